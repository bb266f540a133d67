/*
    Model3

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    floppy::crc.rs

    CRC-16/CCITT as computed by the WD179x over ID and data fields.
*/

/// Polynomial x^16 + x^12 + x^5 + 1, shifted MSB first.
const CRC_POLY: u16 = 0x1021;

/// Initial value of the CRC generator.
pub const CRC_RESET: u16 = 0xFFFF;
/// CRC state after the three MFM 0xA1 sync bytes.
pub const CRC_RESET_A1_A1_A1: u16 = 0xCDB4;
/// CRC state after three MFM 0xA1 sync bytes and an IDAM.
pub const CRC_RESET_A1_A1_A1_FE: u16 = 0xB230;
/// CRC state after a single density IDAM.
pub const CRC_RESET_FE: u16 = 0xEF21;

/// Feed one byte into the CRC generator.
#[inline]
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ ((byte as u16) << 8);
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ CRC_POLY
        }
        else {
            crc << 1
        };
    }
    crc
}

/// Compute the CRC of `bytes` starting from `seed`.
pub fn crc16(seed: u16, bytes: &[u8]) -> u16 {
    bytes.iter().fold(seed, |crc, &b| crc16_update(crc, b))
}
