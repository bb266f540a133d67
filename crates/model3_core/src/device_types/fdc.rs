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

    device_types::fdc.rs

    Floppy format definitions, sector descriptors and codec errors.
*/

use std::collections::HashMap;

use lazy_static::lazy_static;
use thiserror::Error;

/// ID address mark.
pub const IDAM: u8 = 0xFE;
/// Normal data address mark.
pub const DAM_NORMAL: u8 = 0xFB;
/// Deleted data address mark.
pub const DAM_DELETED: u8 = 0xF8;
/// Index address mark.
pub const IAM: u8 = 0xFC;
/// MFM sync byte written before address marks (with a missing clock).
pub const SYNC_BYTE_DD: u8 = 0xA1;
/// MFM index sync byte.
pub const SYNC_BYTE_INDEX_DD: u8 = 0xC2;

pub const FILLER_BYTE_DD: u8 = 0x4E;
pub const FILLER_BYTE_SD: u8 = 0xFF;

pub const MAX_SECTOR_SIZE: usize = 1024;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FdcError {
    #[error("Invalid sector length {0}: must be 128, 256, 512 or 1024 bytes")]
    InvalidSectorLength(usize),
    #[error("Too many sectors for one track: {0}")]
    TooManySectors(usize),
    #[error("Density map covers {map} bytes but the track holds {data}")]
    DensityMapMismatch { map: usize, data: usize },
}

/// Return the sector length for a size code. Only the low two bits are
/// decoded, as the controller does.
#[inline]
pub fn sector_size_from_code(code: u8) -> usize {
    128 << (code & 0x03)
}

/// Return the size code for a sector length.
pub fn sector_size_code(len: usize) -> Result<u8, FdcError> {
    match len {
        128 => Ok(0),
        256 => Ok(1),
        512 => Ok(2),
        1024 => Ok(3),
        _ => Err(FdcError::InvalidSectorLength(len)),
    }
}

/// Classify a byte found in the data address mark window. Returns
/// `Some(true)` for a deleted mark, `Some(false)` for a normal one.
#[inline]
pub fn dam_kind(byte: u8) -> Option<bool> {
    match byte {
        0xF8 | 0xF9 => Some(true),
        0xFA | 0xFB => Some(false),
        _ => None,
    }
}

/// A decoded (or to-be-encoded) sector: its ID field, data address mark and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectorDescriptor {
    pub track_number: u8,
    pub side_one: bool,
    pub sector_number: u8,
    pub sector_size_code: u8,
    pub sector_size: usize,
    pub double_density: bool,
    pub dam: u8,
    pub sector_data: Vec<u8>,
    pub crc_error: bool,
    pub in_use: bool,
}

impl SectorDescriptor {
    pub fn new(track_number: u8, side_one: bool, sector_number: u8, double_density: bool, sector_data: Vec<u8>) -> Self {
        let sector_size = sector_data.len();
        Self {
            track_number,
            side_one,
            sector_number,
            sector_size_code: sector_size_code(sector_size).unwrap_or(0),
            sector_size,
            double_density,
            dam: DAM_NORMAL,
            sector_data,
            crc_error: false,
            in_use: true,
        }
    }

    /// The sentinel returned when no readable sector exists at a location.
    pub fn empty() -> Self {
        Self {
            track_number: 0,
            side_one: false,
            sector_number: 0,
            sector_size_code: 0,
            sector_size: 0,
            double_density: true,
            dam: 0,
            sector_data: Vec::new(),
            crc_error: true,
            in_use: false,
        }
    }

    pub fn with_dam(mut self, dam: u8) -> Self {
        self.in_use = dam_kind(dam) != Some(true);
        self.dam = dam;
        self
    }

    pub fn with_crc_error(mut self, crc_error: bool) -> Self {
        self.crc_error = crc_error;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sector_size == 0
    }

    pub fn deleted(&self) -> bool {
        dam_kind(self.dam) == Some(true)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::EnumString, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StandardFormat {
    Model1Sssd,
    Model3Ssdd,
    Model3Dsdd,
    Model4Ssdd80,
}

/// Geometry of a freshly formatted disk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DiskFormat {
    pub tracks: u8,
    pub sides: u8,
    pub sectors_per_track: u8,
    pub sector_size: usize,
    pub double_density: bool,
    pub first_sector: u8,
}

lazy_static! {
    pub static ref DISK_FORMATS: HashMap<StandardFormat, DiskFormat> = HashMap::from([
        (
            StandardFormat::Model1Sssd,
            DiskFormat {
                tracks: 35,
                sides: 1,
                sectors_per_track: 10,
                sector_size: 256,
                double_density: false,
                first_sector: 0,
            },
        ),
        (
            StandardFormat::Model3Ssdd,
            DiskFormat {
                tracks: 40,
                sides: 1,
                sectors_per_track: 18,
                sector_size: 256,
                double_density: true,
                first_sector: 1,
            },
        ),
        (
            StandardFormat::Model3Dsdd,
            DiskFormat {
                tracks: 40,
                sides: 2,
                sectors_per_track: 18,
                sector_size: 256,
                double_density: true,
                first_sector: 1,
            },
        ),
        (
            StandardFormat::Model4Ssdd80,
            DiskFormat {
                tracks: 80,
                sides: 1,
                sectors_per_track: 18,
                sector_size: 256,
                double_density: true,
                first_sector: 1,
            },
        ),
    ]);
}

impl From<StandardFormat> for DiskFormat {
    fn from(format: StandardFormat) -> Self {
        DISK_FORMATS[&format]
    }
}
