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

    devices::fdc::status.rs

    Point-in-time view of the controller for debuggers and frontends.
*/

use std::fmt::{self, Display};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FdcStatusSnapshot {
    pub drive_number: usize,
    pub op_status: String,
    pub command_status: String,
    pub busy: bool,
    pub drq: bool,
    pub status_register: u8,
    pub command_register: u8,
    pub track_register: u8,
    pub sector_register: u8,
    pub data_register: u8,
    pub double_density: bool,
    pub side_one: bool,
    pub physical_track: u8,
    /// Rotational position in degrees from the index hole.
    pub disk_angle: f64,
    pub track_data_index: usize,
    pub track_data_byte: u8,
    pub index_hole: bool,
    pub seek_error: bool,
    pub lost_data: bool,
    pub crc_error: bool,
    pub interrupt_pending: bool,
    pub motor_on: bool,
    pub disk_present: bool,
    pub write_protected: bool,
    pub cmd_log: Vec<String>,
}

impl Display for FdcStatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Drive {} side {} {} | {} | {}",
            self.drive_number,
            self.side_one as u8,
            if self.double_density { "MFM" } else { "FM" },
            self.op_status,
            self.command_status
        )?;
        writeln!(
            f,
            "CMD:{:02X} STA:{:02X} TRK:{:02X} SEC:{:02X} DAT:{:02X}  busy:{} drq:{} intrq:{}",
            self.command_register,
            self.status_register,
            self.track_register,
            self.sector_register,
            self.data_register,
            self.busy as u8,
            self.drq as u8,
            self.interrupt_pending as u8
        )?;
        writeln!(
            f,
            "Head {} at {:6.2} deg, byte {:04X} = {:02X}{}",
            self.physical_track,
            self.disk_angle,
            self.track_data_index,
            self.track_data_byte,
            if self.index_hole { " [INDEX]" } else { "" }
        )?;
        writeln!(
            f,
            "Errors: seek:{} crc:{} lost:{}  Disk: {} motor:{} wp:{}",
            self.seek_error as u8,
            self.crc_error as u8,
            self.lost_data as u8,
            if self.disk_present { "present" } else { "empty" },
            self.motor_on as u8,
            self.write_protected as u8
        )?;
        for line in &self.cmd_log {
            writeln!(f, "  {}", line)?;
        }
        Ok(())
    }
}
