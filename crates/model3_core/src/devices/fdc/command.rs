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

    devices::fdc::command.rs

    WD1793 command byte decoding.
*/

use modular_bitfield::{bitfield, prelude::*};

/// Step rates selected by the r1 r0 bits of a Type I command, in microseconds.
pub const STEP_RATES_US: [u64; 4] = [6_000, 12_000, 20_000, 30_000];

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum CommandType {
    #[strum(to_string = "Type I")]
    TypeI,
    #[strum(to_string = "Type II")]
    TypeII,
    #[strum(to_string = "Type III")]
    TypeIII,
    #[strum(to_string = "Type IV")]
    TypeIV,
}

/// The commands the controller understands, decoded from the high nibble of
/// the command register.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Command {
    #[strum(to_string = "Restore")]
    Restore,
    #[strum(to_string = "Seek")]
    Seek,
    #[strum(to_string = "Step")]
    Step,
    #[strum(to_string = "Step In")]
    StepIn,
    #[strum(to_string = "Step Out")]
    StepOut,
    #[strum(to_string = "Read Sector")]
    ReadSector,
    #[strum(to_string = "Write Sector")]
    WriteSector,
    #[strum(to_string = "Read Address")]
    ReadAddress,
    #[strum(to_string = "Read Track")]
    ReadTrack,
    #[strum(to_string = "Write Track")]
    WriteTrack,
    #[strum(to_string = "Force Interrupt")]
    ForceInterrupt,
}

impl From<u8> for Command {
    fn from(byte: u8) -> Self {
        match byte >> 4 {
            0x0 => Command::Restore,
            0x1 => Command::Seek,
            0x2 | 0x3 => Command::Step,
            0x4 | 0x5 => Command::StepIn,
            0x6 | 0x7 => Command::StepOut,
            0x8 | 0x9 => Command::ReadSector,
            0xA | 0xB => Command::WriteSector,
            0xC => Command::ReadAddress,
            0xD => Command::ForceInterrupt,
            0xE => Command::ReadTrack,
            _ => Command::WriteTrack,
        }
    }
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Restore | Command::Seek | Command::Step | Command::StepIn | Command::StepOut => CommandType::TypeI,
            Command::ReadSector | Command::WriteSector => CommandType::TypeII,
            Command::ReadAddress | Command::ReadTrack | Command::WriteTrack => CommandType::TypeIII,
            Command::ForceInterrupt => CommandType::TypeIV,
        }
    }
}

/// Flags of a Type I command: r1 r0, V, h, u.
#[bitfield]
#[derive(Copy, Clone)]
pub struct TypeOneFlags {
    pub step_rate: B2,
    pub verify: bool,
    pub head_load: bool,
    pub update: bool,
    #[skip]
    opcode: B3,
}

/// Flags of a Type II or III command: a0, C, E, S, m.
#[bitfield]
#[derive(Copy, Clone)]
pub struct TypeTwoFlags {
    pub deleted_mark: bool,
    pub side_compare: bool,
    pub settle_delay: bool,
    pub side: bool,
    pub multiple: bool,
    #[skip]
    opcode: B3,
}

/// Interrupt conditions of a Force Interrupt command: I0 - I3.
#[bitfield]
#[derive(Copy, Clone)]
pub struct InterruptFlags {
    pub not_ready_to_ready: bool,
    pub ready_to_not_ready: bool,
    pub index_pulse: bool,
    pub immediate: bool,
    #[skip]
    opcode: B4,
}

/// The Model III drive select latch at port 0xF4.
#[bitfield]
#[derive(Copy, Clone)]
pub struct DriveSelectLatch {
    pub drive_0: bool,
    pub drive_1: bool,
    pub drive_2: bool,
    pub drive_3: bool,
    pub side_one: bool,
    pub precompensation: bool,
    pub wait: bool,
    pub double_density: bool,
}

impl DriveSelectLatch {
    /// The lowest numbered drive selected by the latch, if any.
    pub fn selected_drive(&self) -> Option<usize> {
        [self.drive_0(), self.drive_1(), self.drive_2(), self.drive_3()]
            .iter()
            .position(|&selected| selected)
    }
}
