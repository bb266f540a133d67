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

    snapshot.rs

    Binary save state layouts for the floppy subsystem.

    Every field is explicit: lengths are stored ahead of their vectors and
    optional parts are gated by a presence flag written before them.
*/

use std::path::PathBuf;

use binrw::binrw;

use crate::{
    device_types::fdc::FdcError,
    floppy::{disk::FloppyDisk, track::Track},
};

pub const SNAPSHOT_VERSION: u8 = 2;

#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PulseReqState {
    pub delay_us: u64,
    pub trigger: u64,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub expired: bool,
}

#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackState {
    pub physical_track_num: u8,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub side_one: bool,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub changed: bool,
    /// 0: single density, 1: double density, 2: per-byte map follows.
    pub density_tag: u8,
    pub data_len: u32,
    #[br(count = data_len)]
    pub data: Vec<u8>,
    pub density_map_len: u32,
    #[br(count = density_map_len)]
    pub density_map: Vec<u8>,
}

#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskState {
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub double_sided: bool,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub write_protected: bool,
    /// UTF-8 path of the image the disk was loaded from. Empty if none.
    pub file_path_len: u16,
    #[br(count = file_path_len)]
    pub file_path: Vec<u8>,
    pub track_count: u32,
    #[br(count = track_count)]
    pub tracks: Vec<TrackState>,
}

impl DiskState {
    pub fn from_disk(disk: &FloppyDisk) -> Self {
        let tracks: Vec<TrackState> = disk.tracks().map(Track::save_state).collect();
        let file_path = disk
            .file_path()
            .map(|p| p.to_string_lossy().into_owned().into_bytes())
            .unwrap_or_default();
        Self {
            double_sided: disk.double_sided(),
            write_protected: disk.write_protected(),
            file_path_len: file_path.len() as u16,
            file_path,
            track_count: tracks.len() as u32,
            tracks,
        }
    }

    pub fn to_disk(&self) -> Result<FloppyDisk, FdcError> {
        let mut disk = FloppyDisk::new(self.double_sided);
        disk.set_write_protected(self.write_protected);
        if !self.file_path.is_empty() {
            let path = String::from_utf8_lossy(&self.file_path).into_owned();
            disk.set_file_path(Some(PathBuf::from(path)));
        }
        for track_state in &self.tracks {
            disk.insert_track(Track::from_state(track_state)?);
        }
        Ok(disk)
    }
}

#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriveState {
    pub physical_track: u8,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub motor_on: bool,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub write_protected: bool,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub disk_present: bool,
    #[br(if(disk_present))]
    pub disk: Option<DiskState>,
}

#[binrw]
#[brw(little)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationState {
    pub kind: u8,
    pub flags: u8,
    pub step_rate: u8,
}

#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferStateDto {
    pub position: u32,
    pub search_deadline: u64,
    /// u32::MAX when no ID field is targeted.
    pub idam: u32,
    pub buffer_len: u32,
    #[br(count = buffer_len)]
    pub buffer: Vec<u8>,
    pub cursor: u32,
    pub sector_len: u32,
    pub crc: u16,
    pub flags: u8,
    pub steps: u8,
}

/// Complete controller state, drives and media included.
#[binrw]
#[brw(little, magic = b"M3FD")]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FdcState {
    #[br(assert(version == SNAPSHOT_VERSION, "unsupported snapshot version {}", version))]
    pub version: u8,
    pub command_pulse: PulseReqState,
    pub motor_off_pulse: PulseReqState,
    pub command_register: u8,
    pub track_register: u8,
    pub sector_register: u8,
    pub data_register: u8,
    pub status_flags: u16,
    pub last_type: u8,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub step_in: bool,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub intrq: bool,
    pub drive_select: u8,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub side_one: bool,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub double_density: bool,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub wait_enabled: bool,
    /// 0: idle, 1: busy in `phase`, 2: interrupted.
    pub state: u8,
    pub phase: u8,
    pub operation: OperationState,
    pub xfer: TransferStateDto,
    pub drive_count: u8,
    #[br(count = drive_count)]
    pub drives: Vec<DriveState>,
}
