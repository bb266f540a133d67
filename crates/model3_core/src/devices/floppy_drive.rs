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

    devices::floppy_drive.rs

    A floppy drive: head position, motor, write protect switch and the mounted disk.
*/

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Error};

use crate::{
    floppy::{disk::FloppyDisk, track::Track},
    machine_types::FloppyDriveType,
    snapshot::{DiskState, DriveState},
};

#[derive(Clone, Debug, Default)]
pub struct FloppyDiskDrive {
    drive_type: FloppyDriveType,
    drive_n: usize,

    pub(crate) physical_track: u8,
    pub(crate) motor_on: bool,
    /// State of the drive's write protect sensing, independent of the image flag.
    pub(crate) write_protected: bool,
    pub(crate) disk: Option<FloppyDisk>,
}

impl FloppyDiskDrive {
    pub fn new(drive_n: usize, drive_type: FloppyDriveType) -> Self {
        Self {
            drive_type,
            drive_n,
            ..Default::default()
        }
    }

    /// Return the drive to its power-on state. The mounted disk is kept.
    pub fn reset(&mut self) {
        self.physical_track = 0;
        self.motor_on = false;
    }

    pub fn drive_type(&self) -> FloppyDriveType {
        self.drive_type
    }

    pub fn drive_n(&self) -> usize {
        self.drive_n
    }

    pub fn physical_track(&self) -> u8 {
        self.physical_track
    }

    pub fn motor_on(&self) -> bool {
        self.motor_on
    }

    /// Move the head one track. Stepping out at track 0 stays at 0. Returns
    /// false if the head is already at the last position the mechanism can reach.
    pub fn step(&mut self, step_in: bool) -> bool {
        if step_in {
            if self.physical_track + 1 >= self.drive_type.max_tracks() {
                return false;
            }
            self.physical_track += 1;
        }
        else {
            self.physical_track = self.physical_track.saturating_sub(1);
        }
        true
    }

    pub fn track_zero(&self) -> bool {
        self.physical_track == 0
    }

    pub fn disk_present(&self) -> bool {
        self.disk.is_some()
    }

    pub fn disk(&self) -> Option<&FloppyDisk> {
        self.disk.as_ref()
    }

    pub fn disk_mut(&mut self) -> Option<&mut FloppyDisk> {
        self.disk.as_mut()
    }

    /// Write protect as the controller sees it: the drive switch or the image flag.
    pub fn is_write_protected(&self) -> bool {
        self.write_protected || self.disk.as_ref().is_some_and(FloppyDisk::write_protected)
    }

    pub fn set_write_protect(&mut self, state: bool) {
        self.write_protected = state;
    }

    /// The track under the head on the given side.
    pub fn track(&self, side_one: bool) -> Option<&Track> {
        self.disk.as_ref()?.track(self.physical_track, side_one)
    }

    pub fn track_mut(&mut self, side_one: bool) -> Option<&mut Track> {
        let physical_track = self.physical_track;
        self.disk.as_mut()?.track_mut(physical_track, side_one)
    }

    pub fn attach_disk(&mut self, disk: FloppyDisk, write_protect: bool) {
        log::debug!(
            "Drive {}: attached disk {}",
            self.drive_n,
            disk.file_path().map_or("<new>".to_string(), |p| p.display().to_string())
        );
        self.write_protected = write_protect;
        self.disk = Some(disk);
    }

    /// Load a DMK image into the drive.
    pub fn load_image_from(&mut self, src_vec: Vec<u8>, path: Option<&Path>, write_protect: bool) -> Result<(), Error> {
        let disk = FloppyDisk::from_dmk(&src_vec, path.map(Path::to_path_buf))
            .map_err(|e| anyhow!("Drive {}: failed to load image: {}", self.drive_n, e))?;
        self.attach_disk(disk, write_protect);
        Ok(())
    }

    pub fn unload_image(&mut self) -> Option<FloppyDisk> {
        log::debug!("Drive {}: disk ejected", self.drive_n);
        self.disk.take()
    }

    /// Write the mounted disk back to `path`, or to the path it was loaded from.
    pub fn save_image(&mut self, path: Option<PathBuf>) -> Result<PathBuf, Error> {
        let drive_n = self.drive_n;
        let disk = self
            .disk
            .as_mut()
            .ok_or_else(|| anyhow!("Drive {}: no disk to save", drive_n))?;
        let path = path
            .or_else(|| disk.file_path().map(Path::to_path_buf))
            .ok_or_else(|| anyhow!("Drive {}: disk has no file path", drive_n))?;
        disk.save(&path)?;
        Ok(path)
    }

    pub fn save_state(&self) -> DriveState {
        DriveState {
            physical_track: self.physical_track,
            motor_on: self.motor_on,
            write_protected: self.write_protected,
            disk_present: self.disk.is_some(),
            disk: self.disk.as_ref().map(DiskState::from_disk),
        }
    }

    pub fn restore_state(&mut self, state: &DriveState) -> Result<(), Error> {
        self.physical_track = state.physical_track;
        self.motor_on = state.motor_on;
        self.write_protected = state.write_protected;
        self.disk = match &state.disk {
            Some(disk_state) => Some(disk_state.to_disk()?),
            None => None,
        };
        Ok(())
    }
}
