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

    emulator::mod.rs

    Definition of the headless [Emulator]: a clock, the floppy controller and
    the host script that drives it.
*/

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Error};
use binrw::{BinRead, BinWrite};
use colored::Colorize;

use crate::config::{ConfigFileParams, ScriptStep};
use model3_core::{
    bus::IoDevice,
    device_types::fdc::{DiskFormat, StandardFormat},
    devices::fdc::{FloppyController, FDC_DATA_PORT},
    floppy::disk::FloppyDisk,
    timing::{Clock, TickRate},
};

/// Interval at which the host polls the controller while servicing DRQ.
pub const POLL_US: u64 = 10;
const DEFAULT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Default)]
pub struct RunStats {
    pub steps: usize,
    pub bytes_read: usize,
    pub bytes_written: usize,
    pub mismatches: usize,
}

pub struct Emulator {
    pub config: ConfigFileParams,
    pub clock: Clock,
    pub fdc: FloppyController,
    pub stats: RunStats,
}

impl Emulator {
    pub fn new(config: ConfigFileParams) -> Self {
        let rate = TickRate::default();
        let fdc = FloppyController::new(rate, &config.machine.fdc.drive);
        Self {
            config,
            clock: Clock::new(rate),
            fdc,
            stats: RunStats::default(),
        }
    }

    /// Mount the configured media, or restore a saved state if one was given.
    pub fn apply_config(&mut self) -> Result<(), Error> {
        log::debug!("Applying configuration to emulator state...");

        if let Some(restore_file) = self.config.emulator.restore_file.clone() {
            return self.restore_snapshot(&restore_file);
        }

        let wp_default = self.config.emulator.write_protect_default;
        let drives: Vec<_> = self.config.machine.fdc.drive.iter().cloned().enumerate().collect();
        for (drive_n, drive) in drives {
            let Some(image) = drive.image
            else {
                continue;
            };
            let path = PathBuf::from(&image);
            let image_vec = std::fs::read(&path).map_err(|e| anyhow!("Error opening image {:?}: {}", path, e))?;
            self.fdc
                .load_image_from(drive_n, image_vec, Some(&path), drive.write_protect || wp_default)?;
            println!("Mounted {} in drive {}", image, drive_n);
        }

        for blank in &self.config.machine.blank_disk {
            let format = StandardFormat::from_str(&blank.format)
                .map_err(|_| anyhow!("Unknown disk format: {}", blank.format))?;
            let disk = FloppyDisk::new_formatted(&DiskFormat::from(format))?;
            self.fdc.attach_disk(blank.drive, disk, wp_default)?;
            println!("Formatted blank {} disk in drive {}", format, blank.drive);
        }
        Ok(())
    }

    pub fn now(&self) -> u64 {
        self.clock.ticks()
    }

    pub fn tick_us(&mut self, us: u64) {
        let now = self.clock.advance_us(us);
        self.fdc.run(now);
    }

    pub fn run_for_ms(&mut self, ms: u64) {
        let end = self.clock.elapsed_us() + ms * 1000;
        while self.clock.elapsed_us() < end {
            self.tick_us(1000);
        }
    }

    /// Run every script step in order.
    pub fn run_script(&mut self) -> Result<(), Error> {
        let script = self.config.script.clone();
        for (i, step) in script.iter().enumerate() {
            log::debug!("Step {}: {:?}", i, step);
            self.step(step).map_err(|e| anyhow!("Script step {} failed: {}", i, e))?;
            self.stats.steps += 1;
        }
        Ok(())
    }

    fn step(&mut self, step: &ScriptStep) -> Result<(), Error> {
        match step {
            ScriptStep::Out { port, value } => {
                let now = self.now();
                self.fdc.write_u8(*port, *value, now);
            }
            ScriptStep::In { port, expect, mask } => {
                let now = self.now();
                let value = self.fdc.read_u8(*port, now);
                match expect {
                    Some(expect) => {
                        let mask = mask.unwrap_or(0xFF);
                        if value & mask == expect & mask {
                            println!("IN {:02X} = {:02X} {}", port, value, "ok".green());
                        }
                        else {
                            self.stats.mismatches += 1;
                            println!(
                                "IN {:02X} = {:02X} {} (expected {:02X} mask {:02X})",
                                port,
                                value,
                                "MISMATCH".red().bold(),
                                expect,
                                mask
                            );
                        }
                    }
                    None => println!("IN {:02X} = {:02X}", port, value),
                }
            }
            ScriptStep::Run { ms } => self.run_for_ms(*ms),
            ScriptStep::WaitIdle { timeout_ms } => {
                let limit = self.deadline(*timeout_ms);
                while self.fdc.busy() {
                    self.check_deadline(limit)?;
                    self.tick_us(100);
                }
            }
            ScriptStep::ReadData { timeout_ms, dump } => {
                let limit = self.deadline(*timeout_ms);
                let mut data = Vec::new();
                while self.fdc.busy() {
                    self.check_deadline(limit)?;
                    self.tick_us(POLL_US);
                    if self.fdc.drq() {
                        let now = self.now();
                        data.push(self.fdc.read_u8(FDC_DATA_PORT, now));
                    }
                }
                self.stats.bytes_read += data.len();
                println!("Read {} bytes", data.len());
                if *dump {
                    print_hex(&data);
                }
            }
            ScriptStep::WriteData {
                data,
                fill,
                timeout_ms,
            } => {
                let limit = self.deadline(*timeout_ms);
                let fill = fill.unwrap_or(0);
                let mut bytes = data.iter().copied();
                let mut written = 0;
                while self.fdc.busy() {
                    self.check_deadline(limit)?;
                    self.tick_us(POLL_US);
                    if self.fdc.drq() {
                        let now = self.now();
                        self.fdc.write_u8(FDC_DATA_PORT, bytes.next().unwrap_or(fill), now);
                        written += 1;
                    }
                }
                self.stats.bytes_written += written;
                println!("Wrote {} bytes", written);
            }
            ScriptStep::Status => self.report(),
        }
        Ok(())
    }

    fn deadline(&self, timeout_ms: Option<u64>) -> u64 {
        self.clock.elapsed_us() + timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS) * 1000
    }

    fn check_deadline(&self, limit_us: u64) -> Result<(), Error> {
        if self.clock.elapsed_us() >= limit_us {
            let now = self.now();
            return Err(anyhow!(
                "Timed out waiting for controller, status {:02X}",
                self.fdc.get_status_snapshot(now).status_register
            ));
        }
        Ok(())
    }

    pub fn report(&self) {
        let snapshot = self.fdc.get_status_snapshot(self.now());
        println!("{}", "FDC status".bold());
        print!("{}", snapshot);
    }

    /// Write back changed images and the state snapshot, as configured.
    pub fn save_outputs(&mut self) -> Result<(), Error> {
        if self.config.emulator.save_images {
            for drive_n in 0..self.fdc.drive_ct() {
                let Some(drive) = self.fdc.drive_mut(drive_n)
                else {
                    continue;
                };
                let changed = drive.disk().is_some_and(|d| d.changed() && d.file_path().is_some());
                if changed {
                    let path = drive.save_image(None)?;
                    println!("Saved drive {} to {}", drive_n, path.display());
                }
            }
        }
        if let Some(snapshot_file) = self.config.emulator.snapshot_file.clone() {
            self.save_snapshot(&snapshot_file)?;
            println!("Saved state to {}", snapshot_file.display());
        }
        Ok(())
    }

    /// A snapshot file holds the clock followed by the controller state.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), Error> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.clock.ticks().write_le(&mut writer)?;
        self.fdc.serialize(&mut writer)?;
        Ok(())
    }

    pub fn restore_snapshot(&mut self, path: &Path) -> Result<(), Error> {
        let mut reader = BufReader::new(File::open(path)?);
        let ticks = u64::read_le(&mut reader)?;
        self.fdc.deserialize(&mut reader)?;
        self.clock.set_ticks(ticks);
        println!("Restored state from {}", path.display());
        Ok(())
    }
}

fn print_hex(data: &[u8]) {
    for (row, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
        println!("{:04X}: {}", row * 16, hex.join(" "));
    }
}
