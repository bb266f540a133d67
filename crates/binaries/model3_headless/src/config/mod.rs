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

    config::mod.rs

    Reads the headless frontend's TOML configuration and overlays command
    line arguments on top of it. The command line always wins.
*/

mod bpaf_config;
pub mod mount;

use std::path::{Path, PathBuf};

pub use bpaf_config::{cli_args, CmdLineArgs};
use model3_core::machine_config::{FloppyControllerConfig, FloppyDriveConfig};
use mount::MountableDeviceType;
use serde_derive::Deserialize;

const fn _default_true() -> bool {
    true
}

const fn _default_run_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize)]
pub struct Emulator {
    /// Time to keep the machine running after the script finishes.
    #[serde(default = "_default_run_ms")]
    pub run_ms: u64,
    #[serde(default)]
    pub write_protect_default: bool,
    #[serde(default)]
    pub save_images: bool,
    #[serde(default = "_default_true")]
    pub report: bool,
    pub snapshot_file: Option<PathBuf>,
    pub restore_file: Option<PathBuf>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self {
            run_ms: _default_run_ms(),
            write_protect_default: false,
            save_images: false,
            report: true,
            snapshot_file: None,
            restore_file: None,
        }
    }
}

/// A freshly formatted disk to put in a drive instead of an image file.
#[derive(Debug, Deserialize)]
pub struct BlankDiskEntry {
    pub drive:  usize,
    pub format: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Machine {
    #[serde(default)]
    pub fdc: FloppyControllerConfig,
    #[serde(default)]
    pub blank_disk: Vec<BlankDiskEntry>,
}

/// One step of the host program driving the controller.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Write a byte to a port.
    Out { port: u16, value: u8 },
    /// Read a port, optionally checking the masked value.
    In {
        port:   u16,
        expect: Option<u8>,
        mask:   Option<u8>,
    },
    /// Let time pass.
    Run { ms: u64 },
    /// Run until the controller is no longer busy.
    WaitIdle { timeout_ms: Option<u64> },
    /// Service DRQ by reading the data register until the command completes.
    ReadData {
        timeout_ms: Option<u64>,
        #[serde(default)]
        dump: bool,
    },
    /// Service DRQ by writing `data`, then `fill`, until the command completes.
    WriteData {
        #[serde(default)]
        data:       Vec<u8>,
        fill:       Option<u8>,
        timeout_ms: Option<u64>,
    },
    /// Print a status report.
    Status,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFileParams {
    #[serde(default)]
    pub emulator: Emulator,
    #[serde(default)]
    pub machine: Machine,
    #[serde(default)]
    pub script: Vec<ScriptStep>,
}

impl ConfigFileParams {
    pub fn overlay(&mut self, shell_args: CmdLineArgs) {
        if let Some(run_ms) = shell_args.run_ms {
            self.emulator.run_ms = run_ms;
        }
        if let Some(snapshot_file) = shell_args.snapshot_file {
            self.emulator.snapshot_file = Some(snapshot_file);
        }
        if let Some(restore_file) = shell_args.restore_file {
            self.emulator.restore_file = Some(restore_file);
        }
        self.emulator.save_images |= shell_args.save_images;
        self.emulator.write_protect_default |= shell_args.write_protect;
        self.emulator.report &= !shell_args.no_report;

        for mount in shell_args.mounts {
            match mount.device {
                MountableDeviceType::Floppy => {
                    let drives = &mut self.machine.fdc.drive;
                    if drives.len() <= mount.index {
                        drives.resize_with(mount.index + 1, FloppyDriveConfig::default);
                    }
                    let write_protect = mount.write_protect();
                    let drive = &mut drives[mount.index];
                    drive.image = Some(mount.path.to_string_lossy().into_owned());
                    if let Some(wp) = write_protect {
                        drive.write_protect = wp;
                    }
                    self.machine.blank_disk.retain(|b| b.drive != mount.index);
                }
            }
        }
    }
}

pub fn read_config(toml_string: impl AsRef<str>, shell_args: CmdLineArgs) -> Result<ConfigFileParams, anyhow::Error> {
    let mut toml_args: ConfigFileParams = toml::from_str(toml_string.as_ref())?;

    // Command line arguments override config file arguments
    toml_args.overlay(shell_args);
    Ok(toml_args)
}

/// Read the TOML configuration from a file path, parse and overlay command line arguments.
pub fn read_config_file<P>(default_path: P) -> Result<ConfigFileParams, anyhow::Error>
where
    P: AsRef<Path>,
{
    log::debug!("Reading command line arguments...");
    let shell_args = cli_args().run();

    // Allow configuration file path to be overridden by command line argument 'config_file'
    let toml_string = if let Some(configfile_path) = shell_args.config_file.as_ref() {
        std::fs::read_to_string(configfile_path)?
    }
    else {
        std::fs::read_to_string(default_path)?
    };

    read_config(toml_string, shell_args)
}
