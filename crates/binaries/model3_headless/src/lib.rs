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

    lib.rs

    Headless frontend: mounts disks, drives the floppy controller from a
    scripted host and reports the result.
*/

#![forbid(unsafe_code)]

mod config;
mod emulator;

use crate::emulator::Emulator;

pub fn run() {
    env_logger::init();

    // Resolve the configuration by parsing model3.toml and merging it with
    // the command line arguments.
    let config = match config::read_config_file("./model3.toml") {
        Ok(config) => config,
        Err(e) => match e.downcast_ref::<std::io::Error>() {
            Some(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "Configuration file not found! Please create model3.toml in the emulator directory \
                               or provide the path to configuration file with --configfile."
                );
                std::process::exit(1);
            }
            Some(e) => {
                eprintln!("Unknown IO error reading configuration file:\n{}", e);
                std::process::exit(1);
            }
            None => {
                eprintln!(
                    "Failed to parse configuration file. There may be a typo or otherwise invalid toml:\n{}",
                    e
                );
                std::process::exit(1);
            }
        },
    };

    let run_ms = config.emulator.run_ms;
    let report = config.emulator.report;
    let mut emu = Emulator::new(config);

    if let Err(e) = emu.apply_config() {
        eprintln!("Failed to set up the machine: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = emu.run_script() {
        log::error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }

    emu.run_for_ms(run_ms);

    if report {
        emu.report();
    }

    if let Err(e) = emu.save_outputs() {
        eprintln!("Failed to save outputs: {}", e);
        std::process::exit(1);
    }

    println!(
        "Ran {} script steps: {} bytes read, {} bytes written, {} mismatches",
        emu.stats.steps, emu.stats.bytes_read, emu.stats.bytes_written, emu.stats.mismatches
    );
    if emu.stats.mismatches > 0 {
        std::process::exit(2);
    }
}
