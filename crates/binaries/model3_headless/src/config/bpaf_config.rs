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

    config::bpaf_config.rs

    Command line arguments. Anything given here overrides the configuration file.
*/

use std::path::PathBuf;

use crate::config::mount::MountSpec;

use bpaf::{Bpaf, Parser};

fn mount_arg() -> impl Parser<Vec<MountSpec>> {
    bpaf::short('m')
        .long("mount")
        .help("Mount a disk image with syntax: fd:0:disk.dmk[?wp]")
        .argument::<String>("mountspec")
        .parse(|s| s.parse::<MountSpec>())
        .many()
}

#[derive(Debug, Default, Bpaf)]
#[bpaf(options, version, generate(cli_args))]
pub struct CmdLineArgs {
    #[bpaf(long("config_file"), long("configfile"))]
    pub config_file: Option<PathBuf>,

    #[bpaf(long("run_ms"))]
    pub run_ms: Option<u64>,

    #[bpaf(long("snapshot_file"))]
    pub snapshot_file: Option<PathBuf>,

    #[bpaf(long("restore_file"))]
    pub restore_file: Option<PathBuf>,

    #[bpaf(long("save_images"), switch)]
    pub save_images: bool,

    #[bpaf(long("write_protect"), switch)]
    pub write_protect: bool,

    #[bpaf(long("no_report"), switch)]
    pub no_report: bool,

    #[bpaf(external(mount_arg))]
    pub mounts: Vec<MountSpec>,
}
