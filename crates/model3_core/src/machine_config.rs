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

    machine_config.rs

    Core-facing configuration of the floppy subsystem.
*/

use serde_derive::Deserialize;

use crate::machine_types::FloppyDriveType;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FloppyDriveConfig {
    #[serde(rename = "type")]
    pub fd_type: FloppyDriveType,
    pub image: Option<String>,
    #[serde(default)]
    pub write_protect: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FloppyControllerConfig {
    #[serde(default)]
    pub drive: Vec<FloppyDriveConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_controller_config() {
        let cfg: FloppyControllerConfig = toml::from_str(
            r#"
            [[drive]]
            type = "40track"
            image = "ldos.dmk"

            [[drive]]
            type = "80track"
            write_protect = true
            "#,
        )
        .unwrap();

        assert_eq!(cfg.drive.len(), 2);
        assert_eq!(cfg.drive[0].image.as_deref(), Some("ldos.dmk"));
        assert!(!cfg.drive[0].write_protect);
        assert_eq!(cfg.drive[1].fd_type, FloppyDriveType::Floppy80Track);
        assert!(cfg.drive[1].write_protect);
    }
}
