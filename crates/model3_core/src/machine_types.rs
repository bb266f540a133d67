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

    machine_types.rs

    Enumerations describing the machine's floppy hardware.
*/

use std::{fmt, str::FromStr};

use serde::Deserializer;

/// The mechanism fitted in a drive bay. Drives can step a little past the
/// last track of the media they were sold for.
#[derive(Copy, Clone, Default, Debug, Hash, Eq, PartialEq)]
pub enum FloppyDriveType {
    #[default]
    Floppy40Track,
    Floppy80Track,
}

impl FloppyDriveType {
    /// Number of physical head positions the mechanism supports.
    pub fn max_tracks(&self) -> u8 {
        match self {
            FloppyDriveType::Floppy40Track => 42,
            FloppyDriveType::Floppy80Track => 82,
        }
    }
}

impl fmt::Display for FloppyDriveType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FloppyDriveType::Floppy40Track => write!(f, "40 track"),
            FloppyDriveType::Floppy80Track => write!(f, "80 track"),
        }
    }
}

impl FromStr for FloppyDriveType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String>
    where
        Self: Sized,
    {
        match s.to_lowercase().as_str() {
            "40" | "40track" | "floppy40track" => Ok(FloppyDriveType::Floppy40Track),
            "80" | "80track" | "floppy80track" => Ok(FloppyDriveType::Floppy80Track),
            _ => Err("Bad value for floppy drive type".to_string()),
        }
    }
}

impl<'de> serde::Deserialize<'de> for FloppyDriveType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FloppyTypeVisitor;

        impl serde::de::Visitor<'_> for FloppyTypeVisitor {
            type Value = FloppyDriveType;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("`40track` or `80track`")
            }

            fn visit_str<E>(self, value: &str) -> Result<FloppyDriveType, E>
            where
                E: serde::de::Error,
            {
                value
                    .parse::<FloppyDriveType>()
                    .map_err(|_| E::custom(format!("invalid floppy type: {}", value)))
            }
        }

        deserializer.deserialize_str(FloppyTypeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Wrapper {
        drive: FloppyDriveType,
    }

    #[test]
    fn test_parse_drive_type() {
        assert_eq!("80".parse::<FloppyDriveType>(), Ok(FloppyDriveType::Floppy80Track));
        assert!("1.44m".parse::<FloppyDriveType>().is_err());

        let w: Wrapper = toml::from_str("drive = \"40track\"").unwrap();
        assert_eq!(w.drive, FloppyDriveType::Floppy40Track);
    }
}
