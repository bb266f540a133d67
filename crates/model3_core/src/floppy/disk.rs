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

    floppy::disk.rs

    A floppy disk image: a set of raw tracks keyed by track and side, with DMK load and save.
*/

use std::{
    collections::BTreeMap,
    io::Cursor,
    path::{Path, PathBuf},
};

use binrw::{binrw, BinRead, BinWrite};
use thiserror::Error;

use crate::{
    device_types::fdc::{DiskFormat, FdcError, SectorDescriptor},
    floppy::track::{Track, DEFAULT_LENGTH_WITH_HEADER, HEADER_LENGTH_BYTES},
};

pub const DMK_HEADER_LENGTH: usize = 16;
/// Largest track length a DMK header may declare.
pub const DMK_MAX_TRACK_LENGTH: usize = 0x4000;

const DMK_WRITE_PROTECTED: u8 = 0xFF;
const DMK_FLAG_SINGLE_SIDED: u8 = 0x10;
const DMK_FLAG_SINGLE_DENSITY: u8 = 0x40;
// Header signature of an image that maps to a real drive instead of holding data.
const DMK_NATIVE_SIGNATURE: u32 = 0x1234_5678;

/// Byte written into the data field of freshly formatted sectors.
pub const FORMAT_FILL_BYTE: u8 = 0xE5;

#[derive(Debug, Error)]
pub enum DiskImageError {
    #[error("Image is too small to hold a DMK header ({0} bytes)")]
    TooSmall(usize),
    #[error("Image refers to a physical drive and holds no track data")]
    NativeDevice,
    #[error("Invalid track length {0:#06X}")]
    InvalidTrackLength(usize),
    #[error("Image truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("Raw image size {size} is not a multiple of the track length {track_len}")]
    RawSizeMismatch { size: usize, track_len: usize },
    #[error("Bad image header: {0}")]
    Header(#[from] binrw::Error),
    #[error(transparent)]
    Codec(#[from] FdcError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default)]
struct DmkHeader {
    write_protect: u8,
    tracks: u8,
    track_length: u16,
    flags: u8,
    reserved: [u8; 7],
    native: u32,
}

#[derive(Clone, Debug, Default)]
pub struct FloppyDisk {
    tracks: BTreeMap<(u8, bool), Track>,
    double_sided: bool,
    write_protected: bool,
    file_path: Option<PathBuf>,
}

impl FloppyDisk {
    /// Create an empty, unformatted disk.
    pub fn new(double_sided: bool) -> Self {
        Self {
            double_sided,
            ..Default::default()
        }
    }

    /// Parse a DMK image.
    pub fn from_dmk(bytes: &[u8], file_path: Option<PathBuf>) -> Result<Self, DiskImageError> {
        if bytes.len() < DMK_HEADER_LENGTH {
            return Err(DiskImageError::TooSmall(bytes.len()));
        }
        let header = DmkHeader::read(&mut Cursor::new(bytes))?;
        if header.native == DMK_NATIVE_SIGNATURE {
            return Err(DiskImageError::NativeDevice);
        }

        let track_len = header.track_length as usize;
        if track_len <= HEADER_LENGTH_BYTES || track_len > DMK_MAX_TRACK_LENGTH {
            return Err(DiskImageError::InvalidTrackLength(track_len));
        }

        let double_sided = header.flags & DMK_FLAG_SINGLE_SIDED == 0;
        let compact = header.flags & DMK_FLAG_SINGLE_DENSITY != 0;
        let sides: usize = if double_sided { 2 } else { 1 };
        let expected = DMK_HEADER_LENGTH + header.tracks as usize * sides * track_len;
        if bytes.len() < expected {
            return Err(DiskImageError::Truncated {
                expected,
                found: bytes.len(),
            });
        }

        let mut tracks = BTreeMap::new();
        for (i, raw) in bytes[DMK_HEADER_LENGTH..expected].chunks_exact(track_len).enumerate() {
            let track_num = (i / sides) as u8;
            let side_one = i % sides == 1;
            tracks.insert((track_num, side_one), Track::new(track_num, side_one, raw, compact)?);
        }

        log::debug!(
            "Loaded DMK image: {} tracks, {} side(s), track length {:04X}{}",
            header.tracks,
            sides,
            track_len,
            if compact { ", single byte single density" } else { "" }
        );

        Ok(Self {
            tracks,
            double_sided,
            write_protected: header.write_protect == DMK_WRITE_PROTECTED,
            file_path,
        })
    }

    /// Serialize the disk as a DMK image. Every track is written at the length
    /// of the longest track; missing tracks are written blank.
    pub fn to_dmk(&mut self) -> Result<Vec<u8>, DiskImageError> {
        let track_count = self.track_count();
        let track_len = self
            .tracks
            .values()
            .map(Track::length_with_header)
            .max()
            .unwrap_or(DEFAULT_LENGTH_WITH_HEADER);

        let header = DmkHeader {
            write_protect: if self.write_protected { DMK_WRITE_PROTECTED } else { 0 },
            tracks: track_count,
            track_length: track_len as u16,
            flags: if self.double_sided { 0 } else { DMK_FLAG_SINGLE_SIDED },
            ..Default::default()
        };

        let sides = if self.double_sided { 2 } else { 1 };
        let mut cursor = Cursor::new(Vec::with_capacity(
            DMK_HEADER_LENGTH + track_count as usize * sides * track_len,
        ));
        header.write(&mut cursor)?;
        let mut buf = cursor.into_inner();

        for track_num in 0..track_count {
            for side_one in [false, true].into_iter().take(sides) {
                match self.tracks.get_mut(&(track_num, side_one)) {
                    Some(track) => buf.extend(track.to_image_bytes(track_len)),
                    None => buf.extend(Track::blank(track_num, side_one, track_len).to_image_bytes(track_len)),
                }
            }
        }
        Ok(buf)
    }

    /// Build a disk from concatenated raw tracks with no headers.
    pub fn from_raw_tracks(bytes: &[u8], track_len: usize, double_sided: bool) -> Result<Self, DiskImageError> {
        if track_len == 0 || track_len > DMK_MAX_TRACK_LENGTH {
            return Err(DiskImageError::InvalidTrackLength(track_len));
        }
        if bytes.len() % track_len != 0 {
            return Err(DiskImageError::RawSizeMismatch {
                size: bytes.len(),
                track_len,
            });
        }

        let sides = if double_sided { 2 } else { 1 };
        let tracks = bytes
            .chunks_exact(track_len)
            .enumerate()
            .map(|(i, raw)| {
                let track_num = (i / sides) as u8;
                let side_one = i % sides == 1;
                ((track_num, side_one), Track::from_raw_track(track_num, side_one, raw))
            })
            .collect();

        Ok(Self {
            tracks,
            double_sided,
            ..Default::default()
        })
    }

    /// Create a disk with every track formatted to `format`.
    pub fn new_formatted(format: &DiskFormat) -> Result<Self, DiskImageError> {
        let double_sided = format.sides > 1;
        let mut tracks = BTreeMap::new();

        for track_num in 0..format.tracks {
            for side_one in [false, true].into_iter().take(format.sides as usize) {
                let sectors: Vec<SectorDescriptor> = (0..format.sectors_per_track)
                    .map(|n| {
                        SectorDescriptor::new(
                            track_num,
                            side_one,
                            format.first_sector + n,
                            format.double_density,
                            vec![FORMAT_FILL_BYTE; format.sector_size],
                        )
                    })
                    .collect();
                let raw = Track::to_track_bytes(&sectors, None)?;
                tracks.insert((track_num, side_one), Track::new(track_num, side_one, &raw, false)?);
            }
        }

        Ok(Self {
            tracks,
            double_sided,
            ..Default::default()
        })
    }

    pub fn load(path: &Path) -> Result<Self, DiskImageError> {
        let bytes = std::fs::read(path)?;
        Self::from_dmk(&bytes, Some(path.to_path_buf()))
    }

    pub fn save(&mut self, path: &Path) -> Result<(), DiskImageError> {
        let bytes = self.to_dmk()?;
        std::fs::write(path, bytes)?;
        self.file_path = Some(path.to_path_buf());
        for track in self.tracks.values_mut() {
            track.clear_changed();
        }
        Ok(())
    }

    pub fn track(&self, track_num: u8, side_one: bool) -> Option<&Track> {
        self.tracks.get(&(track_num, side_one))
    }

    pub fn track_mut(&mut self, track_num: u8, side_one: bool) -> Option<&mut Track> {
        self.tracks.get_mut(&(track_num, side_one))
    }

    pub fn insert_track(&mut self, track: Track) {
        self.tracks
            .insert((track.physical_track_num(), track.side_one()), track);
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// Number of track positions, counting from track 0.
    pub fn track_count(&self) -> u8 {
        self.tracks
            .keys()
            .map(|&(t, _)| t.saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    /// True if any track carries at least one sector.
    pub fn formatted(&mut self) -> bool {
        self.tracks.values_mut().any(Track::formatted)
    }

    pub fn changed(&self) -> bool {
        self.tracks.values().any(Track::changed)
    }

    pub fn double_sided(&self) -> bool {
        self.double_sided
    }

    pub fn write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn set_write_protected(&mut self, state: bool) {
        self.write_protected = state;
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn set_file_path(&mut self, path: Option<PathBuf>) {
        self.file_path = path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_types::fdc::StandardFormat;

    #[test]
    fn test_dmk_round_trip() {
        let mut disk = FloppyDisk::new_formatted(&StandardFormat::Model3Dsdd.into()).unwrap();
        assert!(disk.formatted());
        assert!(disk.double_sided());
        assert_eq!(disk.track_count(), 40);

        let image = disk.to_dmk().unwrap();
        assert_eq!(image[1], 40);
        assert_eq!(image[4] & DMK_FLAG_SINGLE_SIDED, 0);

        let mut reloaded = FloppyDisk::from_dmk(&image, None).unwrap();
        assert_eq!(reloaded.track_count(), 40);
        let sectors = reloaded.track_mut(39, true).unwrap().to_sector_descriptors();
        assert_eq!(sectors.len(), 18);
        assert_eq!(sectors[0].sector_number, 1);
        assert_eq!(sectors[0].track_number, 39);
        assert!(sectors[0].side_one);
        assert!(sectors.iter().all(|s| !s.crc_error && s.sector_data.iter().all(|&b| b == FORMAT_FILL_BYTE)));

        assert_eq!(reloaded.to_dmk().unwrap(), image);
    }

    #[test]
    fn test_single_sided_write_protected() {
        let mut disk = FloppyDisk::new_formatted(&StandardFormat::Model1Sssd.into()).unwrap();
        disk.set_write_protected(true);
        let image = disk.to_dmk().unwrap();
        assert_eq!(image[0], DMK_WRITE_PROTECTED);
        assert_ne!(image[4] & DMK_FLAG_SINGLE_SIDED, 0);

        let mut reloaded = FloppyDisk::from_dmk(&image, None).unwrap();
        assert!(reloaded.write_protected());
        assert!(!reloaded.double_sided());
        assert!(reloaded.track(0, true).is_none());
        let track = reloaded.track_mut(34, false).unwrap();
        assert!(!track.double_density());
        assert_eq!(track.num_sectors(), 10);
    }

    #[test]
    fn test_bad_images() {
        assert!(matches!(
            FloppyDisk::from_dmk(&[0u8; 8], None),
            Err(DiskImageError::TooSmall(8))
        ));

        let mut header = vec![0u8; DMK_HEADER_LENGTH];
        header[1] = 2;
        header[2..4].copy_from_slice(&0x1900u16.to_le_bytes());
        header[4] = DMK_FLAG_SINGLE_SIDED;
        header.extend(vec![0u8; 0x1900]);
        assert!(matches!(
            FloppyDisk::from_dmk(&header, None),
            Err(DiskImageError::Truncated { .. })
        ));

        header[2..4].copy_from_slice(&0x0040u16.to_le_bytes());
        assert!(matches!(
            FloppyDisk::from_dmk(&header, None),
            Err(DiskImageError::InvalidTrackLength(0x40))
        ));

        header[12..16].copy_from_slice(&DMK_NATIVE_SIGNATURE.to_le_bytes());
        assert!(matches!(
            FloppyDisk::from_dmk(&header, None),
            Err(DiskImageError::NativeDevice)
        ));
    }

    #[test]
    fn test_from_raw_tracks() {
        let mut source = FloppyDisk::new_formatted(&StandardFormat::Model3Ssdd.into()).unwrap();
        let mut raw = Vec::new();
        for t in 0..3 {
            raw.extend_from_slice(source.track_mut(t, false).unwrap().data());
        }
        let track_len = raw.len() / 3;

        let mut disk = FloppyDisk::from_raw_tracks(&raw, track_len, false).unwrap();
        assert_eq!(disk.track_count(), 3);
        assert_eq!(disk.track_mut(2, false).unwrap().num_sectors(), 18);

        assert!(matches!(
            FloppyDisk::from_raw_tracks(&raw[1..], track_len, false),
            Err(DiskImageError::RawSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_unformatted_disk() {
        let mut disk = FloppyDisk::new(false);
        assert!(!disk.formatted());
        disk.insert_track(Track::blank(0, false, DEFAULT_LENGTH_WITH_HEADER));
        assert!(!disk.formatted());
        assert!(!disk.changed());
        let image = disk.to_dmk().unwrap();
        assert_eq!(image.len(), DMK_HEADER_LENGTH + DEFAULT_LENGTH_WITH_HEADER);
    }
}
