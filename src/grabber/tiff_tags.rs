//! Renaming captured TIFF files after the time stamps areaDetector embeds.
//!
//! NDFileTIFF writes private tags into the first IFD: 65000 carries the
//! areaDetector time stamp, 65002/65003 the EPICS seconds and nanoseconds
//! (EPICS epoch, 1990-01-01).

use crate::error::ScanError;
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use chrono::{DateTime, Local};
use std::io::{Cursor, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const TAG_TIMESTAMP: u16 = 65000;
pub const TAG_EPICS_SECONDS: u16 = 65002;
pub const TAG_EPICS_NANOS: u16 = 65003;

/// Seconds between the Unix and EPICS epochs.
pub const EPICS_EPOCH_OFFSET: i64 = 631_152_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStamp {
    pub timestamp: f64,
    pub epics_seconds: u32,
    pub epics_nanos: u32,
}

impl FrameStamp {
    /// Local wall-clock time of the frame, `YYYYmmdd_HHMMSS.ffffff`.
    pub fn wall_clock(&self) -> Option<String> {
        let utc = DateTime::from_timestamp(
            EPICS_EPOCH_OFFSET + self.epics_seconds as i64,
            self.epics_nanos,
        )?;
        Some(
            utc.with_timezone(&Local)
                .format("%Y%m%d_%H%M%S%.6f")
                .to_string(),
        )
    }
}

fn invalid(path: &Path, reason: &str) -> ScanError {
    ScanError::io(
        std::io::Error::new(std::io::ErrorKind::InvalidData, reason.to_string()),
        format!("reading TIFF tags of {}", path.display()),
    )
}

/// Read the frame stamp tags from the first IFD of `path`.
pub fn read_frame_stamp(path: &Path) -> Result<FrameStamp, ScanError> {
    let data = std::fs::read(path)
        .map_err(|e| ScanError::io(e, format!("reading {}", path.display())))?;
    let parsed = match data.get(0..2) {
        Some(b"II") => parse_ifd::<LittleEndian>(&data),
        Some(b"MM") => parse_ifd::<BigEndian>(&data),
        _ => return Err(invalid(path, "not a TIFF file")),
    };
    parsed
        .map_err(|e| ScanError::io(e, format!("reading TIFF tags of {}", path.display())))?
        .ok_or_else(|| invalid(path, "time stamp tags missing"))
}

fn parse_ifd<B: ByteOrder>(data: &[u8]) -> std::io::Result<Option<FrameStamp>> {
    let mut cursor = Cursor::new(data);
    cursor.seek(SeekFrom::Start(2))?;
    if cursor.read_u16::<B>()? != 42 {
        return Ok(None);
    }
    let ifd = cursor.read_u32::<B>()? as u64;
    cursor.seek(SeekFrom::Start(ifd))?;

    let mut timestamp = None;
    let mut seconds = None;
    let mut nanos = None;
    let entries = cursor.read_u16::<B>()?;
    for _ in 0..entries {
        let tag = cursor.read_u16::<B>()?;
        let field_type = cursor.read_u16::<B>()?;
        let _count = cursor.read_u32::<B>()?;
        let value_pos = cursor.position();
        let value = read_scalar::<B>(data, field_type, value_pos)?;
        cursor.seek(SeekFrom::Start(value_pos + 4))?;

        match tag {
            TAG_TIMESTAMP => timestamp = value,
            TAG_EPICS_SECONDS => seconds = value,
            TAG_EPICS_NANOS => nanos = value,
            _ => {}
        }
    }

    Ok(match (timestamp, seconds, nanos) {
        (Some(timestamp), Some(s), Some(ns)) => Some(FrameStamp {
            timestamp,
            epics_seconds: s as u32,
            epics_nanos: ns as u32,
        }),
        _ => None,
    })
}

/// First value of an IFD entry whose value field starts at `pos`.
fn read_scalar<B: ByteOrder>(data: &[u8], field_type: u16, pos: u64) -> std::io::Result<Option<f64>> {
    let mut cursor = Cursor::new(data);
    cursor.seek(SeekFrom::Start(pos))?;
    let value = match field_type {
        3 => cursor.read_u16::<B>()? as f64,
        4 => cursor.read_u32::<B>()? as f64,
        8 => cursor.read_i16::<B>()? as f64,
        9 => cursor.read_i32::<B>()? as f64,
        11 => cursor.read_f32::<B>()? as f64,
        12 => {
            let offset = cursor.read_u32::<B>()? as u64;
            cursor.seek(SeekFrom::Start(offset))?;
            cursor.read_f64::<B>()?
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// New file name: `<prefix>_<wall clock>_<tag 65000>_<last '_' segment>`.
pub fn stamped_name(file_name: &str, prefix: &str, stamp: &FrameStamp) -> Option<String> {
    let suffix = file_name.rsplit('_').next().unwrap_or(file_name);
    Some(format!(
        "{}_{}_{}_{}",
        prefix,
        stamp.wall_clock()?,
        stamp.timestamp,
        suffix
    ))
}

/// Rename `path` after its embedded time stamps. Returns the new path.
pub fn retag(path: &Path, prefix: &str) -> Result<PathBuf, ScanError> {
    let stamp = read_frame_stamp(path)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| invalid(path, "file name is not UTF-8"))?;
    let new_name = stamped_name(file_name, prefix, &stamp)
        .ok_or_else(|| invalid(path, "time stamp out of range"))?;
    let new_path = path.with_file_name(new_name);
    std::fs::rename(path, &new_path)
        .map_err(|e| ScanError::io(e, format!("renaming {}", path.display())))?;
    Ok(new_path)
}
