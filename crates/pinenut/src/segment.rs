//! Append-only segment files, one per `(identifier, time bucket)`.
//!
//! A segment holds one or more units, each written by one pipeline session:
//! a fixed header (magic, version, flags, optional ephemeral public key)
//! followed by a single compressed, optionally encrypted stream. Draining a
//! buffer half appends its bytes verbatim; rotation and unit boundaries are
//! decided upstream and arrive here as part of the drain request.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::error::{Error, Result};

pub(crate) const SEGMENT_MAGIC: [u8; 4] = *b"PNLG";
pub(crate) const SEGMENT_VERSION: u16 = 1;
const FLAG_ENCRYPTED: u8 = 0b0000_0001;

pub(crate) const SEGMENT_EXT: &str = "pine";

/// Width of the time bucket one segment file covers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Day,
    Hour,
    Minute,
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::Minute
    }
}

impl Rotation {
    pub(crate) fn width_secs(self) -> i64 {
        match self {
            Rotation::Day => 86_400,
            Rotation::Hour => 3_600,
            Rotation::Minute => 60,
        }
    }

    /// Start of the UTC bucket containing `secs`.
    pub(crate) fn bucket_start(self, secs: i64) -> i64 {
        secs - secs.rem_euclid(self.width_secs())
    }

    /// Filename component for a bucket: `YYYYMMDD`, `YYYYMMDDHH`, or
    /// `YYYYMMDDHHMM` depending on the rotation width.
    pub(crate) fn bucket_label(self, bucket_start: i64) -> String {
        let dt = OffsetDateTime::from_unix_timestamp(bucket_start)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let formatted = match self {
            Rotation::Day => dt.format(format_description!("[year][month][day]")),
            Rotation::Hour => dt.format(format_description!("[year][month][day][hour]")),
            Rotation::Minute => {
                dt.format(format_description!("[year][month][day][hour][minute]"))
            }
        };
        formatted.expect("formatting into a string cannot fail")
    }
}

/// Inverts [`Rotation::bucket_label`]. The label's length determines the
/// rotation width, so readers need no out-of-band rotation knowledge.
pub(crate) fn parse_bucket_label(label: &str) -> Option<(i64, i64)> {
    if !label.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = label.get(0..4)?.parse().ok()?;
    let month: u8 = label.get(4..6)?.parse().ok()?;
    let day: u8 = label.get(6..8)?.parse().ok()?;
    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;

    let (time, width) = match label.len() {
        8 => (Time::MIDNIGHT, 86_400),
        10 => {
            let hour: u8 = label.get(8..10)?.parse().ok()?;
            (Time::from_hms(hour, 0, 0).ok()?, 3_600)
        }
        12 => {
            let hour: u8 = label.get(8..10)?.parse().ok()?;
            let minute: u8 = label.get(10..12)?.parse().ok()?;
            (Time::from_hms(hour, minute, 0).ok()?, 60)
        }
        _ => return None,
    };
    let start = PrimitiveDateTime::new(date, time)
        .assume_utc()
        .unix_timestamp();
    Some((start, width))
}

pub(crate) fn segment_file_name(identifier: &str, rotation: Rotation, bucket: i64) -> String {
    format!(
        "{identifier}_{}.{SEGMENT_EXT}",
        rotation.bucket_label(bucket)
    )
}

/// Unit header: magic, version, flags, reserved byte, and the ephemeral
/// public key when the unit is encrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub eph_public: Option<[u8; 33]>,
}

impl SegmentHeader {
    pub fn encrypted(&self) -> bool {
        self.eph_public.is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 33);
        out.extend_from_slice(&SEGMENT_MAGIC);
        out.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        out.push(if self.encrypted() { FLAG_ENCRYPTED } else { 0 });
        out.push(0);
        if let Some(key) = &self.eph_public {
            out.extend_from_slice(key);
        }
        out
    }

    /// Decodes a header at the start of `buf`, returning it and its length.
    pub fn decode(buf: &[u8]) -> Result<(SegmentHeader, usize)> {
        if buf.len() < 8 {
            return Err(Error::Codec("segment header is truncated".to_string()));
        }
        if buf[0..4] != SEGMENT_MAGIC {
            return Err(Error::Codec("bad segment magic".to_string()));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != SEGMENT_VERSION {
            return Err(Error::Codec(format!("unsupported segment version {version}")));
        }
        let flags = buf[6];
        if flags & !FLAG_ENCRYPTED != 0 || buf[7] != 0 {
            return Err(Error::Codec(format!("unrecognized segment flags {flags:#04x}")));
        }
        if flags & FLAG_ENCRYPTED == 0 {
            return Ok((SegmentHeader { eph_public: None }, 8));
        }
        if buf.len() < 8 + 33 {
            return Err(Error::Codec("segment header is truncated".to_string()));
        }
        let mut key = [0u8; 33];
        key.copy_from_slice(&buf[8..8 + 33]);
        Ok((
            SegmentHeader {
                eph_public: Some(key),
            },
            8 + 33,
        ))
    }
}

/// One segment file known to [`list_segments`].
#[derive(Debug)]
pub(crate) struct SegmentEntry {
    pub path: PathBuf,
    pub bucket_start: i64,
    pub bucket_end: i64,
}

/// Segment files for `identifier` under `dir`, ordered by bucket.
pub(crate) fn list_segments(dir: &Path, identifier: &str) -> Result<Vec<SegmentEntry>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stem = match name.strip_suffix(&format!(".{SEGMENT_EXT}")) {
            Some(stem) => stem,
            None => continue,
        };
        // The identifier may itself contain underscores; the label never
        // does, so split at the last one.
        let (id, label) = match stem.rsplit_once('_') {
            Some(parts) => parts,
            None => continue,
        };
        if id != identifier {
            continue;
        }
        if let Some((start, width)) = parse_bucket_label(label) {
            out.push(SegmentEntry {
                path: entry.path(),
                bucket_start: start,
                bucket_end: start + width,
            });
        }
    }
    out.sort_by_key(|e| e.bucket_start);
    Ok(out)
}

struct OpenSegment {
    file: File,
    bucket: i64,
}

/// Owns the at-most-one open segment of a logger and appends drained blocks
/// to it. Used exclusively by the drain worker (and by startup recovery,
/// which runs before the worker exists).
pub(crate) struct FileEngine {
    dir: PathBuf,
    identifier: String,
    rotation: Rotation,
    open: Option<OpenSegment>,
}

impl FileEngine {
    pub fn new(dir: PathBuf, identifier: String, rotation: Rotation) -> FileEngine {
        FileEngine {
            dir,
            identifier,
            rotation,
            open: None,
        }
    }

    /// Appends one drained block to the segment for `bucket`, rotating away
    /// from any previously open segment first. `header` is written ahead of
    /// the block when this block opens a new unit: on a freshly created file
    /// always, and on a re-opened file when `first_of_session` is set.
    pub fn append_block(
        &mut self,
        bucket: i64,
        header: &[u8],
        first_of_session: bool,
        block: &[u8],
    ) -> Result<()> {
        let rotate = self.open.as_ref().map_or(false, |open| open.bucket != bucket);
        if rotate {
            self.finalize();
        }
        if self.open.is_none() {
            let path = self.dir.join(segment_file_name(&self.identifier, self.rotation, bucket));
            let file = OpenOptions::new().append(true).create(true).open(&path)?;
            let existing = file.metadata()?.len();
            tracing::debug!(
                path = %path.display(),
                existing,
                "opened segment",
            );
            let mut open = OpenSegment { file, bucket };
            if existing == 0 || first_of_session {
                open.file.write_all(header)?;
            }
            self.open = Some(open);
        }
        let open = self.open.as_mut().expect("segment was just opened");
        open.file.write_all(block)?;
        Ok(())
    }

    /// Replays a crash-recovered block. It continues whatever stream the
    /// previous run was writing, so it goes to the newest existing segment;
    /// only when none exists is a fresh segment for `bucket` created under
    /// `fallback_header`.
    pub fn append_recovered(
        &mut self,
        bucket: i64,
        fallback_header: &[u8],
        block: &[u8],
    ) -> Result<()> {
        let newest = list_segments(&self.dir, &self.identifier)?.pop();
        match newest {
            Some(entry) => {
                tracing::info!(
                    path = %entry.path.display(),
                    bytes = block.len(),
                    "replaying recovered buffer into newest segment",
                );
                let mut file = OpenOptions::new().append(true).open(&entry.path)?;
                file.write_all(block)?;
                Ok(())
            }
            None => {
                tracing::info!(
                    bytes = block.len(),
                    "replaying recovered buffer into a fresh segment",
                );
                self.append_block(bucket, fallback_header, false, block)
            }
        }
    }

    /// Closes the open segment, if any. Stream terminators were already
    /// appended upstream; nothing is written here.
    pub fn finalize(&mut self) {
        if let Some(open) = self.open.take() {
            tracing::debug!(bucket = open.bucket, "finalized segment");
        }
    }

    /// Deletes segments whose bucket ended before `now - lifetime`. The open
    /// segment is never deleted.
    pub fn trim(&mut self, now_secs: i64, lifetime_secs: u64) -> Result<()> {
        let cutoff = now_secs.saturating_sub(i64::try_from(lifetime_secs).unwrap_or(i64::MAX));
        for entry in list_segments(&self.dir, &self.identifier)? {
            if entry.bucket_end >= cutoff {
                continue;
            }
            if let Some(open) = &self.open {
                if open.bucket == entry.bucket_start {
                    continue;
                }
            }
            fs::remove_file(&entry.path)?;
            tracing::info!(path = %entry.path.display(), "trimmed expired segment");
        }
        Ok(())
    }
}
