//! Keyframe-anchored segment store
//!
//! Append-only `.ucf` segment files named by the starting PTS in
//! microseconds. A segment opens when a keyframe arrives and closes when
//! the next keyframe (or the sink) does. Two record layouts exist, all
//! integers little-endian:
//!
//! - per-track (one directory per track, 24-byte header):
//!   `[flags:u32][pts_us:i64][ntp_ns:i64][len:u32][payload]`
//! - interleaved (flat directory, 16-byte header):
//!   `[track+1:u16][flags:u16][pts_us:i64][len:u32][payload]`
//!
//! A writer binds to one format at construction and never mixes formats in
//! a directory. Readers tolerate a concurrently appending writer: records
//! are length-prefixed, and a reader that hits EOF re-scans the manifest
//! and rolls forward to the next segment. That polling roll-over is how
//! live tailing works; there is no notification channel.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::{Result, SinkError};
use crate::media::BufferFlags;

/// Segment file extension.
pub const SEGMENT_EXT: &str = "ucf";

/// On-disk record layout selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// 24-byte header, one directory per track, NTP field reserved.
    PerTrack,
    /// 16-byte header with the track index inline, flat directory.
    Interleaved,
}

impl RecordFormat {
    fn header_len(self) -> usize {
        match self {
            RecordFormat::PerTrack => 24,
            RecordFormat::Interleaved => 16,
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub track: usize,
    pub flags: BufferFlags,
    pub pts_us: i64,
    /// Wall-clock nanoseconds at write time. Reserved; preserved on
    /// re-serialization but not consumed by any reader.
    pub ntp_ns: i64,
    pub payload: Vec<u8>,
}

/// Appending side of a segment directory. Exclusively owned by one sink.
pub struct SegmentWriter {
    dir: PathBuf,
    format: RecordFormat,
    file: Option<File>,
}

impl SegmentWriter {
    pub fn create(dir: impl Into<PathBuf>, format: RecordFormat) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| SinkError::Storage(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            format,
            file: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one sample.
    ///
    /// A keyframe closes the current segment and starts `<pts_us>.ucf`.
    /// Samples arriving before the first keyframe have no segment to land
    /// in and are silently discarded.
    pub fn write_sample(
        &mut self,
        track: usize,
        buf: &[u8],
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<()> {
        if flags.is_keyframe() {
            if let Some(file) = self.file.take() {
                drop(file);
            }
            let path = self.dir.join(format!("{}.{}", pts_us, SEGMENT_EXT));
            let file = File::create(&path)
                .map_err(|e| SinkError::Storage(format!("create {}: {}", path.display(), e)))?;
            debug!("segment opened: {}", path.display());
            self.file = Some(file);
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        let mut header = [0u8; 24];
        let header = match self.format {
            RecordFormat::PerTrack => {
                let ntp_ns = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0);
                header[0..4].copy_from_slice(&flags.0.to_le_bytes());
                header[4..12].copy_from_slice(&pts_us.to_le_bytes());
                header[12..20].copy_from_slice(&ntp_ns.to_le_bytes());
                header[20..24].copy_from_slice(&(buf.len() as u32).to_le_bytes());
                &header[..24]
            }
            RecordFormat::Interleaved => {
                header[0..2].copy_from_slice(&(track as u16 + 1).to_le_bytes());
                header[2..4].copy_from_slice(&(flags.0 as u16).to_le_bytes());
                header[4..12].copy_from_slice(&pts_us.to_le_bytes());
                header[12..16].copy_from_slice(&(buf.len() as u32).to_le_bytes());
                &header[..16]
            }
        };

        file.write_all(header)
            .map_err(|e| SinkError::Storage(format!("segment write: {}", e)))?;
        file.write_all(buf)
            .map_err(|e| SinkError::Storage(format!("segment write: {}", e)))?;
        Ok(())
    }

    /// Close the current segment file, if any.
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|e| SinkError::Storage(format!("segment close: {}", e)))?;
        }
        Ok(())
    }
}

/// One manifest entry: a segment's starting PTS and its absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub pts_us: i64,
    pub path: PathBuf,
}

/// Enumerate the segments of a directory, ascending by starting PTS.
///
/// Non-`.ucf` children and subdirectories are skipped; a `.ucf` file whose
/// stem does not parse as an int64 fails the call.
pub fn read_manifest(dir: &Path) -> Result<Vec<ManifestEntry>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| SinkError::Storage(format!("read {}: {}", dir.display(), e)))?;

    let mut manifest = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SinkError::Storage(format!("read {}: {}", dir.display(), e)))?;
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let pts_us = stem.parse::<i64>().map_err(|_| {
            SinkError::Storage(format!("malformed segment filename: {}", path.display()))
        })?;
        manifest.push(ManifestEntry { pts_us, path });
    }

    manifest.sort_by_key(|e| e.pts_us);
    Ok(manifest)
}

/// Reading side of a segment directory.
///
/// Positioned at segment granularity by [`SampleReader::open`]; [`next`]
/// walks records and transparently rolls over to newer segments.
///
/// [`next`]: SampleReader::next
pub struct SampleReader {
    dir: PathBuf,
    format: RecordFormat,
    /// Track index stamped onto per-track records, which carry none.
    track: usize,
    file: File,
    /// Starting PTS of the currently open segment.
    pub segment_pts: i64,
}

impl SampleReader {
    /// Open a reader at the last segment whose starting PTS is ≤ `pts_us`,
    /// falling back to the first segment when every segment starts later.
    pub fn open(dir: impl Into<PathBuf>, format: RecordFormat, pts_us: i64) -> Result<Self> {
        Self::open_for_track(dir, format, pts_us, 0)
    }

    pub fn open_for_track(
        dir: impl Into<PathBuf>,
        format: RecordFormat,
        pts_us: i64,
        track: usize,
    ) -> Result<Self> {
        let dir = dir.into();
        let manifest = read_manifest(&dir)?;
        let entry = manifest
            .iter()
            .rev()
            .find(|e| e.pts_us <= pts_us)
            .or_else(|| manifest.first())
            .ok_or_else(|| SinkError::Storage(format!("no segments in {}", dir.display())))?;

        let file = File::open(&entry.path)
            .map_err(|e| SinkError::Storage(format!("open {}: {}", entry.path.display(), e)))?;
        Ok(Self {
            dir,
            format,
            track,
            file,
            segment_pts: entry.pts_us,
        })
    }

    /// Read the next record.
    ///
    /// Returns `Ok(None)` at end of stream. A reader that has reached the
    /// end of its segment re-scans the manifest and continues with the
    /// next segment by PTS; callers tailing a live directory just poll
    /// again after `None`.
    pub fn next(&mut self) -> Result<Option<Record>> {
        loop {
            let pos = self
                .file
                .stream_position()
                .map_err(|e| SinkError::Storage(format!("segment seek: {}", e)))?;

            match self.read_record() {
                Ok(record) => return Ok(Some(record)),
                Err(ReadOutcome::Truncated) => {
                    // A torn tail: either the writer is mid-append on the
                    // live segment, or we raced segment roll-over. Rewind so
                    // a later poll can retry the same offset.
                    self.file
                        .seek(SeekFrom::Start(pos))
                        .map_err(|e| SinkError::Storage(format!("segment seek: {}", e)))?;
                    if !self.roll_forward()? {
                        return Ok(None);
                    }
                }
                Err(ReadOutcome::Failed(e)) => return Err(e),
            }
        }
    }

    fn read_record(&mut self) -> std::result::Result<Record, ReadOutcome> {
        decode_record(&mut self.file, self.format, self.track)
    }

    /// Advance to the next segment strictly after the current one.
    fn roll_forward(&mut self) -> Result<bool> {
        let manifest = read_manifest(&self.dir)?;
        let Some(entry) = manifest.iter().find(|e| e.pts_us > self.segment_pts) else {
            return Ok(false);
        };

        let file = File::open(&entry.path)
            .map_err(|e| SinkError::Storage(format!("open {}: {}", entry.path.display(), e)))?;
        debug!("reader rolled over to {}", entry.path.display());
        self.file = file;
        self.segment_pts = entry.pts_us;
        Ok(true)
    }
}

/// Decode every complete record of a single segment file. A torn record
/// at the tail (writer mid-append) ends the result instead of failing.
pub fn read_segment_records(path: &Path, format: RecordFormat) -> Result<Vec<Record>> {
    let mut file =
        File::open(path).map_err(|e| SinkError::Storage(format!("open {}: {}", path.display(), e)))?;
    let mut records = Vec::new();
    loop {
        match decode_record(&mut file, format, 0) {
            Ok(record) => records.push(record),
            Err(ReadOutcome::Truncated) => return Ok(records),
            Err(ReadOutcome::Failed(e)) => return Err(e),
        }
    }
}

fn decode_record(
    file: &mut File,
    format: RecordFormat,
    track_hint: usize,
) -> std::result::Result<Record, ReadOutcome> {
    let mut header = [0u8; 24];
    let header_len = format.header_len();
    read_exact_or_truncated(file, &mut header[..header_len])?;

    let (track, flags, pts_us, ntp_ns, len) = match format {
        RecordFormat::PerTrack => {
            let flags = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let pts = i64::from_le_bytes(header[4..12].try_into().unwrap());
            let ntp = i64::from_le_bytes(header[12..20].try_into().unwrap());
            let len = u32::from_le_bytes(header[20..24].try_into().unwrap());
            (track_hint, flags, pts, ntp, len)
        }
        RecordFormat::Interleaved => {
            let raw_track = u16::from_le_bytes(header[0..2].try_into().unwrap());
            let flags = u16::from_le_bytes(header[2..4].try_into().unwrap()) as u32;
            let pts = i64::from_le_bytes(header[4..12].try_into().unwrap());
            let len = u32::from_le_bytes(header[12..16].try_into().unwrap());
            (raw_track.saturating_sub(1) as usize, flags, pts, 0, len)
        }
    };

    let mut payload = vec![0u8; len as usize];
    read_exact_or_truncated(file, &mut payload)?;

    Ok(Record {
        track,
        flags: BufferFlags(flags),
        pts_us,
        ntp_ns,
        payload,
    })
}

enum ReadOutcome {
    Truncated,
    Failed(SinkError),
}

fn read_exact_or_truncated(file: &mut File, buf: &mut [u8]) -> std::result::Result<(), ReadOutcome> {
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ReadOutcome::Truncated),
        Err(e) => Err(ReadOutcome::Failed(SinkError::Storage(format!(
            "segment read: {}",
            e
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: BufferFlags = BufferFlags::KEY_FRAME;
    const NONE: BufferFlags = BufferFlags(0);

    #[test]
    fn samples_before_first_keyframe_are_discarded() {
        let dir = TempDir::new().unwrap();
        let mut w = SegmentWriter::create(dir.path(), RecordFormat::PerTrack).unwrap();

        w.write_sample(0, b"p1", 1000, NONE).unwrap();
        w.write_sample(0, b"p2", 2000, NONE).unwrap();
        w.write_sample(0, b"p3", 3000, NONE).unwrap();
        w.write_sample(0, b"key", 4000, KEY).unwrap();
        w.write_sample(0, b"p4", 5000, NONE).unwrap();
        w.close().unwrap();

        let manifest = read_manifest(dir.path()).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].pts_us, 4000);

        let mut r = SampleReader::open(dir.path(), RecordFormat::PerTrack, 0).unwrap();
        let first = r.next().unwrap().unwrap();
        assert_eq!((first.pts_us, first.payload.as_slice()), (4000, &b"key"[..]));
        let second = r.next().unwrap().unwrap();
        assert_eq!((second.pts_us, second.payload.as_slice()), (5000, &b"p4"[..]));
        assert!(r.next().unwrap().is_none());
    }

    #[test]
    fn round_trip_preserves_tuples_in_order() {
        let dir = TempDir::new().unwrap();
        let mut w = SegmentWriter::create(dir.path(), RecordFormat::Interleaved).unwrap();

        let written = [
            (0usize, &b"video-key"[..], 100i64, KEY),
            (1, &b"audio"[..], 120, NONE),
            (0, &b"video-p"[..], 133, NONE),
        ];
        for (track, buf, pts, flags) in &written {
            w.write_sample(*track, buf, *pts, *flags).unwrap();
        }
        w.close().unwrap();

        let mut r = SampleReader::open(dir.path(), RecordFormat::Interleaved, 0).unwrap();
        for (track, buf, pts, flags) in &written {
            let rec = r.next().unwrap().unwrap();
            assert_eq!(rec.track, *track);
            assert_eq!(rec.flags, *flags);
            assert_eq!(rec.pts_us, *pts);
            assert_eq!(rec.payload.as_slice(), *buf);
        }
        assert!(r.next().unwrap().is_none());
    }

    #[test]
    fn keyframes_split_segments() {
        let dir = TempDir::new().unwrap();
        let mut w = SegmentWriter::create(dir.path(), RecordFormat::PerTrack).unwrap();

        w.write_sample(0, b"k1", 100, KEY).unwrap();
        w.write_sample(0, b"p", 133, NONE).unwrap();
        w.write_sample(0, b"k2", 200, KEY).unwrap();
        w.close().unwrap();

        let manifest = read_manifest(dir.path()).unwrap();
        assert_eq!(
            manifest.iter().map(|e| e.pts_us).collect::<Vec<_>>(),
            vec![100, 200]
        );
    }

    #[test]
    fn manifest_skips_foreign_children_and_rejects_bad_stems() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("100.ucf"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("video")).unwrap();

        let manifest = read_manifest(dir.path()).unwrap();
        assert_eq!(manifest.len(), 1);

        fs::write(dir.path().join("abc.ucf"), b"").unwrap();
        assert!(read_manifest(dir.path()).is_err());
    }

    #[test]
    fn reader_opens_first_segment_when_all_start_later() {
        let dir = TempDir::new().unwrap();
        let mut w = SegmentWriter::create(dir.path(), RecordFormat::PerTrack).unwrap();
        w.write_sample(0, b"k", 100, KEY).unwrap();
        w.close().unwrap();

        let mut r = SampleReader::open(dir.path(), RecordFormat::PerTrack, 0).unwrap();
        assert_eq!(r.segment_pts, 100);
        assert_eq!(r.next().unwrap().unwrap().pts_us, 100);
    }

    #[test]
    fn reader_positions_at_last_segment_at_or_before_pts() {
        let dir = TempDir::new().unwrap();
        let mut w = SegmentWriter::create(dir.path(), RecordFormat::PerTrack).unwrap();
        for pts in [0i64, 1_000_000, 2_000_000] {
            w.write_sample(0, b"k", pts, KEY).unwrap();
        }
        w.close().unwrap();

        let r = SampleReader::open(dir.path(), RecordFormat::PerTrack, 1_500_000).unwrap();
        assert_eq!(r.segment_pts, 1_000_000);
    }

    #[test]
    fn eof_rolls_over_to_appended_segment_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let mut w = SegmentWriter::create(dir.path(), RecordFormat::PerTrack).unwrap();
        w.write_sample(0, b"first", 100, KEY).unwrap();
        w.close().unwrap();

        let mut r = SampleReader::open(dir.path(), RecordFormat::PerTrack, 0).unwrap();
        assert_eq!(r.next().unwrap().unwrap().pts_us, 100);
        assert!(r.next().unwrap().is_none());

        w.write_sample(0, b"second", 200, KEY).unwrap();
        w.close().unwrap();

        let rec = r.next().unwrap().unwrap();
        assert_eq!(rec.pts_us, 200);
        assert_eq!(rec.payload, b"second");
        assert!(r.next().unwrap().is_none());
    }
}
