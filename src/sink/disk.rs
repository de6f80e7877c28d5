//! Disk sink
//!
//! Write-through wrapper binding the producer's track list to per-track
//! subdirectories of a root path. Each track owns its own keyframe-anchored
//! segment writer; nothing here blocks on anything but the filesystem.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Result, SinkError};
use crate::media::{BufferFlags, MimeType};
use crate::sink::Sink;
use crate::store::{RecordFormat, SegmentWriter};

pub struct DiskSink {
    inner: Mutex<Inner>,
}

struct Inner {
    tracks: Vec<SegmentWriter>,
    closed: bool,
}

impl DiskSink {
    /// Create the per-track directory layout under `root`. Directory names
    /// are the mime strings themselves, so `video/avc` nests one level.
    pub fn create(root: impl AsRef<Path>, tracks: &[MimeType]) -> Result<Self> {
        let root = root.as_ref();
        let writers = tracks
            .iter()
            .map(|mime| SegmentWriter::create(root.join(mime.as_str()), RecordFormat::PerTrack))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            inner: Mutex::new(Inner {
                tracks: writers,
                closed: false,
            }),
        })
    }

    /// Directory a given track writes into.
    pub fn track_dir(root: impl AsRef<Path>, mime: MimeType) -> PathBuf {
        root.as_ref().join(mime.as_str())
    }
}

impl Sink for DiskSink {
    fn write_sample(
        &self,
        track: usize,
        buf: &[u8],
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SinkError::State("disk sink is closed".to_string()));
        }
        let count = inner.tracks.len();
        let writer = inner
            .tracks
            .get_mut(track)
            .ok_or_else(|| SinkError::State(format!("invalid track index {} of {}", track, count)))?;
        writer.write_sample(track, buf, pts_us, flags)?;
        Ok(false)
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        for writer in &mut inner.tracks {
            writer.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::read_manifest;
    use tempfile::TempDir;

    #[test]
    fn writes_land_in_per_track_directories() {
        let dir = TempDir::new().unwrap();
        let sink =
            DiskSink::create(dir.path(), &[MimeType::VideoH264, MimeType::AudioOpus]).unwrap();

        sink.write_sample(0, b"video", 100, BufferFlags::KEY_FRAME)
            .unwrap();
        sink.write_sample(1, b"audio", 100, BufferFlags::KEY_FRAME)
            .unwrap();
        sink.close().unwrap();

        let video = read_manifest(&dir.path().join("video/avc")).unwrap();
        let audio = read_manifest(&dir.path().join("audio/opus")).unwrap();
        assert_eq!(video.len(), 1);
        assert_eq!(audio.len(), 1);
    }

    #[test]
    fn invalid_track_index_is_a_state_error() {
        let dir = TempDir::new().unwrap();
        let sink = DiskSink::create(dir.path(), &[MimeType::VideoH264]).unwrap();
        assert!(matches!(
            sink.write_sample(3, b"x", 0, BufferFlags::KEY_FRAME),
            Err(SinkError::State(_))
        ));
    }

    #[test]
    fn write_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let sink = DiskSink::create(dir.path(), &[MimeType::VideoH264]).unwrap();
        sink.close().unwrap();
        sink.close().unwrap(); // idempotent
        assert!(sink
            .write_sample(0, b"x", 0, BufferFlags::KEY_FRAME)
            .is_err());
    }
}
