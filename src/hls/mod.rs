//! HLS vending server
//!
//! Read-only HTTP server over an interleaved-format segment store that
//! this sink's own writes populate. `GET /manifest.m3u8` lists the
//! segments; `GET /<pts_us>.ts` transmuxes the matching segment's records
//! into an MPEG-TS stream keyed by each record's track index.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Result, SinkError};
use crate::media::{nal, pts_to_90k, BufferFlags, MimeType};
use crate::mpegts::{TsCodec, TsWriter};
use crate::runtime;
use crate::sink::Sink;
use crate::store::{read_manifest, read_segment_records, RecordFormat, SegmentWriter};

/// Manifest target duration in seconds; also reported for the final
/// segment, whose real duration is not yet knowable.
const TARGET_DURATION_SECS: f64 = 2.0;

#[derive(Clone)]
struct VendorState {
    dir: PathBuf,
    codecs: Arc<Vec<TsCodec>>,
}

pub struct HlsSink {
    inner: Mutex<HlsState>,
}

struct HlsState {
    writer: SegmentWriter,
    shutdown: Option<oneshot::Sender<()>>,
    closed: bool,
}

impl HlsSink {
    pub fn start(path: &str, port: u16, tracks: &[MimeType]) -> Result<Self> {
        let codecs = tracks
            .iter()
            .map(|mime| TsCodec::from_mime(*mime))
            .collect::<Result<Vec<_>>>()?;

        let dir = PathBuf::from(path);
        let writer = SegmentWriter::create(&dir, RecordFormat::Interleaved)?;

        let state = VendorState {
            dir,
            codecs: Arc::new(codecs),
        };
        let router = Router::new()
            .route("/manifest.m3u8", get(serve_manifest))
            .route("/:segment", get(serve_segment))
            .with_state(state);

        let listener = runtime::block_on(TcpListener::bind(("0.0.0.0", port)))
            .map_err(|e| SinkError::TransportConnect(format!("HLS bind port {}: {}", port, e)))?;
        info!("HLS vending server listening on {}", port);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        runtime::handle().spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!("HLS server exited: {}", e);
            }
        });

        Ok(Self {
            inner: Mutex::new(HlsState {
                writer,
                shutdown: Some(shutdown_tx),
                closed: false,
            }),
        })
    }
}

impl Sink for HlsSink {
    fn write_sample(
        &self,
        track: usize,
        buf: &[u8],
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SinkError::State("hls sink is closed".to_string()));
        }
        inner.writer.write_sample(track, buf, pts_us, flags)?;
        Ok(false)
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        if let Some(shutdown) = inner.shutdown.take() {
            let _ = shutdown.send(());
        }
        inner.writer.close()
    }
}

async fn serve_manifest(State(state): State<VendorState>) -> Response {
    let manifest = match read_manifest(&state.dir) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!("HLS manifest read failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut body = String::new();
    body.push_str("#EXTM3U\n");
    body.push_str("#EXT-X-TARGETDURATION:2\n");
    body.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    for (i, entry) in manifest.iter().enumerate() {
        let duration = manifest
            .get(i + 1)
            .map(|next| (next.pts_us - entry.pts_us) as f64 / 1_000_000.0)
            .unwrap_or(TARGET_DURATION_SECS);
        body.push_str(&format!("#EXTINF:{:.3},\n", duration));
        body.push_str(&format!("/{}.ucf\n", entry.pts_us));
    }
    body.push_str("#EXT-X-ENDLIST\n");

    (
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        body,
    )
        .into_response()
}

async fn serve_segment(
    State(state): State<VendorState>,
    AxumPath(segment): AxumPath<String>,
) -> Response {
    let Some(stem) = segment.strip_suffix(".ts") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(pts_us) = stem.parse::<i64>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let manifest = match read_manifest(&state.dir) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!("HLS manifest read failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let Some(entry) = manifest.iter().find(|e| e.pts_us == pts_us) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let records = match read_segment_records(&entry.path, RecordFormat::Interleaved) {
        Ok(records) => records,
        Err(e) => {
            warn!("HLS segment read failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut muxer = TsWriter::new(Vec::new(), &state.codecs);
    for record in &records {
        let Some(codec) = state.codecs.get(record.track).copied() else {
            debug!("segment record references unknown track {}", record.track);
            continue;
        };
        let pts_90k = pts_to_90k(record.pts_us);
        let result = match codec {
            TsCodec::H264 | TsCodec::H265 => {
                let nalus = nal::split_nal_units(&record.payload);
                if nalus.is_empty() {
                    continue;
                }
                muxer.write_h26x(record.track, pts_90k, record.flags.is_keyframe(), &nalus)
            }
            TsCodec::AacAdts | TsCodec::Opus => {
                muxer.write_audio(record.track, pts_90k, &record.payload)
            }
        };
        if let Err(e) = result {
            warn!("HLS transmux failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    (
        [(header::CONTENT_TYPE, "application/mpegts")],
        muxer.into_inner(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SampleReader;
    use tempfile::TempDir;

    fn annexb_idr() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84]
    }

    #[test]
    fn sink_writes_interleaved_segments() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("hls");
        let sink = HlsSink::start(
            root.to_str().unwrap(),
            0,
            &[MimeType::VideoH264, MimeType::AudioOpus],
        )
        .unwrap();

        sink.write_sample(0, &annexb_idr(), 1_000_000, BufferFlags::KEY_FRAME)
            .unwrap();
        sink.write_sample(1, b"opus", 1_010_000, BufferFlags(0))
            .unwrap();
        sink.close().unwrap();

        let mut reader = SampleReader::open(&root, RecordFormat::Interleaved, 0).unwrap();
        let video = reader.next().unwrap().unwrap();
        assert_eq!(video.track, 0);
        assert_eq!(video.pts_us, 1_000_000);
        let audio = reader.next().unwrap().unwrap();
        assert_eq!(audio.track, 1);
    }

    #[tokio::test]
    async fn manifest_lists_segments_with_derived_durations() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), RecordFormat::Interleaved).unwrap();
        for pts in [0i64, 2_000_000, 5_000_000] {
            writer
                .write_sample(0, &annexb_idr(), pts, BufferFlags::KEY_FRAME)
                .unwrap();
        }
        writer.close().unwrap();

        let state = VendorState {
            dir: dir.path().to_path_buf(),
            codecs: Arc::new(vec![TsCodec::H264]),
        };
        let response = serve_manifest(State(state)).await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.starts_with("#EXTM3U\n"));
        assert!(text.contains("#EXT-X-TARGETDURATION:2\n"));
        assert!(text.contains("#EXTINF:2.000,\n/0.ucf\n"));
        assert!(text.contains("#EXTINF:3.000,\n/2000000.ucf\n"));
        // Final segment falls back to the target duration.
        assert!(text.contains("#EXTINF:2.000,\n/5000000.ucf\n"));
        assert!(text.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[tokio::test]
    async fn segment_endpoint_transmuxes_and_rejects_bad_paths() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), RecordFormat::Interleaved).unwrap();
        writer
            .write_sample(0, &annexb_idr(), 4_000_000, BufferFlags::KEY_FRAME)
            .unwrap();
        writer.close().unwrap();

        let state = VendorState {
            dir: dir.path().to_path_buf(),
            codecs: Arc::new(vec![TsCodec::H264]),
        };

        let ok = serve_segment(State(state.clone()), AxumPath("4000000.ts".to_string())).await;
        assert_eq!(ok.status(), StatusCode::OK);
        let body = axum::body::to_bytes(ok.into_body(), usize::MAX).await.unwrap();
        assert!(!body.is_empty());
        assert_eq!(body.len() % 188, 0);
        assert_eq!(body[0], 0x47);

        let missing =
            serve_segment(State(state.clone()), AxumPath("123.ts".to_string())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let malformed =
            serve_segment(State(state.clone()), AxumPath("abc.ts".to_string())).await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let foreign = serve_segment(State(state), AxumPath("favicon.ico".to_string())).await;
        assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
    }
}
