//! Sink contract and configuration dispatcher
//!
//! Every output — WHIP push, SRT push, RTSP pull server, segmented disk
//! store, HLS vending server — implements the same small [`Sink`] trait.
//! The producer writes encoded samples; control flows back up either
//! through the `write_sample` return value (keyframe requested) or
//! asynchronously through a registered [`KeyframeRequest`] capability.

pub mod disk;

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::error::{Result, SinkError};
use crate::media::{parse_track_list, BufferFlags};

/// Common contract for all output sinks.
///
/// Implementations are safe to call from any thread; a single internal
/// mutex serializes `write_sample`, `bandwidth_estimate` and `close`.
pub trait Sink: Send + Sync {
    /// Write one encoded sample.
    ///
    /// Returns `Ok(true)` when the sink wants the producer to emit a
    /// keyframe at the next opportunity.
    fn write_sample(
        &self,
        track: usize,
        buf: &[u8],
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<bool>;

    /// Release external resources. Idempotent: the first call releases,
    /// later calls are no-ops; writes after close return a `State` error.
    fn close(&self) -> Result<()>;

    /// Congestion-feedback-driven bitrate target in bits per second, when
    /// the sink has one. This is not the instantaneous send rate.
    fn bandwidth_estimate(&self) -> Option<i64> {
        None
    }

    /// Register the keyframe-request upcall (PLI and friends).
    fn set_keyframe_callback(&self, _callback: Arc<dyn KeyframeRequest>) {}
}

impl std::fmt::Debug for dyn Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Sink")
    }
}

/// Capability handed to sinks for requesting an encoder refresh.
pub trait KeyframeRequest: Send + Sync {
    fn request_keyframe(&self);
}

/// JSON sink descriptor as sent by the producer application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub sink_type: String,
    pub enabled: bool,
    pub url: Option<String>,
    pub bearer_token: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub stream_id: Option<String>,
    pub passphrase: Option<String>,
    pub stream_key: Option<String>,
    pub path: Option<String>,
}

fn required<'a>(field: Option<&'a String>, name: &str, sink_type: &str) -> Result<&'a str> {
    field
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            SinkError::ConfigInvalid(format!("{} sink requires `{}`", sink_type, name))
        })
}

/// Build a sink from a JSON descriptor and the semicolon-joined codec
/// MIME list giving track order.
pub fn create_sink(config_json: &str, mime_types: &str) -> Result<Arc<dyn Sink>> {
    let cfg: SinkConfig = serde_json::from_str(config_json)?;

    if !cfg.enabled {
        return Err(SinkError::ConfigInvalid("sink is disabled".to_string()));
    }

    let tracks = parse_track_list(mime_types)?;
    info!(
        "creating {} sink with {} track(s)",
        cfg.sink_type,
        tracks.len()
    );

    match cfg.sink_type.as_str() {
        "WHIP" => {
            let url = required(cfg.url.as_ref(), "url", "WHIP")?;
            let sink = crate::whip::WhipSink::connect(
                url,
                cfg.bearer_token.as_deref().unwrap_or(""),
                &tracks,
            )?;
            Ok(Arc::new(sink))
        }
        "SRT" => {
            let host = required(cfg.host.as_ref(), "host", "SRT")?;
            let port = cfg
                .port
                .ok_or_else(|| SinkError::ConfigInvalid("SRT sink requires `port`".to_string()))?;
            let mut url = format!("srt://{}:{}", host, port);
            let mut query = Vec::new();
            if let Some(stream_id) = cfg.stream_id.as_deref().filter(|s| !s.is_empty()) {
                query.push(format!("streamid={}", stream_id));
            }
            if let Some(passphrase) = cfg.passphrase.as_deref().filter(|s| !s.is_empty()) {
                query.push(format!("passphrase={}", passphrase));
            }
            if !query.is_empty() {
                url.push('?');
                url.push_str(&query.join("&"));
            }
            Ok(Arc::new(crate::srt::SrtSink::connect(&url, &tracks)?))
        }
        "RTMP" => Err(SinkError::ConfigInvalid(
            "RTMP sink not yet implemented".to_string(),
        )),
        "RTSP" => {
            let path = required(cfg.path.as_ref(), "path", "RTSP")?;
            let port = cfg.port.filter(|p| *p != 0).unwrap_or(8554);
            Ok(Arc::new(crate::rtsp::RtspServerSink::start(
                path, port, &tracks,
            )?))
        }
        "Disk" => {
            let path = required(cfg.path.as_ref(), "path", "Disk")?;
            Ok(Arc::new(disk::DiskSink::create(path, &tracks)?))
        }
        "HLS" => {
            let path = required(cfg.path.as_ref(), "path", "HLS")?;
            let port = cfg.port.filter(|p| *p != 0).unwrap_or(8080);
            Ok(Arc::new(crate::hls::HlsSink::start(path, port, &tracks)?))
        }
        other => Err(SinkError::ConfigInvalid(format!(
            "unknown sink type: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sink_is_rejected() {
        let err = create_sink(
            r#"{"type":"Disk","enabled":false,"path":"/tmp/x"}"#,
            "video/avc",
        )
        .unwrap_err();
        assert!(matches!(err, SinkError::ConfigInvalid(_)));
    }

    #[test]
    fn unknown_sink_type_is_rejected() {
        let err = create_sink(
            r#"{"type":"Carrier","enabled":true}"#,
            "video/avc",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown sink type"));
    }

    #[test]
    fn rtmp_is_reserved() {
        let err = create_sink(r#"{"type":"RTMP","enabled":true}"#, "video/avc").unwrap_err();
        assert!(err.to_string().contains("RTMP"));
    }

    #[test]
    fn disk_sink_from_descriptor() {
        let dir = tempfile::TempDir::new().unwrap();
        let json = format!(
            r#"{{"type":"Disk","enabled":true,"path":"{}"}}"#,
            dir.path().display()
        );
        let sink = create_sink(&json, "video/avc;audio/opus").unwrap();
        assert!(!sink
            .write_sample(0, &[0, 0, 0, 1, 0x65], 100, BufferFlags::KEY_FRAME)
            .unwrap());
        sink.close().unwrap();
    }

    #[test]
    fn bad_mime_list_is_a_codec_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let json = format!(
            r#"{{"type":"Disk","enabled":true,"path":"{}"}}"#,
            dir.path().display()
        );
        assert!(matches!(
            create_sink(&json, "video/unknown").unwrap_err(),
            SinkError::Codec(_)
        ));
    }
}
