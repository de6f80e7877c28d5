//! SRT sink
//!
//! Transports samples as an MPEG-TS stream over an SRT send socket in live
//! mode. Samples are muxed per codec, chunked to the negotiated payload
//! size and flushed after every write. The AIMD estimator in [`aimd`]
//! turns socket statistics into a target bitrate and raises PLI when the
//! loss counter moves.

pub mod aimd;
pub mod options;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use srt_tokio::SrtSocket;
use tracing::{debug, info, warn};

use crate::error::{Result, SinkError};
use crate::media::{nal, pts_to_90k, BufferFlags, MimeType};
use crate::mpegts::{TsCodec, TsWriter};
use crate::runtime;
use crate::sink::{KeyframeRequest, Sink};

use aimd::{AimdEstimator, SrtProbe};
use options::{OptionBinding, SrtTarget};

/// Library init reference counter: the first sink brings the stack up,
/// the last one tears it down.
static ACTIVE_SINKS: AtomicUsize = AtomicUsize::new(0);

fn stack_ref() {
    if ACTIVE_SINKS.fetch_add(1, Ordering::SeqCst) == 0 {
        info!("SRT stack initialized");
    }
}

fn stack_unref() {
    if ACTIVE_SINKS.fetch_sub(1, Ordering::SeqCst) == 1 {
        info!("SRT stack torn down");
    }
}

pub struct SrtSink {
    inner: Mutex<Inner>,
}

struct Inner {
    socket: Option<SrtSocket>,
    muxer: TsWriter<Vec<u8>>,
    codecs: Vec<TsCodec>,
    payload_size: usize,
    estimator: AimdEstimator,
    callback: Option<Arc<dyn KeyframeRequest>>,
}

impl SrtSink {
    /// Parse the URL, resolve the host, connect and negotiate, then build
    /// the MPEG-TS writer over the socket's payload framing.
    pub fn connect(url: &str, tracks: &[MimeType]) -> Result<Self> {
        let target = SrtTarget::parse(url)?;

        let codecs = tracks
            .iter()
            .map(|mime| TsCodec::from_mime(*mime))
            .collect::<Result<Vec<_>>>()?;

        // First resolved address wins.
        let addr = {
            use std::net::ToSocketAddrs;
            (target.host.as_str(), target.port)
                .to_socket_addrs()
                .map_err(|e| {
                    SinkError::TransportConnect(format!("resolve {}: {}", target.host, e))
                })?
                .next()
                .ok_or_else(|| {
                    SinkError::TransportConnect(format!("no addresses for {}", target.host))
                })?
        };

        for name in target.unapplied(OptionBinding::Pre) {
            debug!("SRT option {} noted (no transport knob)", name);
        }

        stack_ref();
        let socket = runtime::block_on(async {
            let mut builder = SrtSocket::builder();
            if let Some(latency) = target.latency_ms() {
                builder = builder.latency(Duration::from_millis(latency as u64));
            }
            if let Some(passphrase) = target.passphrase() {
                builder = builder.encryption(0, passphrase);
            }
            builder.call(addr, target.stream_id()).await
        })
        .map_err(|e| {
            stack_unref();
            SinkError::TransportConnect(format!("srt connect {}: {}", addr, e))
        })?;

        for name in target.unapplied(OptionBinding::Post) {
            debug!("SRT post-connect option {} noted (no transport knob)", name);
        }

        let payload_size = target.payload_size();
        info!(
            "SRT sink connected to {} ({} tracks, payload size {})",
            addr,
            codecs.len(),
            payload_size
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                socket: Some(socket),
                muxer: TsWriter::new(Vec::new(), &codecs),
                codecs,
                payload_size,
                estimator: AimdEstimator::new(),
                callback: None,
            }),
        })
    }

    fn flush_muxed(inner: &mut Inner) -> Result<()> {
        let data = std::mem::take(inner.muxer.get_mut());
        if data.is_empty() {
            return Ok(());
        }
        let socket = inner
            .socket
            .as_mut()
            .ok_or_else(|| SinkError::State("srt sink is closed".to_string()))?;
        let payload_size = inner.payload_size;

        runtime::block_on(async {
            for chunk in data.chunks(payload_size) {
                socket
                    .send((Instant::now(), Bytes::copy_from_slice(chunk)))
                    .await
                    .map_err(|e| SinkError::TransportWrite(format!("srt send: {}", e)))?;
            }
            socket
                .flush()
                .await
                .map_err(|e| SinkError::TransportWrite(format!("srt flush: {}", e)))
        })
    }
}

impl Sink for SrtSink {
    fn write_sample(
        &self,
        track: usize,
        buf: &[u8],
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.socket.is_none() {
            return Err(SinkError::State("srt sink is closed".to_string()));
        }
        let codec = *inner
            .codecs
            .get(track)
            .ok_or_else(|| SinkError::State(format!("invalid track index {}", track)))?;

        let pts_90k = pts_to_90k(pts_us);
        match codec {
            TsCodec::H264 | TsCodec::H265 => {
                let nalus = nal::split_nal_units(buf);
                if nalus.is_empty() {
                    debug!("no NAL units in {} byte buffer, skipping", buf.len());
                    return Ok(false);
                }
                inner
                    .muxer
                    .write_h26x(track, pts_90k, flags.is_keyframe(), &nalus)?;
            }
            TsCodec::AacAdts | TsCodec::Opus => {
                inner.muxer.write_audio(track, pts_90k, buf)?;
            }
        }

        Self::flush_muxed(&mut inner)?;
        Ok(false)
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(mut socket) = inner.socket.take() else {
            return Ok(());
        };
        let result = runtime::block_on(socket.close());
        stack_unref();
        result.map_err(|e| SinkError::TransportWrite(format!("srt close: {}", e)))
    }

    fn bandwidth_estimate(&self) -> Option<i64> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.socket.is_some() && inner.estimator.should_probe(now) {
            if let Some(probe) = sample_statistics(&mut inner) {
                if inner.estimator.on_probe(now, &probe) {
                    // Loss observed: request an encoder refresh off the
                    // write path so the upcall never runs under our lock.
                    if let Some(callback) = inner.callback.clone() {
                        warn!("SRT loss detected, requesting keyframe");
                        runtime::handle().spawn(async move {
                            callback.request_keyframe();
                        });
                    }
                }
            }
        }
        Some(inner.estimator.target())
    }

    fn set_keyframe_callback(&self, callback: Arc<dyn KeyframeRequest>) {
        self.inner.lock().callback = Some(callback);
    }
}

/// Pull one statistics snapshot from the socket without blocking the
/// caller for longer than a poll tick.
fn sample_statistics(inner: &mut Inner) -> Option<SrtProbe> {
    let socket = inner.socket.as_mut()?;
    let stats = runtime::block_on(async {
        tokio::time::timeout(Duration::from_millis(20), socket.statistics().next())
            .await
            .ok()
            .flatten()
    })?;
    Some(SrtProbe {
        pkt_snd_loss_total: (stats.tx_loss_data + stats.rx_loss_data) as u64,
        ms_rtt: stats.tx_average_rtt.as_secs_f64() * 1000.0,
    })
}

impl Drop for SrtSink {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.socket.take().is_some() {
            stack_unref();
        }
    }
}
