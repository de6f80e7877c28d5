//! WHIP sink
//!
//! WebRTC sender with one H.264 video track and optionally one Opus audio
//! track, signaled over the WHIP HTTP profile: POST the SDP offer, read
//! the SDP answer, remember the `Location` resource URL and DELETE it on
//! close. RTP timestamps are driven absolutely from the producer's PTS.
//! SPS/PPS are cached on arrival and re-emitted ahead of every IDR so a
//! receiver can join mid-stream. The connection recovers itself: any
//! non-terminal exit state spawns a single reconnector that re-runs
//! signaling until the sink is closed.

pub mod bwe;
pub mod track;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::error::{Result, SinkError};
use crate::media::{nal, pts_to_rtp, BufferFlags, MimeType};
use crate::runtime;
use crate::sink::{KeyframeRequest, Sink};

use bwe::{BandwidthEstimator, CongestionBackend, TwccObservation};
use track::{RtpTrack, H264_CLOCK_RATE, OPUS_CLOCK_RATE, PLAYOUT_DELAY_URI};

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Construction knobs not carried by the JSON descriptor.
#[derive(Debug, Clone)]
pub struct WhipSinkOptions {
    pub stun_server: String,
    pub congestion: CongestionBackend,
}

impl Default for WhipSinkOptions {
    fn default() -> Self {
        Self {
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            congestion: CongestionBackend::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackRole {
    Video,
    Audio,
}

struct ConnFlags {
    reconnecting: bool,
    closed: bool,
    peer_state: RTCPeerConnectionState,
    ice_state: RTCIceConnectionState,
}

/// State the hot path and background tasks share. The flags live behind a
/// reader-writer lock so `write_sample` can observe `reconnecting` and
/// `closed` without ever blocking on the reconnector.
struct Shared {
    url: String,
    bearer_token: String,
    stun_server: String,
    roles: Vec<TrackRole>,
    has_audio: bool,
    flags: RwLock<ConnFlags>,
    callback: RwLock<Option<Arc<dyn KeyframeRequest>>>,
    keyframe_requested: AtomicBool,
    estimator: Mutex<Box<dyn BandwidthEstimator>>,
    resource_url: RwLock<Option<String>>,
    http: reqwest::Client,
    epoch: Instant,
}

impl Shared {
    fn request_keyframe(&self, reason: &str) {
        debug!("keyframe requested ({})", reason);
        if let Some(callback) = self.callback.read().clone() {
            runtime::handle().spawn(async move {
                callback.request_keyframe();
            });
        } else {
            self.keyframe_requested.store(true, Ordering::SeqCst);
        }
    }

    fn take_keyframe_request(&self) -> bool {
        self.keyframe_requested.swap(false, Ordering::SeqCst)
    }
}

struct Peer {
    pc: Arc<RTCPeerConnection>,
    video: RtpTrack,
    audio: Option<RtpTrack>,
}

struct SinkInner {
    peer: Option<Peer>,
    cached_sps: Option<Bytes>,
    cached_pps: Option<Bytes>,
}

pub struct WhipSink {
    shared: Arc<Shared>,
    inner: Arc<Mutex<SinkInner>>,
}

impl WhipSink {
    pub fn connect(url: &str, bearer_token: &str, tracks: &[MimeType]) -> Result<Self> {
        Self::connect_with(url, bearer_token, tracks, WhipSinkOptions::default())
    }

    pub fn connect_with(
        url: &str,
        bearer_token: &str,
        tracks: &[MimeType],
        options: WhipSinkOptions,
    ) -> Result<Self> {
        let roles = map_roles(tracks)?;
        let has_audio = roles.contains(&TrackRole::Audio);

        let shared = Arc::new(Shared {
            url: url.to_string(),
            bearer_token: bearer_token.to_string(),
            stun_server: options.stun_server,
            roles,
            has_audio,
            flags: RwLock::new(ConnFlags {
                reconnecting: false,
                closed: false,
                peer_state: RTCPeerConnectionState::New,
                ice_state: RTCIceConnectionState::New,
            }),
            callback: RwLock::new(None),
            keyframe_requested: AtomicBool::new(false),
            estimator: Mutex::new(options.congestion.build()),
            resource_url: RwLock::new(None),
            http: reqwest::Client::new(),
            epoch: Instant::now(),
        });
        let inner = Arc::new(Mutex::new(SinkInner {
            peer: None,
            cached_sps: None,
            cached_pps: None,
        }));

        let peer = runtime::block_on(establish(shared.clone(), inner.clone()))?;
        inner.lock().peer = Some(peer);
        info!("WHIP sink connected to {}", url);

        Ok(Self { shared, inner })
    }

    /// ICE connection state of the current peer, as a lowercase string.
    pub fn ice_connection_state(&self) -> String {
        self.shared.flags.read().ice_state.to_string()
    }

    /// Peer connection state of the current peer, as a lowercase string.
    pub fn peer_connection_state(&self) -> String {
        self.shared.flags.read().peer_state.to_string()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.flags.read().reconnecting
    }
}

fn map_roles(tracks: &[MimeType]) -> Result<Vec<TrackRole>> {
    let roles = tracks
        .iter()
        .map(|mime| match mime {
            MimeType::VideoH264 => Ok(TrackRole::Video),
            MimeType::AudioOpus => Ok(TrackRole::Audio),
            other => Err(SinkError::Codec(format!(
                "WHIP sink cannot carry {}",
                other.as_str()
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    let videos = roles.iter().filter(|r| **r == TrackRole::Video).count();
    let audios = roles.iter().filter(|r| **r == TrackRole::Audio).count();
    if videos != 1 || audios > 1 {
        return Err(SinkError::ConfigInvalid(format!(
            "WHIP sink takes one H.264 track and at most one Opus track, got {} video / {} audio",
            videos, audios
        )));
    }
    Ok(roles)
}

/// Build a peer, run WHIP signaling, and hand back the connected tracks.
async fn establish(shared: Arc<Shared>, inner: Arc<Mutex<SinkInner>>) -> Result<Peer> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| SinkError::Codec(format!("register codecs: {}", e)))?;
    media_engine
        .register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: PLAYOUT_DELAY_URI.to_string(),
            },
            RTPCodecType::Video,
            Some(RTCRtpTransceiverDirection::Sendonly),
        )
        .map_err(|e| SinkError::Codec(format!("register playout-delay extension: {}", e)))?;

    // NACK generator + responder, RTCP reports and the TWCC sender
    // feedback all ride in the default interceptor chain.
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| SinkError::TransportConnect(format!("register interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![shared.stun_server.clone()],
            ..Default::default()
        }],
        ..Default::default()
    };
    let pc = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(|e| SinkError::TransportConnect(format!("create peer connection: {}", e)))?,
    );

    let video = RtpTrack::h264();
    let video_sender = pc
        .add_track(video.local())
        .await
        .map_err(|e| SinkError::TransportConnect(format!("add video track: {}", e)))?;
    spawn_rtcp_reader(shared.clone(), video_sender, true);

    let audio = if shared.has_audio {
        let audio = RtpTrack::opus();
        let sender = pc
            .add_track(audio.local())
            .await
            .map_err(|e| SinkError::TransportConnect(format!("add audio track: {}", e)))?;
        spawn_rtcp_reader(shared.clone(), sender, false);
        Some(audio)
    } else {
        None
    };

    let state_shared = shared.clone();
    let state_inner = inner.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let shared = state_shared.clone();
        let inner = state_inner.clone();
        Box::pin(async move {
            info!("WHIP peer connection state: {}", state);
            shared.flags.write().peer_state = state;
            if matches!(
                state,
                RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
            ) {
                maybe_spawn_reconnector(shared, inner);
            }
        })
    }));

    let ice_shared = shared.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let shared = ice_shared.clone();
        Box::pin(async move {
            debug!("WHIP ICE connection state: {}", state);
            shared.flags.write().ice_state = state;
        })
    }));

    signal(&shared, &pc).await?;

    Ok(Peer { pc, video, audio })
}

/// POST the offer, resolve the resource URL, apply the answer.
async fn signal(shared: &Shared, pc: &Arc<RTCPeerConnection>) -> Result<()> {
    let offer = pc
        .create_offer(None)
        .await
        .map_err(|e| SinkError::ProtocolNegotiation(format!("create offer: {}", e)))?;
    pc.set_local_description(offer)
        .await
        .map_err(|e| SinkError::ProtocolNegotiation(format!("set local description: {}", e)))?;

    // Non-trickle: wait for candidate gathering so the offer is complete.
    let mut gathered = pc.gathering_complete_promise().await;
    let _ = gathered.recv().await;

    let offer = pc.local_description().await.ok_or_else(|| {
        SinkError::ProtocolNegotiation("no local description after gathering".to_string())
    })?;

    let mut request = shared
        .http
        .post(&shared.url)
        .header("Content-Type", "application/sdp")
        .body(offer.sdp);
    if !shared.bearer_token.is_empty() {
        request = request.bearer_auth(&shared.bearer_token);
    }
    let response = request
        .send()
        .await
        .map_err(|e| SinkError::ProtocolNegotiation(format!("WHIP POST {}: {}", shared.url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SinkError::ProtocolNegotiation(format!(
            "WHIP endpoint returned {}",
            status
        )));
    }

    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(location) = location {
        let resolved = url::Url::parse(&shared.url)
            .ok()
            .and_then(|base| base.join(&location).ok())
            .map(|u| u.to_string())
            .unwrap_or(location);
        debug!("WHIP resource: {}", resolved);
        *shared.resource_url.write() = Some(resolved);
    }

    let answer_sdp = response
        .text()
        .await
        .map_err(|e| SinkError::ProtocolNegotiation(format!("read WHIP answer: {}", e)))?;
    let answer = RTCSessionDescription::answer(answer_sdp)
        .map_err(|e| SinkError::ProtocolNegotiation(format!("parse WHIP answer: {}", e)))?;
    pc.set_remote_description(answer)
        .await
        .map_err(|e| SinkError::ProtocolNegotiation(format!("set remote description: {}", e)))?;
    Ok(())
}

/// Drain the sender's RTCP stream. On the video sender this is where PLI,
/// FIR and TWCC feedback arrive; the audio sender is read for the side
/// effects in the interceptor chain only.
fn spawn_rtcp_reader(shared: Arc<Shared>, sender: Arc<RTCRtpSender>, video: bool) {
    runtime::handle().spawn(async move {
        loop {
            let packets = match sender.read_rtcp().await {
                Ok((packets, _)) => packets,
                Err(_) => break,
            };
            if !video {
                continue;
            }
            for packet in packets {
                let any = packet.as_any();
                if any.downcast_ref::<PictureLossIndication>().is_some() {
                    shared.request_keyframe("PLI");
                } else if any.downcast_ref::<FullIntraRequest>().is_some() {
                    shared.request_keyframe("FIR");
                } else if let Some(twcc) = any.downcast_ref::<TransportLayerCc>() {
                    let local_ms =
                        Instant::now().duration_since(shared.epoch).as_secs_f64() * 1000.0;
                    let observation = digest_twcc(
                        twcc.packet_status_count,
                        twcc.recv_deltas.len(),
                        twcc.reference_time,
                        local_ms,
                    );
                    shared.estimator.lock().on_feedback(&observation);
                }
            }
        }
    });
}

fn digest_twcc(expected: u16, received: usize, reference_time: u32, local_ms: f64) -> TwccObservation {
    TwccObservation {
        expected: expected as u32,
        received: received as u32,
        // reference_time ticks are 64 ms; only the gradient of this proxy
        // is consumed downstream.
        owd_proxy_ms: local_ms - reference_time as f64 * 64.0,
    }
}

/// Spawn the reconnector unless one is already running or the sink is
/// closed. The `reconnecting` flag is the single-instance guard.
fn maybe_spawn_reconnector(shared: Arc<Shared>, inner: Arc<Mutex<SinkInner>>) {
    {
        let mut flags = shared.flags.write();
        if flags.closed || flags.reconnecting {
            return;
        }
        flags.reconnecting = true;
    }
    warn!("WHIP connection lost, reconnecting");
    runtime::handle().spawn(reconnect_loop(shared, inner));
}

fn reconnect_loop(
    shared: Arc<Shared>,
    inner: Arc<Mutex<SinkInner>>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            if shared.flags.read().closed {
                shared.flags.write().reconnecting = false;
                return;
            }

            let old = inner.lock().peer.take();
            if let Some(peer) = old {
                let _ = peer.pc.close().await;
            }

            match establish(shared.clone(), inner.clone()).await {
                Ok(peer) => {
                    inner.lock().peer = Some(peer);
                    shared.flags.write().reconnecting = false;
                    info!("WHIP reconnected");
                    return;
                }
                Err(e) => {
                    debug!("WHIP reconnect attempt failed: {}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    })
}

/// Expand one video sample into the NAL units to put on the wire.
///
/// SPS and PPS are absorbed into the cache instead of being sent on
/// arrival; an IDR pulls the freshest cached copies back out immediately
/// ahead of itself so every keyframe is self-contained.
fn plan_video_emission(
    nalus: &[&[u8]],
    cached_sps: &mut Option<Bytes>,
    cached_pps: &mut Option<Bytes>,
) -> Vec<Bytes> {
    let mut emission = Vec::with_capacity(nalus.len() + 2);
    for nalu in nalus {
        match nal::h264_nal_type(nalu) {
            Some(nal::H264_NAL_SPS) => {
                *cached_sps = Some(Bytes::copy_from_slice(nalu));
            }
            Some(nal::H264_NAL_PPS) => {
                *cached_pps = Some(Bytes::copy_from_slice(nalu));
            }
            Some(nal::H264_NAL_IDR) => {
                if let Some(sps) = cached_sps.clone() {
                    emission.push(sps);
                }
                if let Some(pps) = cached_pps.clone() {
                    emission.push(pps);
                }
                emission.push(Bytes::copy_from_slice(nalu));
            }
            _ => emission.push(Bytes::copy_from_slice(nalu)),
        }
    }
    emission
}

impl Sink for WhipSink {
    fn write_sample(
        &self,
        track: usize,
        buf: &[u8],
        pts_us: i64,
        _flags: BufferFlags,
    ) -> Result<bool> {
        {
            let flags = self.shared.flags.read();
            if flags.closed {
                return Err(SinkError::State("whip sink is closed".to_string()));
            }
            if flags.reconnecting {
                // Drop the payload; the reconnector owns the peer.
                return Ok(false);
            }
        }

        let role = *self
            .shared
            .roles
            .get(track)
            .ok_or_else(|| SinkError::State(format!("invalid track index {}", track)))?;

        let mut inner = self.inner.lock();
        let SinkInner {
            peer,
            cached_sps,
            cached_pps,
        } = &mut *inner;
        let Some(peer) = peer.as_mut() else {
            return Ok(false);
        };

        match role {
            TrackRole::Video => {
                let nalus = nal::split_nal_units(buf);
                if nalus.is_empty() {
                    debug!("no NAL units in {} byte video buffer, skipping", buf.len());
                    return Ok(self.shared.take_keyframe_request());
                }
                let timestamp = pts_to_rtp(pts_us, H264_CLOCK_RATE);
                let emission = plan_video_emission(&nalus, cached_sps, cached_pps);
                let count = emission.len();
                runtime::block_on(async {
                    for (i, nalu) in emission.iter().enumerate() {
                        peer.video
                            .write_nal(nalu, timestamp, i + 1 == count)
                            .await?;
                    }
                    Ok::<(), SinkError>(())
                })?;
            }
            TrackRole::Audio => {
                if let Some(audio) = peer.audio.as_mut() {
                    let timestamp = pts_to_rtp(pts_us, OPUS_CLOCK_RATE);
                    runtime::block_on(audio.write_audio(buf, timestamp))?;
                }
            }
        }

        Ok(self.shared.take_keyframe_request())
    }

    fn close(&self) -> Result<()> {
        {
            let mut flags = self.shared.flags.write();
            if flags.closed {
                return Ok(());
            }
            flags.closed = true;
        }

        // Best-effort resource teardown; losing the DELETE is not fatal.
        let resource = self.shared.resource_url.read().clone();
        if let Some(url) = resource {
            let mut request = self.shared.http.delete(&url);
            if !self.shared.bearer_token.is_empty() {
                request = request.bearer_auth(&self.shared.bearer_token);
            }
            runtime::block_on(async {
                match request.send().await {
                    Ok(response) => debug!("WHIP resource deleted: {}", response.status()),
                    Err(e) => warn!("WHIP DELETE {} failed: {}", url, e),
                }
            });
        }

        let peer = self.inner.lock().peer.take();
        if let Some(peer) = peer {
            runtime::block_on(peer.pc.close())
                .map_err(|e| SinkError::TransportWrite(format!("close peer: {}", e)))?;
        }
        Ok(())
    }

    fn bandwidth_estimate(&self) -> Option<i64> {
        Some(self.shared.estimator.lock().target().reported())
    }

    fn set_keyframe_callback(&self, callback: Arc<dyn KeyframeRequest>) {
        *self.shared.callback.write() = Some(callback);
    }
}
