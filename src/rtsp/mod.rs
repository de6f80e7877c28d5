//! RTSP server sink
//!
//! Read-only RTSP server fed by the producer's writes. Live samples fan
//! out to every subscribed session as RTP (TCP-interleaved or UDP
//! unicast); a PLAY request with a positive NPT range switches the
//! session onto recorded playback out of the segment store, paced against
//! the wall clock, with a keyframe-recovery prefix emitted at zero
//! timestamp delta. ANNOUNCE and RECORD are refused: this server never
//! accepts publishes.

pub mod range;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rtsp_types as rtsp;
use sdp_types as sdp;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use webrtc::rtp;
use webrtc::rtp::packetizer::Payloader;
use webrtc::util::Marshal;

use crate::error::{Result, SinkError};
use crate::media::hevc::HevcPayloader;
use crate::media::{nal, pts_to_rtp, BufferFlags, MimeType};
use crate::runtime;
use crate::sink::Sink;
use crate::store::{RecordFormat, SampleReader, SegmentWriter};

const RTP_MTU: usize = 1200;
const UDP_RTP_PORT: u16 = 8000;
const UDP_RTCP_PORT: u16 = 8001;
const MULTICAST_RANGE: &str = "224.1.0.0/16";
const RTSP_BUF_SIZE: usize = 8192;

const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, GET_PARAMETER, SET_PARAMETER, TEARDOWN";

enum TrackPayloader {
    H264(rtp::codecs::h264::H264Payloader),
    Hevc(HevcPayloader),
    Opus,
}

impl TrackPayloader {
    fn for_mime(mime: MimeType) -> Result<Self> {
        match mime {
            MimeType::VideoH264 => Ok(Self::H264(rtp::codecs::h264::H264Payloader::default())),
            MimeType::VideoH265 => Ok(Self::Hevc(HevcPayloader::new())),
            MimeType::AudioOpus => Ok(Self::Opus),
            other => Err(SinkError::Codec(format!(
                "RTSP server cannot packetize {}",
                other.as_str()
            ))),
        }
    }

    fn payload(&mut self, buf: &[u8]) -> Vec<Bytes> {
        match self {
            Self::H264(payloader) => {
                match payloader.payload(RTP_MTU, &Bytes::copy_from_slice(buf)) {
                    Ok(payloads) => payloads,
                    Err(e) => {
                        debug!("H264 payload failed: {}", e);
                        Vec::new()
                    }
                }
            }
            Self::Hevc(payloader) => payloader.payload(RTP_MTU, buf),
            Self::Opus => vec![Bytes::copy_from_slice(buf)],
        }
    }
}

struct TrackRtp {
    sequence: u16,
    payloader: TrackPayloader,
}

struct TrackShared {
    mime: MimeType,
    dir: PathBuf,
    payload_type: u8,
    clock_rate: u32,
    ssrc: u32,
    /// Protects the sequence number and payloader; live writes and seek
    /// playback both take it, never across a sleep.
    rtp: Mutex<TrackRtp>,
    pts0: Mutex<Option<i64>>,
}

#[derive(Default, Clone)]
struct ParameterSets {
    h264_sps: Option<Bytes>,
    h264_pps: Option<Bytes>,
    h265_vps: Option<Bytes>,
    h265_sps: Option<Bytes>,
    h265_pps: Option<Bytes>,
}

#[derive(Debug, Clone, Copy)]
enum SessionTransport {
    Interleaved { channel: u8 },
    Udp { addr: SocketAddr },
}

struct Session {
    id: String,
    playing: AtomicBool,
    transports: Mutex<Vec<Option<SessionTransport>>>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

struct RtspShared {
    tracks: Vec<TrackShared>,
    sessions: Mutex<Vec<Arc<Session>>>,
    /// Recorded-playback generation. Zero means live fan-out; every seek
    /// bumps it and playback tasks exit when it moves on without them.
    generation: AtomicU64,
    params: RwLock<ParameterSets>,
    udp_rtp: Option<Arc<UdpSocket>>,
    local_addr: SocketAddr,
}

impl RtspShared {
    /// Packetize one buffer on a track and fan the packets out to every
    /// playing session. The RTP marker is set on the last packet of the
    /// buffer only.
    fn emit(&self, track: usize, buf: &[u8], pts_us: i64) {
        let shared_track = &self.tracks[track];
        let timestamp = pts_to_rtp(pts_us, shared_track.clock_rate);

        let mut rtp_state = shared_track.rtp.lock();
        let payloads = rtp_state.payloader.payload(buf);
        if payloads.is_empty() {
            return;
        }

        let count = payloads.len();
        for (i, payload) in payloads.into_iter().enumerate() {
            let packet = rtp::packet::Packet {
                header: rtp::header::Header {
                    version: 2,
                    marker: i + 1 == count,
                    payload_type: shared_track.payload_type,
                    sequence_number: rtp_state.sequence,
                    timestamp,
                    ssrc: shared_track.ssrc,
                    ..Default::default()
                },
                payload,
            };
            rtp_state.sequence = rtp_state.sequence.wrapping_add(1);

            let Ok(wire) = packet.marshal() else {
                continue;
            };
            self.fan_out(track, &wire);
        }
    }

    fn fan_out(&self, track: usize, wire: &Bytes) {
        let sessions = self.sessions.lock();
        for session in sessions.iter() {
            if !session.playing.load(Ordering::SeqCst) {
                continue;
            }
            let transport = session.transports.lock().get(track).copied().flatten();
            match transport {
                Some(SessionTransport::Interleaved { channel }) => {
                    let mut frame = Vec::with_capacity(4 + wire.len());
                    frame.push(b'$');
                    frame.push(channel);
                    frame.extend_from_slice(&(wire.len() as u16).to_be_bytes());
                    frame.extend_from_slice(wire);
                    let _ = session.frames.send(frame);
                }
                Some(SessionTransport::Udp { addr }) => {
                    if let Some(socket) = &self.udp_rtp {
                        let _ = socket.try_send_to(wire, addr);
                    }
                }
                None => {}
            }
        }
    }

    fn cache_parameter_sets(&self, mime: MimeType, buf: &[u8]) {
        if !mime.is_video() {
            return;
        }
        let nal_units = nal::split_nal_units(buf);
        if nal_units.is_empty() {
            return;
        }
        let mut params = self.params.write();
        for unit in nal_units {
            match mime {
                MimeType::VideoH264 => match nal::h264_nal_type(unit) {
                    Some(nal::H264_NAL_SPS) => {
                        params.h264_sps = Some(Bytes::copy_from_slice(unit))
                    }
                    Some(nal::H264_NAL_PPS) => {
                        params.h264_pps = Some(Bytes::copy_from_slice(unit))
                    }
                    _ => {}
                },
                MimeType::VideoH265 => match nal::h265_nal_type(unit) {
                    Some(32) => params.h265_vps = Some(Bytes::copy_from_slice(unit)),
                    Some(33) => params.h265_sps = Some(Bytes::copy_from_slice(unit)),
                    Some(34) => params.h265_pps = Some(Bytes::copy_from_slice(unit)),
                    _ => {}
                },
                _ => {}
            }
        }
    }
}

struct SinkState {
    writers: Vec<SegmentWriter>,
    closed: bool,
}

pub struct RtspServerSink {
    shared: Arc<RtspShared>,
    inner: Mutex<SinkState>,
    shutdown: broadcast::Sender<()>,
}

impl RtspServerSink {
    /// Start the server: TCP on `port`, RTP/RTCP on UDP 8000/8001 when
    /// available, and a per-track segment store under `path` as the
    /// recorded-playback source.
    pub fn start(path: &str, port: u16, tracks: &[MimeType]) -> Result<Self> {
        let root = PathBuf::from(path);
        let mut writers = Vec::with_capacity(tracks.len());
        let mut shared_tracks = Vec::with_capacity(tracks.len());
        let mut rng = rand::rng();

        for (i, mime) in tracks.iter().enumerate() {
            let dir = root.join(mime.as_str());
            writers.push(SegmentWriter::create(&dir, RecordFormat::PerTrack)?);
            shared_tracks.push(TrackShared {
                mime: *mime,
                dir,
                payload_type: 96 + i as u8,
                clock_rate: mime.clock_rate(),
                ssrc: rng.random(),
                rtp: Mutex::new(TrackRtp {
                    sequence: rng.random(),
                    payloader: TrackPayloader::for_mime(*mime)?,
                }),
                pts0: Mutex::new(None),
            });
        }

        let (shutdown, _) = broadcast::channel(1);

        let (listener, udp_rtp) = runtime::block_on(async {
            let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
                SinkError::TransportConnect(format!("RTSP bind port {}: {}", port, e))
            })?;
            // The UDP pair is best-effort: without it the server still
            // works over TCP-interleaved transport.
            let udp_rtp = match UdpSocket::bind(("0.0.0.0", UDP_RTP_PORT)).await {
                Ok(socket) => {
                    if let Err(e) = UdpSocket::bind(("0.0.0.0", UDP_RTCP_PORT)).await {
                        debug!("RTSP RTCP bind failed: {}", e);
                    }
                    Some(Arc::new(socket))
                }
                Err(e) => {
                    warn!("RTSP UDP bind failed, TCP interleaved only: {}", e);
                    None
                }
            };
            Ok::<_, SinkError>((listener, udp_rtp))
        })?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| SinkError::TransportConnect(format!("RTSP local addr: {}", e)))?;
        let shared = Arc::new(RtspShared {
            tracks: shared_tracks,
            sessions: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            params: RwLock::new(ParameterSets::default()),
            udp_rtp,
            local_addr,
        });

        info!(
            "RTSP server listening on {} (multicast range {})",
            local_addr, MULTICAST_RANGE
        );

        let accept_shared = shared.clone();
        let mut shutdown_rx = shutdown.subscribe();
        runtime::handle().spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let shared = accept_shared.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(stream, peer, shared).await {
                                        debug!("RTSP client {} ended: {}", peer, e);
                                    }
                                });
                            }
                            Err(e) => warn!("RTSP accept failed: {}", e),
                        }
                    }
                }
            }
        });

        Ok(Self {
            shared,
            inner: Mutex::new(SinkState {
                writers,
                closed: false,
            }),
            shutdown,
        })
    }

    /// Address the RTSP listener actually bound, for clients.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }
}

impl Sink for RtspServerSink {
    fn write_sample(
        &self,
        track: usize,
        buf: &[u8],
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SinkError::State("rtsp sink is closed".to_string()));
        }
        if track >= self.shared.tracks.len() {
            return Err(SinkError::State(format!("invalid track index {}", track)));
        }

        inner.writers[track].write_sample(track, buf, pts_us, flags)?;
        drop(inner);

        let shared_track = &self.shared.tracks[track];
        {
            let mut pts0 = shared_track.pts0.lock();
            if pts0.is_none() {
                *pts0 = Some(pts_us);
            }
        }
        self.shared.cache_parameter_sets(shared_track.mime, buf);

        // Live fan-out is suppressed while recorded playback owns the
        // sessions; the sample still landed in the store above.
        if self.shared.generation.load(Ordering::SeqCst) == 0 {
            self.shared.emit(track, buf, pts_us);
        }
        Ok(false)
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        let _ = self.shutdown.send(());
        self.shared.sessions.lock().clear();
        // Unblock playback tasks waiting on an old generation.
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        for writer in &mut inner.writers {
            writer.close()?;
        }
        Ok(())
    }
}

struct Request {
    method: rtsp::Method,
    uri: String,
    version: rtsp::Version,
    headers: HashMap<String, String>,
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, shared: Arc<RtspShared>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let session = Arc::new(Session {
        id: generate_session_id(),
        playing: AtomicBool::new(false),
        transports: Mutex::new(vec![None; shared.tracks.len()]),
        frames: frames_tx,
    });
    shared.sessions.lock().push(session.clone());

    let mut read_buf = [0u8; RTSP_BUF_SIZE];
    let mut request_buffer = Vec::with_capacity(RTSP_BUF_SIZE);

    let result = 'client: loop {
        tokio::select! {
            Some(frame) = frames_rx.recv() => {
                if let Err(e) = writer.write_all(&frame).await {
                    break 'client Err(SinkError::TransportWrite(format!("rtsp write: {}", e)));
                }
            }
            read = reader.read(&mut read_buf) => {
                let n = match read {
                    Ok(0) => break 'client Ok(()),
                    Ok(n) => n,
                    Err(e) => break 'client Err(SinkError::TransportWrite(format!("rtsp read: {}", e))),
                };
                request_buffer.extend_from_slice(&read_buf[..n]);

                while strip_interleaved_prefix(&mut request_buffer) {}
                while let Some(raw) = take_request(&mut request_buffer) {
                    let Some(request) = parse_request(&raw) else {
                        send_simple(&mut writer, 400).await?;
                        continue;
                    };
                    if handle_request(&mut writer, &request, &session, &shared, peer).await? {
                        break 'client Ok(());
                    }
                    while strip_interleaved_prefix(&mut request_buffer) {}
                }
            }
        }
    };

    shared
        .sessions
        .lock()
        .retain(|s| !Arc::ptr_eq(s, &session));
    debug!("RTSP session {} from {} closed", session.id, peer);
    result
}

/// Dispatch one request; `Ok(true)` ends the connection.
async fn handle_request(
    writer: &mut OwnedWriteHalf,
    request: &Request,
    session: &Arc<Session>,
    shared: &Arc<RtspShared>,
    peer: SocketAddr,
) -> Result<bool> {
    match &request.method {
        rtsp::Method::Options => {
            send_response(
                writer,
                request,
                200,
                vec![("Public".to_string(), PUBLIC_METHODS.to_string())],
                "",
                &session.id,
            )
            .await?;
        }
        rtsp::Method::Describe => {
            let params = shared.params.read().clone();
            let sdp = build_sdp(&shared.tracks, &params);
            if sdp.is_empty() {
                send_response(writer, request, 500, vec![], "", &session.id).await?;
                return Ok(false);
            }
            send_response(
                writer,
                request,
                200,
                vec![("Content-Type".to_string(), "application/sdp".to_string())],
                &sdp,
                &session.id,
            )
            .await?;
        }
        rtsp::Method::Setup => {
            let track = track_index_from_uri(&request.uri).unwrap_or(0);
            if track >= shared.tracks.len() {
                send_response(writer, request, 404, vec![], "", &session.id).await?;
                return Ok(false);
            }
            let transport_value = request
                .headers
                .get("transport")
                .cloned()
                .unwrap_or_default();
            let (transport, reply) = negotiate_transport(&transport_value, peer, shared);
            session.transports.lock()[track] = Some(transport);
            send_response(
                writer,
                request,
                200,
                vec![("Transport".to_string(), reply)],
                "",
                &session.id,
            )
            .await?;
        }
        rtsp::Method::Play => {
            let parsed_range = request
                .headers
                .get("range")
                .and_then(|value| range::parse_range(value));

            match parsed_range {
                Some(play_range) if play_range.is_seek() => {
                    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let start_us = play_range.start_us();
                    info!(
                        "RTSP seek to +{}us (generation {})",
                        start_us, generation
                    );
                    for track in 0..shared.tracks.len() {
                        let pts0 = (*shared.tracks[track].pts0.lock()).unwrap_or(0);
                        let requested_pts = pts0 + start_us;
                        let shared = shared.clone();
                        tokio::spawn(playback_track(shared, track, requested_pts, generation));
                    }
                }
                _ => {
                    // No range, `Range: npt=0-` or an unmappable form:
                    // return to live.
                    shared.generation.store(0, Ordering::SeqCst);
                }
            }
            session.playing.store(true, Ordering::SeqCst);
            send_response(writer, request, 200, vec![], "", &session.id).await?;
        }
        rtsp::Method::Pause => {
            session.playing.store(false, Ordering::SeqCst);
            send_response(writer, request, 200, vec![], "", &session.id).await?;
        }
        rtsp::Method::GetParameter | rtsp::Method::SetParameter => {
            send_response(writer, request, 200, vec![], "", &session.id).await?;
        }
        rtsp::Method::Extension(name)
            if name.eq_ignore_ascii_case("ANNOUNCE") || name.eq_ignore_ascii_case("RECORD") =>
        {
            // Read-only posture: publishes are never accepted.
            send_response(writer, request, 403, vec![], "", &session.id).await?;
        }
        rtsp::Method::Teardown => {
            send_response(writer, request, 200, vec![], "", &session.id).await?;
            return Ok(true);
        }
        _ => {
            send_response(writer, request, 405, vec![], "", &session.id).await?;
        }
    }
    Ok(false)
}

/// Recorded playback for one track.
///
/// Samples before the requested PTS form the keyframe-recovery prefix and
/// go out immediately at zero timestamp delta; from the requested PTS on,
/// emission is paced so a sample with PTS `p` leaves at roughly
/// `t0 + (p - requested)`. The task exits when the generation moves on or
/// the reader ends.
async fn playback_track(
    shared: Arc<RtspShared>,
    track: usize,
    requested_pts: i64,
    generation: u64,
) {
    let dir = shared.tracks[track].dir.clone();
    let mut reader =
        match SampleReader::open_for_track(&dir, RecordFormat::PerTrack, requested_pts, track) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("RTSP playback open failed for track {}: {}", track, e);
                return;
            }
        };

    let t0 = tokio::time::Instant::now();
    loop {
        if shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        match reader.next() {
            Ok(Some(record)) => {
                let emit_pts = if record.pts_us < requested_pts {
                    requested_pts
                } else {
                    let offset = (record.pts_us - requested_pts) as u64;
                    tokio::time::sleep_until(t0 + Duration::from_micros(offset)).await;
                    if shared.generation.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    record.pts_us
                };
                shared.emit(track, &record.payload, emit_pts);
            }
            Ok(None) => return,
            Err(e) => {
                warn!("RTSP playback read failed for track {}: {}", track, e);
                return;
            }
        }
    }
}

fn negotiate_transport(
    value: &str,
    peer: SocketAddr,
    shared: &RtspShared,
) -> (SessionTransport, String) {
    let lower = value.to_ascii_lowercase();

    if let Some(channel) = parse_interleaved_channel(&lower) {
        let reply = format!(
            "RTP/AVP/TCP;unicast;interleaved={}-{}",
            channel,
            channel.saturating_add(1)
        );
        return (SessionTransport::Interleaved { channel }, reply);
    }

    if shared.udp_rtp.is_some() {
        if let Some(port) = parse_client_port(&lower) {
            let addr = SocketAddr::new(peer.ip(), port);
            let reply = format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                port,
                port + 1,
                UDP_RTP_PORT,
                UDP_RTCP_PORT
            );
            return (SessionTransport::Udp { addr }, reply);
        }
    }

    // Fall back to interleaved channel 0.
    (
        SessionTransport::Interleaved { channel: 0 },
        "RTP/AVP/TCP;unicast;interleaved=0-1".to_string(),
    )
}

fn parse_interleaved_channel(transport: &str) -> Option<u8> {
    let (_, rest) = transport.split_once("interleaved=")?;
    let head = rest.split(';').next().unwrap_or(rest);
    head.split('-').next().unwrap_or(head).trim().parse().ok()
}

fn parse_client_port(transport: &str) -> Option<u16> {
    let (_, rest) = transport.split_once("client_port=")?;
    let head = rest.split(';').next().unwrap_or(rest);
    head.split('-').next().unwrap_or(head).trim().parse().ok()
}

fn track_index_from_uri(uri: &str) -> Option<usize> {
    let (_, rest) = uri.split_once("trackID=")?;
    rest.split(&['/', '?', '&'][..]).next()?.parse().ok()
}

fn strip_interleaved_prefix(buffer: &mut Vec<u8>) -> bool {
    if buffer.len() < 4 || buffer[0] != b'$' {
        return false;
    }
    let payload_len = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
    if buffer.len() < 4 + payload_len {
        return false;
    }
    buffer.drain(0..4 + payload_len);
    true
}

fn take_request(buffer: &mut Vec<u8>) -> Option<String> {
    let delimiter = b"\r\n\r\n";
    let pos = buffer
        .windows(delimiter.len())
        .position(|window| window == delimiter)?;
    let request: Vec<u8> = buffer.drain(0..pos + delimiter.len()).collect();
    Some(String::from_utf8_lossy(&request).to_string())
}

fn parse_request(raw: &str) -> Option<Request> {
    let (message, consumed): (rtsp::Message<Vec<u8>>, usize) =
        rtsp::Message::parse(raw.as_bytes()).ok()?;
    if consumed != raw.len() {
        return None;
    }
    let request = match message {
        rtsp::Message::Request(request) => request,
        _ => return None,
    };

    let uri = request
        .request_uri()
        .map(|value| value.as_str().to_string())
        .unwrap_or_default();
    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        headers.insert(name.to_string().to_ascii_lowercase(), value.to_string());
    }

    Some(Request {
        method: request.method().clone(),
        uri,
        version: request.version(),
        headers,
    })
}

async fn send_simple<W: AsyncWrite + Unpin>(stream: &mut W, code: u16) -> Result<()> {
    let response =
        rtsp::Response::builder(rtsp::Version::V1_0, status_code(code)).build(Vec::new());
    let mut data = Vec::new();
    response
        .write(&mut data)
        .map_err(|e| SinkError::ProtocolNegotiation(format!("serialize response: {}", e)))?;
    stream.write_all(&data).await?;
    Ok(())
}

async fn send_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    request: &Request,
    code: u16,
    extra_headers: Vec<(String, String)>,
    body: &str,
    session_id: &str,
) -> Result<()> {
    let cseq = request
        .headers
        .get("cseq")
        .cloned()
        .unwrap_or_else(|| "1".to_string());

    let mut builder = rtsp::Response::builder(request.version, status_code(code))
        .header(rtsp::headers::CSEQ, cseq.as_str())
        .header(rtsp::headers::SESSION, session_id);
    for (name, value) in extra_headers {
        let header_name = rtsp::HeaderName::try_from(name.as_str()).map_err(|e| {
            SinkError::ProtocolNegotiation(format!("invalid header {}: {}", name, e))
        })?;
        builder = builder.header(header_name, value);
    }

    let response = builder.build(body.as_bytes().to_vec());
    let mut data = Vec::new();
    response
        .write(&mut data)
        .map_err(|e| SinkError::ProtocolNegotiation(format!("serialize response: {}", e)))?;
    stream.write_all(&data).await?;
    Ok(())
}

fn status_code(code: u16) -> rtsp::StatusCode {
    match code {
        200 => rtsp::StatusCode::Ok,
        400 => rtsp::StatusCode::BadRequest,
        403 => rtsp::StatusCode::Forbidden,
        404 => rtsp::StatusCode::NotFound,
        405 => rtsp::StatusCode::MethodNotAllowed,
        455 => rtsp::StatusCode::MethodNotValidInThisState,
        _ => rtsp::StatusCode::InternalServerError,
    }
}

fn generate_session_id() -> String {
    let value: u64 = rand::rng().random();
    format!("{:016x}", value)
}

fn build_sdp(tracks: &[TrackShared], params: &ParameterSets) -> String {
    let medias = tracks
        .iter()
        .enumerate()
        .map(|(i, track)| {
            let (media, rtpmap, fmtp) = match track.mime {
                MimeType::VideoH264 => (
                    "video",
                    format!("{} H264/90000", track.payload_type),
                    Some(build_h264_fmtp(track.payload_type, params)),
                ),
                MimeType::VideoH265 => (
                    "video",
                    format!("{} H265/90000", track.payload_type),
                    Some(build_h265_fmtp(track.payload_type, params)),
                ),
                _ => (
                    "audio",
                    format!("{} opus/48000/2", track.payload_type),
                    None,
                ),
            };

            let mut attributes = vec![sdp::Attribute {
                attribute: "rtpmap".to_string(),
                value: Some(rtpmap),
            }];
            if let Some(fmtp) = fmtp {
                attributes.push(sdp::Attribute {
                    attribute: "fmtp".to_string(),
                    value: Some(fmtp),
                });
            }
            attributes.push(sdp::Attribute {
                attribute: "control".to_string(),
                value: Some(format!("trackID={}", i)),
            });

            sdp::Media {
                media: media.to_string(),
                port: 0,
                num_ports: None,
                proto: "RTP/AVP".to_string(),
                fmt: track.payload_type.to_string(),
                media_title: None,
                connections: Vec::new(),
                bandwidths: Vec::new(),
                key: None,
                attributes,
            }
        })
        .collect();

    let session = sdp::Session {
        origin: sdp::Origin {
            username: Some("-".to_string()),
            sess_id: "0".to_string(),
            sess_version: 0,
            nettype: "IN".to_string(),
            addrtype: "IP4".to_string(),
            unicast_address: "0.0.0.0".to_string(),
        },
        session_name: "uplink".to_string(),
        session_description: None,
        uri: None,
        emails: Vec::new(),
        phones: Vec::new(),
        connection: Some(sdp::Connection {
            nettype: "IN".to_string(),
            addrtype: "IP4".to_string(),
            connection_address: "0.0.0.0".to_string(),
        }),
        bandwidths: Vec::new(),
        times: vec![sdp::Time {
            start_time: 0,
            stop_time: 0,
            repeats: Vec::new(),
        }],
        time_zones: Vec::new(),
        key: None,
        attributes: vec![sdp::Attribute {
            attribute: "control".to_string(),
            value: Some("*".to_string()),
        }],
        medias,
    };

    let mut output = Vec::new();
    if let Err(e) = session.write(&mut output) {
        warn!("SDP serialization failed: {}", e);
        return String::new();
    }
    String::from_utf8(output).unwrap_or_default()
}

fn build_h264_fmtp(payload_type: u8, params: &ParameterSets) -> String {
    let mut attrs = vec!["packetization-mode=1".to_string()];
    if let (Some(sps), Some(pps)) = (params.h264_sps.as_ref(), params.h264_pps.as_ref()) {
        let encoder = base64::engine::general_purpose::STANDARD;
        attrs.push(format!(
            "sprop-parameter-sets={},{}",
            encoder.encode(sps.as_ref()),
            encoder.encode(pps.as_ref())
        ));
    } else {
        attrs.push("profile-level-id=42e01f".to_string());
    }
    format!("{} {}", payload_type, attrs.join(";"))
}

fn build_h265_fmtp(payload_type: u8, params: &ParameterSets) -> String {
    let encoder = base64::engine::general_purpose::STANDARD;
    let mut attrs = Vec::new();
    if let Some(vps) = params.h265_vps.as_ref() {
        attrs.push(format!("sprop-vps={}", encoder.encode(vps.as_ref())));
    }
    if let Some(sps) = params.h265_sps.as_ref() {
        attrs.push(format!("sprop-sps={}", encoder.encode(sps.as_ref())));
    }
    if let Some(pps) = params.h265_pps.as_ref() {
        attrs.push(format!("sprop-pps={}", encoder.encode(pps.as_ref())));
    }
    if attrs.is_empty() {
        format!("{} profile-id=1", payload_type)
    } else {
        format!("{} {}", payload_type, attrs.join(";"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_header_parsing() {
        assert_eq!(
            parse_interleaved_channel("rtp/avp/tcp;unicast;interleaved=2-3"),
            Some(2)
        );
        assert_eq!(parse_interleaved_channel("rtp/avp;unicast"), None);
        assert_eq!(
            parse_client_port("rtp/avp;unicast;client_port=5000-5001"),
            Some(5000)
        );
    }

    #[test]
    fn track_index_from_setup_uri() {
        assert_eq!(
            track_index_from_uri("rtsp://127.0.0.1:8554/stream/trackID=1"),
            Some(1)
        );
        assert_eq!(track_index_from_uri("rtsp://127.0.0.1:8554/stream"), None);
    }

    #[test]
    fn interleaved_frames_are_stripped_from_request_buffer() {
        let mut buffer = vec![b'$', 0, 0, 2, 0xaa, 0xbb, b'O', b'P'];
        assert!(strip_interleaved_prefix(&mut buffer));
        assert_eq!(buffer, vec![b'O', b'P']);

        // Incomplete frame stays put.
        let mut buffer = vec![b'$', 0, 0, 9, 0xaa];
        assert!(!strip_interleaved_prefix(&mut buffer));
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn sdp_lists_one_media_per_track_with_ascending_payload_types() {
        let mut rng = rand::rng();
        let tracks: Vec<TrackShared> = [MimeType::VideoH264, MimeType::AudioOpus]
            .iter()
            .enumerate()
            .map(|(i, mime)| TrackShared {
                mime: *mime,
                dir: PathBuf::from("/tmp"),
                payload_type: 96 + i as u8,
                clock_rate: mime.clock_rate(),
                ssrc: rng.random(),
                rtp: Mutex::new(TrackRtp {
                    sequence: 0,
                    payloader: TrackPayloader::for_mime(*mime).unwrap(),
                }),
                pts0: Mutex::new(None),
            })
            .collect();

        let sdp_text = build_sdp(&tracks, &ParameterSets::default());
        let session = sdp::Session::parse(sdp_text.as_bytes()).expect("sdp parse failed");
        assert_eq!(session.medias.len(), 2);
        assert_eq!(session.medias[0].fmt, "96");
        assert_eq!(session.medias[1].fmt, "97");
        assert!(session.medias[0].attributes.iter().any(|a| {
            a.attribute == "rtpmap" && a.value.as_deref() == Some("96 H264/90000")
        }));
        assert!(session.medias[1].attributes.iter().any(|a| {
            a.attribute == "rtpmap" && a.value.as_deref() == Some("97 opus/48000/2")
        }));
    }

    #[test]
    fn h264_fmtp_prefers_cached_parameter_sets() {
        let mut params = ParameterSets::default();
        assert!(build_h264_fmtp(96, &params).contains("profile-level-id"));

        params.h264_sps = Some(Bytes::from_static(&[0x67, 0x42, 0xe0, 0x1f]));
        params.h264_pps = Some(Bytes::from_static(&[0x68, 0xce]));
        let fmtp = build_h264_fmtp(96, &params);
        assert!(fmtp.contains("sprop-parameter-sets="));
    }

    #[test]
    fn rejects_unsupported_codecs() {
        assert!(TrackPayloader::for_mime(MimeType::AudioAac).is_err());
        assert!(TrackPayloader::for_mime(MimeType::VideoVp8).is_err());
    }

    mod server {
        use super::super::*;
        use std::io::{Read as _, Write as _};
        use tempfile::TempDir;

        fn send_and_read(stream: &mut std::net::TcpStream, request: &str) -> String {
            stream.write_all(request.as_bytes()).unwrap();
            let mut buf = [0u8; 8192];
            let n = stream.read(&mut buf).unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        }

        fn annexb_idr() -> Vec<u8> {
            vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84]
        }

        #[test]
        fn full_session_cycle_with_seek_and_return_to_live() {
            let dir = TempDir::new().unwrap();
            let sink = RtspServerSink::start(
                dir.path().to_str().unwrap(),
                0,
                &[MimeType::VideoH264],
            )
            .unwrap();

            // Seed the store: keyframes at 0s, 1s, 2s with P-frames between.
            for pts in [0i64, 1_000_000, 2_000_000] {
                sink.write_sample(0, &annexb_idr(), pts, BufferFlags::KEY_FRAME)
                    .unwrap();
                sink.write_sample(
                    0,
                    &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9a],
                    pts + 500_000,
                    BufferFlags(0),
                )
                .unwrap();
            }

            let mut stream = std::net::TcpStream::connect(sink.local_addr()).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();

            let response = send_and_read(
                &mut stream,
                "OPTIONS rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: 1\r\n\r\n",
            );
            assert!(response.starts_with("RTSP/1.0 200"));
            assert!(response.contains("DESCRIBE"));

            let response = send_and_read(
                &mut stream,
                "DESCRIBE rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: 2\r\n\r\n",
            );
            assert!(response.starts_with("RTSP/1.0 200"));
            assert!(response.contains("application/sdp"));

            let response = send_and_read(
                &mut stream,
                "SETUP rtsp://127.0.0.1/stream/trackID=0 RTSP/1.0\r\nCSeq: 3\r\n\
                 Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
            );
            assert!(response.starts_with("RTSP/1.0 200"));
            assert!(response.contains("interleaved=0-1"));

            let response = send_and_read(
                &mut stream,
                "RECORD rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: 4\r\n\r\n",
            );
            assert!(response.starts_with("RTSP/1.0 403"));

            // Seek 1.5 s in: recorded playback takes over (generation 1).
            let response = send_and_read(
                &mut stream,
                "PLAY rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: 5\r\nRange: npt=1.5-\r\n\r\n",
            );
            assert!(response.starts_with("RTSP/1.0 200"));
            assert_eq!(sink.generation(), 1);

            // PLAY without a range returns to live.
            stream
                .write_all(b"PLAY rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: 6\r\n\r\n")
                .unwrap();
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while sink.generation() != 0 && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            assert_eq!(sink.generation(), 0);

            sink.close().unwrap();
        }

        #[test]
        fn live_sequence_numbers_increase_and_marker_trails() {
            let dir = TempDir::new().unwrap();
            let sink = RtspServerSink::start(
                dir.path().to_str().unwrap(),
                0,
                &[MimeType::VideoH264],
            )
            .unwrap();

            // Subscribe a fake session directly and capture its frames.
            let (tx, mut rx) = mpsc::unbounded_channel();
            let session = Arc::new(Session {
                id: "test".to_string(),
                playing: AtomicBool::new(true),
                transports: Mutex::new(vec![Some(SessionTransport::Interleaved { channel: 0 })]),
                frames: tx,
            });
            sink.shared.sessions.lock().push(session);

            // A large IDR fragments into several packets in one buffer.
            let mut large = vec![0x00, 0x00, 0x00, 0x01, 0x65];
            large.extend(vec![0xab; 3000]);
            sink.write_sample(0, &large, 0, BufferFlags::KEY_FRAME).unwrap();

            let mut packets = Vec::new();
            while let Ok(frame) = rx.try_recv() {
                assert_eq!(frame[0], b'$');
                packets.push(frame[4..].to_vec());
            }
            assert!(packets.len() > 1);

            let mut prev_seq: Option<u16> = None;
            for (i, packet) in packets.iter().enumerate() {
                let seq = u16::from_be_bytes([packet[2], packet[3]]);
                if let Some(prev) = prev_seq {
                    assert_eq!(seq, prev.wrapping_add(1));
                }
                prev_seq = Some(seq);

                let marker = packet[1] & 0x80 != 0;
                assert_eq!(marker, i == packets.len() - 1);
            }

            sink.close().unwrap();
        }
    }
}
