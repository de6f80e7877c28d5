//! Per-codec RTP tracks for the WHIP sender
//!
//! The sender drives RTP timestamps absolutely from the producer's PTS
//! rather than accumulating durations, so packetization happens here and
//! each packet's header timestamp is stamped explicitly. H.264 NAL units
//! are emitted as single-NAL packets or FU-A fragments (RFC 6184); Opus
//! packets map one-to-one. Every video packet carries the playout-delay
//! header extension so receivers hold a fixed jitter buffer.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::error::{Result, SinkError};

pub const RTP_MTU: usize = 1200;
pub const H264_PAYLOAD_TYPE: u8 = 96;
pub const OPUS_PAYLOAD_TYPE: u8 = 111;
pub const H264_CLOCK_RATE: u32 = 90_000;
pub const OPUS_CLOCK_RATE: u32 = 48_000;

/// Header extension id negotiated for playout-delay (send-only, video).
pub const PLAYOUT_DELAY_EXT_ID: u8 = 6;
pub const PLAYOUT_DELAY_URI: &str =
    "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";

/// min=max=100 in 10 ms units: a fixed one second of playout delay.
const PLAYOUT_DELAY_10MS: u16 = 100;

const FUA_INDICATOR: u8 = 28;

/// Encode the 3-byte playout-delay extension payload (12-bit min, 12-bit
/// max).
fn playout_delay_payload() -> Bytes {
    let min = PLAYOUT_DELAY_10MS;
    let max = PLAYOUT_DELAY_10MS;
    Bytes::from(vec![
        (min >> 4) as u8,
        (((min & 0x0f) as u8) << 4) | ((max >> 8) as u8),
        (max & 0xff) as u8,
    ])
}

/// One outbound RTP track with its packetization state.
pub struct RtpTrack {
    track: Arc<TrackLocalStaticRTP>,
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    video: bool,
}

impl RtpTrack {
    pub fn h264() -> Self {
        let capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: H264_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_owned(),
            rtcp_feedback: vec![],
        };
        Self::new(capability, "video", H264_PAYLOAD_TYPE, true)
    }

    pub fn opus() -> Self {
        let capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: OPUS_CLOCK_RATE,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        };
        Self::new(capability, "audio", OPUS_PAYLOAD_TYPE, false)
    }

    fn new(capability: RTCRtpCodecCapability, id: &str, payload_type: u8, video: bool) -> Self {
        let mut rng = rand::rng();
        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            id.to_owned(),
            "uplink".to_owned(),
        ));
        Self {
            track,
            payload_type,
            ssrc: rng.random(),
            sequence: rng.random(),
            video,
        }
    }

    pub fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    fn header(&mut self, timestamp: u32, marker: bool) -> rtp::header::Header {
        let mut header = rtp::header::Header {
            version: 2,
            marker,
            payload_type: self.payload_type,
            sequence_number: self.next_sequence(),
            timestamp,
            ssrc: self.ssrc,
            ..Default::default()
        };
        if self.video {
            header.extension = true;
            header.extension_profile = 0xbede;
            header.extensions = vec![rtp::header::Extension {
                id: PLAYOUT_DELAY_EXT_ID,
                payload: playout_delay_payload(),
            }];
        }
        header
    }

    async fn write_payloads(
        &mut self,
        payloads: Vec<Bytes>,
        timestamp: u32,
        marker_on_last: bool,
    ) -> Result<()> {
        let count = payloads.len();
        for (i, payload) in payloads.into_iter().enumerate() {
            let packet = rtp::packet::Packet {
                header: self.header(timestamp, marker_on_last && i + 1 == count),
                payload,
            };
            self.track
                .write_rtp(&packet)
                .await
                .map_err(|e| SinkError::TransportWrite(format!("rtp write: {}", e)))?;
        }
        Ok(())
    }

    /// Send one H.264 NAL unit (no start code) at an absolute timestamp.
    pub async fn write_nal(&mut self, nal: &[u8], timestamp: u32, marker: bool) -> Result<()> {
        if nal.is_empty() {
            return Ok(());
        }
        self.write_payloads(packetize_h264_nal(nal, RTP_MTU), timestamp, marker)
            .await
    }

    /// Send one Opus packet at an absolute timestamp.
    pub async fn write_audio(&mut self, data: &[u8], timestamp: u32) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.write_payloads(vec![Bytes::copy_from_slice(data)], timestamp, true)
            .await
    }
}

/// Split one NAL unit into RTP payloads: single-NAL when it fits,
/// FU-A fragments otherwise.
pub fn packetize_h264_nal(nal: &[u8], mtu: usize) -> Vec<Bytes> {
    if nal.len() <= mtu {
        return vec![Bytes::copy_from_slice(nal)];
    }

    let indicator = (nal[0] & 0xe0) | FUA_INDICATOR;
    let nal_type = nal[0] & 0x1f;
    let body = &nal[1..];
    let chunk = mtu - 2;

    let mut payloads = Vec::with_capacity(body.len() / chunk + 1);
    let mut offset = 0usize;
    while offset < body.len() {
        let take = chunk.min(body.len() - offset);
        let mut pkt = BytesMut::with_capacity(2 + take);
        pkt.put_u8(indicator);

        let mut fu_header = nal_type;
        if offset == 0 {
            fu_header |= 0x80; // start
        }
        if offset + take >= body.len() {
            fu_header |= 0x40; // end
        }
        pkt.put_u8(fu_header);
        pkt.put_slice(&body[offset..offset + take]);
        payloads.push(pkt.freeze());
        offset += take;
    }
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_nal_is_one_payload() {
        let nal = [0x65, 0x88, 0x84];
        let payloads = packetize_h264_nal(&nal, 1200);
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][..], &nal[..]);
    }

    #[test]
    fn large_nal_becomes_fua_fragments() {
        let mut nal = vec![0x65];
        nal.extend(vec![0xaa; 3000]);
        let payloads = packetize_h264_nal(&nal, 1200);
        assert!(payloads.len() > 1);

        for (i, p) in payloads.iter().enumerate() {
            assert!(p.len() <= 1200);
            assert_eq!(p[0] & 0x1f, FUA_INDICATOR);
            assert_eq!(p[1] & 0x1f, 5); // original type
            assert_eq!(p[1] & 0x80 != 0, i == 0);
            assert_eq!(p[1] & 0x40 != 0, i == payloads.len() - 1);
        }

        let body: Vec<u8> = payloads.iter().flat_map(|p| p[2..].to_vec()).collect();
        assert_eq!(body, nal[1..].to_vec());
    }

    #[test]
    fn playout_delay_encodes_min_max_100() {
        let payload = playout_delay_payload();
        assert_eq!(&payload[..], &[0x06, 0x40, 0x64]);
    }

    #[test]
    fn video_headers_carry_extension_and_absolute_timestamp() {
        let mut track = RtpTrack::h264();
        let header = track.header(90_000, true);
        assert_eq!(header.timestamp, 90_000);
        assert!(header.marker);
        assert!(header.extension);
        assert_eq!(header.extension_profile, 0xbede);
        assert_eq!(header.extensions.len(), 1);
        assert_eq!(header.extensions[0].id, PLAYOUT_DELAY_EXT_ID);
    }

    #[test]
    fn audio_headers_have_no_extension() {
        let mut track = RtpTrack::opus();
        let header = track.header(48_000, true);
        assert!(!header.extension);
        assert_eq!(header.payload_type, OPUS_PAYLOAD_TYPE);
    }

    #[test]
    fn sequence_numbers_increment_and_wrap() {
        let mut track = RtpTrack::h264();
        let first = track.header(0, false).sequence_number;
        let second = track.header(0, false).sequence_number;
        assert_eq!(second, first.wrapping_add(1));
    }
}
