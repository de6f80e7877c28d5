//! Media vocabulary shared by all sinks
//!
//! Samples arrive from the producer as codec-native byte buffers (Annex-B
//! NAL streams for H.26x, Opus packets, AAC ADTS frames) tagged with a
//! track index, a microsecond PTS and a set of buffer flags.

pub mod hevc;
pub mod nal;

use crate::error::{Result, SinkError};

/// Codec MIME tags as reported by the producer's encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    VideoH264,
    VideoH265,
    VideoVp8,
    VideoVp9,
    VideoAv1,
    AudioOpus,
    AudioAac,
}

impl MimeType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "video/avc" => Ok(Self::VideoH264),
            "video/hevc" => Ok(Self::VideoH265),
            "video/x-vnd.on2.vp8" => Ok(Self::VideoVp8),
            "video/x-vnd.on2.vp9" => Ok(Self::VideoVp9),
            "video/av01" => Ok(Self::VideoAv1),
            "audio/opus" => Ok(Self::AudioOpus),
            "audio/aac" => Ok(Self::AudioAac),
            other => Err(SinkError::Codec(format!("unknown mime type: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoH264 => "video/avc",
            Self::VideoH265 => "video/hevc",
            Self::VideoVp8 => "video/x-vnd.on2.vp8",
            Self::VideoVp9 => "video/x-vnd.on2.vp9",
            Self::VideoAv1 => "video/av01",
            Self::AudioOpus => "audio/opus",
            Self::AudioAac => "audio/aac",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(
            self,
            Self::VideoH264 | Self::VideoH265 | Self::VideoVp8 | Self::VideoVp9 | Self::VideoAv1
        )
    }

    /// RTP clock rate for this codec.
    pub fn clock_rate(&self) -> u32 {
        match self {
            Self::AudioOpus => 48_000,
            // Video and AAC both ride the 90 kHz MPEG timeline.
            _ => 90_000,
        }
    }
}

/// Parse a semicolon-joined track list (`"video/avc;audio/opus"`) in
/// producer track order.
pub fn parse_track_list(encoded: &str) -> Result<Vec<MimeType>> {
    if encoded.is_empty() {
        return Err(SinkError::ConfigInvalid("empty track list".to_string()));
    }
    encoded.split(';').map(MimeType::parse).collect()
}

/// Sample-buffer flags, matching the producer's encoder flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(pub u32);

impl BufferFlags {
    pub const KEY_FRAME: BufferFlags = BufferFlags(1);
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(2);
    pub const END_OF_STREAM: BufferFlags = BufferFlags(4);
    pub const PARTIAL_FRAME: BufferFlags = BufferFlags(8);
    pub const MUXER_DATA: BufferFlags = BufferFlags(16);
    pub const DECODE_ONLY: BufferFlags = BufferFlags(32);

    pub fn contains(&self, other: BufferFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_keyframe(&self) -> bool {
        self.contains(Self::KEY_FRAME)
    }
}

/// Convert a microsecond PTS to an RTP timestamp at the given clock rate.
pub fn pts_to_rtp(pts_us: i64, clock_rate: u32) -> u32 {
    if pts_us <= 0 {
        return 0;
    }
    ((pts_us as i128 * clock_rate as i128) / 1_000_000) as u32
}

/// Convert a microsecond PTS to a 90 kHz MPEG-TS timestamp.
pub fn pts_to_90k(pts_us: i64) -> i64 {
    (pts_us as i128 * 90_000 / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_track_list_preserves_order() {
        let tracks = parse_track_list("video/avc;audio/opus").unwrap();
        assert_eq!(tracks, vec![MimeType::VideoH264, MimeType::AudioOpus]);
    }

    #[test]
    fn parse_track_list_rejects_unknown() {
        assert!(parse_track_list("video/mystery").is_err());
        assert!(parse_track_list("").is_err());
    }

    #[test]
    fn rtp_timestamp_is_exact_scaling() {
        assert_eq!(pts_to_rtp(1_000_000, 90_000), 90_000);
        assert_eq!(pts_to_rtp(1_500_000, 48_000), 72_000);
        assert_eq!(pts_to_rtp(0, 90_000), 0);
        // Large PTS values must not overflow the intermediate product.
        assert_eq!(pts_to_rtp(10_000_000_000, 90_000), 900_000_000_000u64 as u32);
    }

    #[test]
    fn mpegts_timestamp_is_90k() {
        assert_eq!(pts_to_90k(1_000_000), 90_000);
        assert_eq!(pts_to_90k(33_333), 2_999);
    }

    #[test]
    fn flags_bits_match_producer_values() {
        let flags = BufferFlags(1 | 2);
        assert!(flags.is_keyframe());
        assert!(flags.contains(BufferFlags::CODEC_CONFIG));
        assert!(!flags.contains(BufferFlags::END_OF_STREAM));
    }
}
