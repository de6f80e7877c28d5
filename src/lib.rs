//! uplink - mobile-originated live-video egress engine
//!
//! Accepts encoded media samples (H.264/H.265 video, Opus/AAC audio) from
//! a local producer and multiplexes them across simultaneous output
//! sinks: WHIP/WebRTC push, SRT push, an RTSP pull server, a segmented
//! on-disk store and a derived HLS vending server. The sink layer owns
//! each transport's wire format, pacing, congestion response and
//! recovery; keyframe requests flow back to the producer either through
//! `write_sample`'s return value or a registered callback.

pub mod error;
pub mod ffi;
pub mod hls;
pub mod media;
pub mod mpegts;
pub mod rtsp;
mod runtime;
pub mod sink;
pub mod srt;
pub mod store;
pub mod whip;

pub use error::{Result, SinkError};
pub use media::{BufferFlags, MimeType};
pub use sink::{create_sink, KeyframeRequest, Sink, SinkConfig};
