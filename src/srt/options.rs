//! SRT URL option model
//!
//! `srt://host:port?k=v&…` URLs carry the libsrt socket option vocabulary.
//! Each recognized option has a binding phase (applied before or after the
//! connect call) and a data type. Values that fail to parse for their type
//! are logged and skipped rather than failing the connect, matching how
//! SRT tooling treats option strings.

use std::collections::HashMap;

use tracing::warn;
use url::Url;

use crate::error::{Result, SinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionBinding {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Int32,
    Int64,
    Str,
    Bool,
    TransType,
}

pub struct SocketOption {
    pub name: &'static str,
    pub binding: OptionBinding,
    pub data_type: OptionType,
}

/// Recognized socket options.
pub static SOCKET_OPTIONS: &[SocketOption] = &[
    SocketOption { name: "transtype", binding: OptionBinding::Pre, data_type: OptionType::TransType },
    SocketOption { name: "maxbw", binding: OptionBinding::Pre, data_type: OptionType::Int64 },
    SocketOption { name: "pbkeylen", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "passphrase", binding: OptionBinding::Pre, data_type: OptionType::Str },
    SocketOption { name: "mss", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "fc", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "sndbuf", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "rcvbuf", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "ipttl", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "iptos", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "inputbw", binding: OptionBinding::Post, data_type: OptionType::Int64 },
    SocketOption { name: "oheadbw", binding: OptionBinding::Post, data_type: OptionType::Int32 },
    SocketOption { name: "latency", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "tsbpdmode", binding: OptionBinding::Pre, data_type: OptionType::Bool },
    SocketOption { name: "tlpktdrop", binding: OptionBinding::Pre, data_type: OptionType::Bool },
    SocketOption { name: "snddropdelay", binding: OptionBinding::Post, data_type: OptionType::Int32 },
    SocketOption { name: "nakreport", binding: OptionBinding::Pre, data_type: OptionType::Bool },
    SocketOption { name: "conntimeo", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "lossmaxttl", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "rcvlatency", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "peerlatency", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "minversion", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "streamid", binding: OptionBinding::Pre, data_type: OptionType::Str },
    SocketOption { name: "congestion", binding: OptionBinding::Pre, data_type: OptionType::Str },
    SocketOption { name: "messageapi", binding: OptionBinding::Pre, data_type: OptionType::Bool },
    SocketOption { name: "payloadsize", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "kmrefreshrate", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "kmpreannounce", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "enforcedencryption", binding: OptionBinding::Pre, data_type: OptionType::Bool },
    SocketOption { name: "peeridletimeo", binding: OptionBinding::Pre, data_type: OptionType::Int32 },
    SocketOption { name: "packetfilter", binding: OptionBinding::Pre, data_type: OptionType::Str },
];

fn option_spec(name: &str) -> Option<&'static SocketOption> {
    SOCKET_OPTIONS.iter().find(|o| o.name == name)
}

/// Parsed `srt://` target.
#[derive(Debug, Clone)]
pub struct SrtTarget {
    pub host: String,
    pub port: u16,
    options: HashMap<String, String>,
}

impl SrtTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| SinkError::ConfigInvalid(format!("bad SRT URL {}: {}", raw, e)))?;
        if url.scheme() != "srt" {
            return Err(SinkError::ConfigInvalid(format!(
                "expected srt:// URL, got {}",
                raw
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| SinkError::ConfigInvalid(format!("SRT URL missing host: {}", raw)))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| SinkError::ConfigInvalid(format!("SRT URL missing port: {}", raw)))?;

        let mut options = HashMap::new();
        for (key, value) in url.query_pairs() {
            options.insert(key.to_string(), value.to_string());
        }
        Ok(Self {
            host,
            port,
            options,
        })
    }

    fn raw(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(|s| s.as_str())
    }

    /// Typed integer option value; invalid values are skipped with a log.
    pub fn int(&self, name: &str) -> Option<i64> {
        let value = self.raw(name)?;
        match value.parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("ignoring non-numeric SRT option {}={}", name, value);
                None
            }
        }
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.raw(name)
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.string("streamid")
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.string("passphrase")
    }

    pub fn latency_ms(&self) -> Option<i64> {
        self.int("latency")
    }

    /// Negotiated payload size; SRT live mode defaults to 1316 bytes
    /// (seven 188-byte TS packets).
    pub fn payload_size(&self) -> usize {
        self.int("payloadsize")
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .unwrap_or(1316)
    }

    /// Options we recognized but the transport stack has no knob for, by
    /// binding phase. Logged at connect time so operators can see what a
    /// URL actually applied.
    pub fn unapplied(&self, binding: OptionBinding) -> Vec<&str> {
        self.options
            .keys()
            .filter_map(|k| option_spec(k))
            .filter(|spec| spec.binding == binding)
            .map(|spec| spec.name)
            .filter(|name| !matches!(*name, "latency" | "passphrase" | "streamid" | "payloadsize"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_and_query() {
        let t = SrtTarget::parse("srt://example.com:9000?streamid=live&latency=200").unwrap();
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 9000);
        assert_eq!(t.stream_id(), Some("live"));
        assert_eq!(t.latency_ms(), Some(200));
    }

    #[test]
    fn rejects_non_srt_and_missing_port() {
        assert!(SrtTarget::parse("udp://example.com:9000").is_err());
        assert!(SrtTarget::parse("srt://example.com").is_err());
    }

    #[test]
    fn bad_numeric_values_are_skipped() {
        let t = SrtTarget::parse("srt://h:1?latency=fast").unwrap();
        assert_eq!(t.latency_ms(), None);
    }

    #[test]
    fn payload_size_defaults_to_live_mode() {
        let t = SrtTarget::parse("srt://h:1").unwrap();
        assert_eq!(t.payload_size(), 1316);
        let t = SrtTarget::parse("srt://h:1?payloadsize=1456").unwrap();
        assert_eq!(t.payload_size(), 1456);
    }

    #[test]
    fn option_table_covers_both_binding_phases() {
        assert!(SOCKET_OPTIONS
            .iter()
            .any(|o| o.binding == OptionBinding::Post));
        assert_eq!(
            option_spec("transtype").unwrap().data_type,
            OptionType::TransType
        );
        assert!(option_spec("bogus").is_none());
    }
}
