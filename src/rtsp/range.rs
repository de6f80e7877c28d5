//! RTSP `Range` header parsing
//!
//! PLAY requests may carry NPT, SMPTE or UTC range values. Only the start
//! edge matters to this server: an NPT start greater than zero selects
//! recorded playback, everything else returns the session to live.

/// Range flavor as declared by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Npt,
    Smpte,
    Clock,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayRange {
    pub kind: RangeKind,
    pub start_seconds: f64,
}

impl PlayRange {
    pub fn start_us(&self) -> i64 {
        (self.start_seconds * 1_000_000.0) as i64
    }

    /// Whether this range selects recorded playback rather than live.
    pub fn is_seek(&self) -> bool {
        self.kind == RangeKind::Npt && self.start_seconds > 0.0
    }
}

/// Parse a `Range` header value. Unparseable values yield `None`, which
/// callers treat the same as an absent header (live).
pub fn parse_range(value: &str) -> Option<PlayRange> {
    let value = value.trim();

    if let Some(spec) = value.strip_prefix("npt=") {
        let start = spec.split('-').next()?.trim();
        let seconds = match start {
            "" | "now" => 0.0,
            s => parse_npt_time(s)?,
        };
        return Some(PlayRange {
            kind: RangeKind::Npt,
            start_seconds: seconds,
        });
    }

    if let Some(spec) = value.strip_prefix("smpte=") {
        let start = spec.split('-').next()?.trim();
        return Some(PlayRange {
            kind: RangeKind::Smpte,
            start_seconds: parse_smpte_time(start)?,
        });
    }

    if value.starts_with("clock=") {
        // Wall-clock ranges cannot be mapped onto the capture timeline;
        // recognized but treated as a live request.
        return Some(PlayRange {
            kind: RangeKind::Clock,
            start_seconds: 0.0,
        });
    }

    None
}

/// NPT time: either plain seconds (`1.5`) or `hh:mm:ss[.fraction]`.
fn parse_npt_time(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.len() {
        1 => parts[0].parse::<f64>().ok().filter(|v| *v >= 0.0),
        3 => {
            let hours: f64 = parts[0].parse().ok()?;
            let minutes: f64 = parts[1].parse().ok()?;
            let seconds: f64 = parts[2].parse().ok()?;
            Some(hours * 3600.0 + minutes * 60.0 + seconds)
        }
        _ => None,
    }
}

/// SMPTE timestamp: `hh:mm:ss[:frames]` against a 30 fps timeline.
fn parse_smpte_time(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 3 || parts.len() > 4 {
        return None;
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    let frames: f64 = match parts.get(3) {
        Some(f) => f.parse().ok()?,
        None => 0.0,
    };
    Some(hours * 3600.0 + minutes * 60.0 + seconds + frames / 30.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npt_seconds() {
        let range = parse_range("npt=1.5-").unwrap();
        assert_eq!(range.kind, RangeKind::Npt);
        assert_eq!(range.start_us(), 1_500_000);
        assert!(range.is_seek());
    }

    #[test]
    fn npt_zero_and_now_are_live() {
        assert!(!parse_range("npt=0-").unwrap().is_seek());
        assert!(!parse_range("npt=now-").unwrap().is_seek());
        assert!(!parse_range("npt=-").unwrap().is_seek());
    }

    #[test]
    fn npt_clock_form() {
        let range = parse_range("npt=0:02:30.5-").unwrap();
        assert_eq!(range.start_us(), 150_500_000);
    }

    #[test]
    fn smpte_never_seeks() {
        let range = parse_range("smpte=0:10:20-").unwrap();
        assert_eq!(range.kind, RangeKind::Smpte);
        assert_eq!(range.start_seconds, 620.0);
        assert!(!range.is_seek());
    }

    #[test]
    fn clock_is_recognized_but_live() {
        let range = parse_range("clock=20260101T000000Z-").unwrap();
        assert_eq!(range.kind, RangeKind::Clock);
        assert!(!range.is_seek());
    }

    #[test]
    fn garbage_is_none() {
        assert!(parse_range("bogus").is_none());
        assert!(parse_range("npt=abc-").is_none());
    }
}
