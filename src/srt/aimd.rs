//! AIMD bandwidth estimation for the SRT sink
//!
//! Additive increase, multiplicative decrease, driven by the socket's
//! send-side statistics. Every observation of new loss multiplies the
//! target by the decrease factor and starts a cooldown window during
//! which the target is held; otherwise each probe adds the increase
//! constant. The target always stays inside [min, max].

use std::time::{Duration, Instant};

pub const MIN_BITRATE: i64 = 1_500_000;
pub const MAX_BITRATE: i64 = 7_500_000;
pub const START_BITRATE: i64 = 4_000_000;
pub const INCREASE_STEP: i64 = 200_000;
pub const DECREASE_FACTOR: f64 = 0.9;
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);
pub const LOSS_COOLDOWN: Duration = Duration::from_secs(2);

/// One send-side statistics observation, interval-reset semantics for the
/// instantaneous counters and cumulative for `pkt_snd_loss_total`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SrtProbe {
    pub pkt_snd_loss_total: u64,
    pub ms_rtt: f64,
}

pub struct AimdEstimator {
    target: i64,
    last_probe: Option<Instant>,
    last_loss_total: u64,
    last_loss_at: Option<Instant>,
}

impl AimdEstimator {
    pub fn new() -> Self {
        Self {
            target: START_BITRATE,
            last_probe: None,
            last_loss_total: 0,
            last_loss_at: None,
        }
    }

    pub fn target(&self) -> i64 {
        self.target
    }

    /// Whether enough time has passed since the last probe to take a new
    /// statistics sample.
    pub fn should_probe(&self, now: Instant) -> bool {
        match self.last_probe {
            Some(at) => now.duration_since(at) >= PROBE_INTERVAL,
            None => true,
        }
    }

    /// Feed one statistics sample. Returns `true` when new loss was
    /// observed and the caller should fire the PLI upcall.
    pub fn on_probe(&mut self, now: Instant, probe: &SrtProbe) -> bool {
        self.last_probe = Some(now);

        if probe.pkt_snd_loss_total > self.last_loss_total {
            self.last_loss_total = probe.pkt_snd_loss_total;
            self.last_loss_at = Some(now);
            self.target = (((self.target as f64) * DECREASE_FACTOR) as i64).max(MIN_BITRATE);
            return true;
        }

        let in_cooldown = self
            .last_loss_at
            .is_some_and(|at| now.duration_since(at) < LOSS_COOLDOWN);
        if !in_cooldown {
            self.target = (self.target + INCREASE_STEP).min(MAX_BITRATE);
        }
        false
    }
}

impl Default for AimdEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(loss_total: u64) -> SrtProbe {
        SrtProbe {
            pkt_snd_loss_total: loss_total,
            ms_rtt: 40.0,
        }
    }

    #[test]
    fn full_aimd_cycle() {
        let mut est = AimdEstimator::new();
        let t0 = Instant::now();
        assert_eq!(est.target(), 4_000_000);

        // Clean probe: additive increase.
        assert!(!est.on_probe(t0, &probe(0)));
        assert_eq!(est.target(), 4_200_000);

        // Loss total jumps by 5: multiplicative decrease, PLI fired.
        let t1 = t0 + Duration::from_millis(500);
        assert!(est.on_probe(t1, &probe(5)));
        assert_eq!(est.target(), 3_780_000);

        // Two probes inside the cooldown window: held.
        let t2 = t1 + Duration::from_millis(500);
        assert!(!est.on_probe(t2, &probe(5)));
        assert_eq!(est.target(), 3_780_000);
        let t3 = t1 + Duration::from_millis(1500);
        assert!(!est.on_probe(t3, &probe(5)));
        assert_eq!(est.target(), 3_780_000);

        // Past the cooldown, growth resumes.
        let t4 = t1 + Duration::from_millis(2100);
        assert!(!est.on_probe(t4, &probe(5)));
        assert_eq!(est.target(), 3_980_000);
    }

    #[test]
    fn target_stays_within_bounds() {
        let mut est = AimdEstimator::new();
        let mut now = Instant::now();

        // Hammer with loss until the floor holds.
        for i in 1..100u64 {
            now += LOSS_COOLDOWN;
            est.on_probe(now, &probe(i));
            assert!(est.target() >= MIN_BITRATE);
        }
        assert_eq!(est.target(), MIN_BITRATE);

        // Clean probes forever cap at the ceiling.
        for _ in 0..100 {
            now += LOSS_COOLDOWN;
            est.on_probe(now, &probe(99));
            assert!(est.target() <= MAX_BITRATE);
        }
        assert_eq!(est.target(), MAX_BITRATE);
    }

    #[test]
    fn probe_rate_limit() {
        let mut est = AimdEstimator::new();
        let t0 = Instant::now();
        assert!(est.should_probe(t0));
        est.on_probe(t0, &probe(0));
        assert!(!est.should_probe(t0 + Duration::from_millis(100)));
        assert!(est.should_probe(t0 + PROBE_INTERVAL));
    }

    #[test]
    fn unchanged_loss_total_is_not_loss() {
        let mut est = AimdEstimator::new();
        let t0 = Instant::now();
        assert!(est.on_probe(t0, &probe(7)));

        // The same cumulative total later is not new loss.
        let t1 = t0 + LOSS_COOLDOWN + Duration::from_millis(100);
        assert!(!est.on_probe(t1, &probe(7)));
    }
}
