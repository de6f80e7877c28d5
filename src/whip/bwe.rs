//! Congestion control for the WHIP sender
//!
//! Two estimator back-ends, both fed from TWCC feedback observed on the
//! video sender's RTCP stream: a Google-congestion-control style
//! delay+loss estimator and a self-clocked SCReAM style one. The reported
//! figure prefers the delay-based target over the loss-based one, since
//! some receivers mis-report loss at low bitrates; it is floored and
//! capped to the WHIP operating range.

pub const MIN_BITRATE: i64 = 400_000;
pub const MAX_BITRATE: i64 = 7_500_000;
pub const INITIAL_BITRATE: i64 = 1_000_000;

/// Delay gradient above which the path counts as overused, in ms.
const OVERUSE_THRESHOLD_MS: f64 = 10.0;

/// One digested TWCC feedback message.
#[derive(Debug, Clone, Copy)]
pub struct TwccObservation {
    /// Packets the feedback covers.
    pub expected: u32,
    /// Packets the receiver actually saw.
    pub received: u32,
    /// One-way-delay proxy: local receipt time minus the remote reference
    /// time, in ms. Only its gradient is meaningful.
    pub owd_proxy_ms: f64,
}

impl TwccObservation {
    pub fn loss_fraction(&self) -> f64 {
        if self.expected == 0 {
            return 0.0;
        }
        1.0 - (self.received as f64 / self.expected as f64).min(1.0)
    }
}

/// Separate targets from the two estimator dimensions.
#[derive(Debug, Clone, Copy)]
pub struct TargetBitrate {
    pub delay_based: Option<i64>,
    pub loss_based: i64,
}

impl TargetBitrate {
    /// The figure exposed as `bandwidth_estimate()`.
    pub fn reported(&self) -> i64 {
        self.delay_based
            .unwrap_or(self.loss_based)
            .clamp(MIN_BITRATE, MAX_BITRATE)
    }
}

pub trait BandwidthEstimator: Send {
    fn on_feedback(&mut self, observation: &TwccObservation);
    fn target(&self) -> TargetBitrate;
}

/// Which estimator back-end the sink runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionBackend {
    #[default]
    GoogCc,
    Scream,
}

impl CongestionBackend {
    pub fn build(self) -> Box<dyn BandwidthEstimator> {
        match self {
            Self::GoogCc => Box::new(GoogCcEstimator::new()),
            Self::Scream => Box::new(ScreamEstimator::new()),
        }
    }
}

/// Delay+loss estimator in the GCC mold.
pub struct GoogCcEstimator {
    loss_target: f64,
    delay_target: f64,
    prev_owd_ms: Option<f64>,
    feedback_seen: bool,
}

impl GoogCcEstimator {
    pub fn new() -> Self {
        Self {
            loss_target: INITIAL_BITRATE as f64,
            delay_target: INITIAL_BITRATE as f64,
            prev_owd_ms: None,
            feedback_seen: false,
        }
    }
}

impl Default for GoogCcEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthEstimator for GoogCcEstimator {
    fn on_feedback(&mut self, observation: &TwccObservation) {
        self.feedback_seen = true;

        // Loss-based branch, RFC 8698 shape: heavy loss backs off in
        // proportion, light loss probes upward.
        let loss = observation.loss_fraction();
        if loss > 0.10 {
            self.loss_target *= 1.0 - 0.5 * loss;
        } else if loss < 0.02 {
            self.loss_target *= 1.05;
        }
        self.loss_target = self
            .loss_target
            .clamp(MIN_BITRATE as f64, MAX_BITRATE as f64);

        // Delay-based branch on the one-way-delay gradient.
        if let Some(prev) = self.prev_owd_ms {
            let gradient = observation.owd_proxy_ms - prev;
            if gradient > OVERUSE_THRESHOLD_MS {
                self.delay_target *= 0.85;
            } else if gradient < OVERUSE_THRESHOLD_MS / 2.0 {
                self.delay_target *= 1.05;
            }
            self.delay_target = self
                .delay_target
                .clamp(MIN_BITRATE as f64, MAX_BITRATE as f64);
        }
        self.prev_owd_ms = Some(observation.owd_proxy_ms);
    }

    fn target(&self) -> TargetBitrate {
        TargetBitrate {
            delay_based: (self.feedback_seen && self.prev_owd_ms.is_some())
                .then_some(self.delay_target as i64),
            loss_based: self.loss_target as i64,
        }
    }
}

/// Self-clocked estimator in the SCReAM mold: the congestion signal is an
/// accumulated queue-delay estimate rather than the raw gradient.
pub struct ScreamEstimator {
    target: f64,
    queue_delay_ms: f64,
    prev_owd_ms: Option<f64>,
}

impl ScreamEstimator {
    pub fn new() -> Self {
        Self {
            target: INITIAL_BITRATE as f64,
            queue_delay_ms: 0.0,
            prev_owd_ms: None,
        }
    }
}

impl Default for ScreamEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthEstimator for ScreamEstimator {
    fn on_feedback(&mut self, observation: &TwccObservation) {
        if let Some(prev) = self.prev_owd_ms {
            let gradient = observation.owd_proxy_ms - prev;
            self.queue_delay_ms = (self.queue_delay_ms + gradient).max(0.0);
        }
        self.prev_owd_ms = Some(observation.owd_proxy_ms);

        let loss = observation.loss_fraction();
        if self.queue_delay_ms > 50.0 || loss > 0.10 {
            self.target *= 0.9;
            // The backoff itself drains queue; decay the estimate so a
            // single spike does not pin the target at the floor.
            self.queue_delay_ms *= 0.5;
        } else {
            self.target *= 1.08;
        }
        self.target = self.target.clamp(MIN_BITRATE as f64, MAX_BITRATE as f64);
    }

    fn target(&self) -> TargetBitrate {
        TargetBitrate {
            delay_based: Some(self.target as i64),
            loss_based: self.target as i64,
        }
    }
}
