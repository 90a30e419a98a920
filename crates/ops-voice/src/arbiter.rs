//! Turn-taking arbiter: barge-in detection while the agent is speaking
//!
//! The arbiter is armed only while the session is in `Speaking`. It accumulates
//! user speech above an energy threshold and fires once the speech has been
//! sustained for the configured duration. Dips shorter than the gap tolerance
//! do not reset the accumulated speech.

use crate::audio::AudioFrame;
use std::time::Duration;
use tracing::{debug, info};

/// Barge-in policy parameters
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// RMS energy a frame must exceed to count as user speech (default: 0.05)
    pub energy_threshold: f32,

    /// Sustained speech needed to interrupt the agent (default: 300ms)
    pub min_speech_duration: Duration,

    /// Silence tolerated inside sustained speech (default: 100ms)
    pub gap_tolerance: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.05,
            min_speech_duration: Duration::from_millis(300),
            gap_tolerance: Duration::from_millis(100),
        }
    }
}

/// Outcome of observing one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterDecision {
    /// Agent may keep speaking
    Continue,

    /// User speech was sustained long enough: stop the agent
    BargeIn { speech: Duration },
}

pub struct TurnArbiter {
    config: ArbiterConfig,
    armed: bool,
    fired: bool,
    speech_start: Option<Duration>,
    last_voiced_end: Option<Duration>,
}

impl TurnArbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self {
            config,
            armed: false,
            fired: false,
            speech_start: None,
            last_voiced_end: None,
        }
    }

    /// Start watching for barge-in (agent began speaking).
    pub fn arm(&mut self) {
        if !self.armed {
            debug!("Arbiter armed");
        }
        self.armed = true;
        self.fired = false;
        self.speech_start = None;
        self.last_voiced_end = None;
    }

    /// Stop watching (agent finished or was interrupted).
    pub fn disarm(&mut self) {
        self.armed = false;
        self.speech_start = None;
        self.last_voiced_end = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Observe a frame captured while the agent may be speaking.
    pub fn observe(&mut self, frame: &AudioFrame) -> ArbiterDecision {
        if !self.armed || self.fired {
            return ArbiterDecision::Continue;
        }

        let voiced = frame.rms() > self.config.energy_threshold;
        if voiced {
            let resumed_after_gap = self
                .last_voiced_end
                .map(|end| frame.timestamp.saturating_sub(end) > self.config.gap_tolerance)
                .unwrap_or(true);
            if self.speech_start.is_none() || resumed_after_gap {
                self.speech_start = Some(frame.timestamp);
            }
            self.last_voiced_end = Some(frame.end());

            let speech = self.sustained_speech();
            if speech >= self.config.min_speech_duration {
                info!("⚡ Barge-in: {:?} of sustained user speech", speech);
                self.fired = true;
                return ArbiterDecision::BargeIn { speech };
            }
        } else if let Some(end) = self.last_voiced_end {
            if frame.end().saturating_sub(end) > self.config.gap_tolerance {
                self.speech_start = None;
                self.last_voiced_end = None;
            }
        }

        ArbiterDecision::Continue
    }

    fn sustained_speech(&self) -> Duration {
        match (self.speech_start, self.last_voiced_end) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => Duration::ZERO,
        }
    }
}
