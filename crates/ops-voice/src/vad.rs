//! Voice Activity Detection
//!
//! Per-frame speech classification behind a small trait so the ingress buffer
//! can be driven by any detector. The default detector is an RMS energy gate.

use crate::audio::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Configuration for VAD detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// RMS energy at which a frame counts as half-way to speech (default: 0.02)
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f32,

    /// Probability above which a frame is speech (default: 0.5)
    #[serde(default = "default_speech_threshold")]
    pub speech_threshold: f32,
}

fn default_energy_threshold() -> f32 {
    0.02
}

fn default_speech_threshold() -> f32 {
    0.5
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: default_energy_threshold(),
            speech_threshold: default_speech_threshold(),
        }
    }
}

/// Classifies single audio frames as speech or silence.
pub trait VoiceActivityDetector: Send {
    /// Speech probability for the frame in 0.0..=1.0.
    fn speech_probability(&mut self, frame: &AudioFrame) -> VoiceResult<f32>;

    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Clear any state carried between frames
    fn reset(&mut self) {}
}

/// Energy-based VAD: maps frame RMS onto a probability so that a frame exactly
/// at the threshold scores 0.5 (not speech) and anything louder scores above it.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> VoiceResult<Self> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(VoiceError::Config(format!(
                "VAD energy threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn speech_probability(&mut self, frame: &AudioFrame) -> VoiceResult<f32> {
        if frame.samples.is_empty() {
            return Ok(0.0);
        }
        let score = frame.rms() / self.threshold * 0.5;
        Ok(score.min(1.0))
    }

    fn name(&self) -> &str {
        "energy"
    }
}

/// Create the VAD backend described by `config`.
pub fn create_vad(config: &VadConfig) -> VoiceResult<Box<dyn VoiceActivityDetector>> {
    if !(0.0..1.0).contains(&config.speech_threshold) {
        return Err(VoiceError::Config(format!(
            "VAD speech threshold must be in [0, 1), got {}",
            config.speech_threshold
        )));
    }
    let vad = EnergyVad::new(config.energy_threshold)?;
    info!("🎙️ VAD ready (backend: {}, energy threshold: {})", vad.name(), vad.threshold());
    Ok(Box::new(vad))
}
