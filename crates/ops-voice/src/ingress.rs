//! Audio ingress buffer: voice-activity segmentation of the inbound stream
//!
//! Implements the "gap logic": an utterance opens on the first speech frame and
//! is finalized once the silence after the last speech frame exceeds the
//! configured threshold. All timing comes from frame timestamps.

use crate::audio::AudioFrame;
use crate::error::VoiceResult;
use crate::vad::VoiceActivityDetector;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for utterance segmentation
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Silence after speech before the utterance is finalized (default: 800ms)
    pub silence_threshold: Duration,

    /// Minimum speech duration to be considered a valid utterance (default: 200ms)
    pub min_speech_duration: Duration,

    /// Maximum utterance duration before a forced finalize (default: 30s)
    pub max_utterance_duration: Duration,

    /// VAD probability above which a frame is speech (default: 0.5)
    pub speech_threshold: f32,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_millis(800),
            min_speech_duration: Duration::from_millis(200),
            max_utterance_duration: Duration::from_secs(30),
            speech_threshold: 0.5,
        }
    }
}

/// A contiguous span of detected speech bounded by silence
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Per-session utterance counter
    pub id: u64,

    /// Frames from the first to the last speech frame
    pub frames: Vec<AudioFrame>,

    /// Stream offset of the first speech frame
    pub started_at: Duration,

    /// Stream offset just past the last speech frame
    pub ended_at: Duration,

    pub sample_rate: u32,
}

impl Utterance {
    /// All samples of the utterance, in order
    pub fn samples(&self) -> Vec<f32> {
        self.frames.iter().flat_map(|f| f.samples.iter().copied()).collect()
    }

    pub fn speech_duration(&self) -> Duration {
        self.ended_at.saturating_sub(self.started_at)
    }
}

/// Events emitted by the ingress buffer
#[derive(Debug, Clone)]
pub enum IngressEvent {
    /// A new speech segment opened
    SpeechStarted { at: Duration },

    /// Silence threshold (or max duration) reached: the utterance is final
    Utterance(Utterance),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Silence,
    Speech,
    TrailingSilence,
}

/// Segments inbound frames into utterances
pub struct AudioIngressBuffer {
    config: IngressConfig,
    vad: Box<dyn VoiceActivityDetector>,
    state: SegmentState,
    frames: Vec<AudioFrame>,
    speech_start: Option<Duration>,
    last_speech_end: Option<Duration>,
    next_id: u64,
}

impl AudioIngressBuffer {
    pub fn new(config: IngressConfig, vad: Box<dyn VoiceActivityDetector>) -> Self {
        Self {
            config,
            vad,
            state: SegmentState::Silence,
            frames: Vec::new(),
            speech_start: None,
            last_speech_end: None,
            next_id: 0,
        }
    }

    /// Feed one frame. Returns at most one event per frame.
    pub fn push(&mut self, frame: AudioFrame) -> VoiceResult<Option<IngressEvent>> {
        let probability = self.vad.speech_probability(&frame)?;
        let is_speech = probability > self.config.speech_threshold;

        match (self.state, is_speech) {
            (SegmentState::Silence, true) => {
                debug!("🎤 Speech started at {:?}", frame.timestamp);
                let at = frame.timestamp;
                self.state = SegmentState::Speech;
                self.speech_start = Some(at);
                self.last_speech_end = Some(frame.end());
                self.frames.clear();
                self.frames.push(frame);
                Ok(Some(IngressEvent::SpeechStarted { at }))
            }

            (SegmentState::Silence, false) => Ok(None),

            (SegmentState::Speech, true) | (SegmentState::TrailingSilence, true) => {
                self.state = SegmentState::Speech;
                self.last_speech_end = Some(frame.end());
                self.frames.push(frame);

                let elapsed = self.current_speech_duration();
                if elapsed >= self.config.max_utterance_duration {
                    warn!("⏱️ Max utterance duration reached, finalizing");
                    return Ok(self.finalize());
                }
                Ok(None)
            }

            (SegmentState::Speech, false) | (SegmentState::TrailingSilence, false) => {
                self.state = SegmentState::TrailingSilence;
                let frame_end = frame.end();
                self.frames.push(frame);

                let silence = self
                    .last_speech_end
                    .map(|end| frame_end.saturating_sub(end))
                    .unwrap_or_default();
                if silence >= self.config.silence_threshold {
                    return Ok(self.finalize());
                }
                Ok(None)
            }
        }
    }

    /// Whether a speech segment is currently open
    pub fn in_speech(&self) -> bool {
        self.state != SegmentState::Silence
    }

    /// Drop any partially collected segment.
    pub fn reset(&mut self) {
        self.state = SegmentState::Silence;
        self.frames.clear();
        self.speech_start = None;
        self.last_speech_end = None;
        self.vad.reset();
    }

    fn current_speech_duration(&self) -> Duration {
        match (self.speech_start, self.last_speech_end) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => Duration::ZERO,
        }
    }

    fn finalize(&mut self) -> Option<IngressEvent> {
        let duration = self.current_speech_duration();
        let (Some(started_at), Some(ended_at)) = (self.speech_start, self.last_speech_end) else {
            self.reset();
            return None;
        };

        if duration < self.config.min_speech_duration {
            debug!("⏭️ Speech too short ({:?}), ignoring", duration);
            self.reset();
            return None;
        }

        // Trailing silence is not part of the utterance
        let mut frames = std::mem::take(&mut self.frames);
        frames.retain(|f| f.timestamp < ended_at);
        let sample_rate = frames.first().map(|f| f.sample_rate).unwrap_or_default();

        let utterance = Utterance {
            id: self.next_id,
            frames,
            started_at,
            ended_at,
            sample_rate,
        };
        self.next_id += 1;

        info!(
            "🎯 Utterance {} finalized: {:?} of speech, {} frames",
            utterance.id,
            duration,
            utterance.frames.len()
        );

        self.reset();
        Some(IngressEvent::Utterance(utterance))
    }
}
