//! Audio frames and PCM helpers
//!
//! Every stage of the session exchanges mono `f32` frames normalized to
//! -1.0..=1.0. Timestamps are offsets from the start of the stream, so timing
//! decisions never depend on wall-clock scheduling jitter.

use crate::error::{VoiceError, VoiceResult};
use std::time::Duration;

/// Default input sample rate (Hz)
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Default frame length in milliseconds
pub const DEFAULT_FRAME_MS: u32 = 20;

/// One fixed-length run of mono audio samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Position of this frame in its stream
    pub sequence: u64,

    /// Offset of the first sample from the start of the stream
    pub timestamp: Duration,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, sequence: u64, timestamp: Duration) -> Self {
        Self {
            samples,
            sample_rate,
            sequence,
            timestamp,
        }
    }

    /// Playback duration of this frame
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len() as u64, self.sample_rate)
    }

    /// Stream offset just past the last sample
    pub fn end(&self) -> Duration {
        self.timestamp + self.duration()
    }

    /// Root-mean-square energy of the frame
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// Decode 16-bit little-endian PCM into a frame.
    pub fn from_pcm16_le(
        bytes: &[u8],
        sample_rate: u32,
        sequence: u64,
        timestamp: Duration,
    ) -> VoiceResult<Self> {
        if bytes.len() % 2 != 0 {
            return Err(VoiceError::AudioFormat(format!(
                "PCM16 payload must have an even length, got {} bytes",
                bytes.len()
            )));
        }
        Ok(Self::new(pcm16_le_to_f32(bytes), sample_rate, sequence, timestamp))
    }

    /// Encode the frame as 16-bit little-endian PCM.
    pub fn to_pcm16_le(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.samples.len() * 2);
        for &s in &self.samples {
            buf.extend_from_slice(&f32_to_i16(s).to_le_bytes());
        }
        buf
    }
}

/// Root-mean-square energy of a sample run (0.0 for an empty run)
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Duration covered by `count` samples at `sample_rate`
pub fn samples_to_duration(count: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(count * 1_000_000_000 / sample_rate as u64)
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Decode 16-bit little-endian PCM. A trailing odd byte is ignored.
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for API upload.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = samples.len() * 2; // 16-bit = 2 bytes per sample
    let file_len = 44 + data_len as u32;

    let mut buf = Vec::with_capacity(44 + data_len);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(file_len - 8).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &s in samples {
        buf.extend_from_slice(&f32_to_i16(s).to_le_bytes());
    }
    buf
}

/// Cuts an arbitrary sample stream into fixed-length, sequenced frames.
///
/// Used wherever audio arrives in network-sized pieces (room transport,
/// streamed synthesis) and must be handed on frame by frame.
#[derive(Debug)]
pub struct FrameAssembler {
    sample_rate: u32,
    frame_len: usize,
    pending: Vec<f32>,
    next_sequence: u64,
    emitted_samples: u64,
}

impl FrameAssembler {
    pub fn new(sample_rate: u32, frame_ms: u32) -> Self {
        let frame_len = ((sample_rate as u64 * frame_ms as u64) / 1000).max(1) as usize;
        Self {
            sample_rate,
            frame_len,
            pending: Vec::with_capacity(frame_len),
            next_sequence: 0,
            emitted_samples: 0,
        }
    }

    /// Samples per emitted frame
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Append samples and return every frame that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        for &sample in samples {
            self.pending.push(sample);
            if self.pending.len() >= self.frame_len {
                let chunk = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_len));
                frames.push(self.emit(chunk));
            }
        }
        frames
    }

    /// Emit whatever is buffered as a final, possibly short, frame.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let chunk = std::mem::take(&mut self.pending);
        Some(self.emit(chunk))
    }

    fn emit(&mut self, samples: Vec<f32>) -> AudioFrame {
        let timestamp = samples_to_duration(self.emitted_samples, self.sample_rate);
        self.emitted_samples += samples.len() as u64;
        let frame = AudioFrame::new(samples, self.sample_rate, self.next_sequence, timestamp);
        self.next_sequence += 1;
        frame
    }
}
