//! **Speech synthesis**: streamed text in, paced audio frames out.
//!
//! Text deltas are grouped into sentences so speech can start as soon as the
//! first sentence is complete. Each sentence is synthesized as a lazy frame
//! stream and forwarded to playback no faster than real time (plus a small
//! lead), so a cancellation stops the agent almost immediately.

use crate::audio::{pcm16_le_to_f32, AudioFrame, FrameAssembler, DEFAULT_FRAME_MS, DEFAULT_SAMPLE_RATE};
use crate::error::{VoiceError, VoiceResult};
use crate::openai::{check_status, OpenAiEndpoint};
use crate::retry::RetryPolicy;
use crate::transport::Playback;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub type AudioStream = BoxStream<'static, VoiceResult<AudioFrame>>;

/// OpenAI TTS voices accepted by `/audio/speech`
pub const OPENAI_VOICES: &[&str] = &[
    "alloy", "ash", "ballad", "coral", "echo", "fable", "nova", "onyx", "sage", "shimmer", "verse",
];

/// Backend that turns text into a lazy stream of audio frames.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn preflight(&self) -> VoiceResult<()> {
        Ok(())
    }

    /// Synthesize one sentence.
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioStream>;

    /// Sample rate of the frames this backend produces
    fn output_sample_rate(&self) -> u32;

    fn name(&self) -> &str;
}

/// Groups streamed text into sentences.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    pending: String,
}

const SENTENCE_DELIMITERS: [char; 5] = ['.', '!', '?', '。', '\n'];

impl SentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta; returns every sentence completed by it.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.pending.push_str(delta);
        let mut sentences = Vec::new();
        while let Some(pos) = self.pending.find(SENTENCE_DELIMITERS) {
            let end = pos + self.pending[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
            let sentence: String = self.pending.drain(..end).collect();
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Remaining text once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// What a synthesis run delivered to playback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisReport {
    pub sentences: usize,
    pub frames: u64,
    pub audio: Duration,
    pub cancelled: bool,
}

/// Synthesizer plus retry policy and playback pacing
#[derive(Clone)]
pub struct SynthesisPipeline {
    synthesizer: Arc<dyn Synthesizer>,
    retry: RetryPolicy,
    playback_lead: Duration,
}

impl SynthesisPipeline {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, retry: RetryPolicy, playback_lead: Duration) -> Self {
        Self {
            synthesizer,
            retry,
            playback_lead,
        }
    }

    /// Synthesize text deltas from `text` until the channel closes or `cancel` fires.
    ///
    /// `on_sentence` runs right before the first frame of each sentence is handed
    /// to playback. Frames are released at most `playback_lead` ahead of the
    /// listener's playout; if playout ran dry while a sentence was synthesized,
    /// the clock restarts at the late frame. Returns once the last frame has
    /// played out. On cancellation the in-flight synthesis stream is dropped and
    /// nothing more is sent.
    pub async fn run(
        &self,
        mut text: mpsc::Receiver<String>,
        playback: mpsc::Sender<Playback>,
        cancel: CancellationToken,
        mut on_sentence: impl FnMut(&str) + Send,
    ) -> VoiceResult<SynthesisReport> {
        let mut sentences = SentenceBuffer::new();
        let mut report = SynthesisReport::default();
        let mut clock: Option<Instant> = None;
        let mut input_closed = false;

        while !input_closed {
            let ready = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    return Ok(report);
                }
                delta = text.recv() => match delta {
                    Some(delta) => sentences.push(&delta),
                    None => {
                        input_closed = true;
                        sentences.finish().into_iter().collect()
                    }
                },
            };

            for sentence in ready {
                debug!("🔊 Synthesizing: {}", sentence);
                let mut audio = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        report.cancelled = true;
                        return Ok(report);
                    }
                    opened = self.retry.run("synthesis", |_| self.synthesizer.synthesize(&sentence)) => opened?,
                };
                report.sentences += 1;
                let mut announced = false;

                loop {
                    let frame = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            report.cancelled = true;
                            return Ok(report);
                        }
                        frame = audio.next() => match frame {
                            Some(frame) => frame?,
                            None => break,
                        },
                    };

                    let now = Instant::now();
                    let mut start = *clock.get_or_insert(now);
                    if start + report.audio < now {
                        // Playout ran dry; it resumes with this frame
                        start = now.checked_sub(report.audio).unwrap_or(now);
                        clock = Some(start);
                    }
                    let due = start + report.audio.saturating_sub(self.playback_lead);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            report.cancelled = true;
                            return Ok(report);
                        }
                        _ = tokio::time::sleep_until(due) => {}
                    }

                    let frame = AudioFrame::new(frame.samples, frame.sample_rate, report.frames, report.audio);
                    let duration = frame.duration();
                    if !announced {
                        on_sentence(&sentence);
                        announced = true;
                    }
                    playback
                        .send(Playback::Audio(frame))
                        .await
                        .map_err(|_| VoiceError::ChannelSend("playback closed".to_string()))?;
                    report.frames += 1;
                    report.audio += duration;
                }
            }
        }

        if let Some(start) = clock {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    return Ok(report);
                }
                _ = tokio::time::sleep_until(start + report.audio) => {}
            }
        }

        info!(
            "🗣️ Synthesis done: {} sentences, {:?} of audio",
            report.sentences, report.audio
        );
        Ok(report)
    }
}

/// Placeholder TTS: a short run of silent frames per sentence, roughly the
/// length the sentence would take to speak.
#[derive(Debug, Clone)]
pub struct PlaceholderSynthesizer {
    pub sample_rate: u32,
    /// Audio produced per character of input
    pub per_char: Duration,
}

impl Default for PlaceholderSynthesizer {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            per_char: Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl Synthesizer for PlaceholderSynthesizer {
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioStream> {
        let total = self.per_char * text.chars().count() as u32;
        let samples = (total.as_secs_f64() * self.sample_rate as f64) as usize;
        let mut assembler = FrameAssembler::new(self.sample_rate, DEFAULT_FRAME_MS);
        let mut frames = assembler.push(&vec![0.0; samples]);
        frames.extend(assembler.flush());
        Ok(stream::iter(frames.into_iter().map(Ok)).boxed())
    }

    fn output_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn name(&self) -> &str {
        "placeholder"
    }
}

/// Raw PCM sample rate returned by `/audio/speech` with `response_format: pcm`
const OPENAI_PCM_RATE: u32 = 24000;

/// Production TTS backend: OpenAI-compatible `/audio/speech` streaming raw PCM.
#[derive(Debug, Clone)]
pub struct OpenAiSynthesizer {
    endpoint: OpenAiEndpoint,
    /// TTS model: tts-1 (fast) or tts-1-hd (higher quality)
    pub model: String,
    pub voice: String,
    /// Speaking rate; values below 1.0 speak more slowly
    pub speed: f32,
}

impl OpenAiSynthesizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> VoiceResult<Self> {
        let voice = voice.into();
        if !OPENAI_VOICES.contains(&voice.as_str()) {
            return Err(VoiceError::UnsupportedVoice(voice));
        }
        Ok(Self {
            endpoint: OpenAiEndpoint::new(base_url, api_key, Duration::from_secs(30))?,
            model: model.into(),
            voice,
            speed: 1.0,
        })
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn preflight(&self) -> VoiceResult<()> {
        self.endpoint.preflight("tts").await
    }

    async fn synthesize(&self, text: &str) -> VoiceResult<AudioStream> {
        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": "pcm",
            "speed": self.speed,
        });
        let res = self
            .endpoint
            .post("audio/speech")
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::http("tts", e))?;
        let res = check_status("tts", res).await?;

        let mut bytes = res.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut assembler = FrameAssembler::new(OPENAI_PCM_RATE, DEFAULT_FRAME_MS);
            let mut carry: Option<u8> = None;
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| VoiceError::http("tts", e))?;
                let mut data = Vec::with_capacity(chunk.len() + 1);
                data.extend(carry.take());
                data.extend_from_slice(&chunk);
                if data.len() % 2 == 1 {
                    carry = data.pop();
                }
                for frame in assembler.push(&pcm16_le_to_f32(&data)) {
                    yield frame;
                }
            }
            if let Some(frame) = assembler.flush() {
                yield frame;
            }
        };
        Ok(stream.boxed())
    }

    fn output_sample_rate(&self) -> u32 {
        OPENAI_PCM_RATE
    }

    fn name(&self) -> &str {
        &self.voice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sentences_split_on_delimiters() {
        let mut buffer = SentenceBuffer::new();
        assert!(buffer.push("안녕하세").is_empty());
        assert_eq!(buffer.push("요. 잘 지내"), vec!["안녕하세요.".to_string()]);
        assert_eq!(
            buffer.push("셨어요? 네!\n좋아요"),
            vec!["잘 지내셨어요?".to_string(), "네!".to_string()]
        );
        assert_eq!(buffer.finish(), Some("좋아요".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn ideographic_full_stop_ends_sentence() {
        let mut buffer = SentenceBuffer::new();
        assert_eq!(buffer.push("はい。次"), vec!["はい。".to_string()]);
        assert_eq!(buffer.finish(), Some("次".to_string()));
    }

    #[test]
    fn unknown_voice_is_rejected() {
        let err = OpenAiSynthesizer::new("http://localhost", "key", "tts-1", "Seoyeon").unwrap_err();
        assert!(matches!(err, VoiceError::UnsupportedVoice(_)));
    }

    fn pipeline() -> SynthesisPipeline {
        SynthesisPipeline::new(
            Arc::new(PlaceholderSynthesizer::default()),
            RetryPolicy::no_retry(),
            Duration::from_millis(200),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_restamped_across_sentences() {
        let (text_tx, text_rx) = mpsc::channel(8);
        let (playback_tx, mut playback_rx) = mpsc::channel(256);
        text_tx.send("네. ".to_string()).await.unwrap();
        text_tx.send("좋아요".to_string()).await.unwrap();
        drop(text_tx);

        let spoken = Arc::new(Mutex::new(Vec::new()));
        let log = spoken.clone();
        let report = pipeline()
            .run(text_rx, playback_tx, CancellationToken::new(), move |sentence: &str| {
                log.lock().unwrap().push(sentence.to_string())
            })
            .await
            .unwrap();

        assert_eq!(*spoken.lock().unwrap(), vec!["네.".to_string(), "좋아요".to_string()]);
        assert_eq!(report.sentences, 2);
        assert!(!report.cancelled);

        let mut expected = 0;
        let mut at = Duration::ZERO;
        while let Ok(Playback::Audio(frame)) = playback_rx.try_recv() {
            assert_eq!(frame.sequence, expected);
            assert_eq!(frame.timestamp, at);
            expected += 1;
            at += frame.duration();
        }
        assert_eq!(expected, report.frames);
        assert_eq!(at, report.audio);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_is_paced_in_real_time() {
        let (text_tx, text_rx) = mpsc::channel(8);
        let (playback_tx, _playback_rx) = mpsc::channel(256);
        // 20 chars * 50ms = 1s of audio
        text_tx.send("a".repeat(20)).await.unwrap();
        drop(text_tx);

        let start = Instant::now();
        let report = pipeline()
            .run(text_rx, playback_tx, CancellationToken::new(), |_: &str| {})
            .await
            .unwrap();
        assert_eq!(report.audio, Duration::from_secs(1));
        // Returns once the last frame has played out
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    /// Sleeps before every sentence, as a slow network backend would
    struct SlowSynthesizer {
        inner: PlaceholderSynthesizer,
        latency: Duration,
    }

    #[async_trait]
    impl Synthesizer for SlowSynthesizer {
        async fn synthesize(&self, text: &str) -> VoiceResult<AudioStream> {
            tokio::time::sleep(self.latency).await;
            self.inner.synthesize(text).await
        }

        fn output_sample_rate(&self) -> u32 {
            self.inner.sample_rate
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lead_holds_when_synthesis_is_slower_than_playout() {
        let lead = Duration::from_millis(200);
        let pipeline = SynthesisPipeline::new(
            Arc::new(SlowSynthesizer {
                inner: PlaceholderSynthesizer::default(),
                latency: Duration::from_millis(500),
            }),
            RetryPolicy::no_retry(),
            lead,
        );
        let (text_tx, text_rx) = mpsc::channel(8);
        let (playback_tx, mut playback_rx) = mpsc::channel(1024);
        // Four sentences of 1s each
        for _ in 0..4 {
            text_tx.send(format!("{}. ", "a".repeat(19))).await.unwrap();
        }
        drop(text_tx);

        // Listener plays each frame as soon as it arrives and the previous one ended
        let listener = tokio::spawn(async move {
            let mut playout_end: Option<Instant> = None;
            let mut max_buffered = Duration::ZERO;
            while let Some(Playback::Audio(frame)) = playback_rx.recv().await {
                let now = Instant::now();
                let begins = playout_end.map_or(now, |end| end.max(now));
                max_buffered = max_buffered.max(begins - now);
                playout_end = Some(begins + frame.duration());
            }
            (playout_end.unwrap(), max_buffered)
        });

        let report = pipeline
            .run(text_rx, playback_tx, CancellationToken::new(), |_: &str| {})
            .await
            .unwrap();
        let returned = Instant::now();
        let (playout_end, max_buffered) = listener.await.unwrap();

        assert_eq!(report.audio, Duration::from_secs(4));
        assert!(max_buffered <= lead, "listener buffered {:?}", max_buffered);
        assert!(playout_end <= returned, "playout ends {:?} after return", playout_end - returned);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_output() {
        let (text_tx, text_rx) = mpsc::channel(8);
        let (playback_tx, mut playback_rx) = mpsc::channel(256);
        // 10s of audio
        text_tx.send("a".repeat(200)).await.unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline().run(text_rx, playback_tx, cancel, |_: &str| {}).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert!(report.cancelled);
        assert!(report.audio < Duration::from_secs(1));

        let mut received = 0;
        while playback_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, report.frames);
        drop(text_tx);
    }
}
