//! **Speech-to-Text (STT)**: turn finalized `Utterance`s into transcripts.
//!
//! Implement `Transcriber` for any recognition service. The `RecognitionPipeline`
//! wraps a transcriber with retry and produces partial and final transcript events
//! for the session controller.

use crate::audio::pcm_f32_to_wav;
use crate::error::{VoiceError, VoiceResult};
use crate::ingress::Utterance;
use crate::openai::{check_status, OpenAiEndpoint};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One element of a transcript stream. A stream is finite and ends with `Final`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Best guess so far; superseded by later events
    Partial(String),
    /// Complete transcript for the utterance
    Final(String),
}

pub type TranscriptStream = BoxStream<'static, VoiceResult<TranscriptEvent>>;

/// Backend that converts one utterance into a transcript stream.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Check credentials and configuration before the session leaves Idle.
    async fn preflight(&self) -> VoiceResult<()> {
        Ok(())
    }

    /// Transcribe one utterance. `language` is a BCP-47 code such as `ko-KR`.
    async fn transcribe(
        &self,
        utterance: &Utterance,
        language: &str,
    ) -> VoiceResult<TranscriptStream>;

    /// Short backend name for logs
    fn name(&self) -> &str;
}

/// Recognition output delivered to the session controller
#[derive(Debug)]
pub enum RecognitionEvent {
    Partial { utterance_id: u64, text: String },
    Final { utterance_id: u64, text: String },
    Failed { utterance_id: u64, error: VoiceError },
}

/// Transcriber plus language and retry policy
#[derive(Clone)]
pub struct RecognitionPipeline {
    transcriber: Arc<dyn Transcriber>,
    language: String,
    retry: RetryPolicy,
}

impl RecognitionPipeline {
    pub fn new(transcriber: Arc<dyn Transcriber>, language: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            transcriber,
            language: language.into(),
            retry,
        }
    }

    /// Recognize one utterance, forwarding partials as they arrive.
    ///
    /// Returns `Ok(None)` when the final transcript is empty. A stream that ends
    /// without a final event counts as a transient failure and is retried.
    pub async fn recognize(
        &self,
        utterance: &Utterance,
        partials: Option<&mpsc::UnboundedSender<String>>,
    ) -> VoiceResult<Option<String>> {
        let text = self
            .retry
            .run("transcription", |attempt| async move {
                if attempt > 1 {
                    debug!("Transcribing utterance {} (attempt {})", utterance.id, attempt);
                }
                let mut stream = self.transcriber.transcribe(utterance, &self.language).await?;
                while let Some(event) = stream.next().await {
                    match event? {
                        TranscriptEvent::Partial(text) => {
                            if let Some(tx) = partials {
                                let _ = tx.send(text);
                            }
                        }
                        TranscriptEvent::Final(text) => return Ok(text),
                    }
                }
                Err(VoiceError::Unavailable {
                    service: "stt",
                    message: "transcript stream ended without a final result".to_string(),
                })
            })
            .await?;

        let text = text.trim();
        if text.is_empty() {
            debug!("Utterance {} produced an empty transcript", utterance.id);
            return Ok(None);
        }
        Ok(Some(text.to_string()))
    }

    /// Recognition task: one utterance at a time, in arrival order.
    pub async fn run(
        self,
        mut utterances: mpsc::Receiver<Utterance>,
        events: mpsc::Sender<RecognitionEvent>,
    ) {
        while let Some(utterance) = utterances.recv().await {
            let utterance_id = utterance.id;
            let (partial_tx, mut partial_rx) = mpsc::unbounded_channel();

            let forward = {
                let events = events.clone();
                async move {
                    while let Some(text) = partial_rx.recv().await {
                        let _ = events.send(RecognitionEvent::Partial { utterance_id, text }).await;
                    }
                }
            };
            let recognize = async {
                let result = self.recognize(&utterance, Some(&partial_tx)).await;
                drop(partial_tx);
                result
            };
            let (result, ()) = tokio::join!(recognize, forward);

            let event = match result {
                Ok(Some(text)) => {
                    info!("📝 Transcript (utterance {}): {}", utterance_id, text);
                    RecognitionEvent::Final { utterance_id, text }
                }
                Ok(None) => continue,
                Err(error) => {
                    warn!("Transcription failed for utterance {}: {}", utterance_id, error);
                    RecognitionEvent::Failed { utterance_id, error }
                }
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
        debug!("Recognition task finished");
    }
}

/// Placeholder STT: returns a fixed string, streamed as cumulative partials then a final.
/// Use for exercising the voice loop without a recognition service.
#[derive(Debug, Clone)]
pub struct PlaceholderTranscriber {
    pub response: String,
}

impl Default for PlaceholderTranscriber {
    fn default() -> Self {
        Self {
            response: "안녕하세요, 오늘 기분이 좋아요.".to_string(),
        }
    }
}

impl PlaceholderTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl Transcriber for PlaceholderTranscriber {
    async fn transcribe(
        &self,
        utterance: &Utterance,
        _language: &str,
    ) -> VoiceResult<TranscriptStream> {
        debug!(
            "STT placeholder: {} frames, {:?}",
            utterance.frames.len(),
            utterance.speech_duration()
        );
        let words: Vec<&str> = self.response.split_whitespace().collect();
        let mut events: Vec<VoiceResult<TranscriptEvent>> = (1..words.len())
            .map(|n| Ok(TranscriptEvent::Partial(words[..n].join(" "))))
            .collect();
        events.push(Ok(TranscriptEvent::Final(self.response.clone())));
        Ok(stream::iter(events).boxed())
    }

    fn name(&self) -> &str {
        "placeholder"
    }
}

/// Production STT backend: OpenAI-compatible transcription API (`/audio/transcriptions`).
#[derive(Debug, Clone)]
pub struct OpenAiTranscriber {
    endpoint: OpenAiEndpoint,
    /// Model: whisper-1 or gpt-4o-transcribe, etc.
    pub model: String,
}

impl OpenAiTranscriber {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        Ok(Self {
            endpoint: OpenAiEndpoint::new(base_url, api_key, Duration::from_secs(30))?,
            model: model.into(),
        })
    }
}

/// Primary language subtags the transcription backends accept
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "ko", "en", "ja", "zh", "es", "fr", "de", "it", "pt", "ru", "vi", "th", "id",
];

/// Reject language codes no backend can transcribe.
pub fn validate_language(language: &str) -> VoiceResult<()> {
    let hint = language_hint(language);
    if language.trim().is_empty() || !SUPPORTED_LANGUAGES.contains(&hint.as_str()) {
        return Err(VoiceError::UnsupportedLanguage(language.to_string()));
    }
    Ok(())
}

/// Primary language subtag: `ko-KR` -> `ko`.
pub fn language_hint(language: &str) -> String {
    language
        .split(['-', '_'])
        .next()
        .unwrap_or(language)
        .to_ascii_lowercase()
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn preflight(&self) -> VoiceResult<()> {
        self.endpoint.preflight("stt").await
    }

    async fn transcribe(
        &self,
        utterance: &Utterance,
        language: &str,
    ) -> VoiceResult<TranscriptStream> {
        let samples = utterance.samples();
        if samples.is_empty() {
            return Ok(stream::iter(vec![Ok(TranscriptEvent::Final(String::new()))]).boxed());
        }
        let wav = pcm_f32_to_wav(&samples, utterance.sample_rate);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::AudioFormat(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", language_hint(language));

        let res = self
            .endpoint
            .post("audio/transcriptions")
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::http("stt", e))?;
        let res = check_status("stt", res).await?;
        let json: serde_json::Value = res.json().await.map_err(|e| VoiceError::http("stt", e))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        Ok(stream::iter(vec![Ok(TranscriptEvent::Final(text))]).boxed())
    }

    fn name(&self) -> &str {
        &self.model
    }
}
