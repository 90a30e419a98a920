//! Response generation: streamed chat completions over the conversation history
//!
//! The `ResponseGenerator` opens a text stream with retry and makes it
//! cancellable: once the response token is cancelled the stream ends at the
//! next poll and the underlying HTTP body is dropped.

use crate::error::{VoiceError, VoiceResult};
use crate::history::{Speaker, Turn};
use crate::openai::{check_status, OpenAiEndpoint};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One chat message in OpenAI wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Persona instructions plus the completed conversation so far
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub instructions: String,
    pub history: Vec<Turn>,
}

impl GenerationRequest {
    /// Build a request from completed turns, keeping at most `window` of the most recent.
    pub fn new(instructions: impl Into<String>, completed: Vec<Turn>, window: usize) -> Self {
        let skip = completed.len().saturating_sub(window.max(1));
        Self {
            instructions: instructions.into(),
            history: completed.into_iter().skip(skip).collect(),
        }
    }

    /// System prompt first, then user/assistant messages in order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        if !self.instructions.trim().is_empty() {
            messages.push(ChatMessage::new("system", self.instructions.clone()));
        }
        for turn in self.history.iter().filter(|t| !t.text.is_empty()) {
            let role = match turn.speaker {
                Speaker::User => "user",
                Speaker::Agent => "assistant",
            };
            messages.push(ChatMessage::new(role, turn.text.clone()));
        }
        messages
    }

    /// Text of the most recent user turn
    pub fn last_user_text(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|t| t.speaker == Speaker::User)
            .map(|t| t.text.as_str())
    }
}

pub type TextStream = BoxStream<'static, VoiceResult<String>>;

/// Backend that streams generated text for a request.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn preflight(&self) -> VoiceResult<()> {
        Ok(())
    }

    /// Open a lazy stream of text deltas.
    async fn generate(&self, request: &GenerationRequest) -> VoiceResult<TextStream>;

    fn name(&self) -> &str;
}

/// Generator plus retry policy and cancellation
#[derive(Clone)]
pub struct ResponseGenerator {
    generator: Arc<dyn Generator>,
    retry: RetryPolicy,
}

impl ResponseGenerator {
    pub fn new(generator: Arc<dyn Generator>, retry: RetryPolicy) -> Self {
        Self { generator, retry }
    }

    /// Open a cancellable text stream. Only opening the stream is retried;
    /// errors after the first delta are surfaced as-is.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> VoiceResult<TextStream> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
            opened = self.retry.run("generation", |_| self.generator.generate(request)) => opened?,
        };
        debug!("Generation stream open ({})", self.generator.name());
        Ok(stream.take_until(cancel.cancelled_owned()).boxed())
    }
}

/// Incremental parser for `text/event-stream` chat completion bodies.
///
/// Bytes are buffered until a full line is available so that a UTF-8 sequence
/// or JSON payload split across network chunks is decoded intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the content deltas of every complete line.
    pub fn push(&mut self, bytes: &[u8]) -> VoiceResult<Vec<String>> {
        self.buffer.extend_from_slice(bytes);
        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.done {
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(delta) = self.decode_line(line.trim_end())? {
                deltas.push(delta);
            }
        }
        Ok(deltas)
    }

    /// Whether the `[DONE]` sentinel has been seen
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn decode_line(&mut self, line: &str) -> VoiceResult<Option<String>> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }
        if data.is_empty() {
            return Ok(None);
        }
        let json: serde_json::Value = serde_json::from_str(data)?;
        if let Some(message) = json["error"]["message"].as_str() {
            return Err(VoiceError::Api {
                service: "llm",
                status: 500,
                body: message.to_string(),
            });
        }
        Ok(json["choices"][0]["delta"]["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }
}

/// Production generator: OpenAI-compatible streaming `/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    endpoint: OpenAiEndpoint,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl OpenAiGenerator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        Ok(Self {
            endpoint: OpenAiEndpoint::new(base_url, api_key, Duration::from_secs(60))?,
            model: model.into(),
            temperature: 0.7,
            max_tokens: 512,
        })
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn preflight(&self) -> VoiceResult<()> {
        self.endpoint.preflight("llm").await
    }

    async fn generate(&self, request: &GenerationRequest) -> VoiceResult<TextStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages(),
            "stream": true,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let res = self
            .endpoint
            .post("chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::http("llm", e))?;
        let res = check_status("llm", res).await?;

        let mut bytes = res.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| VoiceError::http("llm", e))?;
                for delta in decoder.push(&chunk)? {
                    yield delta;
                }
                if decoder.is_done() {
                    break;
                }
            }
        };
        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Placeholder generator: streams a canned reply word by word.
#[derive(Debug, Clone)]
pub struct PlaceholderGenerator {
    pub reply: String,
    /// Delay between words, to mimic a live model
    pub chunk_delay: Duration,
}

impl Default for PlaceholderGenerator {
    fn default() -> Self {
        Self {
            reply: "네, 말씀 잘 들었어요. 오늘 건강은 괜찮으세요?".to_string(),
            chunk_delay: Duration::from_millis(40),
        }
    }
}

impl PlaceholderGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Generator for PlaceholderGenerator {
    async fn generate(&self, request: &GenerationRequest) -> VoiceResult<TextStream> {
        debug!(
            "LLM placeholder replying to: {:?}",
            request.last_user_text().unwrap_or_default()
        );
        let words: Vec<String> = self
            .reply
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let delay = self.chunk_delay;
        let stream = async_stream::stream! {
            for word in words {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok::<_, VoiceError>(word);
            }
        };
        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        "placeholder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ConversationHistory;

    fn history() -> Vec<Turn> {
        let mut history = ConversationHistory::new();
        history.push_complete(Speaker::Agent, "안녕하세요").unwrap();
        history.push_complete(Speaker::User, "hello").unwrap();
        history.completed()
    }

    #[test]
    fn messages_follow_history() {
        let request = GenerationRequest::new("Be kind.", history(), 20);
        let messages = request.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], ChatMessage::new("system", "Be kind."));
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[2], ChatMessage::new("user", "hello"));
        assert_eq!(request.last_user_text(), Some("hello"));
    }

    #[test]
    fn history_window_keeps_latest_turns() {
        let request = GenerationRequest::new("", history(), 1);
        assert_eq!(request.history.len(), 1);
        assert_eq!(request.messages(), vec![ChatMessage::new("user", "hello")]);
    }

    #[test]
    fn sse_lines_split_across_chunks() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"안녕\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"하세요\"}}]}\n\n\
                    data: [DONE]\n\n";
        let bytes = body.as_bytes();
        let mut decoder = SseDecoder::new();
        let mut deltas = Vec::new();
        // Split inside a multi-byte character
        for chunk in bytes.chunks(7) {
            deltas.extend(decoder.push(chunk).unwrap());
        }
        assert_eq!(deltas, vec!["안녕".to_string(), "하세요".to_string()]);
        assert!(decoder.is_done());
    }

    #[test]
    fn sse_ignores_comments_and_role_only_deltas() {
        let mut decoder = SseDecoder::new();
        let deltas = decoder
            .push(b": keep-alive\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n")
            .unwrap();
        assert!(deltas.is_empty());
        assert!(!decoder.is_done());
    }

    #[test]
    fn sse_error_payload_is_reported() {
        let mut decoder = SseDecoder::new();
        let err = decoder
            .push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n")
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn placeholder_streams_whole_reply() {
        let generator = PlaceholderGenerator {
            reply: "one two three".to_string(),
            chunk_delay: Duration::ZERO,
        };
        let request = GenerationRequest::new("", history(), 20);
        let text: Vec<String> = generator
            .generate(&request)
            .await
            .unwrap()
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(text.concat(), "one two three");
        assert_eq!(text.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_stream() {
        let response = ResponseGenerator::new(
            Arc::new(PlaceholderGenerator {
                reply: "a b c d e f".to_string(),
                chunk_delay: Duration::from_millis(100),
            }),
            RetryPolicy::no_retry(),
        );
        let cancel = CancellationToken::new();
        let request = GenerationRequest::new("", history(), 20);
        let mut stream = response.generate(&request, cancel.clone()).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "a ");
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_before_open() {
        let response = ResponseGenerator::new(Arc::new(PlaceholderGenerator::new()), RetryPolicy::no_retry());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = GenerationRequest::new("", history(), 20);
        assert!(matches!(
            response.generate(&request, cancel).await,
            Err(VoiceError::Cancelled)
        ));
    }
}
