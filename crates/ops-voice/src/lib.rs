//! # OPS Voice - Real-time Voice Session Orchestration
//!
//! Runs spoken conversations between an elder-care agent and a caller:
//! speech is segmented into utterances, transcribed, answered by a language
//! model and spoken back, with barge-in when the caller talks over the agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Session Controller                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐    │
//! │  │ Room inbound │→ │ Ingress + VAD│→ │ Recognition (STT)    │    │
//! │  │ (PCM frames) │  │ (800ms gap)  │  │ partials / final     │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘    │
//! │                           │ barge-in            ↓                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐    │
//! │  │ Room playback│← │ Synthesis    │← │ Response Generator   │    │
//! │  │ (PCM / clear)│  │ (TTS, paced) │  │ (streaming LLM)      │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`worker`] module accepts rooms over WebSocket and runs one
//! [`SessionController`] per room.

pub mod arbiter;
pub mod audio;
pub mod config;
pub mod error;
pub mod history;
pub mod ingress;
pub mod llm;
pub mod openai;
pub mod response;
pub mod retry;
pub mod session;
pub mod stt;
pub mod transport;
pub mod tts;
pub mod vad;
pub mod worker;

pub use arbiter::{ArbiterConfig, ArbiterDecision, TurnArbiter};
pub use audio::{AudioFrame, FrameAssembler, DEFAULT_FRAME_MS, DEFAULT_SAMPLE_RATE};
pub use config::{BackendKind, LlmSettings, SttSettings, TtsSettings, WorkerConfig};
pub use error::{VoiceError, VoiceResult};
pub use history::{ConversationHistory, Speaker, Turn};
pub use ingress::{AudioIngressBuffer, IngressConfig, IngressEvent, Utterance};
pub use llm::{
    ChatMessage, GenerationRequest, Generator, OpenAiGenerator, PlaceholderGenerator,
    ResponseGenerator, TextStream,
};
pub use response::{ResponseContext, ResponseEvent, ResponseJob, ResponseSource, ResponseUpdate};
pub use retry::RetryPolicy;
pub use session::{
    BargeInConfig, Capabilities, SessionConfig, SessionController, SessionEvent, SessionState,
    SessionSummary,
};
pub use stt::{
    OpenAiTranscriber, PlaceholderTranscriber, RecognitionEvent, RecognitionPipeline,
    TranscriptEvent, TranscriptStream, Transcriber,
};
pub use transport::{channel_room, ClientMessage, Playback, Room, RoomHandle, ServerMessage};
pub use tts::{
    AudioStream, OpenAiSynthesizer, PlaceholderSynthesizer, SynthesisPipeline, SynthesisReport,
    Synthesizer,
};
pub use vad::{create_vad, EnergyVad, VadConfig, VoiceActivityDetector};
pub use worker::{entrypoint, Worker};
