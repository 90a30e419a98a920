//! # Session Controller
//!
//! Owns one conversation: its state machine, its history and the tasks that
//! make up the voice loop.
//!
//! ```text
//!  Room.inbound ─▶ [ingress task: VAD + segmentation + barge-in arbiter]
//!                        │ Utterance              │ Control
//!                        ▼                        ▼
//!                 [recognition task] ─────▶ [controller loop] ─▶ ResponseJob ─▶ Room.playback
//!                                   RecognitionEvent    ▲            │
//!                                                       └────────────┘ ResponseUpdate
//! ```
//!
//! State machine: `Idle → Listening → Thinking → Speaking → Listening … → Closed`.
//! `Closed` is reachable from every state and terminal.

use crate::arbiter::{ArbiterConfig, ArbiterDecision, TurnArbiter};
use crate::audio::{AudioFrame, DEFAULT_FRAME_MS, DEFAULT_SAMPLE_RATE};
use crate::error::{VoiceError, VoiceResult};
use crate::history::{ConversationHistory, Speaker};
use crate::ingress::{AudioIngressBuffer, IngressConfig, IngressEvent, Utterance};
use crate::llm::{GenerationRequest, Generator, PlaceholderGenerator, ResponseGenerator};
use crate::response::{
    ResponseContext, ResponseEvent, ResponseJob, ResponseSource, ResponseUpdate,
};
use crate::retry::RetryPolicy;
use crate::stt::{validate_language, PlaceholderTranscriber, RecognitionEvent, RecognitionPipeline, Transcriber};
use crate::transport::{Playback, Room};
use crate::tts::{PlaceholderSynthesizer, SynthesisPipeline, Synthesizer};
use crate::vad::{create_vad, VadConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
            SessionState::Closed => "closed",
        }
    }

    /// Allowed transitions
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Listening)
                | (Listening, Thinking)
                | (Thinking, Speaking)
                | (Thinking, Listening)
                | (Speaking, Listening)
                | (Idle | Listening | Thinking | Speaking, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events published to session observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    UserSpeechStarted,
    Transcript {
        speaker: Speaker,
        text: String,
        is_final: bool,
    },
    /// Completed agent turn
    AgentText {
        text: String,
    },
    BargeIn,
    Error {
        message: String,
    },
    Closed {
        reason: String,
    },
}

/// External capabilities used by a session
#[derive(Clone)]
pub struct Capabilities {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl Capabilities {
    /// Offline capabilities: fixed transcript, canned reply, silent audio
    pub fn placeholder() -> Self {
        Self {
            transcriber: Arc::new(PlaceholderTranscriber::new()),
            generator: Arc::new(PlaceholderGenerator::new()),
            synthesizer: Arc::new(PlaceholderSynthesizer::default()),
        }
    }

    /// Run every capability's preflight check, stopping at the first failure.
    pub async fn preflight(&self) -> VoiceResult<()> {
        self.transcriber.preflight().await?;
        self.generator.preflight().await?;
        self.synthesizer.preflight().await?;
        info!(
            "✅ Capabilities ready (stt: {}, llm: {}, tts: {})",
            self.transcriber.name(),
            self.generator.name(),
            self.synthesizer.name()
        );
        Ok(())
    }
}

pub const DEFAULT_INSTRUCTIONS: &str = "당신은 어르신들을 돌보는 친절한 AI 어시스턴트입니다.
- 항상 존댓말을 사용하세요
- 천천히, 명확하게 말씀해 주세요
- 어르신의 건강과 안부를 먼저 물어보세요
- 필요시 보호자에게 연락할 수 있도록 안내하세요";

pub const DEFAULT_APOLOGY: &str = "죄송합니다, 잠시 문제가 생겼어요. 다시 한 번 말씀해 주시겠어요?";

/// Barge-in policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BargeInConfig {
    /// Let sustained user speech interrupt the agent (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// RMS energy counted as user speech (default: 0.05)
    #[serde(default = "default_barge_in_energy")]
    pub energy_threshold: f32,

    /// Sustained speech before the agent is interrupted (default: 300ms)
    #[serde(default = "default_barge_in_min_speech_ms")]
    pub min_speech_ms: u64,

    /// Dips tolerated inside sustained speech (default: 100ms)
    #[serde(default = "default_barge_in_gap_ms")]
    pub gap_tolerance_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            energy_threshold: default_barge_in_energy(),
            min_speech_ms: default_barge_in_min_speech_ms(),
            gap_tolerance_ms: default_barge_in_gap_ms(),
        }
    }
}

/// Per-session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// BCP-47 recognition language (default: ko-KR)
    #[serde(default = "default_language")]
    pub language: String,

    /// Persona instructions sent as the system prompt
    #[serde(default = "default_instructions")]
    pub instructions: String,

    /// Opening line spoken right after startup
    #[serde(default)]
    pub greeting: Option<String>,

    /// Spoken when a capability keeps failing
    #[serde(default = "default_apology")]
    pub apology: String,

    /// Inbound sample rate in Hz (default: 16000)
    #[serde(default = "default_sample_rate")]
    pub input_sample_rate: u32,

    /// Inbound frame length in milliseconds (default: 20)
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    #[serde(default)]
    pub vad: VadConfig,

    /// Silence that ends an utterance (default: 800ms)
    #[serde(default = "default_silence_threshold_ms")]
    pub silence_threshold_ms: u64,

    /// Shorter speech is discarded (default: 200ms)
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,

    /// Longer speech is force-finalized (default: 30s)
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,

    #[serde(default)]
    pub barge_in: BargeInConfig,

    /// How long a cancelled response may take to stop before it is aborted (default: 150ms)
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,

    /// How far synthesized audio may run ahead of real time (default: 200ms)
    #[serde(default = "default_playback_lead_ms")]
    pub playback_lead_ms: u64,

    /// Most recent turns sent to the language model (default: 20)
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_true() -> bool {
    true
}
fn default_barge_in_energy() -> f32 {
    0.05
}
fn default_barge_in_min_speech_ms() -> u64 {
    300
}
fn default_barge_in_gap_ms() -> u64 {
    100
}
fn default_language() -> String {
    "ko-KR".to_string()
}
fn default_instructions() -> String {
    DEFAULT_INSTRUCTIONS.to_string()
}
fn default_apology() -> String {
    DEFAULT_APOLOGY.to_string()
}
fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}
fn default_frame_ms() -> u32 {
    DEFAULT_FRAME_MS
}
fn default_silence_threshold_ms() -> u64 {
    800
}
fn default_min_speech_ms() -> u64 {
    200
}
fn default_max_utterance_ms() -> u64 {
    30_000
}
fn default_cancel_timeout_ms() -> u64 {
    150
}
fn default_playback_lead_ms() -> u64 {
    200
}
fn default_history_window() -> usize {
    20
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            instructions: default_instructions(),
            greeting: None,
            apology: default_apology(),
            input_sample_rate: default_sample_rate(),
            frame_ms: default_frame_ms(),
            vad: VadConfig::default(),
            silence_threshold_ms: default_silence_threshold_ms(),
            min_speech_ms: default_min_speech_ms(),
            max_utterance_ms: default_max_utterance_ms(),
            barge_in: BargeInConfig::default(),
            cancel_timeout_ms: default_cancel_timeout_ms(),
            playback_lead_ms: default_playback_lead_ms(),
            history_window: default_history_window(),
            retry: RetryPolicy::default(),
        }
    }
}

const SAMPLE_RATES: [u32; 4] = [8000, 16000, 24000, 48000];

impl SessionConfig {
    pub fn ingress(&self) -> IngressConfig {
        IngressConfig {
            silence_threshold: Duration::from_millis(self.silence_threshold_ms),
            min_speech_duration: Duration::from_millis(self.min_speech_ms),
            max_utterance_duration: Duration::from_millis(self.max_utterance_ms),
            speech_threshold: self.vad.speech_threshold,
        }
    }

    pub fn arbiter(&self) -> ArbiterConfig {
        ArbiterConfig {
            energy_threshold: self.barge_in.energy_threshold,
            min_speech_duration: Duration::from_millis(self.barge_in.min_speech_ms),
            gap_tolerance: Duration::from_millis(self.barge_in.gap_tolerance_ms),
        }
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn playback_lead(&self) -> Duration {
        Duration::from_millis(self.playback_lead_ms)
    }

    /// Check everything a session relies on before it is started.
    pub fn validate(&self) -> VoiceResult<()> {
        validate_language(&self.language)?;
        if !SAMPLE_RATES.contains(&self.input_sample_rate) {
            return Err(VoiceError::Config(format!(
                "input_sample_rate must be one of {:?}, got {}",
                SAMPLE_RATES, self.input_sample_rate
            )));
        }
        if !(10..=60).contains(&self.frame_ms) {
            return Err(VoiceError::Config(format!(
                "frame_ms must be within 10..=60, got {}",
                self.frame_ms
            )));
        }
        if self.silence_threshold_ms == 0 {
            return Err(VoiceError::Config("silence_threshold_ms must be positive".to_string()));
        }
        if self.max_utterance_ms <= self.min_speech_ms {
            return Err(VoiceError::Config(
                "max_utterance_ms must exceed min_speech_ms".to_string(),
            ));
        }
        if !(self.barge_in.energy_threshold > 0.0 && self.barge_in.energy_threshold <= 1.0) {
            return Err(VoiceError::Config(format!(
                "barge_in.energy_threshold must be in (0, 1], got {}",
                self.barge_in.energy_threshold
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(VoiceError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.apology.trim().is_empty() {
            return Err(VoiceError::Config("apology must not be empty".to_string()));
        }
        // Builds and checks the VAD thresholds
        create_vad(&self.vad)?;
        Ok(())
    }
}

/// Final record of a closed session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub room: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reason: String,
    pub turns: usize,
    pub barge_ins: u32,
    pub history: ConversationHistory,
}

impl SessionSummary {
    pub fn transcript(&self) -> String {
        self.history.transcript()
    }
}

/// Signals from the ingress task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    SpeechStarted,
    BargeIn,
}

/// The response currently owned by the controller
struct ActiveResponse {
    job: ResponseJob,
    turn: usize,
    apology: bool,
}

/// Why the controller loop stopped
enum Exit {
    Hangup,
    Shutdown,
    Failed(VoiceError),
}

pub struct SessionController {
    id: Uuid,
    config: SessionConfig,
    capabilities: Capabilities,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    history: ConversationHistory,
    shutdown: CancellationToken,
    response: Option<ActiveResponse>,
    next_job: u64,
    barge_ins: u32,
    started_at: DateTime<Utc>,
}

impl SessionController {
    pub fn new(config: SessionConfig, capabilities: Capabilities) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(256);
        Self {
            id: Uuid::new_v4(),
            config,
            capabilities,
            state,
            events,
            history: ConversationHistory::new(),
            shutdown: CancellationToken::new(),
            response: None,
            next_job: 0,
            barge_ins: 0,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Observe session events. Subscribe before `run` to see every event.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Observe state changes.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Cancelling this token closes the session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn transition(&mut self, to: SessionState) -> VoiceResult<()> {
        let from = self.state();
        if !from.can_transition_to(to) {
            warn!(session_id = %self.id, "Rejected transition {} -> {}", from, to);
            return Err(VoiceError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.state.send_replace(to);
        debug!(session_id = %self.id, "🔄 {} -> {}", from, to);
        self.emit(SessionEvent::StateChanged { from, to });
        Ok(())
    }

    /// Validate configuration and preflight every capability, then start listening.
    ///
    /// On failure the session stays `Idle` and the error is returned to the caller.
    pub async fn start(&mut self) -> VoiceResult<()> {
        let state = self.state();
        if state != SessionState::Idle {
            return Err(VoiceError::InvalidTransition {
                from: state.to_string(),
                to: SessionState::Listening.to_string(),
            });
        }
        let ready = match self.config.validate() {
            Ok(()) => self.capabilities.preflight().await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            error!(session_id = %self.id, "❌ Session startup failed: {}", e);
            self.emit(SessionEvent::Error {
                message: e.to_string(),
            });
            return Err(e);
        }
        self.transition(SessionState::Listening)?;
        info!(session_id = %self.id, "🎧 Session listening (language: {})", self.config.language);
        Ok(())
    }

    /// Run the voice loop on `room` until the room closes, the shutdown token
    /// fires, or a component fails. Always ends in `Closed`.
    pub async fn run(mut self, room: Room) -> VoiceResult<SessionSummary> {
        let state = self.state();
        if state != SessionState::Listening {
            return Err(VoiceError::InvalidTransition {
                from: state.to_string(),
                to: SessionState::Listening.to_string(),
            });
        }

        let Room {
            name,
            inbound,
            playback,
        } = room;
        info!(session_id = %self.id, "📞 Session running in room {}", name);

        let buffer = AudioIngressBuffer::new(self.config.ingress(), create_vad(&self.config.vad)?);
        let arbiter = self
            .config
            .barge_in
            .enabled
            .then(|| TurnArbiter::new(self.config.arbiter()));
        let (utterance_tx, utterance_rx) = mpsc::channel::<Utterance>(8);
        let (control_tx, mut control_rx) = mpsc::channel::<Control>(32);
        let (recognition_tx, mut recognition_rx) = mpsc::channel::<RecognitionEvent>(32);
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel::<ResponseUpdate>();

        let mut ingress_task: JoinHandle<VoiceResult<()>> = tokio::spawn(ingress_loop(
            inbound,
            buffer,
            arbiter,
            self.state.subscribe(),
            utterance_tx,
            control_tx,
        ));
        let recognition = RecognitionPipeline::new(
            self.capabilities.transcriber.clone(),
            self.config.language.clone(),
            self.config.retry.clone(),
        );
        let mut recognition_task = tokio::spawn(recognition.run(utterance_rx, recognition_tx));

        let ctx = ResponseContext {
            generator: ResponseGenerator::new(self.capabilities.generator.clone(), self.config.retry.clone()),
            synthesis: SynthesisPipeline::new(
                self.capabilities.synthesizer.clone(),
                self.config.retry.clone(),
                self.config.playback_lead(),
            ),
            playback: playback.clone(),
            updates: updates_tx,
        };

        let mut exit = match self.config.greeting.clone() {
            Some(greeting) => self
                .start_response(ResponseSource::Fixed(greeting), false, &ctx)
                .err()
                .map(Exit::Failed),
            None => None,
        };

        while exit.is_none() {
            let step = tokio::select! {
                _ = self.shutdown.cancelled() => Err(Exit::Shutdown),

                Some(control) = control_rx.recv() => match control {
                    Control::SpeechStarted => {
                        self.emit(SessionEvent::UserSpeechStarted);
                        Ok(())
                    }
                    Control::BargeIn if self.state() == SessionState::Speaking => {
                        self.interrupt(&playback).await.map_err(Exit::Failed)
                    }
                    Control::BargeIn => Ok(()),
                },

                Some(event) = recognition_rx.recv() => {
                    self.on_recognition(event, &playback, &ctx).await.map_err(Exit::Failed)
                }

                Some(update) = updates_rx.recv() => {
                    self.on_response(update, &ctx).map_err(Exit::Failed)
                }

                joined = &mut ingress_task => Err(match joined {
                    Ok(Ok(())) => Exit::Hangup,
                    Ok(Err(e)) => Exit::Failed(e),
                    Err(e) => Exit::Failed(VoiceError::Component(format!("ingress task: {}", e))),
                }),

                joined = &mut recognition_task => Err(match joined {
                    // Recognition only ends once ingress has
                    Ok(()) => Exit::Hangup,
                    Err(e) => Exit::Failed(VoiceError::Component(format!("recognition task: {}", e))),
                }),
            };
            if let Err(reason) = step {
                exit = Some(reason);
            }
        }

        let reason = match exit {
            Some(Exit::Hangup) => "room closed".to_string(),
            Some(Exit::Shutdown) => "shutdown".to_string(),
            Some(Exit::Failed(e)) => {
                error!(session_id = %self.id, "💥 Session failed: {}", e);
                self.emit(SessionEvent::Error {
                    message: e.to_string(),
                });
                format!("failed: {}", e)
            }
            None => "room closed".to_string(),
        };

        ingress_task.abort();
        recognition_task.abort();
        Ok(self.close(name, reason).await)
    }

    /// Release everything and move to `Closed`.
    async fn close(mut self, room: String, reason: String) -> SessionSummary {
        if let Some(active) = self.response.take() {
            active.job.cancel(self.config.cancel_timeout()).await;
            let _ = self.history.complete(active.turn, true);
        }
        self.shutdown.cancel();
        if self.state() != SessionState::Closed {
            let _ = self.transition(SessionState::Closed);
        }
        self.emit(SessionEvent::Closed {
            reason: reason.clone(),
        });

        let summary = SessionSummary {
            id: self.id,
            room,
            started_at: self.started_at,
            ended_at: Utc::now(),
            reason,
            turns: self.history.completed().len(),
            barge_ins: self.barge_ins,
            history: self.history,
        };
        info!(
            session_id = %summary.id,
            "👋 Session closed ({}): {} turns, {} barge-ins",
            summary.reason, summary.turns, summary.barge_ins
        );
        summary
    }

    fn start_response(&mut self, source: ResponseSource, apology: bool, ctx: &ResponseContext) -> VoiceResult<()> {
        let turn = self.history.begin(Speaker::Agent)?;
        self.next_job += 1;
        let job = ResponseJob::spawn(self.next_job, source, ctx.clone(), &self.shutdown);
        self.response = Some(ActiveResponse { job, turn, apology });
        self.transition(SessionState::Thinking)
    }

    /// Cancel the in-flight response, clear playback and go back to listening.
    async fn interrupt(&mut self, playback: &mpsc::Sender<Playback>) -> VoiceResult<()> {
        let Some(active) = self.response.take() else {
            return Ok(());
        };
        info!(session_id = %self.id, "⚡ Barge-in: stopping response {}", active.job.id());
        // One deadline covers both stopping the job and clearing playback
        let timeout = self.config.cancel_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        active.job.cancel(timeout).await;
        if tokio::time::timeout_at(deadline, playback.send(Playback::Clear))
            .await
            .is_err()
        {
            warn!(session_id = %self.id, "Playback did not accept Clear within {:?}", timeout);
        }

        let turn = self.history.complete(active.turn, true)?;
        if !turn.text.is_empty() {
            let text = turn.text.clone();
            self.emit(SessionEvent::AgentText { text });
        }
        self.barge_ins += 1;
        self.emit(SessionEvent::BargeIn);
        self.transition(SessionState::Listening)
    }

    async fn on_recognition(
        &mut self,
        event: RecognitionEvent,
        playback: &mpsc::Sender<Playback>,
        ctx: &ResponseContext,
    ) -> VoiceResult<()> {
        match event {
            RecognitionEvent::Partial { text, .. } => {
                self.emit(SessionEvent::Transcript {
                    speaker: Speaker::User,
                    text,
                    is_final: false,
                });
                Ok(())
            }
            RecognitionEvent::Final { text, .. } => {
                self.emit(SessionEvent::Transcript {
                    speaker: Speaker::User,
                    text: text.clone(),
                    is_final: true,
                });
                // The user talked over the agent
                if matches!(self.state(), SessionState::Thinking | SessionState::Speaking) {
                    self.interrupt(playback).await?;
                }
                self.history.push_complete(Speaker::User, &text)?;
                let request = GenerationRequest::new(
                    self.config.instructions.clone(),
                    self.history.completed(),
                    self.config.history_window,
                );
                self.start_response(ResponseSource::Generate(request), false, ctx)
            }
            RecognitionEvent::Failed { utterance_id, error } => {
                if error.is_fatal() {
                    return Err(error);
                }
                warn!(session_id = %self.id, "Utterance {} could not be transcribed: {}", utterance_id, error);
                self.emit(SessionEvent::Error {
                    message: error.to_string(),
                });
                if self.state() == SessionState::Listening {
                    self.start_response(ResponseSource::Fixed(self.config.apology.clone()), true, ctx)?;
                }
                Ok(())
            }
        }
    }

    fn on_response(&mut self, update: ResponseUpdate, ctx: &ResponseContext) -> VoiceResult<()> {
        let Some(active) = self.response.as_ref() else {
            return Ok(());
        };
        if active.job.id() != update.job {
            debug!(session_id = %self.id, "Ignoring update from stale response {}", update.job);
            return Ok(());
        }
        let turn = active.turn;

        match update.event {
            ResponseEvent::AudioStarted => {
                if self.state() == SessionState::Thinking {
                    self.transition(SessionState::Speaking)?;
                }
                Ok(())
            }
            ResponseEvent::Text(delta) => self.history.append(turn, &delta),
            ResponseEvent::Finished(report) => {
                self.response = None;
                let text = self.history.complete(turn, false)?.text.clone();
                info!(session_id = %self.id, "🤖 Agent: {} ({:?} of audio)", text, report.audio);
                self.emit(SessionEvent::AgentText { text });
                self.transition(SessionState::Listening)
            }
            ResponseEvent::Failed(error) => {
                let apology = self.response.take().map(|a| a.apology).unwrap_or(false);
                self.history.complete(turn, true)?;
                if error.is_fatal() || matches!(error, VoiceError::Component(_)) {
                    return Err(error);
                }
                warn!(session_id = %self.id, "Response failed: {}", error);
                self.emit(SessionEvent::Error {
                    message: error.to_string(),
                });
                self.transition(SessionState::Listening)?;
                if apology {
                    return Ok(());
                }
                self.start_response(ResponseSource::Fixed(self.config.apology.clone()), true, ctx)
            }
        }
    }
}

/// Ingress task: segmentation for every frame, barge-in detection while the
/// agent is speaking.
async fn ingress_loop(
    mut inbound: mpsc::Receiver<AudioFrame>,
    mut buffer: AudioIngressBuffer,
    mut arbiter: Option<TurnArbiter>,
    state: watch::Receiver<SessionState>,
    utterances: mpsc::Sender<Utterance>,
    control: mpsc::Sender<Control>,
) -> VoiceResult<()> {
    while let Some(frame) = inbound.recv().await {
        if let Some(arbiter) = arbiter.as_mut() {
            let speaking = *state.borrow() == SessionState::Speaking;
            if speaking && !arbiter.is_armed() {
                arbiter.arm();
            } else if !speaking && arbiter.is_armed() {
                arbiter.disarm();
            }
            if let ArbiterDecision::BargeIn { .. } = arbiter.observe(&frame) {
                control
                    .send(Control::BargeIn)
                    .await
                    .map_err(|_| VoiceError::ChannelSend("controller closed".to_string()))?;
            }
        }

        match buffer.push(frame)? {
            Some(IngressEvent::SpeechStarted { .. }) => {
                let _ = control.try_send(Control::SpeechStarted);
            }
            Some(IngressEvent::Utterance(utterance)) => {
                utterances
                    .send(utterance)
                    .await
                    .map_err(|_| VoiceError::ChannelSend("recognition closed".to_string()))?;
            }
            None => {}
        }
    }
    debug!("Inbound audio closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Listening));
        assert!(Listening.can_transition_to(Thinking));
        assert!(Thinking.can_transition_to(Speaking));
        assert!(Thinking.can_transition_to(Listening));
        assert!(Speaking.can_transition_to(Listening));
        for state in [Idle, Listening, Thinking, Speaking] {
            assert!(state.can_transition_to(Closed));
        }

        assert!(!Idle.can_transition_to(Speaking));
        assert!(!Listening.can_transition_to(Speaking));
        assert!(!Speaking.can_transition_to(Thinking));
        for state in [Idle, Listening, Thinking, Speaking, Closed] {
            assert!(!Closed.can_transition_to(state));
        }
    }

    #[test]
    fn default_config_is_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.language, "ko-KR");
        assert!(config.instructions.contains("존댓말"));
        assert_eq!(config.ingress().silence_threshold, Duration::from_millis(800));
        assert_eq!(config.arbiter().min_speech_duration, Duration::from_millis(300));
    }

    #[test]
    fn config_rejects_bad_values() {
        let bad_rate = SessionConfig {
            input_sample_rate: 11025,
            ..Default::default()
        };
        assert!(matches!(bad_rate.validate(), Err(VoiceError::Config(_))));

        let bad_language = SessionConfig {
            language: "xx-YY".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad_language.validate(), Err(VoiceError::UnsupportedLanguage(_))));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"greeting":"안녕하세요","barge_in":{"enabled":false}}"#).unwrap();
        assert_eq!(config.greeting.as_deref(), Some("안녕하세요"));
        assert!(!config.barge_in.enabled);
        assert_eq!(config.barge_in.min_speech_ms, 300);
        assert_eq!(config.cancel_timeout_ms, 150);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&SessionEvent::StateChanged {
            from: SessionState::Listening,
            to: SessionState::Thinking,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"state_changed","from":"listening","to":"thinking"}"#);
    }

    #[tokio::test]
    async fn start_moves_to_listening() {
        let mut session = SessionController::new(SessionConfig::default(), Capabilities::placeholder());
        let mut events = session.subscribe();
        session.start().await.unwrap();
        assert_eq!(session.state(), SessionState::Listening);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::StateChanged {
                from: SessionState::Idle,
                to: SessionState::Listening
            }
        );
        // Already started
        assert!(session.start().await.is_err());
    }

    #[tokio::test]
    async fn run_requires_start() {
        let session = SessionController::new(SessionConfig::default(), Capabilities::placeholder());
        let (room, _handle) = crate::transport::channel_room("test", 8);
        assert!(matches!(
            session.run(room).await,
            Err(VoiceError::InvalidTransition { .. })
        ));
    }
}
