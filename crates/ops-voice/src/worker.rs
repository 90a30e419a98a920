//! Worker: the process boundary. Accepts WebSocket rooms and runs one session
//! per room (connect → run session loop → disconnect).

use crate::config::{BackendKind, WorkerConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::llm::OpenAiGenerator;
use crate::session::{Capabilities, SessionConfig, SessionController, SessionSummary};
use crate::stt::OpenAiTranscriber;
use crate::transport::{bridge_websocket, channel_room, PcmDecoder, ServerMessage};
use crate::tts::OpenAiSynthesizer;
use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames buffered between the transport and a session in each direction
const ROOM_CAPACITY: usize = 256;

/// How long the bridge may take to flush after the session closed
const BRIDGE_DRAIN: Duration = Duration::from_secs(2);

/// How long shutdown waits for running sessions
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

impl Capabilities {
    /// Build the capability set selected by `config.backend`.
    pub fn from_config(config: &WorkerConfig) -> VoiceResult<Self> {
        match config.backend {
            BackendKind::Placeholder => Ok(Self::placeholder()),
            BackendKind::OpenAi => {
                let key = |service: &str, key: &Option<String>| {
                    key.clone().ok_or_else(|| {
                        VoiceError::Config(format!("{} api_key is not set", service))
                    })
                };
                let transcriber = OpenAiTranscriber::new(
                    config.stt.base_url.clone(),
                    key("stt", &config.stt.api_key)?,
                    config.stt.model.clone(),
                )?;
                let generator = OpenAiGenerator::new(
                    config.llm.base_url.clone(),
                    key("llm", &config.llm.api_key)?,
                    config.llm.model.clone(),
                )?
                .with_sampling(config.llm.temperature, config.llm.max_tokens);
                let synthesizer = OpenAiSynthesizer::new(
                    config.tts.base_url.clone(),
                    key("tts", &config.tts.api_key)?,
                    config.tts.model.clone(),
                    config.tts.voice.clone(),
                )?
                .with_speed(config.tts.speed);
                Ok(Self {
                    transcriber: Arc::new(transcriber),
                    generator: Arc::new(generator),
                    synthesizer: Arc::new(synthesizer),
                })
            }
        }
    }
}

/// Run one session over an accepted WebSocket.
///
/// Startup failures are reported to the client and returned; the session
/// never leaves `Idle` in that case.
pub async fn entrypoint<S>(
    mut ws: WebSocketStream<S>,
    room: String,
    config: SessionConfig,
    capabilities: Capabilities,
    shutdown: CancellationToken,
) -> VoiceResult<SessionSummary>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let output_sample_rate = capabilities.synthesizer.output_sample_rate();
    let decoder = PcmDecoder::new(config.input_sample_rate, config.frame_ms);
    let input_sample_rate = config.input_sample_rate;

    let mut session = SessionController::new(config, capabilities);
    let events = session.subscribe();

    if let Err(e) = session.start().await {
        let message = ServerMessage::Error {
            message: e.to_string(),
        };
        if let Ok(message) = message.to_message() {
            let _ = ws.send(message).await;
        }
        if let Ok(closed) = ServerMessage::Closed.to_message() {
            let _ = ws.send(closed).await;
        }
        let _ = ws.close(None).await;
        return Err(e);
    }

    let (room, handle) = channel_room(room, ROOM_CAPACITY);
    let ready = ServerMessage::Ready {
        session_id: session.id(),
        input_sample_rate,
        output_sample_rate,
    };
    let bridge = tokio::spawn(bridge_websocket(ws, handle, events, ready, decoder));

    // Worker shutdown closes the session
    let session_token = session.shutdown_token();
    let link = tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => session_token.cancel(),
            _ = session_token.cancelled() => {}
        }
    });

    let summary = session.run(room).await;
    link.abort();

    match tokio::time::timeout(BRIDGE_DRAIN, bridge).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => debug!("Room bridge ended with error: {}", e),
        Ok(Err(e)) => warn!("Room bridge task failed: {}", e),
        Err(_) => warn!("Room bridge did not finish within {:?}", BRIDGE_DRAIN),
    }
    summary
}

/// Accepts rooms and runs sessions
pub struct Worker {
    config: WorkerConfig,
    capabilities: Capabilities,
    sessions: Arc<Semaphore>,
}

impl Worker {
    /// Validate `config` and prepare to serve.
    pub fn new(config: WorkerConfig, capabilities: Capabilities) -> VoiceResult<Self> {
        config.validate()?;
        let sessions = Arc::new(Semaphore::new(config.max_sessions));
        Ok(Self {
            config,
            capabilities,
            sessions,
        })
    }

    /// Build capabilities from the configuration itself.
    pub fn from_config(config: WorkerConfig) -> VoiceResult<Self> {
        let capabilities = Capabilities::from_config(&config)?;
        Self::new(config, capabilities)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> VoiceResult<TcpListener> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        Ok(listener)
    }

    /// Accept rooms until `shutdown` fires, then wait briefly for running sessions.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> VoiceResult<()> {
        let addr = listener.local_addr()?;
        info!(
            "🚀 OPS voice worker listening on ws://{} (backend: {:?}, max sessions: {})",
            addr, self.config.backend, self.config.max_sessions
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let Ok(permit) = self.sessions.clone().try_acquire_owned() else {
                        warn!("Refusing connection from {}: session limit reached", peer);
                        continue;
                    };

                    let config = self.config.session.clone();
                    let capabilities = self.capabilities.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let ws = match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => ws,
                            Err(e) => {
                                warn!("WebSocket handshake with {} failed: {}", peer, e);
                                return;
                            }
                        };
                        let room = format!("room-{}", peer);
                        match entrypoint(ws, room, config, capabilities, shutdown).await {
                            Ok(summary) => info!(
                                session_id = %summary.id,
                                "Session in {} ended: {}",
                                summary.room, summary.reason
                            ),
                            Err(e) => error!("Session for {} failed to start: {}", peer, e),
                        }
                    });
                }
            }
        }

        info!("🛑 Worker shutting down, waiting for active sessions");
        let all = self.config.max_sessions as u32;
        if tokio::time::timeout(SHUTDOWN_DRAIN, self.sessions.acquire_many(all))
            .await
            .is_err()
        {
            warn!("Sessions still running after {:?}", SHUTDOWN_DRAIN);
        }
        Ok(())
    }
}
