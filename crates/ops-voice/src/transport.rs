//! Room transport: the bidirectional audio connection carrying one session.
//!
//! A `Room` is the session-side view (inbound frames, outbound playback); a
//! `RoomHandle` is the transport-side view. `bridge_websocket` drives a
//! WebSocket connection through a `RoomHandle`:
//!
//! - client → worker: binary PCM16 LE mono audio, text `{"type":"hangup"}`
//! - worker → client: binary PCM16 LE synthesized audio, text JSON events

use crate::audio::{pcm16_le_to_f32, AudioFrame, FrameAssembler};
use crate::error::{VoiceError, VoiceResult};
use crate::history::Speaker;
use crate::session::{SessionEvent, SessionState};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Commands for the playback side of a room
#[derive(Debug, Clone, PartialEq)]
pub enum Playback {
    /// Play this frame after everything queued before it
    Audio(AudioFrame),
    /// Drop all queued audio immediately (barge-in)
    Clear,
}

/// Session-side end of a room
#[derive(Debug)]
pub struct Room {
    pub name: String,
    pub inbound: mpsc::Receiver<AudioFrame>,
    pub playback: mpsc::Sender<Playback>,
}

/// Transport-side end of a room
#[derive(Debug)]
pub struct RoomHandle {
    pub audio: mpsc::Sender<AudioFrame>,
    pub playback: mpsc::Receiver<Playback>,
}

/// In-process room backed by bounded channels.
pub fn channel_room(name: impl Into<String>, capacity: usize) -> (Room, RoomHandle) {
    let (audio_tx, audio_rx) = mpsc::channel(capacity);
    let (playback_tx, playback_rx) = mpsc::channel(capacity);
    (
        Room {
            name: name.into(),
            inbound: audio_rx,
            playback: playback_tx,
        },
        RoomHandle {
            audio: audio_tx,
            playback: playback_rx,
        },
    )
}

/// Text messages sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hangup,
}

/// Text messages sent to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready {
        session_id: Uuid,
        input_sample_rate: u32,
        output_sample_rate: u32,
    },
    State {
        state: SessionState,
    },
    Transcript {
        speaker: Speaker,
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },
    Clear,
    Error {
        message: String,
    },
    Closed,
}

impl ServerMessage {
    /// Client-facing form of a session event, if it has one
    pub fn from_event(event: &SessionEvent) -> Option<Self> {
        match event {
            SessionEvent::StateChanged { to, .. } => Some(ServerMessage::State { state: *to }),
            SessionEvent::Transcript {
                speaker,
                text,
                is_final,
            } => Some(ServerMessage::Transcript {
                speaker: *speaker,
                text: text.clone(),
                is_final: *is_final,
            }),
            SessionEvent::AgentText { text } => Some(ServerMessage::Transcript {
                speaker: Speaker::Agent,
                text: text.clone(),
                is_final: true,
            }),
            SessionEvent::Error { message } => Some(ServerMessage::Error {
                message: message.clone(),
            }),
            SessionEvent::Closed { .. } => Some(ServerMessage::Closed),
            SessionEvent::UserSpeechStarted | SessionEvent::BargeIn => None,
        }
    }

    pub fn to_message(&self) -> VoiceResult<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Decodes binary PCM16 payloads into fixed-length inbound frames.
///
/// A payload with an odd byte count keeps its last byte for the next payload.
#[derive(Debug)]
pub struct PcmDecoder {
    assembler: FrameAssembler,
    carry: Option<u8>,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32, frame_ms: u32) -> Self {
        Self {
            assembler: FrameAssembler::new(sample_rate, frame_ms),
            carry: None,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        let mut data = Vec::with_capacity(bytes.len() + 1);
        data.extend(self.carry.take());
        data.extend_from_slice(bytes);
        if data.len() % 2 == 1 {
            self.carry = data.pop();
        }
        self.assembler.push(&pcm16_le_to_f32(&data))
    }
}

/// Pump one WebSocket connection through a room until the session closes or
/// the client disconnects.
///
/// `ready` is sent first. A client hangup closes the inbound audio channel,
/// which ends the session; the bridge then keeps forwarding until the session
/// reports `Closed`.
pub async fn bridge_websocket<S>(
    ws: WebSocketStream<S>,
    handle: RoomHandle,
    mut events: broadcast::Receiver<SessionEvent>,
    ready: ServerMessage,
    mut decoder: PcmDecoder,
) -> VoiceResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let RoomHandle {
        audio,
        mut playback,
    } = handle;
    let mut audio = Some(audio);
    let mut playback_open = true;

    ws_tx.send(ready.to_message()?).await.map_err(transport)?;

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    let Some(tx) = audio.clone() else { continue };
                    for frame in decoder.push(&bytes) {
                        if tx.send(frame).await.is_err() {
                            debug!("Session stopped accepting audio");
                            audio = None;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Hangup) => {
                        info!("📴 Client hung up");
                        audio = None;
                    }
                    Err(e) => warn!("Ignoring client message {:?}: {}", text, e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket closed by client");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(transport(e)),
            },

            command = playback.recv(), if playback_open => match command {
                Some(Playback::Audio(frame)) => {
                    ws_tx.send(Message::Binary(frame.to_pcm16_le())).await.map_err(transport)?;
                }
                Some(Playback::Clear) => {
                    ws_tx.send(ServerMessage::Clear.to_message()?).await.map_err(transport)?;
                }
                // Session released the room; its Closed event follows
                None => playback_open = false,
            },

            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(message) = ServerMessage::from_event(&event) {
                        ws_tx.send(message.to_message()?).await.map_err(transport)?;
                    }
                    if matches!(event, SessionEvent::Closed { .. }) {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("WebSocket bridge lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = ws_tx.send(ServerMessage::Closed.to_message()?).await;
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
        }
    }
}

fn transport(err: tokio_tungstenite::tungstenite::Error) -> VoiceError {
    VoiceError::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn server_messages_use_type_tags() {
        let json = serde_json::to_string(&ServerMessage::State {
            state: SessionState::Listening,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"state","state":"listening"}"#);

        let json = serde_json::to_string(&ServerMessage::Transcript {
            speaker: Speaker::User,
            text: "네".to_string(),
            is_final: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"transcript","speaker":"user","text":"네","final":true}"#);

        assert_eq!(serde_json::to_string(&ServerMessage::Clear).unwrap(), r#"{"type":"clear"}"#);
    }

    #[test]
    fn hangup_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"hangup"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Hangup);
    }

    #[test]
    fn decoder_carries_odd_bytes() {
        let frame = AudioFrame::new(vec![0.25; 320], 16000, 0, Duration::ZERO);
        let bytes = frame.to_pcm16_le();
        let mut decoder = PcmDecoder::new(16000, 20);

        assert!(decoder.push(&bytes[..101]).is_empty());
        let frames = decoder.push(&bytes[101..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples.len(), 320);
        assert!((frames[0].samples[0] - 0.25).abs() < 1e-3);
    }

    #[tokio::test]
    async fn channel_room_connects_both_ends() {
        let (mut room, mut handle) = channel_room("test", 4);
        let frame = AudioFrame::new(vec![0.0; 320], 16000, 0, Duration::ZERO);
        handle.audio.send(frame.clone()).await.unwrap();
        assert_eq!(room.inbound.recv().await, Some(frame));

        room.playback.send(Playback::Clear).await.unwrap();
        assert_eq!(handle.playback.recv().await, Some(Playback::Clear));
        assert_eq!(room.name, "test");
    }
}
