//! Example: one simulated call against the offline placeholder backends.
//!
//! Feeds half a second of synthetic "speech" followed by silence into an
//! in-memory room, prints every session event and hangs up once the agent
//! has answered.

use ops_voice::{
    channel_room, AudioFrame, Capabilities, Playback, RoomHandle, SessionConfig,
    SessionController, SessionEvent, DEFAULT_FRAME_MS,
};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("🎤 OPS Voice local session");

    let config = SessionConfig {
        greeting: Some("안녕하세요, 오늘 하루는 어떠셨어요?".to_string()),
        ..Default::default()
    };
    let sample_rate = config.input_sample_rate;
    let mut session = SessionController::new(config, Capabilities::placeholder());
    let mut events = session.subscribe();
    session.start().await?;

    let (room, handle) = channel_room("local", 256);
    let RoomHandle {
        audio,
        mut playback,
    } = handle;
    let call = tokio::spawn(session.run(room));

    tokio::spawn(async move {
        let mut played = Duration::ZERO;
        while let Some(command) = playback.recv().await {
            match command {
                Playback::Audio(frame) => played += frame.duration(),
                Playback::Clear => info!("🔇 Playback cleared after {:?}", played),
            }
        }
        info!("🔈 {:?} of agent audio played", played);
    });

    // Wait for the greeting before speaking
    let mut answers = 0;
    let frame_len = (sample_rate * DEFAULT_FRAME_MS / 1000) as usize;
    let mut at = Duration::ZERO;
    while let Ok(event) = events.recv().await {
        info!("📣 {:?}", event);
        if let SessionEvent::AgentText { .. } = event {
            answers += 1;
            if answers == 2 {
                break;
            }
            for amplitude in std::iter::repeat(0.2).take(25).chain(std::iter::repeat(0.0).take(50)) {
                let frame = AudioFrame::new(vec![amplitude; frame_len], sample_rate, 0, at);
                at += frame.duration();
                audio.send(frame).await?;
            }
        }
    }

    drop(audio);
    let summary = call.await??;
    info!("📝 Transcript:\n{}", summary.transcript());
    Ok(())
}
