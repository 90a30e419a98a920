//! One agent response in flight: generation feeding synthesis.
//!
//! ```text
//!  GenerationRequest ──▶ [generation task] ──text (mpsc 16)──▶ [synthesis] ──▶ Playback
//!                               │                                   │
//!                               └──────── ResponseUpdate ◀──────────┘
//! ```
//!
//! Both stages share a child `CancellationToken`. Cancelling the job stops
//! generation and synthesis at their next await point; whatever is still
//! running after the timeout is aborted.

use crate::error::{VoiceError, VoiceResult};
use crate::llm::{GenerationRequest, ResponseGenerator};
use crate::transport::Playback;
use crate::tts::{SynthesisPipeline, SynthesisReport};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Text source for a response
#[derive(Debug, Clone)]
pub enum ResponseSource {
    /// Ask the language model
    Generate(GenerationRequest),
    /// Speak a fixed line (greeting, apology)
    Fixed(String),
}

#[derive(Debug)]
pub enum ResponseEvent {
    /// First synthesized frame is on its way to playback
    AudioStarted,
    /// A sentence whose audio reached playback
    Text(String),
    /// All text generated and synthesized
    Finished(SynthesisReport),
    Failed(VoiceError),
}

/// A response event tagged with the job that produced it
#[derive(Debug)]
pub struct ResponseUpdate {
    pub job: u64,
    pub event: ResponseEvent,
}

/// Everything a response job needs besides its source
#[derive(Clone)]
pub struct ResponseContext {
    pub generator: ResponseGenerator,
    pub synthesis: SynthesisPipeline,
    pub playback: mpsc::Sender<Playback>,
    pub updates: mpsc::UnboundedSender<ResponseUpdate>,
}

/// Handle to a running response
pub struct ResponseJob {
    id: u64,
    cancel: CancellationToken,
    watcher: JoinHandle<()>,
    aborts: Vec<AbortHandle>,
}

impl ResponseJob {
    /// Start generating and speaking. `parent` cancels the job together with
    /// the session.
    pub fn spawn(
        id: u64,
        source: ResponseSource,
        ctx: ResponseContext,
        parent: &CancellationToken,
    ) -> Self {
        let ResponseContext {
            generator,
            synthesis,
            playback,
            updates,
        } = ctx;
        let cancel = parent.child_token();
        let (text_tx, text_rx) = mpsc::channel::<String>(16);

        let generation = tokio::spawn(generate(
            id,
            source,
            generator,
            text_tx,
            cancel.clone(),
        ));
        let generation_abort = generation.abort_handle();

        let job = {
            let cancel = cancel.clone();
            let updates = updates.clone();
            tokio::spawn(async move {
                let spoken = updates.clone();
                let mut started = false;
                let synthesized = synthesis
                    .run(text_rx, playback, cancel.clone(), move |sentence: &str| {
                        let text = if started {
                            format!(" {}", sentence)
                        } else {
                            started = true;
                            let _ = spoken.send(ResponseUpdate {
                                job: id,
                                event: ResponseEvent::AudioStarted,
                            });
                            sentence.to_string()
                        };
                        let _ = spoken.send(ResponseUpdate {
                            job: id,
                            event: ResponseEvent::Text(text),
                        });
                    })
                    .await;

                let event = match synthesized {
                    Ok(report) if report.cancelled => return,
                    Ok(report) => match generation.await {
                        Ok(Ok(())) => ResponseEvent::Finished(report),
                        Ok(Err(VoiceError::Cancelled)) => return,
                        Ok(Err(e)) => ResponseEvent::Failed(e),
                        Err(e) => ResponseEvent::Failed(VoiceError::Component(format!(
                            "generation task: {}",
                            e
                        ))),
                    },
                    Err(e) => {
                        generation.abort();
                        if cancel.is_cancelled() {
                            return;
                        }
                        ResponseEvent::Failed(e)
                    }
                };
                let _ = updates.send(ResponseUpdate { job: id, event });
            })
        };
        let job_abort = job.abort_handle();

        // Report a panic in the job itself as a component failure
        let watcher = tokio::spawn(async move {
            if let Err(e) = job.await {
                if e.is_panic() {
                    let _ = updates.send(ResponseUpdate {
                        job: id,
                        event: ResponseEvent::Failed(VoiceError::Component(format!(
                            "response task panicked: {}",
                            e
                        ))),
                    });
                }
            }
        });

        Self {
            id,
            cancel,
            watcher,
            aborts: vec![generation_abort, job_abort],
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel and wait up to `timeout` for both stages to stop; abort them
    /// otherwise. Returns whether they stopped within the timeout.
    pub async fn cancel(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let stopped = tokio::time::timeout(timeout, self.watcher).await.is_ok();
        if !stopped {
            warn!("Response {} did not stop within {:?}, aborting", self.id, timeout);
        }
        for abort in &self.aborts {
            abort.abort();
        }
        stopped
    }
}

/// Generation stage: stream text into the synthesis channel.
async fn generate(
    id: u64,
    source: ResponseSource,
    generator: ResponseGenerator,
    text: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> VoiceResult<()> {
    let request = match source {
        ResponseSource::Fixed(line) => {
            let _ = text.send(line).await;
            return Ok(());
        }
        ResponseSource::Generate(request) => request,
    };

    let mut stream = generator.generate(&request, cancel.clone()).await?;
    let mut deltas = 0usize;
    while let Some(delta) = stream.next().await {
        let delta = delta?;
        deltas += 1;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
            sent = text.send(delta) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    if cancel.is_cancelled() {
        return Err(VoiceError::Cancelled);
    }
    debug!("Response {} generated {} deltas", id, deltas);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Generator, PlaceholderGenerator, TextStream};
    use crate::retry::RetryPolicy;
    use crate::tts::PlaceholderSynthesizer;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Unreachable;

    #[async_trait]
    impl Generator for Unreachable {
        async fn generate(&self, _: &GenerationRequest) -> VoiceResult<TextStream> {
            Err(VoiceError::Unavailable {
                service: "llm",
                message: "connection refused".to_string(),
            })
        }

        fn name(&self) -> &str {
            "unreachable"
        }
    }

    fn context(
        generator: Arc<dyn Generator>,
    ) -> (
        ResponseContext,
        mpsc::Receiver<Playback>,
        mpsc::UnboundedReceiver<ResponseUpdate>,
    ) {
        let (playback_tx, playback_rx) = mpsc::channel(1024);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let ctx = ResponseContext {
            generator: ResponseGenerator::new(generator, RetryPolicy::no_retry()),
            synthesis: SynthesisPipeline::new(
                Arc::new(PlaceholderSynthesizer::default()),
                RetryPolicy::no_retry(),
                Duration::from_millis(200),
            ),
            playback: playback_tx,
            updates: updates_tx,
        };
        (ctx, playback_rx, updates_rx)
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("", Vec::new(), 20)
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_line_is_spoken() {
        let (ctx, _playback, mut updates) = context(Arc::new(PlaceholderGenerator::new()));
        let _job = ResponseJob::spawn(1, ResponseSource::Fixed("안녕하세요.".to_string()), ctx, &CancellationToken::new());

        let mut events = Vec::new();
        while let Some(update) = updates.recv().await {
            assert_eq!(update.job, 1);
            let done = matches!(update.event, ResponseEvent::Finished(_));
            events.push(update.event);
            if done {
                break;
            }
        }
        assert!(matches!(events[0], ResponseEvent::AudioStarted));
        assert!(matches!(&events[1], ResponseEvent::Text(t) if t == "안녕하세요."));
        assert!(matches!(&events[2], ResponseEvent::Finished(r) if r.sentences == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn generation_failure_is_reported() {
        let (ctx, _playback, mut updates) = context(Arc::new(Unreachable));
        let _job = ResponseJob::spawn(2, ResponseSource::Generate(request()), ctx, &CancellationToken::new());

        let update = updates.recv().await.unwrap();
        assert_eq!(update.job, 2);
        assert!(matches!(update.event, ResponseEvent::Failed(ref e) if e.is_transient()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_within_timeout() {
        let generator = PlaceholderGenerator {
            reply: "하나. 둘. 셋. 넷. 다섯. 여섯. 일곱. 여덟.".to_string(),
            chunk_delay: Duration::from_millis(300),
        };
        let (ctx, _playback, mut updates) = context(Arc::new(generator));
        let job = ResponseJob::spawn(3, ResponseSource::Generate(request()), ctx, &CancellationToken::new());

        loop {
            let update = updates.recv().await.unwrap();
            if matches!(update.event, ResponseEvent::AudioStarted) {
                break;
            }
        }
        assert!(job.cancel(Duration::from_millis(150)).await);

        while let Ok(update) = updates.try_recv() {
            assert!(!matches!(update.event, ResponseEvent::Finished(_) | ResponseEvent::Failed(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_played_sentences_are_reported() {
        let generator = PlaceholderGenerator {
            reply: "첫 문장입니다. 두 번째 문장은 아주 길어서 끝까지 나가지 않습니다.".to_string(),
            chunk_delay: Duration::ZERO,
        };
        let (ctx, _playback, mut updates) = context(Arc::new(generator));
        let job = ResponseJob::spawn(5, ResponseSource::Generate(request()), ctx, &CancellationToken::new());

        let mut spoken = Vec::new();
        while spoken.is_empty() {
            if let ResponseEvent::Text(text) = updates.recv().await.unwrap().event {
                spoken.push(text);
            }
        }
        assert!(job.cancel(Duration::from_millis(150)).await);
        while let Ok(update) = updates.try_recv() {
            if let ResponseEvent::Text(text) = update.event {
                spoken.push(text);
            }
        }
        assert_eq!(spoken, vec!["첫 문장입니다.".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_reaches_job() {
        let generator = PlaceholderGenerator {
            reply: "a b c d e f g h".to_string(),
            chunk_delay: Duration::from_secs(1),
        };
        let (ctx, _playback, _updates) = context(Arc::new(generator));
        let parent = CancellationToken::new();
        let job = ResponseJob::spawn(4, ResponseSource::Generate(request()), ctx, &parent);
        parent.cancel();
        assert!(tokio::time::timeout(Duration::from_millis(50), job.watcher).await.is_ok());
    }
}
