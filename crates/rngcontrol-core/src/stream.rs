//! Streaming connection to the hardware randomness source.
//!
//! Lifecycle of one connection:
//!
//! ```text
//! Disconnected -> Connecting -> Armed -> Streaming -> Stopping -> Disconnected
//!                     \___________\__________\___________^ (transport error)
//! ```
//!
//! The source starts emitting as soon as the socket opens. While **Armed**
//! the client drops everything it receives; after the arm delay it sends the
//! start signal and only then counts messages. The run ends on the message
//! that reaches the trial count, so duration is bounded by trials rather than
//! by a wall-clock timer.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::{ControlConfig, RawPayload};
use crate::error::ControlError;
use crate::telemetry::{Aggregator, ResultsBundle};

/// State of the connection to the randomness source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Armed,
    Streaming,
    Stopping,
}

impl StreamState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Armed)
                | (Armed, Streaming)
                | (Streaming, Stopping)
                | (Stopping, Disconnected)
        ) || (next == Stopping && self != Disconnected)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Armed => write!(f, "armed"),
            Self::Streaming => write!(f, "streaming"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// How a streaming run ended.
#[derive(Debug)]
pub enum StreamOutcome {
    /// The trial count was reached; the bundle is sealed.
    Completed(ResultsBundle),
    /// Transport failure. No partial results survive this path.
    Failed(ControlError),
}

/// A source of streamed randomness that can run one fixed-length collection.
#[async_trait]
pub trait RandomnessSource: Send + Sync {
    async fn collect(&self, trials: usize) -> StreamOutcome;
}

/// WebSocket client for the randomness source.
#[derive(Debug, Clone)]
pub struct StreamClient {
    url: String,
    arm_delay: Duration,
    start_signal: String,
    raw_payload: RawPayload,
    connect_timeout: Duration,
}

impl StreamClient {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            url: config.rng_url.clone(),
            arm_delay: config.arm_delay,
            start_signal: config.start_signal.clone(),
            raw_payload: config.raw_payload,
            connect_timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl RandomnessSource for StreamClient {
    async fn collect(&self, trials: usize) -> StreamOutcome {
        let mut conn = Connection {
            client: self,
            state: StreamState::Disconnected,
        };
        match conn.run(trials).await {
            Ok(bundle) => StreamOutcome::Completed(bundle),
            Err(e) => {
                log::error!("Stream from {} failed: {e}", self.url);
                StreamOutcome::Failed(e)
            }
        }
    }
}

/// One connection attempt and its state.
struct Connection<'a> {
    client: &'a StreamClient,
    state: StreamState,
}

impl Connection<'_> {
    fn transition(&mut self, next: StreamState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal stream transition {} -> {next}",
            self.state
        );
        log::debug!("Stream {} -> {next}", self.state);
        self.state = next;
    }

    /// Connection never opened: nothing to close.
    fn abort(&mut self) {
        self.transition(StreamState::Stopping);
        self.transition(StreamState::Disconnected);
    }

    async fn run(&mut self, trials: usize) -> Result<ResultsBundle, ControlError> {
        let client = self.client;
        self.transition(StreamState::Connecting);
        log::info!("Connecting to RNG at {}", client.url);
        let ws = match tokio::time::timeout(client.connect_timeout, connect_async(&client.url)).await
        {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                self.abort();
                return Err(e.into());
            }
            Err(_) => {
                self.abort();
                return Err(ControlError::StreamTransport(
                    "connect timed out".to_string(),
                ));
            }
        };
        let (mut sink, mut source) = ws.split();

        self.transition(StreamState::Armed);
        let mut agg = Aggregator::new(client.raw_payload);
        agg.reset();

        let result = async {
            let dropped = discard_preroll(&mut source, client.arm_delay).await?;
            if dropped > 0 {
                log::debug!("Dropped {dropped} pre-roll messages while armed");
            }

            sink.send(Message::Text(client.start_signal.clone())).await?;
            self.transition(StreamState::Streaming);
            log::info!("RNG armed, collecting {trials} trials");

            while agg.trial_count() < trials {
                match source.next().await {
                    Some(Ok(Message::Binary(data))) => match agg.sample(data) {
                        Some(sample) => {
                            agg.ingest(sample);
                        }
                        None => log::debug!("Ignoring empty frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(ControlError::StreamTransport(format!(
                            "source closed after {} of {trials} trials",
                            agg.trial_count()
                        )));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ControlError::from(e)),
                }
            }
            Ok::<(), ControlError>(())
        }
        .await;

        self.transition(StreamState::Stopping);
        // Closing after the last counted message; anything still in flight is discarded.
        if let Err(e) = sink.close().await {
            log::debug!("Error closing RNG stream: {e}");
        }
        self.transition(StreamState::Disconnected);

        result.map(|()| agg.into_bundle())
    }
}

/// Drop everything the source sends until `arm` elapses. Returns how many
/// data frames were discarded.
async fn discard_preroll<S>(source: &mut S, arm: Duration) -> Result<usize, ControlError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let arm = tokio::time::sleep(arm);
    tokio::pin!(arm);
    let mut dropped = 0usize;
    loop {
        // Frames already received are drained before the timer is checked.
        tokio::select! {
            biased;
            msg = source.next() => match msg {
                Some(Ok(Message::Binary(_) | Message::Text(_))) => dropped += 1,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ControlError::StreamTransport(
                        "source closed before start".to_string(),
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ControlError::from(e)),
            },
            _ = &mut arm => return Ok(dropped),
        }
    }
}
