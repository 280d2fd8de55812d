//! Periodic topic/payload publisher

use crate::error::{EngineError, Result};
use crate::events::{Direction, Encoding, SampleKind, SampleStats, Severity};
use crate::relay::EventSink;
use crate::sample::{Command, Flow, Sample};
use crate::transport::{Context, Endpoint, Multipart, PubSocket, DEFAULT_TIMEOUT};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Delay before the single send of a send-once publisher
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub endpoint: Endpoint,
    pub topic: String,
    pub payload: String,
    /// Messages per second; 0 sends a single message
    pub frequency: u32,
    pub hex: bool,
    /// First-send delay when `frequency` is 0
    pub initial_delay: Duration,
    /// Finish after this many successful sends
    pub max_messages: Option<u64>,
    pub send_timeout: Duration,
}

impl PublisherConfig {
    pub fn new<T, P>(endpoint: Endpoint, topic: T, payload: P, frequency: u32) -> Self
    where
        T: Into<String>,
        P: Into<String>,
    {
        Self {
            endpoint,
            topic: topic.into(),
            payload: payload.into(),
            frequency,
            hex: false,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_messages: None,
            send_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_hex(mut self, hex: bool) -> Self {
        self.hex = hex;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_messages(mut self, max: u64) -> Self {
        self.max_messages = Some(max);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

/// Send interval for a frequency, `None` for send-once
fn interval(frequency: u32) -> Option<Duration> {
    if frequency == 0 {
        None
    } else {
        Some(Duration::from_micros(1_000_000 / u64::from(frequency)))
    }
}

/// Encode the topic/payload pair, hex-encoding every part when asked
pub(crate) fn encode_parts(topic: &str, payload: &str, hex: bool) -> (Encoding, Multipart) {
    if hex {
        (
            Encoding::Hex,
            vec![Bytes::from(hex::encode(topic)), Bytes::from(hex::encode(payload))],
        )
    } else {
        (
            Encoding::Raw,
            vec![
                Bytes::copy_from_slice(topic.as_bytes()),
                Bytes::copy_from_slice(payload.as_bytes()),
            ],
        )
    }
}

/// Sends `[topic, payload]` every `1/frequency` seconds on a bound socket
pub struct Publisher {
    config: PublisherConfig,
    socket: PubSocket,
    topic: String,
    payload: String,
    frequency: u32,
    hex: bool,
    next_send: Option<Instant>,
    endpoint: Option<Endpoint>,
    stats: SampleStats,
}

impl Publisher {
    pub fn new(context: &Context, config: PublisherConfig) -> Self {
        let mut socket = context.publisher();
        socket.set_send_timeout(config.send_timeout);
        Self {
            topic: config.topic.clone(),
            payload: config.payload.clone(),
            frequency: config.frequency,
            hex: config.hex,
            config,
            socket,
            next_send: None,
            endpoint: None,
            stats: SampleStats::default(),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Whether a send is scheduled
    pub fn is_scheduled(&self) -> bool {
        self.next_send.is_some()
    }

    /// Send once, then schedule the next send according to the current frequency
    async fn fire(&mut self, sink: &EventSink) -> Flow {
        self.next_send = None;
        let (encoding, parts) = encode_parts(&self.topic, &self.payload, self.hex);

        match self.socket.send(&parts).await {
            Ok(subscribers) => {
                let timestamp = sink.now();
                self.stats.sent += 1;
                debug!(
                    sample = %sink.sample(),
                    subscribers,
                    "Publisher> {:?}, Timestamp: {}",
                    parts,
                    timestamp
                );
                sink.message(Direction::Sent, timestamp, encoding, parts);
            }
            Err(e) if e.is_fatal() => return Flow::Fail(e.to_string()),
            Err(e) => {
                if matches!(e, EngineError::Timeout(_)) {
                    self.stats.timeouts += 1;
                }
                sink.log(Severity::Warning, format!("Send failed: {}", e));
            }
        }

        if let Some(max) = self.config.max_messages {
            if self.stats.sent >= max {
                sink.log(
                    Severity::Info,
                    format!("Sent {} of {} messages, frequency exhausted", self.stats.sent, max),
                );
                return Flow::Finish;
            }
        }

        if let Some(every) = interval(self.frequency) {
            self.next_send = Some(Instant::now() + every);
        }
        Flow::Continue
    }
}

#[async_trait(?Send)]
impl Sample for Publisher {
    type Tick = ();

    fn kind(&self) -> SampleKind {
        SampleKind::Publisher
    }

    async fn start(&mut self, sink: &EventSink) -> Result<()> {
        self.socket.bind(&self.config.endpoint).await?;
        self.endpoint = self.socket.local_endpoint();

        let delay = interval(self.frequency).unwrap_or(self.config.initial_delay);
        self.next_send = Some(Instant::now() + delay);

        let bound = self
            .endpoint
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        sink.log(
            Severity::Info,
            format!(
                "Publishing '{}' on {} at {} Hz",
                self.topic, bound, self.frequency
            ),
        );
        Ok(())
    }

    async fn ready(&mut self) {
        match self.next_send {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    async fn on_tick(&mut self, _tick: (), sink: &EventSink) -> Flow {
        self.fire(sink).await
    }

    async fn on_command(&mut self, command: Command, sink: &EventSink) -> Flow {
        match command {
            Command::Stop => Flow::Finish,
            Command::SetFrequency(frequency) => {
                self.frequency = frequency;
                sink.log(Severity::Info, format!("Frequency set to {} Hz", frequency));
                Flow::Continue
            }
            Command::SetHex(hex) => {
                self.hex = hex;
                sink.log(
                    Severity::Info,
                    if hex { "Hex encoding on" } else { "Hex encoding off" },
                );
                Flow::Continue
            }
            Command::Publish { topic, payload } => {
                self.topic = topic;
                self.payload = payload;
                self.fire(sink).await
            }
            Command::Halt => {
                if self.next_send.take().is_some() {
                    sink.log(Severity::Info, "Halted");
                }
                Flow::Continue
            }
            Command::Subscribe(topic) | Command::Unsubscribe(topic) => {
                sink.log(
                    Severity::Info,
                    format!("Ignoring subscription change for '{}' on a publisher", topic),
                );
                Flow::Continue
            }
        }
    }

    fn stats(&self) -> SampleStats {
        self.stats
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.clone()
    }
}
