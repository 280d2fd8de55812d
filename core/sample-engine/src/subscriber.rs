//! Topic-filtered subscriber and its shared topic set

use crate::error::{EngineError, Result};
use crate::events::{Direction, Encoding, SampleKind, SampleStats, Severity};
use crate::relay::EventSink;
use crate::sample::{Command, Flow, Sample};
use crate::transport::{
    Context, Endpoint, Multipart, SubSocket, TopicMatch, DEFAULT_RECONNECT_INTERVAL,
    DEFAULT_TIMEOUT,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Subscribed topics in insertion order, without duplicates.
///
/// Only the owning subscriber mutates the set; any thread may take a snapshot.
#[derive(Debug, Clone, Default)]
pub struct TopicSet {
    topics: Arc<RwLock<Vec<String>>>,
}

impl TopicSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.topics.read().clone()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.read().iter().any(|t| t == topic)
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }

    /// Returns false if the topic was already present
    pub(crate) fn insert(&self, topic: &str) -> bool {
        let mut topics = self.topics.write();
        if topics.iter().any(|t| t == topic) {
            return false;
        }
        topics.push(topic.to_string());
        true
    }

    /// Returns false if the topic was not present
    pub(crate) fn remove(&self, topic: &str) -> bool {
        let mut topics = self.topics.write();
        match topics.iter().position(|t| t == topic) {
            Some(index) => {
                topics.remove(index);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberConfig {
    pub endpoint: Endpoint,
    pub topics: Vec<String>,
    /// Hex-encode every part of each received message
    pub hex: bool,
    /// Traffic on the wire is already hex text: filter on the hex form of each topic
    /// and keep received parts as they are
    pub hex_wire: bool,
    pub match_mode: TopicMatch,
    pub recv_timeout: Duration,
    pub reconnect_interval: Duration,
}

impl SubscriberConfig {
    pub fn new<I, T>(endpoint: Endpoint, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            endpoint,
            topics: topics.into_iter().map(Into::into).collect(),
            hex: false,
            hex_wire: false,
            match_mode: TopicMatch::default(),
            recv_timeout: DEFAULT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }

    pub fn with_hex(mut self, hex: bool) -> Self {
        self.hex = hex;
        self
    }

    pub fn with_hex_wire(mut self, hex_wire: bool) -> Self {
        self.hex_wire = hex_wire;
        self
    }

    pub fn with_match_mode(mut self, mode: TopicMatch) -> Self {
        self.match_mode = mode;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

/// Receives messages on subscribed topics from a connected socket
pub struct Subscriber {
    config: SubscriberConfig,
    socket: SubSocket,
    topics: TopicSet,
    hex: bool,
    connected: bool,
    /// Set once a quiet period has been reported, cleared by the next message
    quiet: bool,
    stats: SampleStats,
}

impl Subscriber {
    pub fn new(context: &Context, config: SubscriberConfig) -> Self {
        let mut socket = context.subscriber();
        socket.set_recv_timeout(config.recv_timeout);
        socket.set_reconnect_interval(config.reconnect_interval);
        socket.set_match_mode(config.match_mode);

        let topics = TopicSet::new();
        for topic in &config.topics {
            topics.insert(topic);
        }

        Self {
            hex: config.hex,
            config,
            socket,
            topics,
            connected: false,
            quiet: false,
            stats: SampleStats::default(),
        }
    }

    /// Shared handle on the subscribed topics
    pub fn topics(&self) -> TopicSet {
        self.topics.clone()
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    fn filter(&self, topic: &str) -> Vec<u8> {
        if self.config.hex_wire {
            hex::encode(topic).into_bytes()
        } else {
            topic.as_bytes().to_vec()
        }
    }

    fn encode(&self, parts: Multipart) -> (Encoding, Multipart) {
        if self.config.hex_wire {
            (Encoding::Hex, parts)
        } else if self.hex {
            let parts: Multipart = parts
                .iter()
                .map(|p| Bytes::from(hex::encode(p)))
                .collect();
            (Encoding::Hex, parts)
        } else {
            (Encoding::Raw, parts)
        }
    }

    fn subscribe(&mut self, topic: &str, sink: &EventSink) {
        if !self.topics.insert(topic) {
            sink.log(Severity::Info, format!("Already subscribed to '{}'", topic));
            return;
        }
        let filter = self.filter(topic);
        self.socket.subscribe(&filter);
        sink.log(Severity::Info, format!("Subscribed to '{}'", topic));
    }

    fn unsubscribe(&mut self, topic: &str, sink: &EventSink) {
        if !self.topics.remove(topic) {
            sink.log(Severity::Info, format!("Not subscribed to '{}'", topic));
            return;
        }
        let filter = self.filter(topic);
        self.socket.unsubscribe(&filter);
        sink.log(Severity::Info, format!("Unsubscribed from '{}'", topic));
    }

    /// Takes effect from the next received message
    fn set_hex(&mut self, hex: bool, sink: &EventSink) {
        if hex == self.hex {
            return;
        }
        self.hex = hex;
        sink.log(
            Severity::Info,
            if hex { "Hex encoding on" } else { "Hex encoding off" },
        );
    }
}

#[async_trait(?Send)]
impl Sample for Subscriber {
    type Tick = Result<Option<Multipart>>;

    fn kind(&self) -> SampleKind {
        SampleKind::Subscriber
    }

    async fn start(&mut self, sink: &EventSink) -> Result<()> {
        for topic in self.topics.snapshot() {
            let filter = self.filter(&topic);
            self.socket.subscribe(&filter);
        }
        self.socket.connect(&self.config.endpoint).await?;
        self.connected = true;

        sink.log(
            Severity::Info,
            format!(
                "Subscribed to {:?} on {}",
                self.topics.snapshot(),
                self.config.endpoint
            ),
        );
        Ok(())
    }

    async fn ready(&mut self) -> Result<Option<Multipart>> {
        self.socket.recv().await
    }

    async fn on_tick(&mut self, tick: Result<Option<Multipart>>, sink: &EventSink) -> Flow {
        match tick {
            Ok(Some(parts)) => {
                let timestamp = sink.now();
                self.stats.received += 1;
                self.quiet = false;
                let (encoding, parts) = self.encode(parts);
                debug!(
                    sample = %sink.sample(),
                    "Subscriber> {:?}, Timestamp: {}",
                    parts,
                    timestamp
                );
                sink.message(Direction::Received, timestamp, encoding, parts);
                Flow::Continue
            }
            Ok(None) => {
                sink.log(
                    Severity::Warning,
                    format!("Connection to {} closed", self.config.endpoint),
                );
                Flow::Finish
            }
            Err(EngineError::Timeout(after)) => {
                self.stats.timeouts += 1;
                if self.quiet {
                    debug!(sample = %sink.sample(), "No message within {:?}", after);
                } else {
                    self.quiet = true;
                    sink.log(
                        Severity::Info,
                        format!("No message within {:?}, still listening", after),
                    );
                }
                Flow::Continue
            }
            Err(e) if e.is_fatal() => Flow::Fail(e.to_string()),
            Err(e) => {
                sink.log(Severity::Warning, format!("Receive failed: {}", e));
                Flow::Continue
            }
        }
    }

    async fn on_command(&mut self, command: Command, sink: &EventSink) -> Flow {
        match command {
            Command::Stop => return Flow::Finish,
            Command::Subscribe(topic) => self.subscribe(&topic, sink),
            Command::Unsubscribe(topic) => self.unsubscribe(&topic, sink),
            Command::SetHex(hex) => self.set_hex(hex, sink),
            Command::SetFrequency(_) | Command::Publish { .. } | Command::Halt => {
                sink.log(
                    Severity::Info,
                    format!("Ignoring {:?} on a subscriber", command),
                );
            }
        }
        Flow::Continue
    }

    fn stats(&self) -> SampleStats {
        self.stats
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.connected.then(|| self.config.endpoint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SampleId;
    use crate::publisher::encode_parts;
    use crate::relay::EventRelay;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Insert(String),
        Remove(String),
    }

    fn op() -> impl Strategy<Value = Op> {
        let topic = prop::sample::select(vec!["a", "b", "c", "a/b", "t1"]).prop_map(String::from);
        prop_oneof![
            topic.clone().prop_map(Op::Insert),
            topic.prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_topic_set_matches_model(ops in prop::collection::vec(op(), 0..50)) {
            let set = TopicSet::new();
            let mut model: Vec<String> = Vec::new();
            for op in ops {
                match op {
                    Op::Insert(t) => {
                        let fresh = !model.contains(&t);
                        if fresh {
                            model.push(t.clone());
                        }
                        prop_assert_eq!(set.insert(&t), fresh);
                    }
                    Op::Remove(t) => {
                        let known = model.contains(&t);
                        model.retain(|m| m != &t);
                        prop_assert_eq!(set.remove(&t), known);
                    }
                }
            }
            prop_assert_eq!(set.snapshot(), model);
        }
    }

    async fn started(
        name: &str,
        config: SubscriberConfig,
    ) -> (Context, EventRelay, EventSink, Subscriber) {
        let context = Context::new();
        let relay = EventRelay::new();
        let sink = relay.sink(SampleId::new(), SampleKind::Subscriber);
        let mut subscriber = Subscriber::new(&context, config);
        subscriber.start(&sink).await.unwrap();
        assert_eq!(subscriber.endpoint(), Some(Endpoint::inproc(name)));
        (context, relay, sink, subscriber)
    }

    #[tokio::test]
    async fn test_receives_subscribed_topics_only() {
        let config = SubscriberConfig::new(Endpoint::inproc("sub-basic"), ["t1"]);
        let (context, relay, sink, mut subscriber) = started("sub-basic", config).await;

        let mut publisher = context.publisher();
        publisher.bind(&Endpoint::inproc("sub-basic")).await.unwrap();
        publisher.send(&encode_parts("other", "x", false).1).await.unwrap();
        publisher.send(&encode_parts("t1", "hello", false).1).await.unwrap();

        let tick = subscriber.ready().await;
        assert_eq!(subscriber.on_tick(tick, &sink).await, Flow::Continue);

        let received = relay.drain_received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].topic(), b"t1");
        assert_eq!(subscriber.stats().received, 1);
    }

    #[tokio::test]
    async fn test_runtime_subscription_changes() {
        let config = SubscriberConfig::new(Endpoint::inproc("sub-runtime"), ["a"]);
        let (_context, relay, sink, mut subscriber) = started("sub-runtime", config).await;
        relay.drain_logs();

        subscriber.on_command(Command::Subscribe("b".into()), &sink).await;
        subscriber.on_command(Command::Subscribe("b".into()), &sink).await;
        subscriber.on_command(Command::Unsubscribe("zz".into()), &sink).await;
        subscriber.on_command(Command::Unsubscribe("a".into()), &sink).await;

        assert_eq!(subscriber.topics().snapshot(), vec!["b".to_string()]);
        assert_eq!(subscriber.socket.filters(), &[Bytes::from_static(b"b")]);
        assert!(relay
            .drain_logs()
            .iter()
            .all(|r| r.severity == Severity::Info));
    }

    #[tokio::test]
    async fn test_hex_encodes_raw_traffic() {
        let config = SubscriberConfig::new(Endpoint::inproc("sub-hex"), ["t1"]).with_hex(true);
        let (context, relay, sink, mut subscriber) = started("sub-hex", config).await;
        assert_eq!(subscriber.socket.filters(), &[Bytes::from_static(b"t1")]);

        let mut publisher = context.publisher();
        publisher.bind(&Endpoint::inproc("sub-hex")).await.unwrap();
        publisher.send(&encode_parts("t1", "hello", false).1).await.unwrap();

        let tick = subscriber.ready().await;
        assert_eq!(subscriber.on_tick(tick, &sink).await, Flow::Continue);

        let received = relay.drain_received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].encoding, Encoding::Hex);
        assert_eq!(
            received[0].parts,
            vec![Bytes::from_static(b"7431"), Bytes::from_static(b"68656c6c6f")]
        );
        let decoded = received[0].decoded().unwrap();
        assert_eq!(decoded[1], Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_hex_wire_round_trip() {
        let config =
            SubscriberConfig::new(Endpoint::inproc("sub-hex-wire"), ["t1"]).with_hex_wire(true);
        let (context, relay, sink, mut subscriber) = started("sub-hex-wire", config).await;
        assert_eq!(subscriber.socket.filters(), &[Bytes::from_static(b"7431")]);

        let mut publisher = context.publisher();
        publisher.bind(&Endpoint::inproc("sub-hex-wire")).await.unwrap();
        publisher.send(&encode_parts("t1", "hello", false).1).await.unwrap();
        publisher.send(&encode_parts("t1", "hello", true).1).await.unwrap();

        let tick = subscriber.ready().await;
        subscriber.on_tick(tick, &sink).await;

        let received = relay.drain_received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].encoding, Encoding::Hex);
        assert_eq!(received[0].topic(), b"7431");
        let decoded = received[0].decoded().unwrap();
        assert_eq!(decoded[1], Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_set_hex_applies_to_next_message() {
        let config = SubscriberConfig::new(Endpoint::inproc("sub-toggle"), ["t1"]);
        let (context, relay, sink, mut subscriber) = started("sub-toggle", config).await;

        let mut publisher = context.publisher();
        publisher.bind(&Endpoint::inproc("sub-toggle")).await.unwrap();
        publisher.send(&encode_parts("t1", "a", false).1).await.unwrap();
        publisher.send(&encode_parts("t1", "b", false).1).await.unwrap();

        let tick = subscriber.ready().await;
        subscriber.on_tick(tick, &sink).await;
        subscriber.on_command(Command::SetHex(true), &sink).await;
        assert_eq!(subscriber.socket.filters(), &[Bytes::from_static(b"t1")]);
        let tick = subscriber.ready().await;
        subscriber.on_tick(tick, &sink).await;

        let received = relay.drain_received();
        assert_eq!(received[0].encoding, Encoding::Raw);
        assert_eq!(received[0].parts[1], Bytes::from_static(b"a"));
        assert_eq!(received[1].encoding, Encoding::Hex);
        assert_eq!(received[1].parts[1], Bytes::from_static(b"62"));
    }

    #[tokio::test]
    async fn test_timeout_counted_and_reported_once() {
        let config = SubscriberConfig::new(Endpoint::inproc("sub-quiet"), ["t1"])
            .with_recv_timeout(Duration::from_millis(20));
        let (context, relay, sink, mut subscriber) = started("sub-quiet", config).await;
        relay.drain_logs();

        for _ in 0..3 {
            let tick = subscriber.ready().await;
            assert_eq!(subscriber.on_tick(tick, &sink).await, Flow::Continue);
        }
        assert_eq!(subscriber.stats().timeouts, 3);
        let logs = relay.drain_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].severity, Severity::Info);

        // Traffic resumes, then stops again
        let mut publisher = context.publisher();
        publisher.bind(&Endpoint::inproc("sub-quiet")).await.unwrap();
        publisher.send(&encode_parts("t1", "x", false).1).await.unwrap();
        let tick = subscriber.ready().await;
        subscriber.on_tick(tick, &sink).await;
        let tick = subscriber.ready().await;
        subscriber.on_tick(tick, &sink).await;
        assert_eq!(relay.drain_logs().len(), 1);
    }
}
