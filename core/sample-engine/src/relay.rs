//! Event relay between worker threads and the controller
//!
//! Workers never touch controller state. Traffic and informational log lines
//! are appended to [`BufferedQueue`]s that the controller drains on its own
//! cadence; lifecycle events and error logs travel over an unbounded channel
//! the controller can block on.

use crate::clock::{SystemClock, TimeSource, Timestamp};
use crate::events::{
    Direction, Encoding, LifecycleEvent, LogEntry, LogRecord, SampleId, SampleKind, SampleStats,
    Severity,
};
use crate::transport::{Endpoint, Multipart};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Append-only buffer drained in batches
pub struct BufferedQueue<T> {
    items: Mutex<Vec<T>>,
}

impl<T> BufferedQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn post(&self, item: T) {
        self.items.lock().push(item);
    }

    /// Take every queued item in arrival order
    pub fn drain_all(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for BufferedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct RelayShared {
    clock: Arc<dyn TimeSource>,
    sent: BufferedQueue<LogEntry>,
    received: BufferedQueue<LogEntry>,
    logs: BufferedQueue<LogRecord>,
    lifecycle: Sender<LifecycleEvent>,
}

/// Controller side of the relay
pub struct EventRelay {
    shared: Arc<RelayShared>,
    lifecycle: Receiver<LifecycleEvent>,
}

impl EventRelay {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn TimeSource>) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            shared: Arc::new(RelayShared {
                clock,
                sent: BufferedQueue::new(),
                received: BufferedQueue::new(),
                logs: BufferedQueue::new(),
                lifecycle: tx,
            }),
            lifecycle: rx,
        }
    }

    /// Worker-side handle for one sample
    pub fn sink(&self, sample: SampleId, kind: SampleKind) -> EventSink {
        EventSink {
            sample,
            kind,
            shared: self.shared.clone(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.shared.clock.now()
    }

    pub fn drain_sent(&self) -> Vec<LogEntry> {
        self.shared.sent.drain_all()
    }

    pub fn drain_received(&self) -> Vec<LogEntry> {
        self.shared.received.drain_all()
    }

    pub fn drain_logs(&self) -> Vec<LogRecord> {
        self.shared.logs.drain_all()
    }

    pub fn try_lifecycle(&self) -> Option<LifecycleEvent> {
        self.lifecycle.try_recv().ok()
    }

    /// Block until a lifecycle event arrives or `timeout` passes
    pub fn wait_lifecycle(&self, timeout: Duration) -> Option<LifecycleEvent> {
        match self.lifecycle.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Default for EventRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker side of the relay, bound to one sample
#[derive(Clone)]
pub struct EventSink {
    sample: SampleId,
    kind: SampleKind,
    shared: Arc<RelayShared>,
}

impl EventSink {
    pub fn sample(&self) -> SampleId {
        self.sample
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    pub fn now(&self) -> Timestamp {
        self.shared.clock.now()
    }

    /// Queue a sent or received message
    pub fn message(
        &self,
        direction: Direction,
        timestamp: Timestamp,
        encoding: Encoding,
        parts: Multipart,
    ) {
        let entry = LogEntry {
            sample: self.sample,
            timestamp,
            direction,
            encoding,
            parts,
        };
        match direction {
            Direction::Sent => self.shared.sent.post(entry),
            Direction::Received => self.shared.received.post(entry),
        }
    }

    /// Queue a diagnostic line. Errors skip the batch and are delivered immediately.
    pub fn log<S: Into<String>>(&self, severity: Severity, text: S) {
        let record = LogRecord {
            sample: self.sample,
            timestamp: self.now(),
            severity,
            text: text.into(),
        };

        match severity {
            Severity::Info => info!(sample = %self.sample, "{}", record.text),
            Severity::Warning => warn!(sample = %self.sample, "{}", record.text),
            Severity::Error => error!(sample = %self.sample, "{}", record.text),
        }

        if severity == Severity::Error {
            self.emit(LifecycleEvent::Log(record));
        } else {
            self.shared.logs.post(record);
        }
    }

    pub(crate) fn started(&self, endpoint: Option<Endpoint>) {
        self.emit(LifecycleEvent::Started {
            sample: self.sample,
            kind: self.kind,
            endpoint,
        });
    }

    pub(crate) fn failure<S: Into<String>>(&self, reason: S) {
        self.emit(LifecycleEvent::Failure {
            sample: self.sample,
            reason: reason.into(),
        });
    }

    pub(crate) fn finished(&self, stats: SampleStats) {
        self.emit(LifecycleEvent::Finished {
            sample: self.sample,
            stats,
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        // Receiver gone means the controller shut down; nothing left to notify
        let _ = self.shared.lifecycle.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    #[test]
    fn test_drain_twice() {
        let queue = BufferedQueue::new();
        queue.post(1);
        queue.post(2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain_all(), vec![1, 2]);
        assert!(queue.drain_all().is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_traffic_routed_by_direction() {
        let relay = EventRelay::new();
        let sink = relay.sink(SampleId::new(), SampleKind::Publisher);
        let parts = vec![Bytes::from_static(b"t1"), Bytes::from_static(b"hello")];

        sink.message(Direction::Sent, sink.now(), Encoding::Raw, parts.clone());
        sink.message(Direction::Received, sink.now(), Encoding::Raw, parts);

        assert_eq!(relay.drain_sent().len(), 1);
        assert_eq!(relay.drain_received().len(), 1);
        assert!(relay.drain_logs().is_empty());
    }

    #[test]
    fn test_error_logs_bypass_batch() {
        let relay = EventRelay::new();
        let sink = relay.sink(SampleId::new(), SampleKind::Subscriber);

        sink.log(Severity::Info, "connected");
        sink.log(Severity::Error, "Exception: boom");

        let logs = relay.drain_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].severity, Severity::Info);

        match relay.try_lifecycle() {
            Some(LifecycleEvent::Log(record)) => assert_eq!(record.text, "Exception: boom"),
            other => panic!("expected error log, got {:?}", other),
        }
        assert!(relay.try_lifecycle().is_none());
    }

    #[test]
    fn test_wait_lifecycle_from_thread() {
        let relay = EventRelay::new();
        let sink = relay.sink(SampleId::new(), SampleKind::Publisher);

        let worker = std::thread::spawn(move || sink.finished(SampleStats::default()));
        let event = relay.wait_lifecycle(Duration::from_secs(5));
        worker.join().unwrap();

        assert!(matches!(event, Some(LifecycleEvent::Finished { .. })));
        assert!(relay.wait_lifecycle(Duration::from_millis(10)).is_none());
    }

    proptest! {
        #[test]
        fn prop_drains_concatenate_to_posts(
            batches in prop::collection::vec(prop::collection::vec(any::<u32>(), 0..20), 0..10)
        ) {
            let queue = BufferedQueue::new();
            let mut drained = Vec::new();
            for batch in &batches {
                for item in batch {
                    queue.post(*item);
                }
                drained.extend(queue.drain_all());
            }
            prop_assert!(queue.drain_all().is_empty());

            let posted: Vec<u32> = batches.into_iter().flatten().collect();
            prop_assert_eq!(drained, posted);
        }
    }
}
