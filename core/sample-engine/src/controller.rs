//! Controller: creates samples, routes commands and drains relayed events
//!
//! The controller lives on the caller's thread. It never shares state with
//! workers; everything comes back through the [`EventRelay`]. Traffic is
//! drained at the traffic cadence, batched log lines at the log cadence, and
//! lifecycle events wake the drain loop immediately. Buffers are always
//! drained before a lifecycle batch is dispatched, so a sample's traffic and
//! log lines reach the handler before its terminal event.

use crate::config::{EngineConfig, SampleConfig, TRAFFIC_REFRESH_RANGE};
use crate::error::{EngineError, Result};
use crate::events::{LifecycleEvent, LogEntry, LogRecord, SampleId, SampleKind, SampleStats};
use crate::publisher::Publisher;
use crate::relay::EventRelay;
use crate::sample::{Command, SampleState};
use crate::subscriber::{Subscriber, TopicSet};
use crate::transport::{Context, Endpoint};
use crate::worker::{self, SampleHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Callbacks for the display layer. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait EventHandler {
    fn on_started(&mut self, sample: SampleId, kind: SampleKind, endpoint: Option<&Endpoint>) {}

    fn on_message_sent(&mut self, entry: &LogEntry) {}

    fn on_message_received(&mut self, entry: &LogEntry) {}

    fn on_finished(&mut self, sample: SampleId, stats: &SampleStats) {}

    fn on_failure(&mut self, sample: SampleId, reason: &str) {}

    fn on_log(&mut self, record: &LogRecord) {}
}

/// Handler that discards everything
impl EventHandler for () {}

/// Aggregate traffic and lifecycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub sent: u64,
    pub received: u64,
    pub finished: u64,
    pub failures: u64,
}

/// What is kept of a sample once its terminal event has been dispatched
#[derive(Debug, Clone, Copy)]
struct Retired {
    kind: SampleKind,
    state: SampleState,
    stats: SampleStats,
}

pub struct Controller {
    context: Context,
    relay: EventRelay,
    samples: HashMap<SampleId, SampleHandle>,
    order: Vec<SampleId>,
    topics: HashMap<SampleId, TopicSet>,
    retired: HashMap<SampleId, Retired>,
    counters: Counters,
    traffic_interval: Duration,
    log_interval: Duration,
    next_traffic: Instant,
    next_logs: Instant,
}

impl Controller {
    pub fn new() -> Self {
        Self::with_relay(EventRelay::new())
    }

    /// Use a relay with a custom time source
    pub fn with_relay(relay: EventRelay) -> Self {
        let defaults = EngineConfig::default();
        let now = Instant::now();
        Self {
            context: Context::new(),
            relay,
            samples: HashMap::new(),
            order: Vec::new(),
            topics: HashMap::new(),
            retired: HashMap::new(),
            counters: Counters::default(),
            traffic_interval: defaults.traffic_interval(),
            log_interval: defaults.log_interval(),
            next_traffic: now,
            next_logs: now,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let mut controller = Self::new();
        controller.traffic_interval = config.traffic_interval();
        controller.log_interval = config.log_interval();
        Ok(controller)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Change the traffic drain cadence (1 to 200 Hz)
    pub fn set_traffic_refresh_hz(&mut self, hz: u32) -> Result<()> {
        if !TRAFFIC_REFRESH_RANGE.contains(&hz) {
            return Err(EngineError::config(format!(
                "traffic refresh rate must be between {} and {} Hz, got {}",
                TRAFFIC_REFRESH_RANGE.start(),
                TRAFFIC_REFRESH_RANGE.end(),
                hz
            )));
        }
        self.traffic_interval = Duration::from_micros(1_000_000 / u64::from(hz));
        Ok(())
    }

    pub fn traffic_interval(&self) -> Duration {
        self.traffic_interval
    }

    /// Create a sample and bind it to a worker thread; it stays idle until [`Controller::start`]
    pub fn create_sample<C: Into<SampleConfig>>(&mut self, config: C) -> SampleId {
        let config = config.into();
        let id = SampleId::new();
        let sink = self.relay.sink(id, config.kind());

        let handle = match config {
            SampleConfig::Publisher(config) => {
                worker::bind(Publisher::new(&self.context, config), &self.context, sink)
            }
            SampleConfig::Subscriber(config) => {
                let subscriber = Subscriber::new(&self.context, config);
                self.topics.insert(id, subscriber.topics());
                worker::bind(subscriber, &self.context, sink)
            }
        };

        debug!(sample = %id, kind = %handle.kind(), "Sample created");
        self.samples.insert(id, handle);
        self.order.push(id);
        id
    }

    pub fn start(&mut self, id: SampleId) -> Result<()> {
        self.handle_mut(id)?.start()
    }

    /// Queue a stop request. No-op for a finished sample.
    pub fn stop(&self, id: SampleId) -> Result<()> {
        if let Some(handle) = self.live(id)? {
            handle.stop();
        }
        Ok(())
    }

    /// Queue a command; `Ok(false)` if the sample no longer takes commands
    pub fn command(&self, id: SampleId, command: Command) -> Result<bool> {
        Ok(self
            .live(id)?
            .map(|handle| handle.command(command))
            .unwrap_or(false))
    }

    pub fn state(&self, id: SampleId) -> Option<SampleState> {
        match self.samples.get(&id) {
            Some(handle) => Some(handle.state()),
            None => self.retired.get(&id).map(|r| r.state),
        }
    }

    pub fn kind(&self, id: SampleId) -> Option<SampleKind> {
        match self.samples.get(&id) {
            Some(handle) => Some(handle.kind()),
            None => self.retired.get(&id).map(|r| r.kind),
        }
    }

    /// Snapshot of a live subscriber's topics
    pub fn topics(&self, id: SampleId) -> Option<Vec<String>> {
        self.topics.get(&id).map(|t| t.snapshot())
    }

    /// Final stats of a finished sample
    pub fn stats(&self, id: SampleId) -> Option<SampleStats> {
        self.retired.get(&id).map(|r| r.stats)
    }

    /// Drop what is kept of a finished sample; its id becomes unknown
    pub fn forget(&mut self, id: SampleId) -> Option<SampleStats> {
        self.retired.remove(&id).map(|r| r.stats)
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Ids of samples not yet finished, in creation order
    pub fn samples(&self) -> &[SampleId] {
        &self.order
    }

    /// Samples started and not yet terminal
    pub fn active(&self) -> usize {
        self.samples
            .values()
            .filter(|h| h.is_started() && !h.state().is_terminal())
            .count()
    }

    pub fn stop_all(&self) {
        for handle in self.samples.values() {
            if !handle.state().is_terminal() {
                handle.stop();
            }
        }
    }

    /// Drain whatever is due without blocking. Returns the number of events dispatched.
    pub fn pump<H: EventHandler + ?Sized>(&mut self, handler: &mut H) -> usize {
        self.pump_with(None, handler)
    }

    /// Run the drain loop for `duration`
    pub fn run_for<H: EventHandler + ?Sized>(&mut self, duration: Duration, handler: &mut H) {
        self.run_until(duration, handler, |_| false);
    }

    /// Run the drain loop until `done` holds or `timeout` passes.
    /// Returns whether `done` was reached.
    pub fn run_until<H, F>(&mut self, timeout: Duration, handler: &mut H, mut done: F) -> bool
    where
        H: EventHandler + ?Sized,
        F: FnMut(&Controller) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let wake = self.next_traffic.min(self.next_logs).min(deadline);
            let first = self.relay.wait_lifecycle(wake.saturating_duration_since(now));
            self.pump_with(first, handler);
        }
    }

    /// Stop every sample, drain until all are terminal, then join their threads
    pub fn shutdown<H>(&mut self, timeout: Duration, handler: &mut H) -> bool
    where
        H: EventHandler + ?Sized,
    {
        info!(samples = self.samples.len(), "Controller shutting down");
        self.stop_all();
        let clean = self.run_until(timeout, handler, |c| c.active() == 0);
        self.flush(handler);

        for handle in self.samples.values_mut() {
            if handle.state().is_terminal() {
                if let Err(e) = handle.join() {
                    warn!("{}", e);
                }
            }
        }
        if !clean {
            warn!(active = self.active(), "Shutdown timed out with samples still running");
        }
        clean
    }

    /// Drain everything queued right now, regardless of cadence
    pub fn flush<H: EventHandler + ?Sized>(&mut self, handler: &mut H) -> usize {
        let mut lifecycle = Vec::new();
        while let Some(event) = self.relay.try_lifecycle() {
            lifecycle.push(event);
        }
        let now = Instant::now();
        let mut dispatched = self.drain_traffic(now, handler) + self.drain_logs(now, handler);
        for event in lifecycle {
            self.dispatch(event, handler);
            dispatched += 1;
        }
        dispatched
    }

    fn pump_with<H>(&mut self, first: Option<LifecycleEvent>, handler: &mut H) -> usize
    where
        H: EventHandler + ?Sized,
    {
        let mut lifecycle: Vec<LifecycleEvent> = first.into_iter().collect();
        while let Some(event) = self.relay.try_lifecycle() {
            lifecycle.push(event);
        }

        let now = Instant::now();
        let urgent = !lifecycle.is_empty();
        let mut dispatched = 0;
        if urgent || now >= self.next_traffic {
            dispatched += self.drain_traffic(now, handler);
        }
        if urgent || now >= self.next_logs {
            dispatched += self.drain_logs(now, handler);
        }

        for event in lifecycle {
            self.dispatch(event, handler);
            dispatched += 1;
        }
        dispatched
    }

    fn drain_traffic<H: EventHandler + ?Sized>(&mut self, now: Instant, handler: &mut H) -> usize {
        self.next_traffic = now + self.traffic_interval;
        let sent = self.relay.drain_sent();
        let received = self.relay.drain_received();
        self.counters.sent += sent.len() as u64;
        self.counters.received += received.len() as u64;

        for entry in &sent {
            handler.on_message_sent(entry);
        }
        for entry in &received {
            handler.on_message_received(entry);
        }
        sent.len() + received.len()
    }

    fn drain_logs<H: EventHandler + ?Sized>(&mut self, now: Instant, handler: &mut H) -> usize {
        self.next_logs = now + self.log_interval;
        let logs = self.relay.drain_logs();
        for record in &logs {
            handler.on_log(record);
        }
        logs.len()
    }

    fn dispatch<H: EventHandler + ?Sized>(&mut self, event: LifecycleEvent, handler: &mut H) {
        match event {
            LifecycleEvent::Started {
                sample,
                kind,
                endpoint,
            } => {
                info!(sample = %sample, kind = %kind, endpoint = ?endpoint, "Sample started");
                handler.on_started(sample, kind, endpoint.as_ref());
            }
            LifecycleEvent::Failure { sample, reason } => {
                self.counters.failures += 1;
                handler.on_failure(sample, &reason);
            }
            LifecycleEvent::Finished { sample, stats } => {
                self.counters.finished += 1;
                self.retire(sample, stats);
                handler.on_finished(sample, &stats);
            }
            LifecycleEvent::Log(record) => handler.on_log(&record),
        }
    }

    /// Join the worker thread and release the handle, keeping only the outcome
    fn retire(&mut self, id: SampleId, stats: SampleStats) {
        let Some(mut handle) = self.samples.remove(&id) else {
            return;
        };
        if let Err(e) = handle.join() {
            warn!(sample = %id, "{}", e);
        }
        self.order.retain(|s| *s != id);
        self.topics.remove(&id);
        self.retired.insert(
            id,
            Retired {
                kind: handle.kind(),
                state: handle.state(),
                stats,
            },
        );
    }

    /// `None` for a retired sample
    fn live(&self, id: SampleId) -> Result<Option<&SampleHandle>> {
        match self.samples.get(&id) {
            Some(handle) => Ok(Some(handle)),
            None if self.retired.contains_key(&id) => Ok(None),
            None => Err(EngineError::UnknownSample(id.to_string())),
        }
    }

    fn handle_mut(&mut self, id: SampleId) -> Result<&mut SampleHandle> {
        if self.retired.contains_key(&id) {
            return Err(EngineError::AlreadyStarted(id.to_string()));
        }
        self.samples
            .get_mut(&id)
            .ok_or_else(|| EngineError::UnknownSample(id.to_string()))
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}
