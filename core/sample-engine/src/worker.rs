//! Worker threads for samples
//!
//! [`bind`] moves a sample onto its own OS thread. The thread builds a
//! single-threaded tokio runtime that acts as the sample's private event loop.
//! Commands arrive on an unbounded queue and are handled before the sample's
//! own readiness, in arrival order.
//!
//! Teardown order on the worker thread: terminal event posted, sample (and its
//! socket) dropped, runtime dropped, then the captured [`Context`] released.

use crate::error::{EngineError, Result};
use crate::events::{SampleId, SampleKind, SampleStats, Severity};
use crate::relay::EventSink;
use crate::sample::{Command, Flow, Sample, SampleState, StateCell};
use crate::transport::Context;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type Launch = Box<dyn FnOnce() -> std::io::Result<JoinHandle<()>> + Send>;

/// Bind a sample to a (not yet started) worker thread.
///
/// Commands sent before [`SampleHandle::start`] are queued and handled right
/// after setup.
pub fn bind<S: Sample>(sample: S, context: &Context, sink: EventSink) -> SampleHandle {
    let (commands, inbox) = mpsc::unbounded_channel();
    let state = Arc::new(StateCell::new());
    let id = sink.sample();
    let kind = sample.kind();

    let worker_state = Arc::clone(&state);
    let worker_sink = sink.clone();
    let worker_context = context.clone();
    let launch: Launch = Box::new(move || {
        thread::Builder::new()
            .name(format!("{}-{}", kind, id.short()))
            .spawn(move || run_worker(sample, inbox, worker_sink, worker_state, worker_context))
    });

    SampleHandle {
        id,
        kind,
        state,
        sink,
        commands,
        launch: Some(launch),
        thread: None,
    }
}

/// Controller-side handle on a bound sample.
///
/// Dropping the handle asks a running sample to stop but does not wait for it.
pub struct SampleHandle {
    id: SampleId,
    kind: SampleKind,
    state: Arc<StateCell>,
    sink: EventSink,
    commands: mpsc::UnboundedSender<Command>,
    launch: Option<Launch>,
    thread: Option<JoinHandle<()>>,
}

impl SampleHandle {
    pub fn id(&self) -> SampleId {
        self.id
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    pub fn state(&self) -> SampleState {
        self.state.get()
    }

    /// Spawn the worker thread. A handle can only be started once.
    pub fn start(&mut self) -> Result<()> {
        let launch = self
            .launch
            .take()
            .ok_or_else(|| EngineError::AlreadyStarted(self.id.to_string()))?;

        match launch() {
            Ok(thread) => {
                debug!(sample = %self.id, kind = %self.kind, "Worker thread spawned");
                self.thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                let reason = format!("failed to spawn worker thread: {}", e);
                fail(&self.sink, &self.state, &reason, SampleStats::default());
                Err(EngineError::Worker(reason))
            }
        }
    }

    /// Queue a stop request. No-op once the sample has finished.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    /// Queue a command; returns false if the sample no longer accepts commands
    pub fn command(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.launch.is_none()
    }

    /// Whether the worker thread has exited (false if never started)
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(false)
    }

    /// Wait for the worker thread to exit
    pub fn join(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| EngineError::Worker(format!("worker thread of {} panicked", self.id))),
            None => Ok(()),
        }
    }
}

impl Drop for SampleHandle {
    fn drop(&mut self) {
        if self.thread.is_some() && !self.state.get().is_terminal() {
            self.stop();
        }
    }
}

fn run_worker<S: Sample>(
    sample: S,
    inbox: mpsc::UnboundedReceiver<Command>,
    sink: EventSink,
    state: Arc<StateCell>,
    context: Context,
) {
    debug!(sample = %sink.sample(), "Worker thread started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Worker(format!("failed to build runtime: {}", e)))?;
        runtime.block_on(drive(sample, inbox, &sink, &state));
        Ok::<(), EngineError>(())
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => fail(&sink, &state, &e.to_string(), SampleStats::default()),
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            fail(&sink, &state, &reason, SampleStats::default());
        }
    }

    drop(context);
    debug!(sample = %sink.sample(), "Worker thread exiting");
}

async fn drive<S: Sample>(
    mut sample: S,
    mut inbox: mpsc::UnboundedReceiver<Command>,
    sink: &EventSink,
    state: &StateCell,
) {
    if let Err(e) = sample.start(sink).await {
        fail(sink, state, &e.to_string(), sample.stats());
        return;
    }

    state.set(SampleState::Running);
    sink.started(sample.endpoint());

    let outcome = loop {
        let flow = tokio::select! {
            biased;

            command = inbox.recv() => match command {
                Some(Command::Stop) | None => Flow::Finish,
                Some(command) => sample.on_command(command, sink).await,
            },
            tick = sample.ready() => sample.on_tick(tick, sink).await,
        };

        if flow != Flow::Continue {
            break flow;
        }
    };

    // Later stop requests become no-ops
    inbox.close();

    match outcome {
        Flow::Fail(reason) => fail(sink, state, &reason, sample.stats()),
        _ => {
            state.set(SampleState::Stopping);
            sink.log(Severity::Info, "Stopping");
            state.set(SampleState::Finished);
            sink.finished(sample.stats());
            info!(sample = %sink.sample(), stats = ?sample.stats(), "Sample finished");
        }
    }
}

/// Post the failure triple unless the sample already reached a terminal state
fn fail(sink: &EventSink, state: &StateCell, reason: &str, stats: SampleStats) {
    if !state.advance(SampleState::Failed) {
        warn!(sample = %sink.sample(), "Ignoring failure after termination: {}", reason);
        return;
    }
    sink.failure(reason);
    sink.finished(stats);
    sink.log(Severity::Error, format!("Exception: {}", reason));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LifecycleEvent;
    use crate::relay::EventRelay;
    use crate::transport::Endpoint;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct Scripted {
        fail_start: bool,
        panic_on_tick: bool,
        ticks: u64,
    }

    #[async_trait(?Send)]
    impl Sample for Scripted {
        type Tick = ();

        fn kind(&self) -> SampleKind {
            SampleKind::Publisher
        }

        async fn start(&mut self, _sink: &EventSink) -> Result<()> {
            if self.fail_start {
                return Err(EngineError::config("boom"));
            }
            Ok(())
        }

        async fn ready(&mut self) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        async fn on_tick(&mut self, _tick: (), _sink: &EventSink) -> Flow {
            if self.panic_on_tick {
                panic!("tick exploded");
            }
            self.ticks += 1;
            Flow::Continue
        }

        async fn on_command(&mut self, _command: Command, _sink: &EventSink) -> Flow {
            Flow::Continue
        }

        fn stats(&self) -> SampleStats {
            SampleStats {
                sent: self.ticks,
                ..SampleStats::default()
            }
        }

        fn endpoint(&self) -> Option<Endpoint> {
            None
        }
    }

    /// Collect lifecycle events until `n` arrived or nothing more comes
    fn collect(relay: &EventRelay, n: usize) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while events.len() < n {
            match relay.wait_lifecycle(Duration::from_secs(5)) {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }

    fn sink(relay: &EventRelay) -> EventSink {
        relay.sink(SampleId::new(), SampleKind::Publisher)
    }

    #[test]
    fn test_stop_finishes_once() {
        let context = Context::new();
        let relay = EventRelay::new();
        let mut handle = bind(Scripted::default(), &context, sink(&relay));
        assert_eq!(handle.state(), SampleState::Idle);

        handle.start().unwrap();
        assert!(matches!(handle.start(), Err(EngineError::AlreadyStarted(_))));

        std::thread::sleep(Duration::from_millis(30));
        handle.stop();
        handle.join().unwrap();

        let events = collect(&relay, 2);
        assert!(matches!(events[0], LifecycleEvent::Started { .. }));
        assert!(matches!(events[1], LifecycleEvent::Finished { .. }));
        assert!(relay.wait_lifecycle(Duration::from_millis(50)).is_none());
        assert_eq!(handle.state(), SampleState::Finished);

        // Closed inbox
        assert!(!handle.command(Command::Stop));
        assert_eq!(context.references(), 1);
    }

    #[test]
    fn test_stop_before_start_is_queued() {
        let context = Context::new();
        let relay = EventRelay::new();
        let mut handle = bind(Scripted::default(), &context, sink(&relay));

        handle.stop();
        handle.start().unwrap();
        handle.join().unwrap();

        let events = collect(&relay, 2);
        match &events[1] {
            LifecycleEvent::Finished { stats, .. } => assert_eq!(stats.sent, 0),
            other => panic!("expected finished, got {:?}", other),
        }
    }

    #[test]
    fn test_setup_failure_order() {
        let relay = EventRelay::new();
        let sample = Scripted {
            fail_start: true,
            ..Scripted::default()
        };
        let mut handle = bind(sample, &Context::new(), sink(&relay));
        handle.start().unwrap();
        handle.join().unwrap();

        let events = collect(&relay, 3);
        assert!(matches!(
            &events[0],
            LifecycleEvent::Failure { reason, .. } if reason.contains("boom")
        ));
        assert!(matches!(events[1], LifecycleEvent::Finished { .. }));
        assert!(matches!(&events[2], LifecycleEvent::Log(r) if r.text.starts_with("Exception: ")));
        assert_eq!(handle.state(), SampleState::Failed);
    }

    #[test]
    fn test_panic_becomes_failure() {
        let context = Context::new();
        let relay = EventRelay::new();
        let sample = Scripted {
            panic_on_tick: true,
            ..Scripted::default()
        };
        let mut handle = bind(sample, &context, sink(&relay));
        handle.start().unwrap();
        handle.join().unwrap();

        let events = collect(&relay, 4);
        assert!(matches!(events[0], LifecycleEvent::Started { .. }));
        assert!(matches!(
            &events[1],
            LifecycleEvent::Failure { reason, .. } if reason.contains("tick exploded")
        ));
        assert!(matches!(events[2], LifecycleEvent::Finished { .. }));
        assert!(matches!(events[3], LifecycleEvent::Log(_)));
        assert_eq!(handle.state(), SampleState::Failed);
        assert_eq!(context.references(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("bad");
        assert_eq!(panic_message(payload.as_ref()), "worker panicked: bad");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "worker panicked");
    }
}
