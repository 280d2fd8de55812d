//! Sample abstraction shared by publishers and subscribers
//!
//! A sample is driven by exactly one worker thread. The worker's event loop
//! waits on two sources: the command queue and the sample's own readiness
//! ([`Sample::ready`], a timer for publishers and the socket for
//! subscribers). Queued commands always win over readiness, so a stop request
//! observed before a due send cancels it.

use crate::error::Result;
use crate::events::{SampleKind, SampleStats};
use crate::relay::EventSink;
use crate::transport::Endpoint;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SampleState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Finished = 3,
    Failed = 4,
}

impl SampleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Finished,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for SampleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Finished => "finished",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State shared between a worker and its handle
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(SampleState::Idle as u8))
    }

    pub(crate) fn get(&self) -> SampleState {
        SampleState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SampleState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `to` unless a terminal state was already reached.
    /// Returns false if the state was terminal.
    pub(crate) fn advance(&self, to: SampleState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if SampleState::from_u8(current).is_terminal() {
                    None
                } else {
                    Some(to as u8)
                }
            })
            .is_ok()
    }
}

/// Control request queued to a sample's worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Finish the sample
    Stop,
    /// New send frequency in messages per second (0 = send once)
    SetFrequency(u32),
    SetHex(bool),
    /// Send this topic/payload now, then keep using it at the current frequency
    Publish { topic: String, payload: String },
    /// Cancel the pending send without finishing
    Halt,
    Subscribe(String),
    Unsubscribe(String),
}

/// What the event loop does after handling a tick or command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finish,
    /// Unrecoverable error; the sample ends as failed
    Fail(String),
}

/// A publisher or subscriber driven by a worker thread
#[async_trait(?Send)]
pub trait Sample: Send + 'static {
    /// What [`Sample::ready`] resolves to
    type Tick: 'static;

    fn kind(&self) -> SampleKind;

    /// Transport setup (bind/connect, timeouts, filters) and first scheduling.
    /// An error here fails the sample.
    async fn start(&mut self, sink: &EventSink) -> Result<()>;

    /// Resolve when the sample has work to do. Must be cancel-safe.
    async fn ready(&mut self) -> Self::Tick;

    async fn on_tick(&mut self, tick: Self::Tick, sink: &EventSink) -> Flow;

    /// Handle any command except [`Command::Stop`], which the worker handles
    async fn on_command(&mut self, command: Command, sink: &EventSink) -> Flow;

    fn stats(&self) -> SampleStats;

    /// Endpoint the sample is bound or connected to, once started
    fn endpoint(&self) -> Option<Endpoint>;
}
