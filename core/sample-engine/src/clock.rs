//! Timestamps for sent and received traffic
//!
//! Every send/receive event is stamped by a [`TimeSource`]. The default
//! [`SystemClock`] reads wall-clock time with microsecond resolution and
//! never hands out the same or an earlier value twice, so the timestamps of a
//! run are strictly increasing even when the wall clock is coarse or steps back.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Display format for timestamps (`2024-01-31 12:00:00.123456`)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Microseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// Convert to local time for display
    pub fn to_local(&self) -> Option<DateTime<Local>> {
        let secs = self.0.div_euclid(1_000_000);
        let nanos = (self.0.rem_euclid(1_000_000) * 1_000) as u32;
        DateTime::<Utc>::from_timestamp(secs, nanos).map(|utc| utc.with_timezone(&Local))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_local() {
            Some(local) => write!(f, "{}", local.format(TIMESTAMP_FORMAT)),
            None => write!(f, "{}us", self.0),
        }
    }
}

/// Source of timestamps shared by all samples of a controller
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock with a monotonic floor
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeSource for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = Utc::now().timestamp_micros();
        let next = |last: i64| wall.max(last + 1);
        match self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(next(last)))
        {
            Ok(previous) | Err(previous) => Timestamp(next(previous)),
        }
    }
}
