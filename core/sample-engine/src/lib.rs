//! # Sample Engine
//!
//! Execution engine for publish/subscribe test samples.
//!
//! ## Features
//!
//! - **Worker Threads**: Every sample runs on its own OS thread with a private event loop
//! - **Queued Control**: Start/stop and runtime commands are queued, never shared writes
//! - **Buffered Relay**: Traffic and log lines are batched for the display layer
//! - **Immediate Lifecycle**: Started/failure/finished events wake the controller at once
//! - **Transports**: `tcp://host:port` fan-out and `inproc://name` channels
//!
//! ## Example
//!
//! ```rust,no_run
//! use sample_engine::{Controller, Endpoint, PublisherConfig, SubscriberConfig};
//! use std::time::Duration;
//!
//! let mut controller = Controller::new();
//! let endpoint = Endpoint::tcp("127.0.0.1", 9445);
//!
//! let publisher =
//!     controller.create_sample(PublisherConfig::new(endpoint.clone(), "t1", "hello", 5));
//! let subscriber = controller.create_sample(SubscriberConfig::new(endpoint, ["t1"]));
//! controller.start(subscriber).unwrap();
//! controller.start(publisher).unwrap();
//!
//! // Drain relayed events for two seconds, then stop everything
//! controller.run_for(Duration::from_secs(2), &mut ());
//! controller.shutdown(Duration::from_secs(5), &mut ());
//! println!("{:?}", controller.counters());
//! ```

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod publisher;
pub mod relay;
pub mod sample;
pub mod subscriber;
pub mod transport;
pub mod worker;

// Re-exports
pub use clock::{SystemClock, TimeSource, Timestamp};
pub use config::{EngineConfig, SampleConfig};
pub use controller::{Controller, Counters, EventHandler};
pub use error::{EngineError, Result};
pub use events::*;
pub use publisher::{Publisher, PublisherConfig};
pub use relay::{BufferedQueue, EventRelay, EventSink};
pub use sample::{Command, Flow, Sample, SampleState};
pub use subscriber::{Subscriber, SubscriberConfig, TopicSet};
pub use transport::{Context, Endpoint, Multipart, PubSocket, SubSocket, TopicMatch};
pub use worker::{bind, SampleHandle};
