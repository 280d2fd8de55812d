//! Engine configuration
//!
//! Loaded from TOML, every field optional:
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 9445
//! traffic_refresh_hz = 10
//!
//! [publisher]
//! topic = "t1"
//! payload = "hello"
//! frequency = 5
//!
//! [subscriber]
//! topics = ["t1"]
//! match_mode = "exact"
//! hex_wire = false
//! ```

use crate::error::{EngineError, Result};
use crate::events::SampleKind;
use crate::publisher::{PublisherConfig, DEFAULT_INITIAL_DELAY};
use crate::subscriber::SubscriberConfig;
use crate::transport::{Endpoint, TopicMatch, DEFAULT_RECONNECT_INTERVAL, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Accepted traffic refresh rates (Hz)
pub const TRAFFIC_REFRESH_RANGE: std::ops::RangeInclusive<u32> = 1..=200;

/// Configuration for one sample
#[derive(Debug, Clone, PartialEq)]
pub enum SampleConfig {
    Publisher(PublisherConfig),
    Subscriber(SubscriberConfig),
}

impl SampleConfig {
    pub fn kind(&self) -> SampleKind {
        match self {
            Self::Publisher(_) => SampleKind::Publisher,
            Self::Subscriber(_) => SampleKind::Subscriber,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Self::Publisher(config) => &config.endpoint,
            Self::Subscriber(config) => &config.endpoint,
        }
    }
}

impl From<PublisherConfig> for SampleConfig {
    fn from(config: PublisherConfig) -> Self {
        Self::Publisher(config)
    }
}

impl From<SubscriberConfig> for SampleConfig {
    fn from(config: SubscriberConfig) -> Self {
        Self::Subscriber(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// IPv4 address to bind/connect, or `*` to bind all interfaces
    pub host: String,
    pub port: u16,
    pub hex: bool,
    pub send_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    /// How often the controller drains traffic buffers
    pub traffic_refresh_hz: u32,
    /// How often the controller drains batched log lines
    pub log_refresh_ms: u64,
    pub publisher: PublisherSection,
    pub subscriber: SubscriberSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9445,
            hex: false,
            send_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            recv_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL.as_millis() as u64,
            traffic_refresh_hz: 10,
            log_refresh_ms: 100,
            publisher: PublisherSection::default(),
            subscriber: SubscriberSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    pub topic: String,
    pub payload: String,
    /// Messages per second; 0 sends once
    pub frequency: u32,
    pub max_messages: Option<u64>,
    pub initial_delay_ms: u64,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            topic: "t1".to_string(),
            payload: "hello".to_string(),
            frequency: 1,
            max_messages: None,
            initial_delay_ms: DEFAULT_INITIAL_DELAY.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberSection {
    pub topics: Vec<String>,
    pub match_mode: TopicMatch,
    /// Publishers on the endpoint send hex text
    pub hex_wire: bool,
}

impl Default for SubscriberSection {
    fn default() -> Self {
        Self {
            topics: vec!["t1".to_string()],
            match_mode: TopicMatch::Exact,
            hex_wire: false,
        }
    }
}

impl EngineConfig {
    /// Load and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EngineError::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host != "*" && !is_valid_ipv4(&self.host) {
            return Err(EngineError::config(format!("invalid IPv4 address '{}'", self.host)));
        }
        if !TRAFFIC_REFRESH_RANGE.contains(&self.traffic_refresh_hz) {
            return Err(EngineError::config(format!(
                "traffic refresh rate must be between {} and {} Hz, got {}",
                TRAFFIC_REFRESH_RANGE.start(),
                TRAFFIC_REFRESH_RANGE.end(),
                self.traffic_refresh_hz
            )));
        }
        if self.log_refresh_ms == 0 {
            return Err(EngineError::config("log refresh interval must be positive"));
        }
        if self.send_timeout_ms == 0 || self.recv_timeout_ms == 0 {
            return Err(EngineError::config("timeouts must be positive"));
        }

        if !is_valid_topic(&self.publisher.topic) {
            return Err(EngineError::config(format!(
                "invalid publisher topic '{}'",
                self.publisher.topic
            )));
        }
        // Payloads follow the same character rules as topics
        if !is_valid_topic(&self.publisher.payload) {
            return Err(EngineError::config(format!(
                "invalid publisher payload '{}'",
                self.publisher.payload
            )));
        }
        if let Some(topic) = self.subscriber.topics.iter().find(|t| !is_valid_topic(t)) {
            return Err(EngineError::config(format!("invalid subscriber topic '{}'", topic)));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::tcp(self.host.clone(), self.port)
    }

    /// Address subscribers connect to (`*` becomes loopback)
    pub fn connect_endpoint(&self) -> Endpoint {
        if self.host == "*" {
            Endpoint::tcp("127.0.0.1", self.port)
        } else {
            self.endpoint()
        }
    }

    pub fn traffic_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.traffic_refresh_hz.max(1)))
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_refresh_ms)
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        let section = &self.publisher;
        let mut config = PublisherConfig::new(
            self.endpoint(),
            section.topic.clone(),
            section.payload.clone(),
            section.frequency,
        )
        .with_hex(self.hex)
        .with_initial_delay(Duration::from_millis(section.initial_delay_ms))
        .with_send_timeout(Duration::from_millis(self.send_timeout_ms));
        config.max_messages = section.max_messages;
        config
    }

    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig::new(self.connect_endpoint(), self.subscriber.topics.clone())
            .with_hex(self.hex)
            .with_hex_wire(self.subscriber.hex_wire)
            .with_match_mode(self.subscriber.match_mode)
            .with_recv_timeout(Duration::from_millis(self.recv_timeout_ms))
            .with_reconnect_interval(Duration::from_millis(self.reconnect_interval_ms))
    }
}

/// Non-empty and made of ASCII letters, digits and `/`
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.chars().all(|c| c.is_ascii_alphanumeric() || c == '/')
}

/// Dotted-quad IPv4 address
pub fn is_valid_ipv4(host: &str) -> bool {
    host.parse::<Ipv4Addr>().is_ok()
}
