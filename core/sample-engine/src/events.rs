//! Event type definitions for samples and the controller

use crate::clock::Timestamp;
use crate::transport::{Endpoint, Multipart};
use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Unique identity of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SampleId(Uuid);

impl SampleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First eight hex digits, used in log lines and thread names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SampleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    Publisher,
    Subscriber,
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => f.write_str("publisher"),
            Self::Subscriber => f.write_str("subscriber"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// How the parts of a message were put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Raw,
    /// Each part is the lowercase hex text of the original bytes
    Hex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("INFO"),
            Self::Warning => f.write_str("WARNING"),
            Self::Error => f.write_str("ERROR"),
        }
    }
}

// ============================================================================
// Traffic
// ============================================================================

/// One sent or received message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub sample: SampleId,
    pub timestamp: Timestamp,
    pub direction: Direction,
    pub encoding: Encoding,
    #[serde(serialize_with = "serialize_parts")]
    pub parts: Multipart,
}

impl LogEntry {
    /// First part of the message (empty for an empty message)
    pub fn topic(&self) -> &[u8] {
        self.parts.first().map(|p| &p[..]).unwrap_or(&[])
    }

    /// Every part after the topic
    pub fn payload(&self) -> &[Bytes] {
        self.parts.get(1..).unwrap_or(&[])
    }

    /// Parts with hex encoding undone. `None` if a hex entry holds invalid hex.
    pub fn decoded(&self) -> Option<Multipart> {
        match self.encoding {
            Encoding::Raw => Some(self.parts.clone()),
            Encoding::Hex => self
                .parts
                .iter()
                .map(|p| hex::decode(p).ok().map(Bytes::from))
                .collect(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Sent => "->",
            Direction::Received => "<-",
        };
        write!(f, "{} [{}] {} ", self.timestamp, self.sample, arrow)?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(&String::from_utf8_lossy(part))?;
        }
        Ok(())
    }
}

fn serialize_parts<S: Serializer>(parts: &Multipart, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(parts.iter().map(|p| String::from_utf8_lossy(p)))
}

// ============================================================================
// Diagnostics & lifecycle
// ============================================================================

/// Diagnostic log line emitted by a sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub sample: SampleId,
    pub timestamp: Timestamp,
    pub severity: Severity,
    pub text: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.timestamp, self.sample, self.severity, self.text
        )
    }
}

/// Per-sample counters, reported with the terminal event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SampleStats {
    pub sent: u64,
    pub received: u64,
    pub timeouts: u64,
}

/// Events delivered immediately to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Setup succeeded; `endpoint` is the address actually bound or connected
    Started {
        sample: SampleId,
        kind: SampleKind,
        endpoint: Option<Endpoint>,
    },
    Failure {
        sample: SampleId,
        reason: String,
    },
    /// Terminal event, posted exactly once per started sample
    Finished {
        sample: SampleId,
        stats: SampleStats,
    },
    /// Error-severity log line
    Log(LogRecord),
}

impl LifecycleEvent {
    pub fn sample(&self) -> SampleId {
        match self {
            Self::Started { sample, .. }
            | Self::Failure { sample, .. }
            | Self::Finished { sample, .. } => *sample,
            Self::Log(record) => record.sample,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(encoding: Encoding, parts: &[&'static [u8]]) -> LogEntry {
        LogEntry {
            sample: SampleId::new(),
            timestamp: Timestamp::from_micros(1_700_000_000_000_000),
            direction: Direction::Sent,
            encoding,
            parts: parts.iter().map(|p| Bytes::from_static(p)).collect(),
        }
    }

    #[test]
    fn test_topic_and_payload() {
        let e = entry(Encoding::Raw, &[b"t1", b"hello"]);
        assert_eq!(e.topic(), b"t1");
        assert_eq!(e.payload(), &[Bytes::from_static(b"hello")]);

        let empty = entry(Encoding::Raw, &[]);
        assert!(empty.topic().is_empty());
        assert!(empty.payload().is_empty());
    }

    #[test]
    fn test_decoded_hex() {
        let e = entry(Encoding::Hex, &[b"7431", b"68656c6c6f"]);
        let decoded = e.decoded().unwrap();
        assert_eq!(decoded[0], Bytes::from_static(b"t1"));
        assert_eq!(decoded[1], Bytes::from_static(b"hello"));

        assert!(entry(Encoding::Hex, &[b"zz"]).decoded().is_none());
    }

    #[test]
    fn test_entry_json() {
        let e = entry(Encoding::Raw, &[b"t1", b"hello"]);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["direction"], "sent");
        assert_eq!(json["parts"], serde_json::json!(["t1", "hello"]));
    }

    #[test]
    fn test_sample_id_short() {
        let id = SampleId::new();
        assert_eq!(id.short().len(), 8);
        assert_eq!(id.to_string(), id.short());
    }
}
