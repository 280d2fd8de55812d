#![allow(dead_code)]

use sample_engine::{
    Endpoint, EventHandler, LogEntry, LogRecord, SampleId, SampleKind, SampleStats, Severity,
};
use std::net::TcpListener;

/// Everything a controller dispatched, in dispatch order
#[derive(Debug, Clone)]
pub enum Recorded {
    Started(SampleId, Option<Endpoint>),
    Sent(LogEntry),
    Received(LogEntry),
    Finished(SampleId, SampleStats),
    Failure(SampleId, String),
    Log(LogRecord),
}

impl Recorded {
    pub fn sample(&self) -> SampleId {
        match self {
            Self::Started(id, _) | Self::Finished(id, _) | Self::Failure(id, _) => *id,
            Self::Sent(entry) | Self::Received(entry) => entry.sample,
            Self::Log(record) => record.sample,
        }
    }
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Recorded>,
}

impl Recorder {
    pub fn sent(&self, id: SampleId) -> Vec<&LogEntry> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Recorded::Sent(entry) if entry.sample == id => Some(entry),
                _ => None,
            })
            .collect()
    }

    pub fn received(&self, id: SampleId) -> Vec<&LogEntry> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Recorded::Received(entry) if entry.sample == id => Some(entry),
                _ => None,
            })
            .collect()
    }

    pub fn started(&self, id: SampleId) -> Option<Option<Endpoint>> {
        self.events.iter().find_map(|e| match e {
            Recorded::Started(sample, endpoint) if *sample == id => Some(endpoint.clone()),
            _ => None,
        })
    }

    pub fn finished_count(&self, id: SampleId) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Recorded::Finished(sample, _) if *sample == id))
            .count()
    }

    pub fn logs(&self, id: SampleId, severity: Severity) -> Vec<&LogRecord> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Recorded::Log(record) if record.sample == id && record.severity == severity => {
                    Some(record)
                }
                _ => None,
            })
            .collect()
    }

    pub fn for_sample(&self, id: SampleId) -> Vec<&Recorded> {
        self.events.iter().filter(|e| e.sample() == id).collect()
    }
}

impl EventHandler for Recorder {
    fn on_started(&mut self, sample: SampleId, _kind: SampleKind, endpoint: Option<&Endpoint>) {
        self.events.push(Recorded::Started(sample, endpoint.cloned()));
    }

    fn on_message_sent(&mut self, entry: &LogEntry) {
        self.events.push(Recorded::Sent(entry.clone()));
    }

    fn on_message_received(&mut self, entry: &LogEntry) {
        self.events.push(Recorded::Received(entry.clone()));
    }

    fn on_finished(&mut self, sample: SampleId, stats: &SampleStats) {
        self.events.push(Recorded::Finished(sample, *stats));
    }

    fn on_failure(&mut self, sample: SampleId, reason: &str) {
        self.events.push(Recorded::Failure(sample, reason.to_string()));
    }

    fn on_log(&mut self, record: &LogRecord) {
        self.events.push(Recorded::Log(record.clone()));
    }
}

/// Port that was free a moment ago
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
