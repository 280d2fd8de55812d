//! Error types for the sample engine

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the transport, the samples and the controller.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Endpoint string could not be parsed
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// In-process endpoint already has a bound publisher
    #[error("address already in use: {0}")]
    AddressInUse(String),

    /// Binding a publisher socket failed
    #[error("bind to {endpoint} failed: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Resolving or connecting a subscriber socket failed
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    /// Send or receive did not complete in time
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Socket used in the wrong state (send before bind, recv before connect, ...)
    #[error("socket error: {0}")]
    SocketState(&'static str),

    /// Malformed multipart frame on the wire
    #[error("malformed frame: {0}")]
    Frame(String),

    /// Transport I/O errors
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `start` called on a handle whose thread already launched
    #[error("sample {0} was already started")]
    AlreadyStarted(String),

    /// No sample registered under that id
    #[error("unknown sample {0}")]
    UnknownSample(String),

    /// Worker thread or runtime could not be created
    #[error("worker thread error: {0}")]
    Worker(String),

    /// Configuration loading or validation errors
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid endpoint error
    pub fn invalid_endpoint<E: Into<String>, R: Into<String>>(endpoint: E, reason: R) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error ends the sample when raised during setup or a work cycle.
    ///
    /// Timeouts and broken peers are retried on the next scheduling cycle.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout(_) | Self::Frame(_) | Self::Io(_))
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;
