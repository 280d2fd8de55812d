//! Publisher and subscriber sockets
//!
//! Sockets are owned by exactly one sample and only touched from that
//! sample's worker thread. Each socket holds a clone of its [`Context`], so the
//! context outlives every socket created from it.

use super::inproc::InprocRegistry;
use super::tcp::{self, TcpFanout, TcpFeed};
use super::{Context, Endpoint, Multipart};
use crate::error::{EngineError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::warn;

/// Default send/receive timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default pause between subscriber reconnect attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// How a subscription filter is compared against a message's topic part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicMatch {
    /// Topic part must equal the filter
    #[default]
    Exact,
    /// Topic part must start with the filter
    Prefix,
}

impl TopicMatch {
    pub fn matches(self, filter: &[u8], topic: &[u8]) -> bool {
        match self {
            Self::Exact => filter == topic,
            Self::Prefix => topic.starts_with(filter),
        }
    }
}

enum PubBackend {
    Tcp(TcpFanout),
    Inproc {
        name: String,
        sender: broadcast::Sender<Multipart>,
    },
}

/// Sending side of a publish/subscribe pair
pub struct PubSocket {
    context: Context,
    backend: Option<PubBackend>,
    send_timeout: Duration,
}

impl PubSocket {
    pub(crate) fn new(context: Context) -> Self {
        Self {
            context,
            backend: None,
            send_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Bind to the endpoint. TCP binds must run inside the worker's runtime.
    pub async fn bind(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.backend.is_some() {
            return Err(EngineError::SocketState("publisher socket is already bound"));
        }

        let backend = match endpoint {
            Endpoint::Tcp { host, port } => {
                let host = if host == "*" { "0.0.0.0" } else { host.as_str() };
                let fanout = TcpFanout::bind(host, *port)
                    .await
                    .map_err(|source| EngineError::Bind {
                        endpoint: endpoint.to_string(),
                        source,
                    })?;
                PubBackend::Tcp(fanout)
            }
            Endpoint::Inproc(name) => PubBackend::Inproc {
                name: name.clone(),
                sender: self.registry().bind(name)?,
            },
        };

        self.backend = Some(backend);
        Ok(())
    }

    /// Actual bound endpoint (resolves port 0 to the assigned port)
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        match self.backend.as_ref()? {
            PubBackend::Tcp(fanout) => {
                let addr = fanout.local_addr();
                Some(Endpoint::tcp(addr.ip().to_string(), addr.port()))
            }
            PubBackend::Inproc { name, .. } => Some(Endpoint::inproc(name.clone())),
        }
    }

    /// Send one multipart message; returns the number of subscribers reached.
    ///
    /// Having no subscribers is not an error.
    pub async fn send(&mut self, parts: &[Bytes]) -> Result<usize> {
        let timeout = self.send_timeout;
        match self.backend.as_mut() {
            None => Err(EngineError::SocketState("publisher socket is not bound")),
            Some(PubBackend::Tcp(fanout)) => {
                let frame = tcp::encode_frame(parts)?;
                fanout.send(&frame, timeout)
            }
            Some(PubBackend::Inproc { sender, .. }) => {
                Ok(sender.send(parts.to_vec()).unwrap_or(0))
            }
        }
    }

    fn registry(&self) -> &InprocRegistry {
        &self.context.inner.inproc
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        if let Some(PubBackend::Inproc { name, .. }) = &self.backend {
            self.registry().unbind(name);
        }
    }
}

enum SubBackend {
    Tcp(TcpFeed),
    Inproc(broadcast::Receiver<Multipart>),
}

/// Receiving side of a publish/subscribe pair.
///
/// Messages whose first part does not match any filter are discarded; with
/// no filters nothing is delivered.
pub struct SubSocket {
    context: Context,
    backend: Option<SubBackend>,
    endpoint: Option<Endpoint>,
    filters: Vec<Bytes>,
    match_mode: TopicMatch,
    recv_timeout: Duration,
    reconnect_interval: Duration,
}

impl SubSocket {
    pub(crate) fn new(context: Context) -> Self {
        Self {
            context,
            backend: None,
            endpoint: None,
            filters: Vec::new(),
            match_mode: TopicMatch::default(),
            recv_timeout: DEFAULT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }

    pub fn set_recv_timeout(&mut self, timeout: Duration) {
        self.recv_timeout = timeout;
    }

    pub fn set_reconnect_interval(&mut self, interval: Duration) {
        self.reconnect_interval = interval;
    }

    pub fn set_match_mode(&mut self, mode: TopicMatch) {
        self.match_mode = mode;
    }

    /// Connect to the endpoint.
    ///
    /// TCP addresses are resolved immediately (failure is a setup error); the
    /// connection itself is established lazily and retried until a publisher
    /// is listening.
    pub async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.backend.is_some() {
            return Err(EngineError::SocketState("subscriber socket is already connected"));
        }

        let backend = match endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| EngineError::Connect {
                        endpoint: endpoint.to_string(),
                        reason: e.to_string(),
                    })?
                    .next()
                    .ok_or_else(|| EngineError::Connect {
                        endpoint: endpoint.to_string(),
                        reason: "host resolved to no addresses".to_string(),
                    })?;
                SubBackend::Tcp(TcpFeed::connect(addr, self.reconnect_interval))
            }
            Endpoint::Inproc(name) => SubBackend::Inproc(self.context.inner.inproc.connect(name)),
        };

        self.backend = Some(backend);
        self.endpoint = Some(endpoint.clone());
        Ok(())
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Add a filter; returns false if it was already present
    pub fn subscribe(&mut self, filter: &[u8]) -> bool {
        if self.filters.iter().any(|f| f.as_ref() == filter) {
            return false;
        }
        self.filters.push(Bytes::copy_from_slice(filter));
        true
    }

    /// Remove a filter; returns false if it was not present
    pub fn unsubscribe(&mut self, filter: &[u8]) -> bool {
        match self.filters.iter().position(|f| f.as_ref() == filter) {
            Some(index) => {
                self.filters.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn filters(&self) -> &[Bytes] {
        &self.filters
    }

    pub fn accepts(&self, parts: &[Bytes]) -> bool {
        let topic = parts.first().map(|p| &p[..]).unwrap_or(&[]);
        self.filters
            .iter()
            .any(|filter| self.match_mode.matches(filter, topic))
    }

    /// Wait for the next message passing the filters.
    ///
    /// Fails with [`EngineError::Timeout`] when nothing arrives within the
    /// receive timeout. `Ok(None)` means the transport is gone for good.
    /// Cancel-safe: dropping the future loses no message.
    pub async fn recv(&mut self) -> Result<Option<Multipart>> {
        let timeout = self.recv_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let backend = self
                .backend
                .as_mut()
                .ok_or(EngineError::SocketState("subscriber socket is not connected"))?;
            let next = tokio::time::timeout_at(deadline, next_message(backend))
                .await
                .map_err(|_| EngineError::Timeout(timeout))?;

            match next {
                Some(parts) if self.accepts(&parts) => return Ok(Some(parts)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}

async fn next_message(backend: &mut SubBackend) -> Option<Multipart> {
    match backend {
        SubBackend::Tcp(feed) => feed.recv().await,
        SubBackend::Inproc(rx) => loop {
            match rx.recv().await {
                Ok(parts) => return Some(parts),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        },
    }
}
