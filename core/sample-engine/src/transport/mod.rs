//! Multipart publish/subscribe transport
//!
//! A [`Context`] owns the shared transport state (the in-process endpoint
//! registry). Sockets created from it keep it alive, and so does every worker
//! thread running a sample, so no socket operation can outlive its context.

mod endpoint;
mod inproc;
mod socket;
mod tcp;

pub use endpoint::Endpoint;
pub use socket::{PubSocket, SubSocket, TopicMatch, DEFAULT_RECONNECT_INTERVAL, DEFAULT_TIMEOUT};

use bytes::Bytes;
use inproc::InprocRegistry;
use std::fmt;
use std::sync::Arc;

/// One message: topic part first, payload parts after
pub type Multipart = Vec<Bytes>;

#[derive(Default)]
struct ContextInner {
    inproc: InprocRegistry,
}

/// Shared transport context
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unbound publisher socket
    pub fn publisher(&self) -> PubSocket {
        PubSocket::new(self.clone())
    }

    /// Create an unconnected subscriber socket
    pub fn subscriber(&self) -> SubSocket {
        SubSocket::new(self.clone())
    }

    /// Number of live handles on this context (sockets, workers and the owner)
    pub fn references(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("references", &self.references())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockets_hold_context() {
        let context = Context::new();
        assert_eq!(context.references(), 1);

        let publisher = context.publisher();
        let subscriber = context.subscriber();
        assert_eq!(context.references(), 3);

        drop(publisher);
        drop(subscriber);
        assert_eq!(context.references(), 1);
    }
}
