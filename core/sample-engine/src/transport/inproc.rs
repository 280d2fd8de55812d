//! In-process transport: one broadcast channel per endpoint name

use super::Multipart;
use crate::error::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Channel capacity for each in-process endpoint
const CHANNEL_CAPACITY: usize = 10_000;

struct InprocChannel {
    sender: broadcast::Sender<Multipart>,
    bound: bool,
}

impl InprocChannel {
    fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            bound: false,
        }
    }
}

/// Endpoint registry owned by a transport context.
///
/// Subscribers may connect before the publisher binds; both sides share the
/// channel created by whoever arrives first.
#[derive(Default)]
pub(crate) struct InprocRegistry {
    channels: DashMap<String, InprocChannel>,
}

impl InprocRegistry {
    /// Claim the endpoint for a publisher
    pub(crate) fn bind(&self, name: &str) -> Result<broadcast::Sender<Multipart>> {
        match self.channels.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let channel = occupied.get_mut();
                if channel.bound {
                    return Err(EngineError::AddressInUse(format!("inproc://{}", name)));
                }
                channel.bound = true;
                Ok(channel.sender.clone())
            }
            Entry::Vacant(vacant) => {
                debug!("Creating inproc endpoint on bind: {}", name);
                let mut channel = InprocChannel::new();
                channel.bound = true;
                let sender = channel.sender.clone();
                vacant.insert(channel);
                Ok(sender)
            }
        }
    }

    /// Release the endpoint so another publisher can bind it
    pub(crate) fn unbind(&self, name: &str) {
        if let Some(mut channel) = self.channels.get_mut(name) {
            channel.bound = false;
        }
    }

    /// Attach a subscriber to the endpoint
    pub(crate) fn connect(&self, name: &str) -> broadcast::Receiver<Multipart> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Creating inproc endpoint on connect: {}", name);
                InprocChannel::new()
            })
            .sender
            .subscribe()
    }

    #[cfg(test)]
    pub(crate) fn is_bound(&self, name: &str) -> bool {
        self.channels.get(name).map(|c| c.bound).unwrap_or(false)
    }
}
