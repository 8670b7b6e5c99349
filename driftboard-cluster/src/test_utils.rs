// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory transport for multi-node tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use driftboard_core::NodeId;
use tokio::sync::mpsc;

use crate::transport::{Envelope, Incoming, Transport, TransportError, TransportStats};

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// A process-local hub connecting any number of in-memory transports.
///
/// Messages are delivered through unbounded channels: ordering between two
/// nodes is preserved (stricter than the real contract allows, which is
/// fine for tests) and nothing is dropped unless a node disconnects.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HashMap<NodeId, mpsc::UnboundedSender<Incoming>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, returning its transport handle and incoming channel.
    pub fn join(&self, node: NodeId) -> (MemoryTransport, mpsc::UnboundedReceiver<Incoming>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .insert(node.clone(), tx);

        let transport = MemoryTransport {
            hub: self.clone(),
            self_node: node,
        };
        (transport, rx)
    }

    /// Simulate a node dropping off the network: all sends to it fail and
    /// its incoming channel closes.
    pub fn disconnect(&self, node: &NodeId) {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .remove(node);
    }
}

/// [`Transport`] implementation backed by a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    self_node: NodeId,
}

impl Transport for MemoryTransport {
    fn send(&self, to: &NodeId, envelope: Envelope) -> Result<(), TransportError> {
        let senders = self.hub.inner.lock().expect("hub lock poisoned");
        let sender = senders
            .get(to)
            .ok_or_else(|| TransportError::Disconnected(to.clone()))?;
        sender
            .send(Incoming {
                from: self.self_node.clone(),
                envelope,
            })
            .map_err(|_| TransportError::Disconnected(to.clone()))
    }

    fn broadcast(&self, envelope: Envelope) {
        let senders = self.hub.inner.lock().expect("hub lock poisoned");
        for (node, sender) in senders.iter() {
            if *node == self.self_node {
                continue;
            }
            // Disconnected receivers are cleaned up by `disconnect`; a
            // failed send here is just a peer that vanished mid-broadcast.
            let _ = sender.send(Incoming {
                from: self.self_node.clone(),
                envelope: envelope.clone(),
            });
        }
    }

    fn peers(&self) -> Vec<NodeId> {
        self.hub
            .inner
            .lock()
            .expect("hub lock poisoned")
            .keys()
            .filter(|node| **node != self.self_node)
            .cloned()
            .collect()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            connected_peers: self.peers().len(),
        }
    }
}
