//! Transport seam for peer messages.
//!
//! Sends are fire-and-forget: a response to a request travels as its own
//! message later, so the trait is a single `send`. Inbound messages arrive
//! on an mpsc inbox as `(from, Message)` pairs consumed by the dispatcher.
//!
//! Two implementations ship: [`crate::tcp::TcpTransport`] for real
//! clusters, and [`InMemoryTransport`] here — a channel mesh for tests,
//! where dropping a peer's sender doubles as a network partition.

use crate::error::{RaftError, Result};
use crate::types::{Message, NodeId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Inbound message stream handed to the dispatcher.
pub type Inbox = mpsc::Receiver<(NodeId, Message)>;
pub type InboxSender = mpsc::Sender<(NodeId, Message)>;

/// Default inbox depth; past this the link behaves as lossy.
pub const INBOX_CAPACITY: usize = 1024;

/// Peer message transport.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Deliver one message to `target`, best-effort. Sending to the local
    /// node loops back into the local inbox.
    async fn send(&self, target: NodeId, message: Message) -> Result<()>;
}

/// In-process transport: a mesh of channels, one inbox per node.
///
/// Peers can be attached and detached at runtime, which is how tests
/// simulate partitions and crashes.
pub struct InMemoryTransport {
    local_id: NodeId,
    local_tx: InboxSender,
    peers: Arc<RwLock<HashMap<NodeId, InboxSender>>>,
}

impl InMemoryTransport {
    /// Create a transport for `local_id`; `local_tx` feeds the node's own
    /// inbox (loopback and, in tests, injection).
    pub fn new(local_id: NodeId, local_tx: InboxSender) -> Self {
        Self {
            local_id,
            local_tx,
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The sender feeding this node's own inbox; peers use clones of it to
    /// reach this node.
    pub fn local_sender(&self) -> InboxSender {
        self.local_tx.clone()
    }

    pub fn add_peer(&self, peer: NodeId, sender: InboxSender) {
        self.peers.write().insert(peer, sender);
    }

    /// Detach a peer: subsequent sends fail as unreachable.
    pub fn remove_peer(&self, peer: NodeId) {
        self.peers.write().remove(&peer);
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn send(&self, target: NodeId, message: Message) -> Result<()> {
        let tx = if target == self.local_id {
            self.local_tx.clone()
        } else {
            self.peers
                .read()
                .get(&target)
                .cloned()
                .ok_or(RaftError::PeerUnreachable { peer: target })?
        };

        // A full or closed inbox counts as a lossy link; Raft's own retries
        // absorb the drop.
        tx.try_send((self.local_id, message))
            .map_err(|_| RaftError::PeerUnreachable { peer: target })
    }
}
