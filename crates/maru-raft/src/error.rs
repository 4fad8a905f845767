//! Raft error types.

use thiserror::Error;

use crate::types::NodeId;

/// Raft errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader (cannot accept client commands).
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// A proposed entry did not commit within the propose timeout.
    #[error("commit wait timed out after {elapsed_ms}ms")]
    CommitTimeout { elapsed_ms: u64 },

    /// Malformed peer wire frame (bad header, oversized payload, truncated
    /// field). The connection that produced it is dropped.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: &'static str },

    /// No live connection to the peer.
    #[error("peer {peer} unreachable")]
    PeerUnreachable { peer: NodeId },

    /// The persisted log or hard-state file could not be replayed.
    #[error("log store corrupt: {reason}")]
    Corrupt { reason: String },

    /// The node has shut down; outstanding waits resolve with this.
    #[error("node is shut down")]
    Stopped,

    /// I/O error (log persistence, sockets).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Internal invariant violation (bug).
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

/// Raft result type.
pub type Result<T> = std::result::Result<T, RaftError>;
