//! maru-raft: Raft consensus for a replicated key-value store.
//!
//! Implements the classic algorithm with:
//! - Leader election with randomized timeouts
//! - Log replication with consistency checks and suffix truncation
//! - Majority commit with the current-term restriction
//! - A live-count heuristic that makes a partitioned leader step down
//! - A persistent log store with a commit pointer, plus persisted
//!   term/vote hard state
//!
//! The crate is transport-agnostic: peers exchange typed messages through
//! the [`transport::RaftTransport`] seam, either over TCP with the
//! length-prefixed framing in [`wire`] or over in-process channels in tests.

pub mod config;
pub mod error;
pub mod types;
pub mod wire;
pub mod log;
pub mod state;
pub mod election;
pub mod replication;
pub mod rpc_handler;
pub mod transport;
pub mod tcp;
pub mod raft;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use raft::Raft;
pub use types::*;

use bytes::Bytes;

/// State machine driven by the apply loop.
///
/// Committed log entries are handed to `apply` in strict index order,
/// exactly once per run of the process. Commands must be deterministic and
/// idempotent: after a restart the applier replays from index 1.
pub trait StateMachine: Send + Sync {
    /// Apply one committed command. Errors are logged by the apply loop and
    /// do not stall it; the cursor still advances past the entry.
    fn apply(&self, index: LogIndex, command: &Bytes) -> Result<()>;
}
