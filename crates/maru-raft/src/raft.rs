//! The Raft facade: wires the core to its background tasks.
//!
//! `start()` spawns three loops:
//! - the role loop, which runs the follower/candidate/leader phases
//! - the dispatcher, draining the transport inbox into the core handlers
//! - the apply loop, feeding committed entries to the state machine
//!
//! All of them observe one shutdown broadcast plus the core's running flag.
//! The client path is `propose` + the poll-based waits: a command is
//! acknowledged only once its index is covered by the commit (and, for
//! reads, apply) cursor.

use crate::election;
use crate::error::{RaftError, Result};
use crate::replication;
use crate::rpc_handler;
use crate::state::RaftCore;
use crate::transport::{Inbox, RaftTransport};
use crate::types::*;
use crate::StateMachine;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::time::sleep;

pub struct Raft {
    core: Arc<RaftCore>,
    transport: Arc<dyn RaftTransport>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Raft {
    pub fn new(core: Arc<RaftCore>, transport: Arc<dyn RaftTransport>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(8);
        Self {
            core,
            transport,
            shutdown_tx,
        }
    }

    pub fn core(&self) -> &Arc<RaftCore> {
        &self.core
    }

    /// Spawn the background tasks. `inbox` is the transport's inbound
    /// message stream; committed entries go to `state_machine`.
    pub fn start(&self, inbox: Inbox, state_machine: Arc<dyn StateMachine>) {
        let core = Arc::clone(&self.core);
        let transport = Arc::clone(&self.transport);
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            rpc_handler::dispatch_loop(core, transport, inbox, shutdown).await;
        });

        let core = Arc::clone(&self.core);
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            replication::apply_loop(core, state_machine, shutdown).await;
        });

        let core = Arc::clone(&self.core);
        let transport = Arc::clone(&self.transport);
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            role_loop(core, transport, shutdown).await;
        });

        tracing::info!(node = %self.core.id(), "raft node started as follower, term {}", self.core.current_term());
    }

    /// Stop all loops; outstanding waits resolve with [`RaftError::Stopped`].
    pub fn shutdown(&self) {
        self.core.stop();
        let _ = self.shutdown_tx.send(());
        tracing::info!(node = %self.core.id(), "raft node stopped");
    }

    pub fn is_leader(&self) -> bool {
        self.core.role() == Role::Leader
    }

    pub fn role(&self) -> Role {
        self.core.role()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.core.leader()
    }

    pub fn current_term(&self) -> Term {
        self.core.current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.core.commit_index()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.core.last_applied()
    }

    /// Append a client command to the replicated log. Leader only; the
    /// entry replicates in the background and the caller decides which
    /// wait (commit or apply) acknowledges it.
    pub fn propose(&self, command: Bytes) -> Result<LogIndex> {
        self.core.append_local(command)
    }

    /// Wait until `index` is committed (durable on a majority).
    pub async fn wait_committed(&self, index: LogIndex) -> Result<()> {
        self.wait_for(index, |core| core.commit_index()).await
    }

    /// Wait until `index` has been applied to the state machine.
    pub async fn wait_applied(&self, index: LogIndex) -> Result<()> {
        self.wait_for(index, |core| core.last_applied()).await
    }

    async fn wait_for(
        &self,
        index: LogIndex,
        cursor: impl Fn(&RaftCore) -> LogIndex,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            if cursor(&self.core) >= index {
                return Ok(());
            }
            if !self.core.is_running() {
                return Err(RaftError::Stopped);
            }
            let elapsed = start.elapsed();
            if elapsed >= self.core.config().propose_timeout {
                return Err(RaftError::CommitTimeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            sleep(self.core.config().commit_poll).await;
        }
    }
}

/// Run whichever phase matches the current role until shutdown.
async fn role_loop(
    core: Arc<RaftCore>,
    transport: Arc<dyn RaftTransport>,
    mut shutdown: broadcast::Receiver<()>,
) {
    while core.is_running() {
        match core.role() {
            Role::Follower => election::follower_phase(&core, &mut shutdown).await,
            Role::Candidate => election::candidate_phase(&core, &transport, &mut shutdown).await,
            Role::Leader => replication::leader_phase(&core, &transport, &mut shutdown).await,
        }
    }
    tracing::debug!(node = %core.id(), "role loop stopped");
}
