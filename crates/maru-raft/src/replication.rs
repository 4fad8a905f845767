//! Log replication: the leader tick and the apply loop.
//!
//! The leader sends AppendEntries to every peer once per heartbeat
//! interval. Each message carries the next window of entries after
//! `match_index[p]` (at most `batch_size`); an empty window is a pure
//! heartbeat. Each tick also spends one live-count credit; ack-matched
//! responses earn credits back, and a leader that runs dry steps down on
//! partition suspicion.
//!
//! The apply loop is the only writer of `last_applied`: it walks committed
//! entries in strict index order into the state machine.

use crate::state::RaftCore;
use crate::transport::RaftTransport;
use crate::types::*;
use crate::StateMachine;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep};

/// Leader phase: replicate every tick until dethroned, stopped, or out of
/// live-count credit.
pub(crate) async fn leader_phase(
    core: &Arc<RaftCore>,
    transport: &Arc<dyn RaftTransport>,
    shutdown: &mut broadcast::Receiver<()>,
) {
    while core.is_running() && core.role() == Role::Leader {
        core.rotate_seq();

        let sends = core
            .peers()
            .iter()
            .map(|&peer| send_append_entries(core, transport, peer));
        join_all(sends).await;

        tokio::select! {
            _ = sleep(core.config().heartbeat_interval) => {}
            _ = shutdown.recv() => return,
        }

        if !core.is_running() || core.role() != Role::Leader {
            return;
        }

        // The live-count measures peer acks, meaningless without peers.
        if !core.peers().is_empty() && core.spend_live_credit() < 0 {
            tracing::warn!(
                node = %core.id(),
                term = %core.current_term(),
                "no quorum of heartbeat acks, suspecting partition and stepping down"
            );
            if let Err(error) = core.become_follower(core.current_term()) {
                tracing::error!(%error, "failed to persist step-down, stopping node");
                core.stop();
            }
            return;
        }
    }
}

/// Build and send one AppendEntries to `peer`.
async fn send_append_entries(
    core: &Arc<RaftCore>,
    transport: &Arc<dyn RaftTransport>,
    peer: NodeId,
) {
    let log = core.log();
    let prev = core.match_index(peer);
    let prev_term = log.term_at(prev);
    let last = log.last_index();

    let mut entries = Vec::new();
    let mut index = prev.next();
    while index <= last && entries.len() < core.config().batch_size {
        entries.push(LogEntry {
            term: log.term_at(index),
            data: log.entry_at(index),
        });
        index = index.next();
    }

    let request = AppendEntriesRequest {
        term: core.current_term(),
        leader_id: core.id(),
        prev_log_index: prev,
        prev_log_term: prev_term,
        leader_commit: core.commit_index(),
        seq: core.current_seq(),
        entries,
    };

    if let Err(error) = transport.send(peer, Message::AppendRequest(request)).await {
        tracing::debug!(%peer, %error, "append entries send failed");
    }
}

/// Apply committed entries to the state machine, in order, forever.
///
/// Apply errors are logged and the cursor still advances: commands are
/// deterministic, so an entry that fails here would fail identically on
/// every node, and stalling would wedge the whole pipeline.
pub(crate) async fn apply_loop(
    core: Arc<RaftCore>,
    state_machine: Arc<dyn StateMachine>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(core.config().apply_poll);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !core.is_running() {
                    return;
                }
                while core.last_applied() < core.commit_index() {
                    let index = core.last_applied().next();
                    let command = core.log().entry_at(index);
                    if let Err(error) = state_machine.apply(index, &command) {
                        tracing::error!(%index, %error, "state machine apply failed");
                    }
                    core.set_last_applied(index);
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("apply loop shutting down");
                return;
            }
        }
    }
}
