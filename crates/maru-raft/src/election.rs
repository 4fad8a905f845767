//! Leader election: the follower timeout watch and candidacies.
//!
//! A follower that hears nothing for one follower timeout becomes a
//! candidate. A candidacy opens a fresh term, votes for itself, persists
//! that vote, broadcasts RequestVote, and waits a randomized interval; if
//! no majority materialises the node drops back to follower and the next
//! timeout tries again. The randomized wait is the split-vote tie-breaker.

use crate::state::RaftCore;
use crate::transport::RaftTransport;
use crate::types::*;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// Follower phase: consume one heartbeat per timeout window; a silent
/// window promotes the node to candidate.
pub(crate) async fn follower_phase(core: &Arc<RaftCore>, shutdown: &mut broadcast::Receiver<()>) {
    while core.is_running() && core.role() == Role::Follower {
        tokio::select! {
            _ = sleep(core.config().follower_timeout) => {}
            _ = shutdown.recv() => return,
        }

        if !core.is_running() || core.role() != Role::Follower {
            return;
        }
        if !core.take_heartbeat() {
            core.note_election_timeout();
            return;
        }
    }
}

/// Candidate phase: run candidacies until this node wins, discovers a
/// leader, or gives up back to follower.
pub(crate) async fn candidate_phase(
    core: &Arc<RaftCore>,
    transport: &Arc<dyn RaftTransport>,
    shutdown: &mut broadcast::Receiver<()>,
) {
    while core.is_running() && core.role() == Role::Candidate {
        let term = match core.start_candidacy() {
            Ok(term) => term,
            Err(error) => {
                // Hard-state persistence failed; the node cannot safely
                // keep participating.
                tracing::error!(%error, "failed to persist candidacy, stopping node");
                core.stop();
                return;
            }
        };

        // The self-vote alone can be a majority in a one-node cluster.
        if core.majority() <= 1 {
            core.become_leader();
            return;
        }

        broadcast_vote_request(core, transport, term).await;

        tokio::select! {
            _ = sleep(core.config().random_election_timeout()) => {}
            _ = shutdown.recv() => return,
        }

        if core.role() == Role::Candidate {
            tracing::info!(node = %core.id(), term = %term, "no majority this candidacy, reverting to follower");
            if let Err(error) = core.become_follower(core.current_term()) {
                tracing::error!(%error, "failed to persist step-down, stopping node");
                core.stop();
            }
            return;
        }
    }
}

/// Send RequestVote to every peer in parallel.
async fn broadcast_vote_request(
    core: &Arc<RaftCore>,
    transport: &Arc<dyn RaftTransport>,
    term: Term,
) {
    let request = RequestVoteRequest {
        term,
        candidate_id: core.id(),
        last_log_index: core.log().last_index(),
        last_log_term: core.log().last_term(),
    };

    let sends = core.peers().iter().map(|&peer| {
        let message = Message::VoteRequest(request.clone());
        async move {
            if let Err(error) = transport.send(peer, message).await {
                tracing::debug!(%peer, %error, "vote request send failed");
            }
        }
    });
    join_all(sends).await;
}
