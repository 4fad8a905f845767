//! Raft node state: roles, transitions, and the four message handlers.
//!
//! # Persistent state (survives crashes)
//!
//! - `current_term` and `voted_for`, written to the hard-state file before
//!   the vote or candidacy they record reaches the wire
//! - the log itself (stored in [`RaftLog`])
//!
//! # Volatile state
//!
//! - `role`, `leader_id`, `commit_index`, `last_applied`, `vote_count`, the
//!   heartbeat flag, the live-count, and the heartbeat `seq`
//! - leader-only: `match_index[p]`, the highest index known replicated on
//!   each peer, initialised optimistically to the leader's own last index
//!
//! Every shared scalar is an atomic, so handlers running on different tasks
//! never take a coarse lock; only the match-index table and grouped role
//! transitions are mutex-guarded.

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::log::RaftLog;
use crate::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

const ROLE_FOLLOWER: u8 = 0;
const ROLE_CANDIDATE: u8 = 1;
const ROLE_LEADER: u8 = 2;

/// Heartbeat sequence numbers rotate through 0..=SEQ_MODULUS.
const SEQ_MODULUS: u32 = 10;

/// Core consensus state for one node.
pub struct RaftCore {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    log: Arc<RaftLog>,

    role: AtomicU8,
    current_term: AtomicU32,
    /// Vote cast in `current_term`; 0 = none.
    voted_for: AtomicU32,
    /// Last known leader of `current_term`; 0 = unknown.
    leader_id: AtomicU32,
    vote_count: AtomicU32,
    /// Set by any valid leader contact or granted vote; the follower loop
    /// consumes it once per timeout window.
    heartbeat_seen: AtomicBool,
    commit_index: AtomicU32,
    last_applied: AtomicU32,
    /// Current heartbeat sequence number, rotated once per leader tick.
    seq: AtomicU32,
    /// Partition detector credit; below zero the leader steps down.
    live_count: AtomicI32,
    running: AtomicBool,

    match_index: Mutex<HashMap<NodeId, LogIndex>>,
    /// Serialises multi-field role transitions.
    transition: Mutex<()>,
}

impl RaftCore {
    /// Build the core, restoring persisted term/vote hard state.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        log: Arc<RaftLog>,
    ) -> Result<Self> {
        let (term, voted_for) = log.load_hard_state()?;

        Ok(Self {
            id,
            peers,
            config,
            log,
            role: AtomicU8::new(ROLE_FOLLOWER),
            current_term: AtomicU32::new(term.0),
            voted_for: AtomicU32::new(voted_for.0),
            leader_id: AtomicU32::new(0),
            vote_count: AtomicU32::new(0),
            heartbeat_seen: AtomicBool::new(false),
            commit_index: AtomicU32::new(0),
            last_applied: AtomicU32::new(0),
            seq: AtomicU32::new(0),
            live_count: AtomicI32::new(0),
            running: AtomicBool::new(true),
            match_index: Mutex::new(HashMap::new()),
            transition: Mutex::new(()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<RaftLog> {
        &self.log
    }

    pub fn role(&self) -> Role {
        match self.role.load(Ordering::SeqCst) {
            ROLE_LEADER => Role::Leader,
            ROLE_CANDIDATE => Role::Candidate,
            _ => Role::Follower,
        }
    }

    pub fn current_term(&self) -> Term {
        Term(self.current_term.load(Ordering::SeqCst))
    }

    /// Last known leader of the current term, if any.
    pub fn leader(&self) -> Option<NodeId> {
        let id = NodeId(self.leader_id.load(Ordering::SeqCst));
        id.is_known().then_some(id)
    }

    pub fn commit_index(&self) -> LogIndex {
        LogIndex(self.commit_index.load(Ordering::SeqCst))
    }

    pub fn last_applied(&self) -> LogIndex {
        LogIndex(self.last_applied.load(Ordering::SeqCst))
    }

    pub(crate) fn set_last_applied(&self, index: LogIndex) {
        self.last_applied.fetch_max(index.0, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flip the running flag; every loop observes it at its next wake.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub(crate) fn current_seq(&self) -> u32 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Rotate the heartbeat sequence number for the next tick.
    pub(crate) fn rotate_seq(&self) -> u32 {
        let next = match self.seq.load(Ordering::SeqCst) {
            SEQ_MODULUS => 0,
            n => n + 1,
        };
        self.seq.store(next, Ordering::SeqCst);
        next
    }

    /// Spend one live-count credit; returns the balance after spending.
    pub(crate) fn spend_live_credit(&self) -> i32 {
        self.live_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Consume the heartbeat flag, returning whether one arrived since the
    /// last call.
    pub(crate) fn take_heartbeat(&self) -> bool {
        self.heartbeat_seen.swap(false, Ordering::SeqCst)
    }

    /// Replicated index believed reached on `peer` (leader bookkeeping).
    pub fn match_index(&self, peer: NodeId) -> LogIndex {
        self.match_index
            .lock()
            .get(&peer)
            .copied()
            .unwrap_or(LogIndex::ZERO)
    }

    // ---- transitions ----

    /// Step down to follower. A strictly greater term resets the vote and
    /// persists fresh hard state; an unchanged term keeps the vote so a
    /// failed candidacy cannot hand out a second grant in the same term.
    pub fn become_follower(&self, term: Term) -> Result<()> {
        let _guard = self.transition.lock();

        if term > self.current_term() {
            self.current_term.store(term.0, Ordering::SeqCst);
            self.voted_for.store(0, Ordering::SeqCst);
            self.log.save_hard_state(term, NodeId::UNKNOWN)?;
        }

        let was = self.role();
        self.role.store(ROLE_FOLLOWER, Ordering::SeqCst);
        self.leader_id.store(0, Ordering::SeqCst);
        self.vote_count.store(0, Ordering::SeqCst);
        self.heartbeat_seen.store(false, Ordering::SeqCst);

        if was != Role::Follower {
            tracing::info!(node = %self.id, term = %self.current_term(), from = %was, "stepping down to follower");
        }
        Ok(())
    }

    /// Follower timeout fired: switch role; the candidate phase starts the
    /// actual election.
    pub(crate) fn note_election_timeout(&self) {
        tracing::info!(node = %self.id, term = %self.current_term(), "no heartbeat within follower timeout, becoming candidate");
        self.role.store(ROLE_CANDIDATE, Ordering::SeqCst);
    }

    /// Open a new election term: bump the term, vote for self, persist the
    /// hard state before any RequestVote leaves this node.
    pub fn start_candidacy(&self) -> Result<Term> {
        let _guard = self.transition.lock();

        let term = self.current_term().next();
        self.current_term.store(term.0, Ordering::SeqCst);
        self.voted_for.store(self.id.0, Ordering::SeqCst);
        self.log.save_hard_state(term, self.id)?;

        self.role.store(ROLE_CANDIDATE, Ordering::SeqCst);
        self.leader_id.store(0, Ordering::SeqCst);
        self.vote_count.store(1, Ordering::SeqCst);

        tracing::info!(node = %self.id, term = %term, "starting election");
        Ok(term)
    }

    /// Won the election: init per-peer match indexes to the local last log
    /// index (optimistic; failed consistency checks walk them back) and arm
    /// the live-count.
    pub fn become_leader(&self) {
        let _guard = self.transition.lock();
        if self.role() == Role::Leader {
            return;
        }

        self.role.store(ROLE_LEADER, Ordering::SeqCst);
        self.leader_id.store(self.id.0, Ordering::SeqCst);
        self.seq.store(0, Ordering::SeqCst);
        self.live_count
            .store(self.config.leader_resilience, Ordering::SeqCst);

        let last = self.log.last_index();
        let mut match_index = self.match_index.lock();
        match_index.clear();
        for &peer in &self.peers {
            match_index.insert(peer, last);
        }

        tracing::info!(node = %self.id, term = %self.current_term(), "became leader");
    }

    // ---- client path ----

    /// Leader-only append of a client command at the current term.
    pub fn append_local(&self, data: bytes::Bytes) -> Result<LogIndex> {
        if self.role() != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader(),
            });
        }
        let index = self.log.append(data, self.current_term())?;
        // The local replica may already complete a majority (one-node
        // cluster); peer replicas advance this on their responses.
        self.advance_commit();
        Ok(index)
    }

    // ---- message handlers ----

    /// RequestVote receiver.
    pub fn handle_vote_request(&self, req: &RequestVoteRequest) -> Result<RequestVoteResponse> {
        let deny = |term: Term| RequestVoteResponse {
            term,
            vote_granted: false,
        };

        if req.term < self.current_term() {
            return Ok(deny(self.current_term()));
        }
        if req.term > self.current_term() {
            self.become_follower(req.term)?;
        }

        let term = self.current_term();

        // One vote per term.
        if NodeId(self.voted_for.load(Ordering::SeqCst)).is_known() {
            return Ok(deny(term));
        }
        // A concurrent handler may have moved the term while we stepped
        // down; a grant is only valid for the term the candidate asked in.
        if term != req.term {
            return Ok(deny(term));
        }

        let last_log_term = self.log.last_term();
        let last_log_index = self.log.last_index();
        let log_ok = req.last_log_term > last_log_term
            || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);
        if !log_ok {
            return Ok(deny(term));
        }

        // Persist the vote before it becomes visible on the wire.
        self.voted_for.store(req.candidate_id.0, Ordering::SeqCst);
        self.log.save_hard_state(term, req.candidate_id)?;
        // Granting counts as leader contact: suppress our own candidacy.
        self.heartbeat_seen.store(true, Ordering::SeqCst);

        tracing::debug!(node = %self.id, term = %term, candidate = %req.candidate_id, "vote granted");
        Ok(RequestVoteResponse {
            term,
            vote_granted: true,
        })
    }

    /// RequestVote response receiver (candidate side).
    pub fn handle_vote_response(&self, resp: &RequestVoteResponse) -> Result<()> {
        if resp.term > self.current_term() {
            return self.become_follower(resp.term);
        }

        if self.role() == Role::Candidate && resp.vote_granted {
            let votes = self.vote_count.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(node = %self.id, votes, "vote received");
            if votes as usize >= self.majority() {
                self.become_leader();
            }
        }
        Ok(())
    }

    /// AppendEntries receiver: heartbeat bookkeeping, the log consistency
    /// check with suffix truncation, entry append, and commit advance.
    pub fn handle_append_request(
        &self,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if req.term < self.current_term() {
            return Ok(self.append_response(req.seq, false));
        }

        // term >= ours: this is the leader of req.term.
        if req.term > self.current_term() || self.role() != Role::Follower {
            self.become_follower(req.term)?;
        }
        self.leader_id.store(req.leader_id.0, Ordering::SeqCst);
        self.heartbeat_seen.store(true, Ordering::SeqCst);

        // Consistency check against the entry preceding the new window.
        if req.prev_log_index > LogIndex::ZERO {
            let last = self.log.last_index();
            if req.prev_log_index > last {
                return Ok(self.append_response(req.seq, false));
            }
            if self.log.term_at(req.prev_log_index) != req.prev_log_term {
                // Divergent suffix: drop it from the mismatch onward and let
                // the leader retry with an earlier prev index.
                self.log.truncate(req.prev_log_index, last)?;
                return Ok(self.append_response(req.seq, false));
            }
        }

        if !req.entries.is_empty() {
            let mut next = req.prev_log_index.next();
            let mut entries = req.entries.as_slice();

            // Skip entries the log already holds at the same term, so a
            // retransmitted window never disturbs the committed prefix.
            while let Some(entry) = entries.first() {
                if next <= self.log.last_index() && self.log.term_at(next) == entry.term {
                    next = next.next();
                    entries = &entries[1..];
                } else {
                    break;
                }
            }

            if !entries.is_empty() {
                let last = self.log.last_index();
                if next <= last {
                    self.log.truncate(next, last)?;
                }
                for entry in entries {
                    self.log.append(entry.data.clone(), entry.term)?;
                }
            }
        }

        if req.leader_commit > self.commit_index() {
            let new_commit = req.leader_commit.min(self.log.last_index());
            self.log.commit(new_commit);
            self.commit_index.fetch_max(new_commit.0, Ordering::SeqCst);
        }

        Ok(self.append_response(req.seq, true))
    }

    fn append_response(&self, seq: u32, success: bool) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term(),
            follower_id: self.id,
            log_index: self.log.last_index(),
            success,
            follower_commit: self.commit_index(),
            ack: seq,
        }
    }

    /// AppendEntries response receiver (leader side): live-count credit,
    /// match-index bookkeeping, and commit advance.
    pub fn handle_append_response(&self, resp: &AppendEntriesResponse) -> Result<()> {
        if self.role() != Role::Leader {
            return Ok(());
        }
        if resp.term > self.current_term() {
            return self.become_follower(resp.term);
        }

        // An ack for the current tick proves the peer link is alive.
        if resp.ack == self.current_seq() {
            let cap = self.config.leader_resilience;
            let _ = self
                .live_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    (v < cap).then_some(v + 1)
                });
        }

        if resp.success {
            {
                let mut match_index = self.match_index.lock();
                let slot = match_index.entry(resp.follower_id).or_insert(LogIndex::ZERO);
                // Max-merge tolerates reordered responses.
                if resp.log_index > *slot {
                    *slot = resp.log_index;
                }
            }
            self.advance_commit();
        } else {
            // Resync: fall back to the follower's reported last index, or
            // one step back when that would not move us.
            let mut match_index = self.match_index.lock();
            if let Some(slot) = match_index.get_mut(&resp.follower_id) {
                *slot = if resp.log_index < *slot {
                    resp.log_index
                } else {
                    slot.prev().unwrap_or(LogIndex::ZERO)
                };
            }
        }
        Ok(())
    }

    /// Advance the commit index to the highest entry replicated on a
    /// majority whose term is the current one. Entries from earlier terms
    /// commit only implicitly, when a current-term entry above them does.
    pub fn advance_commit(&self) {
        if self.role() != Role::Leader {
            return;
        }

        let current_term = self.current_term();
        let last = self.log.last_index();
        let mut commit = self.commit_index();

        {
            let match_index = self.match_index.lock();
            for i in commit.0 + 1..=last.0 {
                let idx = LogIndex(i);
                let replicas = 1 + match_index.values().filter(|&&m| m >= idx).count();
                if replicas >= self.majority() && self.log.term_at(idx) == current_term {
                    commit = idx;
                }
            }
        }

        if commit > self.commit_index() {
            self.log.commit(commit);
            self.commit_index.fetch_max(commit.0, Ordering::SeqCst);
            tracing::debug!(node = %self.id, commit = %commit, "commit index advanced");
        }
    }
}
