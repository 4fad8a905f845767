//! Core Raft types: terms, indexes, node ids, log entries, RPC messages.

use bytes::Bytes;
use std::fmt;

/// Raft term number (monotonically increasing).
///
/// Terms are the logical clock of the protocol: each term has at most one
/// leader, and every message carries the sender's term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Term(pub u32);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed; 0 is the sentinel for "before the log").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogIndex(pub u32);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Node identifier, unique within the cluster. Zero means "unknown" and is
/// never a valid member id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const UNKNOWN: NodeId = NodeId(0);

    pub fn is_known(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Node role in the consensus state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// A replicated log entry: the term it was created in plus an opaque
/// command payload (for MaruKV, the client's original RESP request).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(term: Term, data: impl Into<Bytes>) -> Self {
        Self {
            term,
            data: data.into(),
        }
    }
}

/// RequestVote RPC request, broadcast by a candidate at the start of an
/// election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate_id: NodeId,

    /// Index of the candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteResponse {
    /// Voter's current term, for the candidate to update itself
    pub term: Term,

    /// True if the candidate received the vote
    pub vote_granted: bool,
}

/// AppendEntries RPC request: heartbeat and log replication in one message.
/// An empty `entries` list is a pure heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's id, so followers can redirect clients
    pub leader_id: NodeId,

    /// Index of the entry immediately preceding the new ones
    pub prev_log_index: LogIndex,

    /// Term of the entry at `prev_log_index`
    pub prev_log_term: Term,

    /// Leader's commit index
    pub leader_commit: LogIndex,

    /// Heartbeat sequence number; echoed back as `ack` and used by the
    /// leader's live-count partition detector
    pub seq: u32,

    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// Follower's current term, for the leader to update itself
    pub term: Term,

    /// Responding follower's id
    pub follower_id: NodeId,

    /// Follower's last log index after handling the request
    pub log_index: LogIndex,

    /// True if the consistency check passed and entries were stored
    pub success: bool,

    /// Follower's commit index
    pub follower_commit: LogIndex,

    /// Echo of the request's `seq`
    pub ack: u32,
}

/// The four peer messages as a tagged sum, dispatched on the wire type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    VoteRequest(RequestVoteRequest),
    VoteResponse(RequestVoteResponse),
    AppendRequest(AppendEntriesRequest),
    AppendResponse(AppendEntriesResponse),
}

impl Message {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::VoteRequest(_) => "RequestVote.Req",
            Message::VoteResponse(_) => "RequestVote.Resp",
            Message::AppendRequest(_) => "AppendEntries.Req",
            Message::AppendResponse(_) => "AppendEntries.Resp",
        }
    }

    /// The sender id carried inside the message, when the kind has one.
    /// Used by the TCP transport to label inbound connections.
    pub fn source_id(&self) -> Option<NodeId> {
        match self {
            Message::VoteRequest(req) => Some(req.candidate_id),
            Message::VoteResponse(_) => None,
            Message::AppendRequest(req) => Some(req.leader_id),
            Message::AppendResponse(resp) => Some(resp.follower_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_and_index_ordering() {
        assert!(Term(2) > Term(1));
        assert_eq!(Term(5).next(), Term(6));
        assert!(LogIndex(10) > LogIndex(5));
        assert_eq!(LogIndex(5).prev(), Some(LogIndex(4)));
        assert_eq!(LogIndex(0).prev(), None);
    }

    #[test]
    fn node_id_zero_is_unknown() {
        assert!(!NodeId::UNKNOWN.is_known());
        assert!(NodeId(3).is_known());
    }

    #[test]
    fn message_source_ids() {
        let req = Message::AppendRequest(AppendEntriesRequest {
            term: Term(1),
            leader_id: NodeId(2),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            leader_commit: LogIndex::ZERO,
            seq: 0,
            entries: vec![],
        });
        assert_eq!(req.source_id(), Some(NodeId(2)));

        let resp = Message::VoteResponse(RequestVoteResponse {
            term: Term(1),
            vote_granted: true,
        });
        assert_eq!(resp.source_id(), None);
    }
}
