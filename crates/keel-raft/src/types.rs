//! Core Raft types: terms, log indexes, server names, roles, and the
//! RPC message value objects.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entry::LogEntry;

/// Raft term number (monotonically increasing).
///
/// Terms are the logical clock of the protocol: each term has at most
/// one leader, and a server starting an election first increments its
/// term.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log index (1-indexed; 0 is the sentinel for "before the log").
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

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

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server name (unique across the cluster).
///
/// Names are strings so hosts can use DNS names, UUIDs, or IP:port
/// combinations; the transport resolves them to addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// Server role.
///
/// `Stopped` is the state before `start()` and after `stop()`;
/// handlers invoked while stopped fail immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Stopped,
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Stopped => write!(f, "Stopped"),
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// RequestVote RPC request, sent by a candidate to every peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,

    /// Candidate requesting the vote.
    pub candidate_name: NodeId,

    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

impl RequestVoteRequest {
    pub fn new(
        term: Term,
        candidate_name: impl Into<NodeId>,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Self {
        Self {
            term,
            candidate_name: candidate_name.into(),
            last_log_index,
            last_log_term,
        }
    }
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Voter's current term, for the candidate to update itself.
    pub term: Term,

    /// True if the candidate received the vote.
    pub vote_granted: bool,
}

/// AppendEntries RPC request.
///
/// Sent by the leader to replicate entries; an empty `entries` list is
/// a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,

    /// Leader's name, so followers can redirect clients.
    pub leader_name: NodeId,

    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,

    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,

    /// Entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,

    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    pub fn new(
        term: Term,
        leader_name: impl Into<NodeId>,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_name: leader_name.into(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Follower's current term, for the leader to update itself.
    pub term: Term,

    /// True if the follower's log matched `prev_log_index`/`prev_log_term`
    /// and the entries were stored.
    pub success: bool,
}

/// A command crossing the propose-forwarding hook: the registered
/// command name plus its opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub name: String,
    pub payload: bytes::Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_ordering_and_next() {
        assert!(Term(2) > Term(1));
        assert_eq!(Term(5).next(), Term(6));
        assert_eq!(Term(7).to_string(), "7");
    }

    #[test]
    fn log_index_ordering_and_prev() {
        assert!(LogIndex(10) > LogIndex(5));
        assert_eq!(LogIndex(5).next(), LogIndex(6));
        assert_eq!(LogIndex(5).prev(), Some(LogIndex(4)));
        assert_eq!(LogIndex(0).prev(), None);
    }

    #[test]
    fn node_id_display_is_raw() {
        assert_eq!(NodeId::new("n1").to_string(), "n1");
        assert_eq!(NodeId::from("x").as_str(), "x");
    }

    #[test]
    fn role_display() {
        assert_eq!(Role::Stopped.to_string(), "Stopped");
        assert_eq!(Role::Leader.to_string(), "Leader");
    }
}
