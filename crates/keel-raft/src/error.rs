//! Raft error types.
//!
//! The Display texts of the handler-level errors are part of the wire
//! contract: remote callers match on them, and the integration tests
//! assert them verbatim.

use thiserror::Error;

use crate::types::{LogIndex, NodeId, Term};

/// Raft errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// RequestVote denied: the candidate's term is behind ours.
    #[error("Stale term: {request} < {current}")]
    StaleTerm { request: Term, current: Term },

    /// RequestVote denied: another candidate already holds our vote
    /// this term.
    #[error("Already voted for {candidate}")]
    AlreadyVoted { candidate: NodeId, current: Term },

    /// RequestVote denied: our log is strictly more up-to-date than
    /// the candidate's.
    #[error("Out-of-date log: [{last_index}/{last_term}] > [{candidate_index}/{candidate_term}]")]
    OutOfDateLog {
        last_index: LogIndex,
        last_term: Term,
        candidate_index: LogIndex,
        candidate_term: Term,
        current: Term,
    },

    /// AppendEntries rejected: the leader's term is behind ours.
    #[error("Stale request term")]
    StaleRequestTerm { request: Term, current: Term },

    /// Append would move the log backwards in index or term.
    #[error(
        "Cannot append entry with earlier index in the same term \
         ({last_term}:{last_index} <= {term}:{index})"
    )]
    EntryOutOfOrder {
        last_index: LogIndex,
        last_term: Term,
        index: LogIndex,
        term: Term,
    },

    /// AppendEntries anchor `(prev_log_index, prev_log_term)` does not
    /// match any entry in our log.
    #[error("Log consistency check failed: no entry at {index} with term {term}")]
    AnchorMismatch { index: LogIndex, term: Term },

    /// A truncation would discard entries at or below the commit index.
    #[error("Cannot truncate committed entries after {index} (committed through {commit})")]
    CommittedTruncate { index: LogIndex, commit: LogIndex },

    /// Client submission reached a server that is not the leader.
    #[error("Not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// Client submission reached a non-leader with no known leader.
    #[error("No leader available")]
    NoLeader,

    /// Handler invoked after `stop()`.
    #[error("Server is stopped")]
    Stopped,

    /// `start()` invoked on a server that is already running.
    #[error("Server is already running")]
    AlreadyRunning,

    /// No factory registered for this command name.
    #[error("Unknown command: {name}")]
    UnknownCommand { name: String },

    /// The durable log failed validation on load. Fatal at startup.
    #[error("Corrupt log at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    /// Entry line codec failure (bad field, bad checksum).
    #[error("Codec error: {reason}")]
    Codec { reason: String },

    /// Peer unknown to the transport.
    #[error("Peer not reachable: {peer}")]
    Unreachable { peer: NodeId },

    /// Invalid configuration.
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// I/O error from the durable store.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Command payload (de)serialization failure.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl RaftError {
    /// The responder's term, for errors produced by the request
    /// handlers. Lets the remote caller recover the `(term, denied)`
    /// pair the message shapes describe.
    pub fn current_term(&self) -> Option<Term> {
        match self {
            RaftError::StaleTerm { current, .. }
            | RaftError::AlreadyVoted { current, .. }
            | RaftError::OutOfDateLog { current, .. }
            | RaftError::StaleRequestTerm { current, .. } => Some(*current),
            _ => None,
        }
    }

    /// True for the log-consistency failures an AppendEntries caller
    /// answers with index backtracking.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            RaftError::EntryOutOfOrder { .. }
                | RaftError::AnchorMismatch { .. }
                | RaftError::CommittedTruncate { .. }
        )
    }
}

/// Raft result type.
pub type Result<T> = std::result::Result<T, RaftError>;
