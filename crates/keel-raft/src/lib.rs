//! keel-raft: a library-form Raft consensus core.
//!
//! Provides a replicated state machine over a cluster of named peers:
//! clients submit commands to the leader, the leader orders and
//! durably appends them to the log, and the log is replicated to and
//! applied by every follower.
//!
//! The crate supplies the consensus core only. The pieces that touch
//! the outside world are injected:
//!
//! - **Transport** — outbound peer calls go through the [`Transport`]
//!   trait; inbound requests are plain calls on [`Server`] handlers.
//!   [`InMemoryTransport`] wires a whole cluster in-process for tests.
//! - **Commands** — hosts register command factories on the
//!   [`Server`]; committed entries are decoded through the registry
//!   and applied in commit order on every member.
//! - **Durability** — each server owns one append-only log file of
//!   checksummed entry lines, written and fsynced before an append is
//!   acknowledged.
//!
//! ```ignore
//! let transport = Arc::new(InMemoryTransport::new());
//! let server = Server::new("1", dir.join("log"), RaftConfig::default(), transport.clone())?;
//! server.start()?;
//! server.join("1").await?;       // single-node bootstrap
//! let result = server.propose(&my_command).await?;
//! ```

pub mod command;
pub mod config;
pub mod election;
pub mod entry;
pub mod error;
pub mod log;
pub mod peer;
pub mod replication;
pub mod server;
pub mod transport;
pub mod types;

pub use command::{ApplyContext, Command, CommandFactory, CommandRegistry, JoinCommand};
pub use config::RaftConfig;
pub use entry::LogEntry;
pub use error::{RaftError, Result};
pub use log::Log;
pub use peer::Peer;
pub use server::Server;
pub use transport::{InMemoryTransport, Transport};
pub use types::{
    AppendEntriesRequest, AppendEntriesResponse, CommandFrame, LogIndex, NodeId,
    RequestVoteRequest, RequestVoteResponse, Role, Term,
};
