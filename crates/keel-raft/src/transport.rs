//! Transport abstraction: the three injected peer-call hooks.
//!
//! The consensus core never opens a socket. Outbound calls go through
//! a [`Transport`] the host injects, and inbound requests arrive as
//! plain calls on the server's handlers ([`crate::Server::request_vote`],
//! [`crate::Server::append_entries`], [`crate::Server::propose_frame`]).
//! That keeps the state machine unit-testable: an in-process transport
//! that routes hook calls straight into peer handlers is enough to
//! stand up a whole cluster (see [`InMemoryTransport`]).
//!
//! None of the hooks is ever invoked while the caller holds its server
//! mutex; implementations are free to block on real I/O.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{RaftError, Result};
use crate::server::Server;
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, CommandFrame, NodeId, RequestVoteRequest,
    RequestVoteResponse,
};

/// Outbound peer calls, injected by the host.
///
/// Handler-level denials travel back as [`RaftError`] values carrying
/// the responder's current term (`RaftError::current_term`), so the
/// caller sees both the boolean outcome and the term, as the message
/// shapes require.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a RequestVote to `target` and return its answer.
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Deliver an AppendEntries (replication batch or heartbeat) to
    /// `target` and return its answer.
    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Forward a client submission to `target` (used by followers to
    /// reach the leader). Resolves once the command commits there.
    async fn propose(&self, target: &NodeId, command: CommandFrame) -> Result<()>;
}

/// In-process transport for tests and single-process clusters.
///
/// Holds a roster of servers by name and routes each hook call
/// directly into the target's handler, exactly the way the test
/// harness composes hook functions. A stopped server answers every
/// call with `Stopped`, which is how partitions-by-shutdown behave in
/// the integration tests.
#[derive(Default)]
pub struct InMemoryTransport {
    servers: RwLock<HashMap<NodeId, Server>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server to the routing table.
    pub fn register(&self, server: Server) {
        self.servers.write().insert(server.name().clone(), server);
    }

    /// Remove a server from the routing table, simulating an
    /// unreachable peer.
    pub fn deregister(&self, name: &NodeId) {
        self.servers.write().remove(name);
    }

    fn lookup(&self, name: &NodeId) -> Result<Server> {
        self.servers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RaftError::Unreachable { peer: name.clone() })
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.lookup(target)?.request_vote(request)
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.lookup(target)?.append_entries(request)
    }

    async fn propose(&self, target: &NodeId, command: CommandFrame) -> Result<()> {
        self.lookup(target)?.propose_frame(command).await?;
        Ok(())
    }
}
