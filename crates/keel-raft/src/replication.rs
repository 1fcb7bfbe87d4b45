//! Log replication: per-peer heartbeat tasks and leader-side commit
//! advancement.
//!
//! Every peer gets its own task so a slow follower never stalls
//! replication to the rest. A task ticks at the heartbeat period,
//! builds the AppendEntries for its peer under the server mutex,
//! releases the mutex for the call, and reacquires it to record the
//! outcome:
//!
//! - response (or handler error) with a term above ours → step down,
//!   which tears down every heartbeat task;
//! - consistency rejection → backtrack the peer's anchor by one and
//!   retry on the next tick;
//! - success → move the anchor to the last index that was sent, then
//!   try to advance the commit index.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::server::{self, ServerInner, ServerState};
use crate::types::{AppendEntriesRequest, AppendEntriesResponse, LogIndex, NodeId, Role};

/// Spawn the heartbeat task for `peer`. The task runs until the
/// leadership broadcast fires, the peer disappears from the roster,
/// or this server stops leading.
pub(crate) fn spawn_heartbeat(
    inner: Arc<ServerInner>,
    peer: NodeId,
    demote_rx: broadcast::Receiver<()>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(heartbeat_loop(inner, peer, demote_rx, period))
}

async fn heartbeat_loop(
    inner: Arc<ServerInner>,
    peer: NodeId,
    mut demote_rx: broadcast::Receiver<()>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = demote_rx.recv() => break,
        }

        let Some((request, sent_through)) = build_request(&inner, &peer) else {
            break;
        };
        let result = inner.transport.append_entries(&peer, request).await;
        if !record_outcome(&inner, &peer, result, sent_through) {
            break;
        }
    }
    tracing::debug!(server = %inner.name, peer = %peer, "heartbeat task exiting");
}

/// Build the next AppendEntries for `peer` under the mutex. Returns
/// `None` once this server no longer leads or the peer left the
/// roster. The second element is the last log index covered by the
/// request, which becomes the peer's anchor on success.
fn build_request(
    inner: &Arc<ServerInner>,
    peer: &NodeId,
) -> Option<(AppendEntriesRequest, LogIndex)> {
    let st = inner.state.lock();
    if st.role != Role::Leader {
        return None;
    }
    let peer = st.peers.get(peer)?;
    let log = st.log.as_ref()?;

    let prev_log_index = peer.prev_log_index();
    let prev_log_term = log.term_at(prev_log_index).unwrap_or_default();
    let request = AppendEntriesRequest {
        term: st.current_term,
        leader_name: inner.name.clone(),
        prev_log_index,
        prev_log_term,
        entries: log.entries_after(prev_log_index),
        leader_commit: log.commit_index(),
    };
    Some((request, log.last_index()))
}

/// Record one replication outcome. Returns false when the task should
/// stop (demotion or lost leadership).
fn record_outcome(
    inner: &Arc<ServerInner>,
    peer: &NodeId,
    result: Result<AppendEntriesResponse>,
    sent_through: LogIndex,
) -> bool {
    let mut st = inner.state.lock();
    if st.role != Role::Leader {
        return false;
    }

    match result {
        Ok(response) if response.term > st.current_term => {
            server::step_down(&mut st, response.term);
            false
        }
        Ok(response) if response.success => {
            if let Some(p) = st.peers.get_mut(peer) {
                p.set_prev_log_index(sent_through);
            }
            advance_commit(inner, &mut st);
            true
        }
        Ok(_) => {
            // Rejected without an error: backtrack and retry.
            if let Some(p) = st.peers.get_mut(peer) {
                p.backtrack();
            }
            true
        }
        Err(err) => {
            if let Some(peer_term) = err.current_term() {
                if peer_term > st.current_term {
                    server::step_down(&mut st, peer_term);
                    return false;
                }
            }
            if err.is_consistency() {
                tracing::debug!(server = %inner.name, peer = %peer, error = %err, "log mismatch, backtracking");
                if let Some(p) = st.peers.get_mut(peer) {
                    p.backtrack();
                }
            } else {
                tracing::debug!(server = %inner.name, peer = %peer, error = %err, "replication attempt failed");
            }
            true
        }
    }
}

/// Advance the leader's commit index.
///
/// Finds the highest index N such that a majority of the cluster
/// (self included) has replicated through N and `log[N].term` is the
/// current term — the Raft rule against committing prior-term entries
/// by counting — then commits and applies through N.
pub(crate) fn advance_commit(inner: &Arc<ServerInner>, st: &mut ServerState) {
    if st.role != Role::Leader {
        return;
    }

    let target = {
        let Some(log) = st.log.as_ref() else {
            return;
        };
        let committed = log.commit_index();
        let mut indices: Vec<LogIndex> =
            st.peers.values().map(|p| p.prev_log_index()).collect();
        indices.push(log.last_index());
        let quorum = indices.len() / 2 + 1;

        let mut candidates: Vec<LogIndex> = indices
            .iter()
            .copied()
            .filter(|&i| i > committed)
            .collect();
        candidates.sort_unstable_by(|a, b| b.cmp(a));
        candidates.dedup();

        let term = st.current_term;
        candidates.into_iter().find(|&n| {
            indices.iter().filter(|&&i| i >= n).count() >= quorum
                && log.term_at(n) == Some(term)
        })
    };

    if let Some(n) = target {
        tracing::debug!(server = %inner.name, through = %n, "advancing commit index");
        server::apply_committed(inner, st, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftConfig;
    use crate::entry::LogEntry;
    use crate::peer::Peer;
    use crate::server::Server;
    use crate::transport::InMemoryTransport;
    use crate::types::Term;
    use tempfile::TempDir;

    /// Leader with a synthetic roster; no heartbeat tasks are started
    /// so the tests can steer `prev_log_index` by hand.
    fn synthetic_leader(peers: &[(&str, u64)]) -> (Server, TempDir) {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(InMemoryTransport::new());
        let server = Server::new(
            "1",
            dir.path().join("log"),
            RaftConfig::default(),
            transport,
        )
        .unwrap();

        {
            let mut st = server.inner.state.lock();
            let log = crate::log::Log::open(dir.path().join("log"), |_| {}).unwrap();
            st.log = Some(log);
            st.role = Role::Leader;
            st.current_term = Term(1);
            for (name, matched) in peers {
                let mut peer = Peer::new(NodeId::new(*name));
                peer.set_prev_log_index(LogIndex(*matched));
                st.peers.insert(NodeId::new(*name), peer);
            }
        }
        (server, dir)
    }

    fn append(server: &Server, index: u64, term: u64) {
        let mut st = server.inner.state.lock();
        st.log
            .as_mut()
            .unwrap()
            .append(LogEntry::new(
                LogIndex(index),
                Term(term),
                "raft:join",
                format!("{{\"name\":\"n{index}\"}}").into_bytes(),
            ))
            .unwrap();
    }

    #[test]
    fn commit_advances_to_majority_point() {
        let (server, _dir) = synthetic_leader(&[("2", 3), ("3", 3)]);
        for i in 1..=5 {
            append(&server, i, 1);
        }

        let mut st = server.inner.state.lock();
        advance_commit(&server.inner, &mut st);
        assert_eq!(st.log.as_ref().unwrap().commit_index(), LogIndex(3));
    }

    #[test]
    fn commit_needs_majority() {
        let (server, _dir) = synthetic_leader(&[("2", 1), ("3", 0)]);
        for i in 1..=5 {
            append(&server, i, 1);
        }

        let mut st = server.inner.state.lock();
        advance_commit(&server.inner, &mut st);
        // Leader (5) + peer 2 (1) is a majority only through 1.
        assert_eq!(st.log.as_ref().unwrap().commit_index(), LogIndex(1));
    }

    #[test]
    fn prior_term_entries_not_committed_by_counting() {
        let (server, _dir) = synthetic_leader(&[("2", 2), ("3", 2)]);
        append(&server, 1, 1);
        append(&server, 2, 1);
        server.inner.state.lock().current_term = Term(2);

        let mut st = server.inner.state.lock();
        advance_commit(&server.inner, &mut st);
        // Entries are from term 1 but we lead term 2: counting alone
        // must not commit them.
        assert_eq!(st.log.as_ref().unwrap().commit_index(), LogIndex::ZERO);
    }
}
