//! Leader election: the vote drive and the background election timer.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::random_election_timeout;
use crate::error::{RaftError, Result};
use crate::replication;
use crate::server::{self, ServerInner};
use crate::types::{NodeId, RequestVoteRequest, Role, Term};

/// Drive the server to leadership.
///
/// Each round: increment the term, vote for self, become Candidate,
/// and dispatch RequestVote to every peer concurrently. The count
/// includes the implicit self-vote. Outcomes per round:
///
/// - majority of grants before the randomized deadline → Leader;
/// - any response (or handler error) carrying a term above ours →
///   Follower at that term, returns `Ok(false)`;
/// - deadline first → a new round at term + 1.
pub(crate) async fn promote(inner: &Arc<ServerInner>) -> Result<bool> {
    let mut round = 0u32;
    loop {
        let (term, request, peers, timeout) = {
            let mut st = inner.state.lock();
            match st.role {
                Role::Stopped => return Err(RaftError::Stopped),
                Role::Leader => return Ok(true),
                // Demoted while a previous round was in flight.
                Role::Follower if round > 0 => return Ok(false),
                _ => {}
            }

            st.current_term = st.current_term.next();
            st.voted_for = Some(inner.name.clone());
            st.role = Role::Candidate;
            st.leader = None;
            st.last_event = std::time::Instant::now();

            let (last_log_index, last_log_term) = st
                .log
                .as_ref()
                .map(|l| l.last_info())
                .unwrap_or_default();
            let request = RequestVoteRequest {
                term: st.current_term,
                candidate_name: inner.name.clone(),
                last_log_index,
                last_log_term,
            };
            let peers: Vec<NodeId> = st.peers.keys().cloned().collect();
            let timeout = random_election_timeout(st.election_timeout);
            (st.current_term, request, peers, timeout)
        };

        tracing::info!(server = %inner.name, term = %term, round, "starting election");

        let member_count = peers.len() + 1;
        let quorum = member_count / 2 + 1;
        let mut votes = 1usize; // self

        if votes >= quorum {
            if become_leader(inner, term) {
                return Ok(true);
            }
            round += 1;
            continue;
        }

        let mut calls: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| {
                let transport = inner.transport.clone();
                let request = request.clone();
                async move {
                    let result = transport.request_vote(&peer, request).await;
                    (peer, result)
                }
            })
            .collect();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut won = false;

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                response = calls.next(), if !calls.is_empty() => {
                    let Some((peer, result)) = response else { continue };
                    match result {
                        Ok(resp) if resp.term > term => {
                            demote_to(inner, resp.term);
                            return Ok(false);
                        }
                        Ok(resp) if resp.vote_granted => {
                            votes += 1;
                            tracing::debug!(server = %inner.name, from = %peer, votes, "vote granted");
                            if votes >= quorum {
                                won = true;
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            if let Some(peer_term) = err.current_term() {
                                if peer_term > term {
                                    demote_to(inner, peer_term);
                                    return Ok(false);
                                }
                            }
                            tracing::debug!(server = %inner.name, from = %peer, error = %err, "vote denied");
                        }
                    }
                }
            }
        }

        if won && become_leader(inner, term) {
            return Ok(true);
        }
        round += 1;
    }
}

/// Take leadership for `term`, unless the candidacy was invalidated
/// while the votes were in flight.
fn become_leader(inner: &Arc<ServerInner>, term: Term) -> bool {
    let mut st = inner.state.lock();
    if st.role != Role::Candidate || st.current_term != term {
        return false;
    }

    st.role = Role::Leader;
    st.leader = Some(inner.name.clone());

    let (demote_tx, _) = broadcast::channel(4);
    st.demote_tx = Some(demote_tx.clone());

    let last_index = st
        .log
        .as_ref()
        .map(|l| l.last_index())
        .unwrap_or_default();
    let period = st.heartbeat_timeout;
    for (name, peer) in st.peers.iter_mut() {
        peer.set_prev_log_index(last_index);
        peer.set_heartbeat(replication::spawn_heartbeat(
            inner.clone(),
            name.clone(),
            demote_tx.subscribe(),
            period,
        ));
    }

    tracing::info!(server = %inner.name, term = %term, "became leader");
    true
}

fn demote_to(inner: &Arc<ServerInner>, term: Term) {
    let mut st = inner.state.lock();
    server::step_down(&mut st, term);
}

/// Background election timer, spawned by `start()`.
///
/// Sleeps a fresh randomized duration each cycle and promotes when
/// the timeout elapsed with no leader liveness (and no vote granted)
/// in the meantime. Single-member servers never self-elect; they
/// become leader through the bootstrap join.
pub(crate) async fn election_loop(inner: Arc<ServerInner>, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        let timeout = {
            let st = inner.state.lock();
            if st.role == Role::Stopped {
                return;
            }
            random_election_timeout(st.election_timeout)
        };

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = shutdown_rx.recv() => return,
        }

        let due = {
            let st = inner.state.lock();
            match st.role {
                Role::Stopped => return,
                Role::Leader => false,
                _ => {
                    // A timeout raised after this cycle's draw takes
                    // effect immediately.
                    let threshold = timeout.max(st.election_timeout);
                    !st.peers.is_empty() && st.last_event.elapsed() >= threshold
                }
            }
        };
        if !due {
            continue;
        }

        tokio::select! {
            result = promote(&inner) => {
                if let Err(err) = result {
                    tracing::debug!(server = %inner.name, error = %err, "election abandoned");
                    return;
                }
            }
            _ = shutdown_rx.recv() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftConfig;
    use crate::peer::Peer;
    use crate::server::Server;
    use crate::transport::InMemoryTransport;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Build a cluster wired through an in-process transport, with the
    /// full roster installed on every server.
    async fn test_cluster(names: &[&str]) -> (Vec<Server>, HashMap<String, Server>, Vec<TempDir>) {
        let transport = Arc::new(InMemoryTransport::new());
        let mut servers = Vec::new();
        let mut lookup = HashMap::new();
        let mut dirs = Vec::new();

        for name in names {
            let dir = TempDir::new().unwrap();
            let config = RaftConfig {
                election_timeout: Duration::from_millis(200),
                heartbeat_timeout: Duration::from_millis(40),
            };
            let server =
                Server::new(*name, dir.path().join("log"), config, transport.clone()).unwrap();
            server.start().unwrap();
            transport.register(server.clone());
            lookup.insert(name.to_string(), server.clone());
            servers.push(server);
            dirs.push(dir);
        }

        for server in &servers {
            let mut st = server.inner.state.lock();
            for name in names {
                let id = NodeId::new(*name);
                if id != server.inner.name {
                    st.peers.insert(id.clone(), Peer::new(id));
                }
            }
        }

        (servers, lookup, dirs)
    }

    #[tokio::test]
    async fn single_server_promotes_itself() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(InMemoryTransport::new());
        let server = Server::new(
            "1",
            dir.path().join("log"),
            RaftConfig::default(),
            transport,
        )
        .unwrap();
        server.start().unwrap();

        assert!(server.promote().await.unwrap());
        assert_eq!(server.role(), Role::Leader);
        server.stop().await;
    }

    #[tokio::test]
    async fn cluster_promotion() {
        let (servers, _lookup, _dirs) = test_cluster(&["1", "2", "3"]).await;
        let leader = &servers[0];

        assert!(leader.promote().await.unwrap());
        assert_eq!(leader.role(), Role::Leader);
        assert_eq!(leader.current_term(), Term(1));

        for server in &servers {
            server.stop().await;
        }
    }

    #[tokio::test]
    async fn double_election_when_votes_are_taken() {
        let (servers, lookup, _dirs) = test_cluster(&["1", "2", "3"]).await;

        // Servers 2 and 3 already voted for themselves in term 1, so
        // the first round splits; the retry at term 2 wins. Their own
        // election timers are pushed out so they sit out the retry
        // window.
        for name in ["2", "3"] {
            let server = &lookup[name];
            server.set_election_timeout(Duration::from_secs(60));
            let mut st = server.inner.state.lock();
            st.current_term = Term(1);
            st.voted_for = Some(NodeId::new(name));
        }

        let leader = &servers[0];
        assert!(leader.promote().await.unwrap());
        assert_eq!(leader.role(), Role::Leader);
        assert_eq!(leader.current_term(), Term(2));
        assert_eq!(lookup["2"].voted_for(), Some(NodeId::new("1")));
        assert_eq!(lookup["3"].voted_for(), Some(NodeId::new("1")));

        for server in &servers {
            server.stop().await;
        }
    }

    #[tokio::test]
    async fn promotion_aborts_on_higher_term() {
        let (servers, lookup, _dirs) = test_cluster(&["1", "2"]).await;

        lookup["2"].inner.state.lock().current_term = Term(10);

        let candidate = &servers[0];
        assert!(!candidate.promote().await.unwrap());
        assert_eq!(candidate.role(), Role::Follower);
        assert_eq!(candidate.current_term(), Term(10));

        for server in &servers {
            server.stop().await;
        }
    }
}
