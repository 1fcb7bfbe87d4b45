//! The Raft server: role state machine, request handlers, client
//! submission, and membership bootstrap.
//!
//! # Locking discipline
//!
//! All mutable server state — term, vote, role, peers, the log and its
//! file — lives behind one mutex, held for the duration of each
//! top-level handler. Outbound hook calls (votes, replication, propose
//! forwarding) are made with the mutex released and the lock is
//! reacquired to record their results. A `propose` caller waits for
//! its entry to commit on a oneshot channel, outside the lock.
//!
//! # Roles
//!
//! ```text
//! Stopped → Follower        start()
//! Follower → Candidate      election timeout without leader liveness
//! Candidate → Leader        majority of votes for the current term
//! Candidate → Candidate     timeout; term + 1, re-vote self
//! Candidate → Follower      higher term seen, or AppendEntries with term >= own
//! Leader → Follower         higher term seen
//! any → Stopped             stop()
//! ```

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};

use crate::command::{ApplyContext, Command, CommandFactory, CommandRegistry, JoinCommand};
use crate::config::RaftConfig;
use crate::election;
use crate::entry::LogEntry;
use crate::error::{RaftError, Result};
use crate::log::Log;
use crate::peer::Peer;
use crate::replication;
use crate::transport::Transport;
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, CommandFrame, LogIndex, NodeId, RequestVoteRequest,
    RequestVoteResponse, Role, Term,
};

/// A single member of a Raft cluster.
///
/// Cheap to clone; all clones share the same underlying server.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) name: NodeId,
    pub(crate) path: PathBuf,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: RwLock<CommandRegistry>,
    pub(crate) state: Mutex<ServerState>,
    /// Signals the background election loop to exit on `stop()`.
    pub(crate) shutdown_tx: broadcast::Sender<()>,
}

pub(crate) struct ServerState {
    pub(crate) role: Role,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    /// Last known leader, recorded from valid AppendEntries.
    pub(crate) leader: Option<NodeId>,
    /// Open while the server runs; `None` before start and after stop.
    pub(crate) log: Option<Log>,
    /// Membership roster, excluding this server.
    pub(crate) peers: HashMap<NodeId, Peer>,
    pub(crate) election_timeout: Duration,
    pub(crate) heartbeat_timeout: Duration,
    /// Baseline for the election timer: the last event proving leader
    /// liveness or a granted vote.
    pub(crate) last_event: Instant,
    /// Commit waiters registered by `propose`, keyed by entry index.
    pub(crate) pending: HashMap<LogIndex, oneshot::Sender<Result<Value>>>,
    /// Broadcast tearing down the heartbeat tasks of the current
    /// leadership; `Some` only while leading.
    pub(crate) demote_tx: Option<broadcast::Sender<()>>,
}

impl Server {
    /// Create a stopped server.
    ///
    /// `path` is the durable log file; it is opened (and replayed) by
    /// [`Server::start`].
    pub fn new(
        name: impl Into<NodeId>,
        path: impl Into<PathBuf>,
        config: RaftConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Self {
            inner: Arc::new(ServerInner {
                name: name.into(),
                path: path.into(),
                transport,
                registry: RwLock::new(CommandRegistry::new()),
                state: Mutex::new(ServerState {
                    role: Role::Stopped,
                    current_term: Term::ZERO,
                    voted_for: None,
                    leader: None,
                    log: None,
                    peers: HashMap::new(),
                    election_timeout: config.election_timeout,
                    heartbeat_timeout: config.heartbeat_timeout,
                    last_event: Instant::now(),
                    pending: HashMap::new(),
                    demote_tx: None,
                }),
                shutdown_tx,
            }),
        })
    }

    pub fn name(&self) -> &NodeId {
        &self.inner.name
    }

    pub fn role(&self) -> Role {
        self.inner.state.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.inner.state.lock().current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.inner.state.lock().voted_for.clone()
    }

    /// Last known leader, if any.
    pub fn leader(&self) -> Option<NodeId> {
        self.inner.state.lock().leader.clone()
    }

    /// Number of servers in the membership roster, counting self.
    pub fn member_count(&self) -> usize {
        self.inner.state.lock().peers.len() + 1
    }

    /// `(index, term)` of the last log entry.
    pub fn last_info(&self) -> (LogIndex, Term) {
        self.inner
            .state
            .lock()
            .log
            .as_ref()
            .map(|l| l.last_info())
            .unwrap_or_default()
    }

    /// `(index, term)` at the commit point.
    pub fn commit_info(&self) -> (LogIndex, Term) {
        self.inner
            .state
            .lock()
            .log
            .as_ref()
            .map(|l| l.commit_info())
            .unwrap_or_default()
    }

    /// Register a command factory under `name`. Must cover every
    /// command name that can appear in the log before `start()`
    /// replays it.
    pub fn register_command(&self, name: impl Into<String>, factory: CommandFactory) {
        self.inner.registry.write().register(name, factory);
    }

    /// Override the base election timeout. Takes effect on the next
    /// timer reset.
    pub fn set_election_timeout(&self, timeout: Duration) {
        self.inner.state.lock().election_timeout = timeout;
    }

    /// Override the heartbeat period. Takes effect on the next
    /// promotion.
    pub fn set_heartbeat_timeout(&self, timeout: Duration) {
        self.inner.state.lock().heartbeat_timeout = timeout;
    }

    /// Start the server: replay the durable log, become Follower, and
    /// spawn the background election loop.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`RaftError::Corrupt`] if the log does not validate, and with
    /// [`RaftError::UnknownCommand`] if the log holds a command no
    /// factory covers.
    pub fn start(&self) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.role != Role::Stopped {
            return Err(RaftError::AlreadyRunning);
        }

        // Replay the durable log: every entry was committed when it
        // was persisted, so applying rebuilds membership and the host
        // state machine.
        let registry = &self.inner.registry;
        let name = &self.inner.name;
        let mut members: Vec<NodeId> = Vec::new();
        let mut replay_err: Option<RaftError> = None;
        let log = Log::open(&self.inner.path, |entry| {
            match registry.read().decode(&entry.name, &entry.payload) {
                Ok(cmd) => {
                    let mut ctx = ApplyContext::new(name);
                    if let Err(err) = cmd.apply(&mut ctx) {
                        tracing::warn!(
                            server = %name,
                            index = %entry.index,
                            command = %entry.name,
                            error = %err,
                            "replayed entry failed to apply"
                        );
                    }
                    members.extend(ctx.into_joins());
                }
                Err(err) => {
                    if replay_err.is_none() {
                        replay_err = Some(err);
                    }
                }
            }
        })?;
        if let Some(err) = replay_err {
            return Err(err);
        }

        st.peers.clear();
        for member in members {
            if member != self.inner.name {
                st.peers
                    .entry(member.clone())
                    .or_insert_with(|| Peer::new(member));
            }
        }

        tracing::info!(
            server = %self.inner.name,
            path = %log.path().display(),
            last = %log.last_index(),
            members = st.peers.len() + 1,
            "server starting"
        );

        st.log = Some(log);
        st.role = Role::Follower;
        st.leader = None;
        st.last_event = Instant::now();
        drop(st);

        tokio::spawn(election::election_loop(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        ));
        Ok(())
    }

    /// Stop the server: demote, cancel the timers, join every
    /// heartbeat task, and fail outstanding propose waiters.
    /// Handlers invoked afterwards fail with [`RaftError::Stopped`].
    pub async fn stop(&self) {
        let (demote_tx, handles, waiters) = {
            let mut st = self.inner.state.lock();
            if st.role == Role::Stopped {
                return;
            }
            st.role = Role::Stopped;
            st.leader = None;
            let demote_tx = st.demote_tx.take();
            let handles: Vec<_> = st
                .peers
                .values_mut()
                .filter_map(|p| p.take_heartbeat())
                .collect();
            let waiters: Vec<_> = st.pending.drain().map(|(_, tx)| tx).collect();
            (demote_tx, handles, waiters)
        };

        let _ = self.inner.shutdown_tx.send(());
        if let Some(tx) = demote_tx {
            let _ = tx.send(());
        }
        for tx in waiters {
            let _ = tx.send(Err(RaftError::Stopped));
        }
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(server = %self.inner.name, "server stopped");
    }

    /// Handle a RequestVote RPC.
    ///
    /// Checks run in order; the first failure wins and is returned as
    /// a typed error carrying this server's current term.
    pub fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let mut st = self.inner.state.lock();
        if st.role == Role::Stopped {
            return Err(RaftError::Stopped);
        }

        if request.term < st.current_term {
            return Err(RaftError::StaleTerm {
                request: request.term,
                current: st.current_term,
            });
        }

        if request.term > st.current_term {
            step_down(&mut st, request.term);
        }

        if let Some(voted_for) = &st.voted_for {
            if *voted_for != request.candidate_name {
                return Err(RaftError::AlreadyVoted {
                    candidate: voted_for.clone(),
                    current: st.current_term,
                });
            }
        }

        let (last_index, last_term) = st
            .log
            .as_ref()
            .map(|l| l.last_info())
            .unwrap_or_default();
        let candidate_behind = last_term > request.last_log_term
            || (last_term == request.last_log_term && last_index > request.last_log_index);
        if candidate_behind {
            return Err(RaftError::OutOfDateLog {
                last_index,
                last_term,
                candidate_index: request.last_log_index,
                candidate_term: request.last_log_term,
                current: st.current_term,
            });
        }

        tracing::debug!(
            server = %self.inner.name,
            candidate = %request.candidate_name,
            term = %st.current_term,
            "granting vote"
        );
        st.voted_for = Some(request.candidate_name);
        st.last_event = Instant::now();
        Ok(RequestVoteResponse {
            term: st.current_term,
            vote_granted: true,
        })
    }

    /// Handle an AppendEntries RPC (replication batch or heartbeat).
    pub fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let mut st = self.inner.state.lock();
        if st.role == Role::Stopped {
            return Err(RaftError::Stopped);
        }

        if request.term < st.current_term {
            return Err(RaftError::StaleRequestTerm {
                request: request.term,
                current: st.current_term,
            });
        }

        if request.term > st.current_term {
            step_down(&mut st, request.term);
        } else if st.role != Role::Follower {
            // Same term: a candidate (or a leader that should not
            // exist this term) yields to the sender.
            demote(&mut st);
        }

        st.leader = Some(request.leader_name.clone());
        st.last_event = Instant::now();

        let log = st.log.as_mut().ok_or(RaftError::Stopped)?;
        log.append_batch_after(request.prev_log_index, request.prev_log_term, request.entries)?;

        apply_committed(&self.inner, &mut st, request.leader_commit);

        Ok(AppendEntriesResponse {
            term: st.current_term,
            success: true,
        })
    }

    /// Submit a command to the cluster.
    ///
    /// On the leader, the command is appended to the log and this call
    /// resolves with its apply result once the entry commits. On any
    /// other server it is forwarded to the known leader through the
    /// propose hook; with no known leader it fails with
    /// [`RaftError::NoLeader`].
    pub async fn propose(&self, command: &dyn Command) -> Result<Value> {
        let frame = CommandFrame {
            name: command.name().to_string(),
            payload: command.payload()?,
        };
        self.propose_frame(frame).await
    }

    /// Handler counterpart of the propose-forwarding hook: submit a
    /// command that arrived as a wire frame.
    pub async fn propose_frame(&self, frame: CommandFrame) -> Result<Value> {
        enum Route {
            Local(oneshot::Receiver<Result<Value>>),
            Forward(NodeId, CommandFrame),
        }

        let route = {
            let mut st = self.inner.state.lock();
            match st.role {
                Role::Stopped => return Err(RaftError::Stopped),
                Role::Leader => {
                    // Fail unknown commands before they reach the log.
                    self.inner.registry.read().decode(&frame.name, &frame.payload)?;

                    let term = st.current_term;
                    let log = st.log.as_mut().ok_or(RaftError::Stopped)?;
                    let index = log.last_index().next();
                    log.append(LogEntry::new(index, term, frame.name, frame.payload))?;

                    let (tx, rx) = oneshot::channel();
                    st.pending.insert(index, tx);

                    // A single-member cluster commits on its own vote.
                    replication::advance_commit(&self.inner, &mut st);
                    Route::Local(rx)
                }
                _ => match st.leader.clone() {
                    Some(leader) => Route::Forward(leader, frame),
                    None => return Err(RaftError::NoLeader),
                },
            }
        };

        match route {
            Route::Local(rx) => rx.await.map_err(|_| RaftError::Stopped)?,
            Route::Forward(leader, frame) => {
                self.inner.transport.propose(&leader, frame).await?;
                Ok(Value::Null)
            }
        }
    }

    /// Join the cluster through `contact`.
    ///
    /// Joining yourself with an empty roster bootstraps a single-node
    /// cluster: the server promotes itself and appends its own
    /// membership entry so servers joining later replay the full
    /// roster. Any other join is forwarded to the known leader (or to
    /// `contact` when no leader is known yet) and resolves once the
    /// membership entry commits.
    pub async fn join(&self, contact: impl Into<NodeId>) -> Result<()> {
        let contact = contact.into();
        let bootstrap = {
            let st = self.inner.state.lock();
            if st.role == Role::Stopped {
                return Err(RaftError::Stopped);
            }
            contact == self.inner.name && st.peers.is_empty()
        };

        let command = JoinCommand {
            name: self.inner.name.clone(),
        };

        if bootstrap {
            if !election::promote(&self.inner).await? {
                return Err(RaftError::NoLeader);
            }
            self.propose(&command).await?;
            return Ok(());
        }

        let destination = {
            let st = self.inner.state.lock();
            if st.role == Role::Leader {
                None
            } else {
                Some(st.leader.clone().unwrap_or(contact))
            }
        };
        match destination {
            None => {
                self.propose(&command).await?;
                Ok(())
            }
            Some(dest) => {
                let frame = CommandFrame {
                    name: command.name().to_string(),
                    payload: command.payload()?,
                };
                self.inner.transport.propose(&dest, frame).await
            }
        }
    }

    /// Drive this server to leadership: start an election and keep
    /// re-running it (term + 1 each round) until a majority votes for
    /// us, a higher term demotes us, or the server stops.
    ///
    /// Returns `Ok(true)` on promotion, `Ok(false)` on demotion.
    pub async fn promote(&self) -> Result<bool> {
        election::promote(&self.inner).await
    }
}

/// Adopt a higher term: record it, clear the vote, and fall back to
/// Follower (tearing down leadership if we held it).
pub(crate) fn step_down(st: &mut ServerState, term: Term) {
    if term > st.current_term {
        tracing::debug!(from = %st.current_term, to = %term, "adopting higher term");
        st.current_term = term;
        st.voted_for = None;
    }
    demote(st);
}

/// Fall back to Follower at the current term.
pub(crate) fn demote(st: &mut ServerState) {
    if st.role == Role::Leader {
        tracing::info!(term = %st.current_term, "leader stepping down");
        if let Some(tx) = st.demote_tx.take() {
            let _ = tx.send(());
        }
        for (_, waiter) in st.pending.drain() {
            let _ = waiter.send(Err(RaftError::NotLeader { leader: None }));
        }
    }
    if st.role != Role::Stopped {
        st.role = Role::Follower;
    }
    st.last_event = Instant::now();
}

/// Advance the commit index to `upto`, applying each newly committed
/// entry in order: decode through the registry, run the command, hand
/// the outcome to any waiting proposer, and enact membership changes.
pub(crate) fn apply_committed(inner: &Arc<ServerInner>, st: &mut ServerState, upto: LogIndex) {
    let ServerState {
        role,
        log,
        peers,
        pending,
        demote_tx,
        heartbeat_timeout,
        ..
    } = st;
    let Some(log) = log.as_mut() else {
        return;
    };

    let mut joins: Vec<NodeId> = Vec::new();
    log.commit_to(upto, |entry| {
        let outcome = inner
            .registry
            .read()
            .decode(&entry.name, &entry.payload)
            .and_then(|cmd| {
                let mut ctx = ApplyContext::new(&inner.name);
                let result = cmd.apply(&mut ctx);
                joins.extend(ctx.into_joins());
                result
            });
        if let Err(err) = &outcome {
            tracing::warn!(
                server = %inner.name,
                index = %entry.index,
                command = %entry.name,
                error = %err,
                "apply failed"
            );
        }
        if let Some(waiter) = pending.remove(&entry.index) {
            let _ = waiter.send(outcome);
        }
    });

    for member in joins {
        if member == inner.name || peers.contains_key(&member) {
            continue;
        }
        tracing::info!(server = %inner.name, peer = %member, "adding member");
        let mut peer = Peer::new(member.clone());
        if *role == Role::Leader {
            peer.set_prev_log_index(log.last_index());
            if let Some(demote_tx) = demote_tx.as_ref() {
                peer.set_heartbeat(replication::spawn_heartbeat(
                    inner.clone(),
                    member.clone(),
                    demote_tx.subscribe(),
                    *heartbeat_timeout,
                ));
            }
        }
        peers.insert(member, peer);
    }
}
