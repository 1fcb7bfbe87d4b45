//! Remote-server handle.

use tokio::task::JoinHandle;

use crate::types::{LogIndex, NodeId};

/// The leader's view of one remote server: its name, the highest log
/// index known replicated to it (the anchor for the next
/// AppendEntries), and the heartbeat task driving it while we lead.
pub struct Peer {
    name: NodeId,
    prev_log_index: LogIndex,
    heartbeat: Option<JoinHandle<()>>,
}

impl Peer {
    pub fn new(name: NodeId) -> Self {
        Self {
            name,
            prev_log_index: LogIndex::ZERO,
            heartbeat: None,
        }
    }

    pub fn name(&self) -> &NodeId {
        &self.name
    }

    pub fn prev_log_index(&self) -> LogIndex {
        self.prev_log_index
    }

    pub(crate) fn set_prev_log_index(&mut self, index: LogIndex) {
        self.prev_log_index = index;
    }

    /// Backtrack the anchor by one after a rejected AppendEntries,
    /// bounded at zero.
    pub(crate) fn backtrack(&mut self) {
        self.prev_log_index = self.prev_log_index.prev().unwrap_or(LogIndex::ZERO);
    }

    pub(crate) fn set_heartbeat(&mut self, handle: JoinHandle<()>) {
        self.heartbeat = Some(handle);
    }

    pub(crate) fn take_heartbeat(&mut self) -> Option<JoinHandle<()>> {
        self.heartbeat.take()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("prev_log_index", &self.prev_log_index)
            .field("heartbeat", &self.heartbeat.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backtrack_bounded_at_zero() {
        let mut peer = Peer::new(NodeId::new("2"));
        peer.set_prev_log_index(LogIndex(2));
        peer.backtrack();
        assert_eq!(peer.prev_log_index(), LogIndex(1));
        peer.backtrack();
        peer.backtrack();
        assert_eq!(peer.prev_log_index(), LogIndex::ZERO);
    }
}
