//! Commands and the command registry.
//!
//! Commands are the payloads of log entries: a short registered name
//! plus JSON bytes. The registry maps names to decode factories so a
//! server can rebuild a command from a replicated entry and apply it.
//! Factories are plain closures, which lets a host capture its state
//! machine handle directly:
//!
//! ```ignore
//! let store = Arc::new(Mutex::new(Store::default()));
//! server.register_command("kv:put", {
//!     let store = store.clone();
//!     Arc::new(move |payload| {
//!         let put: Put = serde_json::from_slice(payload)?;
//!         Ok(Box::new(PutCommand { store: store.clone(), put }))
//!     })
//! });
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::types::NodeId;

/// Name of the built-in membership-change command.
pub const JOIN_COMMAND: &str = "raft:join";

/// A client command carried through the replicated log.
pub trait Command: fmt::Debug + Send + Sync {
    /// Registered wire name.
    fn name(&self) -> &str;

    /// JSON payload stored in the log entry.
    fn payload(&self) -> Result<Bytes>;

    /// Apply the command once its entry commits. Runs on every server
    /// in commit order; the returned value is handed to the proposing
    /// client on the leader.
    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<Value>;
}

/// Context handed to [`Command::apply`].
///
/// Exposes the applying server's identity and the membership mutation
/// used by the built-in join command. Host state lives inside the
/// commands themselves (captured by their factories).
pub struct ApplyContext<'a> {
    server: &'a NodeId,
    joins: Vec<NodeId>,
}

impl<'a> ApplyContext<'a> {
    pub(crate) fn new(server: &'a NodeId) -> Self {
        Self {
            server,
            joins: Vec::new(),
        }
    }

    /// Name of the server applying the entry.
    pub fn server_name(&self) -> &NodeId {
        self.server
    }

    /// Request that `name` be added to the membership roster. The
    /// server enacts the change after the command returns; adding an
    /// existing member (or the server itself) is a no-op.
    pub fn add_member(&mut self, name: NodeId) {
        self.joins.push(name);
    }

    pub(crate) fn into_joins(self) -> Vec<NodeId> {
        self.joins
    }
}

/// Factory rebuilding a command from its stored payload.
pub type CommandFactory = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Command>> + Send + Sync>;

/// Registry of command factories, keyed by wire name.
pub struct CommandRegistry {
    factories: HashMap<String, CommandFactory>,
}

impl CommandRegistry {
    /// An empty registry with the built-in commands pre-registered.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(JOIN_COMMAND, Arc::new(|payload| {
            let cmd: JoinCommand = serde_json::from_slice(payload)?;
            Ok(Box::new(cmd) as Box<dyn Command>)
        }));
        registry
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, factory: CommandFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Rebuild a command from a stored `(name, payload)` pair.
    pub fn decode(&self, name: &str, payload: &[u8]) -> Result<Box<dyn Command>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RaftError::UnknownCommand {
                name: name.to_string(),
            })?;
        factory(payload)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in membership-change command: adds the named server to the
/// roster of every server that commits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCommand {
    pub name: NodeId,
}

impl Command for JoinCommand {
    fn name(&self) -> &str {
        JOIN_COMMAND
    }

    fn payload(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<Value> {
        ctx.add_member(self.name.clone());
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        val: String,
    }

    impl Command for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn payload(&self) -> Result<Bytes> {
            Ok(serde_json::to_vec(self)?.into())
        }

        fn apply(&self, _ctx: &mut ApplyContext<'_>) -> Result<Value> {
            Ok(Value::String(self.val.clone()))
        }
    }

    #[test]
    fn register_and_decode() {
        let mut registry = CommandRegistry::new();
        registry.register(
            "echo",
            Arc::new(|payload| {
                let cmd: Echo = serde_json::from_slice(payload)?;
                Ok(Box::new(cmd) as Box<dyn Command>)
            }),
        );

        let original = Echo {
            val: "hello".to_string(),
        };
        let payload = original.payload().unwrap();
        let decoded = registry.decode("echo", &payload).unwrap();

        let server = NodeId::new("1");
        let mut ctx = ApplyContext::new(&server);
        assert_eq!(
            decoded.apply(&mut ctx).unwrap(),
            Value::String("hello".to_string())
        );
    }

    #[test]
    fn unknown_command_rejected() {
        let registry = CommandRegistry::new();
        let err = registry.decode("nope", b"{}").unwrap_err();
        assert_eq!(err.to_string(), "Unknown command: nope");
    }

    #[test]
    fn join_command_round_trip() {
        let registry = CommandRegistry::new();
        let cmd = JoinCommand {
            name: NodeId::new("2"),
        };
        let payload = cmd.payload().unwrap();
        let decoded = registry.decode(JOIN_COMMAND, &payload).unwrap();

        let server = NodeId::new("1");
        let mut ctx = ApplyContext::new(&server);
        decoded.apply(&mut ctx).unwrap();
        assert_eq!(ctx.into_joins(), vec![NodeId::new("2")]);
    }
}
