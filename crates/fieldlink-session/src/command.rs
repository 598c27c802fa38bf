//! Commands and the pending-acknowledgment set.
//!
//! A command is identified by name plus sequence number. Delivery is
//! at-least-once: the sender keeps every command in a
//! [`PendingCommandSet`] and retransmits the whole set on every send-cycle
//! tick until the peer's acknowledgment is observed (or the caller
//! withdraws the command). Redundant acknowledgments are accepted as the
//! cost of this scheme.

use bytes::Bytes;
use std::collections::HashMap;

// ─── Command ─────────────────────────────────────────────────────────────────

/// Identity of a command: name plus sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandKey {
    pub name: String,
    pub sequence: u32,
}

/// An application command.
///
/// `acknowledged` marks a command that is (or is being) acked;
/// `injected` marks a command that originated locally rather than over the
/// wire, so replies to it are delivered locally instead of transmitted.
#[derive(Debug, Clone)]
pub struct Command {
    name: String,
    sequence: u32,
    payload: Bytes,
    acknowledged: bool,
    injected: bool,
}

impl Command {
    pub fn new(name: impl Into<String>, sequence: u32, payload: Bytes) -> Self {
        Command {
            name: name.into(),
            sequence,
            payload,
            acknowledged: false,
            injected: false,
        }
    }

    pub fn key(&self) -> CommandKey {
        CommandKey {
            name: self.name.clone(),
            sequence: self.sequence,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn set_injected(&mut self, injected: bool) {
        self.injected = injected;
    }

    pub fn is_injected(&self) -> bool {
        self.injected
    }
}

// ─── Pending Set ─────────────────────────────────────────────────────────────

/// Commands awaiting acknowledgment.
///
/// Created when a connection's send cycle starts, trimmed per-command on
/// ack or withdrawal, cleared wholesale on client disconnect.
#[derive(Debug, Default)]
pub struct PendingCommandSet {
    commands: HashMap<CommandKey, Command>,
}

impl PendingCommandSet {
    pub fn new() -> Self {
        PendingCommandSet::default()
    }

    /// Add (or replace) a command awaiting acknowledgment.
    pub fn insert(&mut self, command: Command) {
        self.commands.insert(command.key(), command);
    }

    /// Withdraw a command; returns whether it was present.
    pub fn remove(&mut self, key: &CommandKey) -> bool {
        self.commands.remove(key).is_some()
    }

    pub fn contains(&self, key: &CommandKey) -> bool {
        self.commands.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Clone out everything pending, for one retransmission pass.
    /// No delivery-order guarantee between commands.
    pub fn snapshot(&self) -> Vec<Command> {
        self.commands.values().cloned().collect()
    }
}
