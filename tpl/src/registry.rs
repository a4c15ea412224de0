//! Command registry and dispatcher
//!
//! The registry owns id allocation and the id → [`Command`] map. The
//! dispatcher half applies parsed reply lines to the matching command in
//! stream order and enforces the bounded history.
//!
//! Ids are allocated from a single counter and never reused, so ascending id
//! order is also age order; eviction pops from the low end of a `BTreeMap`.

use crate::command::{Command, ValueType, Verb};
use crate::config::ProtocolTokens;
use crate::reply::{parse_reply, Reply};
use std::collections::BTreeMap;

/// What applying one line did, for event fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// State of the command changed, nothing terminal happened
    Updated(u64),
    /// Command just saw its finished token
    Completed(u64),
    /// Payload could not be decoded; command is now terminal
    Failed { id: u64, reason: String },
    /// Error event recorded against the command
    EventError {
        id: u64,
        target: String,
        message: String,
    },
    /// Line did not parse, or belongs to no live command
    Discarded,
}

#[derive(Debug)]
pub struct CommandRegistry {
    commands: BTreeMap<u64, Command>,
    next_id: u64,
    history_limit: usize,
    tokens: ProtocolTokens,
}

impl CommandRegistry {
    pub fn new(history_limit: usize, tokens: ProtocolTokens) -> Self {
        Self {
            commands: BTreeMap::new(),
            next_id: 1,
            history_limit: history_limit.max(1),
            tokens,
        }
    }

    pub fn tokens(&self) -> &ProtocolTokens {
        &self.tokens
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Reserve the next id; never blocks, never fails
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Allocate an id and record a fresh command under it
    pub fn register(&mut self, verb: Verb, target: &str) -> u64 {
        let id = self.allocate_id();
        self.commands.insert(id, Command::new(id, verb, target));
        id
    }

    pub fn get(&self, id: u64) -> Option<&Command> {
        self.commands.get(&id)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of commands still waiting for their finished token
    pub fn pending_count(&self) -> usize {
        self.commands.values().filter(|c| !c.complete()).count()
    }

    pub fn is_over_limit(&self) -> bool {
        self.commands.len() > self.history_limit
    }

    /// Ids currently held, oldest first
    pub fn ids(&self) -> Vec<u64> {
        self.commands.keys().copied().collect()
    }

    /// Parse and apply one reply line
    pub fn apply_line(&mut self, line: &str) -> LineOutcome {
        match parse_reply(line) {
            Ok(reply) => self.apply(reply, line),
            Err(e) => {
                tracing::warn!("Discarding TPL2 line: {}", e);
                LineOutcome::Discarded
            }
        }
    }

    /// Apply a classified reply to its command
    pub fn apply(&mut self, reply: Reply, line: &str) -> LineOutcome {
        let id = reply.id();
        let Some(cmd) = self.commands.get_mut(&id) else {
            tracing::warn!("Discarding TPL2 line for unknown command {}: {:?}", id, line);
            return LineOutcome::Discarded;
        };
        if cmd.is_failed() {
            tracing::debug!("Ignoring line for failed command {}: {:?}", id, line);
            return LineOutcome::Discarded;
        }
        cmd.record_raw(line);

        match reply {
            Reply::TypeTag { tag, .. } => {
                cmd.set_value_type(ValueType::from_tag(&tag));
                LineOutcome::Updated(id)
            }
            // Data is accepted after completion too; bursts can straddle the status
            Reply::Data { target, value, .. } => match cmd.push_raw_value(&value) {
                Ok(()) => LineOutcome::Updated(id),
                Err(reason) => {
                    tracing::warn!(
                        "Command {} ({}): decode failed, marking failed: {}",
                        id,
                        target,
                        reason
                    );
                    cmd.mark_failed(reason.clone());
                    LineOutcome::Failed { id, reason }
                }
            },
            Reply::DataOk { .. } => LineOutcome::Updated(id),
            Reply::Status { status, .. } => {
                if cmd.record_status(&status, &self.tokens) {
                    tracing::debug!("Command {} ({}) complete", id, cmd.target());
                    LineOutcome::Completed(id)
                } else {
                    LineOutcome::Updated(id)
                }
            }
            Reply::EventError {
                target, message, ..
            } => {
                tracing::debug!("Command {} error event on {}: {}", id, target, message);
                cmd.push_event(&target, &message);
                LineOutcome::EventError {
                    id,
                    target,
                    message,
                }
            }
        }
    }

    /// Drop oldest commands until within the history limit; returns evicted ids
    pub fn evict_overflow(&mut self) -> Vec<u64> {
        let mut evicted = Vec::new();
        while self.commands.len() > self.history_limit {
            match self.commands.pop_first() {
                Some((id, cmd)) => {
                    if !cmd.complete() {
                        tracing::debug!("Evicting incomplete command {} ({})", id, cmd.target());
                    }
                    evicted.push(id);
                }
                None => break,
            }
        }
        evicted
    }
}
