//! Response parser for id-tagged TPL2 reply lines
//!
//! Every reply after the handshake starts with the id of the command it
//! belongs to. A line is classified in one pass into a [`Reply`]; the
//! dispatcher matches on it exhaustively.

use crate::protocol::{next_token, TYPE_SUFFIX};
use thiserror::Error;

/// A classified reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `<id> DATA INLINE <target>!TYPE=<tag>`
    TypeTag { id: u64, target: String, tag: String },
    /// `<id> DATA INLINE <target>=<value>`
    Data { id: u64, target: String, value: String },
    /// `<id> DATA OK <target>`
    DataOk { id: u64, target: String },
    /// `<id> COMMAND <status>`
    Status { id: u64, status: String },
    /// `<id> EVENT ERROR <target>:<message>`
    EventError {
        id: u64,
        target: String,
        message: String,
    },
}

impl Reply {
    /// Id of the command this line belongs to
    pub fn id(&self) -> u64 {
        match self {
            Reply::TypeTag { id, .. }
            | Reply::Data { id, .. }
            | Reply::DataOk { id, .. }
            | Reply::Status { id, .. }
            | Reply::EventError { id, .. } => *id,
        }
    }
}

/// Why a line could not be classified
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("line does not start with a command id: {0:?}")]
    MissingId(String),

    #[error("unrecognized reply: {0:?}")]
    Unrecognized(String),
}

/// Classify one line (terminator already removed)
pub fn parse_reply(line: &str) -> Result<Reply, ReplyError> {
    let (id_token, rest) =
        next_token(line).ok_or_else(|| ReplyError::MissingId(line.to_string()))?;
    let id = id_token
        .parse::<u64>()
        .map_err(|_| ReplyError::MissingId(line.to_string()))?;
    let unrecognized = || ReplyError::Unrecognized(line.to_string());

    let (kind, rest) = next_token(rest).ok_or_else(unrecognized)?;
    match kind {
        "DATA" => {
            let (sub, rest) = next_token(rest).ok_or_else(unrecognized)?;
            match sub {
                "INLINE" => {
                    let (target, value) = rest.split_once('=').ok_or_else(unrecognized)?;
                    let target = target.trim();
                    if target.is_empty() {
                        return Err(unrecognized());
                    }
                    match target.strip_suffix(TYPE_SUFFIX) {
                        Some(base) => Ok(Reply::TypeTag {
                            id,
                            target: base.to_string(),
                            tag: value.trim().to_string(),
                        }),
                        None => Ok(Reply::Data {
                            id,
                            target: target.to_string(),
                            value: value.trim().to_string(),
                        }),
                    }
                }
                "OK" => {
                    let (target, _) = next_token(rest).ok_or_else(unrecognized)?;
                    Ok(Reply::DataOk {
                        id,
                        target: target.to_string(),
                    })
                }
                _ => Err(unrecognized()),
            }
        }
        "COMMAND" => {
            let (status, _) = next_token(rest).ok_or_else(unrecognized)?;
            Ok(Reply::Status {
                id,
                status: status.to_string(),
            })
        }
        "EVENT" => {
            let (sub, rest) = next_token(rest).ok_or_else(unrecognized)?;
            if sub != "ERROR" {
                return Err(unrecognized());
            }
            // The object path is the first word up to its last ':'
            let (word, tail) = next_token(rest).ok_or_else(unrecognized)?;
            let (target, head) = word.rsplit_once(':').ok_or_else(unrecognized)?;
            let message = if tail.is_empty() {
                head.trim().to_string()
            } else {
                format!("{} {}", head, tail).trim().to_string()
            };
            Ok(Reply::EventError {
                id,
                target: target.to_string(),
                message,
            })
        }
        _ => Err(unrecognized()),
    }
}
