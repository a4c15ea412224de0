//! TPL2 Protocol Client
//!
//! Client engine for the line-oriented TPL2 control protocol spoken by
//! Astelco telescope, dome and focuser servers. One [`TplClient`] is shared by
//! every driver talking to the same server.
//!
//! ## Features
//!
//! - Greeting and `AUTH PLAIN` handshake with session details
//! - GET / SET / binary SET with monotonically increasing command ids
//! - Non-blocking dispatcher with split-line buffering
//! - Type-tagged value decoding (integer, float, text)
//! - Bounded command history with oldest-first eviction
//! - One transparent reconnect-and-retry on write failure
//! - Configurable status tokens for server variants

mod client;
mod command;
mod config;
mod connection;
mod error;
pub mod protocol;
mod registry;
mod reply;
mod tokenizer;

pub use client::{TplClient, TplEvent, WaitOutcome};
pub use command::{Command, CommandEvent, CommandSnapshot, TplValue, ValueType, Verb};
pub use config::{ProtocolTokens, TplConfig, DEFAULT_HISTORY_LIMIT, TPL_DEFAULT_PORT};
pub use connection::{BoxedReader, BoxedWriter, Connector, SessionInfo, TcpConnector};
pub use error::{TplError, TplResult};
pub use protocol::objects;
pub use registry::{CommandRegistry, LineOutcome};
pub use reply::{parse_reply, Reply, ReplyError};
pub use tokenizer::LineTokenizer;
