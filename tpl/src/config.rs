//! TPL2 client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default TPL2 server port
pub const TPL_DEFAULT_PORT: u16 = 65432;

/// Default number of commands kept in the registry
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Status and reply tokens the server uses to report progress.
///
/// Server firmware versions disagree on which token means what, so none of
/// these are hardcoded in the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolTokens {
    /// Status that marks a command as accepted (`ok = true`)
    pub accepted: String,
    /// Status that marks a command as finished (`complete = true`)
    pub finished: String,
    /// Status `succeeded()` compares against
    pub success: String,
    /// First token of an AUTH reply that grants access
    pub auth_accept: String,
}

impl Default for ProtocolTokens {
    fn default() -> Self {
        Self {
            accepted: "OK".to_string(),
            finished: "COMPLETE".to_string(),
            success: "COMPLETE".to_string(),
            auth_accept: "OK".to_string(),
        }
    }
}

/// Configuration for a TPL2 session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TplConfig {
    /// Server host name or address
    pub host: String,
    /// Server port (default: 65432)
    pub port: u16,
    /// User sent with `AUTH PLAIN`
    pub user: String,
    /// Password sent with `AUTH PLAIN`
    pub password: String,
    /// Timeout for the TCP connect and each handshake line (default: 60 seconds)
    pub connection_timeout_secs: u64,
    /// Interval the host is expected to call `tick()` at (default: 90 seconds)
    pub poll_frequency_secs: u64,
    /// Budget for one blocking `get`/`set` wait (default: 60 seconds)
    pub wait_timeout_secs: u64,
    /// Sleep between completion checks inside a wait (default: 500ms)
    pub wait_sleep_ms: u64,
    /// Maximum number of commands retained before oldest-first eviction
    pub history_limit: usize,
    /// Status/auth tokens
    pub tokens: ProtocolTokens,
}

impl Default for TplConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: TPL_DEFAULT_PORT,
            user: "admin".to_string(),
            password: "admin".to_string(),
            connection_timeout_secs: 60,
            poll_frequency_secs: 90,
            wait_timeout_secs: 60,
            wait_sleep_ms: 500,
            history_limit: DEFAULT_HISTORY_LIMIT,
            tokens: ProtocolTokens::default(),
        }
    }
}

impl TplConfig {
    /// Config pointing at `host:port` with every other option defaulted
    pub fn new(host: &str, port: Option<u16>) -> Self {
        Self {
            host: host.to_string(),
            port: port.unwrap_or(TPL_DEFAULT_PORT),
            ..Self::default()
        }
    }

    /// Set the credentials used for the handshake
    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_string();
        self.password = password.to_string();
        self
    }

    /// `host:port` address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the connection timeout as a Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get the poll frequency as a Duration
    pub fn poll_frequency(&self) -> Duration {
        Duration::from_secs(self.poll_frequency_secs)
    }

    /// Get the per-wait timeout as a Duration
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Get the wait-loop sleep as a Duration
    pub fn wait_sleep(&self) -> Duration {
        Duration::from_millis(self.wait_sleep_ms)
    }
}
