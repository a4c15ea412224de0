//! TPL2 client implementation
//!
//! [`TplClient`] is the single engine instance shared by every driver
//! talking to one telescope control server. It provides:
//! - Connection + `AUTH PLAIN` handshake
//! - GET/SET command submission with monotonically increasing ids
//! - A non-blocking `poll()` dispatcher and a `tick()` for the host's timer
//! - Blocking waits bounded by the configured timeout
//! - Bounded command history with oldest-first eviction
//! - Event broadcast for completions, failures and error events
//!
//! All access to the registry and the transport goes through one
//! `tokio::sync::Mutex`, held for a single transaction (allocate + send, or
//! one poll pass). Waiters release it between checks so that other drivers
//! and the periodic tick keep making progress.

use crate::command::{CommandSnapshot, TplValue, Verb};
use crate::config::TplConfig;
use crate::connection::{deadline_after, Connector, ConnectionManager, SessionInfo, TcpConnector};
use crate::error::{TplError, TplResult};
use crate::protocol;
use crate::registry::{CommandRegistry, LineOutcome};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, Instant};

/// Broadcast channel capacity for event subscribers
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// TPL2 client event
#[derive(Debug, Clone, PartialEq)]
pub enum TplEvent {
    /// Transport opened or lost
    ConnectionStateChanged(bool),
    /// Transport was replaced after a write failure
    Reconnected,
    /// Command saw its finished status
    CommandCompleted {
        id: u64,
        target: String,
        succeeded: bool,
    },
    /// Command payload could not be decoded
    CommandFailed {
        id: u64,
        target: String,
        reason: String,
    },
    /// `EVENT ERROR` reported for a command
    EventError {
        id: u64,
        target: String,
        message: String,
    },
    /// Commands dropped by the history limit, oldest first
    CommandsEvicted(Vec<u64>),
}

/// How a blocking wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Predicate became true
    Completed,
    /// Deadline passed; the command is left untouched and may still finish
    TimedOut,
    /// Command was evicted (or never existed) while waiting
    Vanished,
}

/// Everything guarded by the engine lock
struct Session {
    manager: ConnectionManager,
    registry: CommandRegistry,
}

/// Body of an outgoing request
enum Payload<'a> {
    Get,
    Set(String),
    Binary(&'a [u8]),
}

/// TPL2 client for one telescope control server
pub struct TplClient {
    config: TplConfig,
    session: Mutex<Session>,
    event_tx: broadcast::Sender<TplEvent>,
}

impl TplClient {
    /// Create a new TPL2 client for `host:port` with default configuration
    pub fn new(host: &str, port: Option<u16>) -> Self {
        Self::with_config(TplConfig::new(host, port))
    }

    /// Create a new TPL2 client using a TCP transport
    pub fn with_config(config: TplConfig) -> Self {
        let connector = Arc::new(TcpConnector::from_config(&config));
        Self::with_connector(config, connector)
    }

    /// Create a new TPL2 client over a custom transport
    pub fn with_connector(config: TplConfig, connector: Arc<dyn Connector>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = CommandRegistry::new(config.history_limit, config.tokens.clone());
        let manager = ConnectionManager::new(connector, config.clone(), event_tx.clone());
        Self {
            config,
            session: Mutex::new(Session { manager, registry }),
            event_tx,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &TplConfig {
        &self.config
    }

    /// Subscribe to TPL2 events
    pub fn subscribe(&self) -> broadcast::Receiver<TplEvent> {
        self.event_tx.subscribe()
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Open the transport and read the greeting
    pub async fn connect(&self) -> TplResult<SessionInfo> {
        let mut session = self.session.lock().await;
        session.manager.connect().await.cloned()
    }

    /// Authenticate the open session
    pub async fn authenticate(&self, user: &str, password: &str) -> TplResult<()> {
        let mut session = self.session.lock().await;
        session.manager.authenticate(user, password).await
    }

    /// Connect and authenticate with the configured credentials
    pub async fn open(&self) -> TplResult<SessionInfo> {
        let mut session = self.session.lock().await;
        session.manager.connect().await?;
        session
            .manager
            .authenticate(&self.config.user, &self.config.password)
            .await?;
        session
            .manager
            .session_info()
            .cloned()
            .ok_or(TplError::NotConnected)
    }

    /// Close the transport; idempotent
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        session.manager.disconnect().await;
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        let mut session = self.session.lock().await;
        session.manager.is_connected()
    }

    /// Handshake details of the live session
    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.session.lock().await.manager.session_info().cloned()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Reserve the next command id without sending anything
    pub async fn allocate_id(&self) -> u64 {
        self.session.lock().await.registry.allocate_id()
    }

    /// Request the type tag and value of `target`
    ///
    /// With `wait`, blocks until the command completes or the configured
    /// timeout passes. The id is returned either way.
    pub async fn get(&self, target: &str, wait: bool) -> TplResult<u64> {
        self.submit(Verb::Get, target, Payload::Get, wait).await
    }

    /// Write `target=value`
    pub async fn set(&self, target: &str, value: impl fmt::Display, wait: bool) -> TplResult<u64> {
        self.submit(Verb::Set, target, Payload::Set(value.to_string()), wait)
            .await
    }

    /// Write a length-prefixed raw payload to `target`
    pub async fn set_binary(&self, target: &str, payload: &[u8], wait: bool) -> TplResult<u64> {
        self.submit(Verb::Set, target, Payload::Binary(payload), wait)
            .await
    }

    async fn submit(
        &self,
        verb: Verb,
        target: &str,
        payload: Payload<'_>,
        wait: bool,
    ) -> TplResult<u64> {
        let id = {
            let mut session = self.session.lock().await;
            if !session.manager.can_send() {
                return Err(TplError::NotConnected);
            }

            // The command exists before its bytes leave
            let id = session.registry.register(verb, target);
            let request = match payload {
                Payload::Get => protocol::get_request(id, target).into_bytes(),
                Payload::Set(value) => protocol::set_request(id, target, &value).into_bytes(),
                Payload::Binary(raw) => {
                    let mut buf = protocol::set_binary_header(id, target, raw.len()).into_bytes();
                    buf.extend_from_slice(raw);
                    buf
                }
            };
            tracing::debug!("-> {} {} {} ({} bytes)", id, verb, target, request.len());

            session.manager.write(&request).await.map_err(|e| match e {
                TplError::Io { message, .. } => TplError::Io {
                    id: Some(id),
                    message,
                },
                other => other,
            })?;
            id
        };

        if wait {
            self.wait_for(id, self.config.wait_timeout()).await;
        }
        Ok(id)
    }

    /// GET `target`, wait, and return its first decoded value
    ///
    /// `NoData` (completed, nothing delivered) and `WaitTimeout` (outcome
    /// unknown) are distinct errors.
    pub async fn get_value(&self, target: &str) -> TplResult<TplValue> {
        self.fetch_value(target).await.map(|(_, value)| value)
    }

    async fn fetch_value(&self, target: &str) -> TplResult<(u64, TplValue)> {
        let id = self.get(target, false).await?;
        let wait_timeout = self.config.wait_timeout();
        match self.wait_for(id, wait_timeout).await {
            WaitOutcome::Vanished => Err(TplError::UnknownCommand(id)),
            WaitOutcome::TimedOut => Err(TplError::WaitTimeout {
                id,
                target: target.to_string(),
                duration: wait_timeout,
            }),
            WaitOutcome::Completed => {
                let cmd = self.get_command(id).await?;
                if let Some(reason) = cmd.decode_error() {
                    return Err(TplError::Decode {
                        id,
                        target: target.to_string(),
                        message: reason.to_string(),
                    });
                }
                let value = cmd.values().first().cloned().ok_or_else(|| TplError::NoData {
                    id,
                    target: target.to_string(),
                })?;
                Ok((id, value))
            }
        }
    }

    /// `get_value` as an integer
    pub async fn get_int(&self, target: &str) -> TplResult<i64> {
        let (id, value) = self.fetch_value(target).await?;
        value.as_i64().ok_or_else(|| TplError::Decode {
            id,
            target: target.to_string(),
            message: format!("expected integer, got {:?}", value),
        })
    }

    /// `get_value` as a float; integers widen
    pub async fn get_float(&self, target: &str) -> TplResult<f64> {
        let (id, value) = self.fetch_value(target).await?;
        value.as_f64().ok_or_else(|| TplError::Decode {
            id,
            target: target.to_string(),
            message: format!("expected number, got {:?}", value),
        })
    }

    /// `get_value` rendered as text, whatever its type
    pub async fn get_text(&self, target: &str) -> TplResult<String> {
        Ok(self.get_value(target).await?.to_string())
    }

    /// Whether the command's status equals the success token
    pub async fn succeeded(&self, id: u64) -> TplResult<bool> {
        let session = self.session.lock().await;
        session
            .registry
            .get(id)
            .map(|cmd| cmd.succeeded(session.registry.tokens()))
            .ok_or(TplError::UnknownCommand(id))
    }

    /// Current snapshot of a command
    pub async fn get_command(&self, id: u64) -> TplResult<CommandSnapshot> {
        let session = self.session.lock().await;
        session
            .registry
            .get(id)
            .cloned()
            .ok_or(TplError::UnknownCommand(id))
    }

    /// Commands still waiting for their finished status
    pub async fn pending_count(&self) -> usize {
        self.session.lock().await.registry.pending_count()
    }

    /// Commands currently retained
    pub async fn history_len(&self) -> usize {
        self.session.lock().await.registry.len()
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Drain available input and apply it; never waits for the socket.
    /// Returns the number of lines processed.
    pub async fn poll(&self) -> usize {
        let mut session = self.session.lock().await;
        self.poll_locked(&mut session)
    }

    /// Periodic keep-alive: a poll pass, skipped when nothing is outstanding
    pub async fn tick(&self) -> usize {
        let mut session = self.session.lock().await;
        if session.registry.pending_count() == 0 && !session.registry.is_over_limit() {
            return 0;
        }
        self.poll_locked(&mut session)
    }

    fn poll_locked(&self, session: &mut Session) -> usize {
        let lines = session.manager.drain_lines();
        for line in &lines {
            tracing::trace!("<- {}", line);
            match session.registry.apply_line(line) {
                LineOutcome::Completed(id) => {
                    if let Some(cmd) = session.registry.get(id) {
                        let _ = self.event_tx.send(TplEvent::CommandCompleted {
                            id,
                            target: cmd.target().to_string(),
                            succeeded: cmd.succeeded(session.registry.tokens()),
                        });
                    }
                }
                LineOutcome::Failed { id, reason } => {
                    let target = session
                        .registry
                        .get(id)
                        .map(|c| c.target().to_string())
                        .unwrap_or_default();
                    let _ = self
                        .event_tx
                        .send(TplEvent::CommandFailed { id, target, reason });
                }
                LineOutcome::EventError {
                    id,
                    target,
                    message,
                } => {
                    let _ = self.event_tx.send(TplEvent::EventError {
                        id,
                        target,
                        message,
                    });
                }
                LineOutcome::Updated(_) | LineOutcome::Discarded => {}
            }
        }

        let evicted = session.registry.evict_overflow();
        if !evicted.is_empty() {
            tracing::debug!(
                "Evicted {} commands over history limit {}",
                evicted.len(),
                session.registry.history_limit()
            );
            let _ = self.event_tx.send(TplEvent::CommandsEvicted(evicted));
        }
        lines.len()
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Wait until the command completes
    pub async fn wait_for(&self, id: u64, timeout: Duration) -> WaitOutcome {
        self.wait_until(id, timeout, |cmd| cmd.complete()).await
    }

    /// Poll until `done` holds for the command or `timeout` passes
    ///
    /// The lock is released between checks. A timeout leaves the command
    /// exactly as it was.
    pub async fn wait_until<F>(&self, id: u64, timeout: Duration, mut done: F) -> WaitOutcome
    where
        F: FnMut(&CommandSnapshot) -> bool,
    {
        let deadline = deadline_after(timeout);
        let sleep_step = self.config.wait_sleep();

        loop {
            {
                let mut session = self.session.lock().await;
                self.poll_locked(&mut session);
                let Some(cmd) = session.registry.get(id) else {
                    tracing::warn!("Command {} vanished while waiting", id);
                    return WaitOutcome::Vanished;
                };
                if done(cmd) {
                    return WaitOutcome::Completed;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("Command {} timed out after {:?}", id, timeout);
                return WaitOutcome::TimedOut;
            }
            sleep(sleep_step.min(deadline - now)).await;
        }
    }
}

impl Default for TplClient {
    fn default() -> Self {
        Self::with_config(TplConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::approx_constant)]
mod tests {
    use super::*;
    use crate::connection::{BoxedReader, BoxedWriter};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const GREETING: &str = "TPL2 2.2 CONN 17 AUTH PLAIN ENC MESSAGE Welcome\n";

    /// Hands out pre-made in-memory streams, one per open()
    struct ScriptedConnector {
        streams: StdMutex<VecDeque<DuplexStream>>,
        opens: StdMutex<usize>,
    }

    impl ScriptedConnector {
        fn new(streams: Vec<DuplexStream>) -> Arc<Self> {
            Arc::new(Self {
                streams: StdMutex::new(streams.into()),
                opens: StdMutex::new(0),
            })
        }

        fn opens(&self) -> usize {
            *self.opens.lock().unwrap()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn open(&self) -> TplResult<(BoxedReader, BoxedWriter)> {
            *self.opens.lock().unwrap() += 1;
            let stream = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TplError::ConnectionFailed("no more streams".to_string()))?;
            let (r, w) = tokio::io::split(stream);
            Ok((Box::new(r), Box::new(w)))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Server end of a session, with the handshake already done
    struct ServerEnd {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl ServerEnd {
        async fn handshake(server: DuplexStream) -> Self {
            let (r, mut writer) = tokio::io::split(server);
            let mut lines = BufReader::new(r).lines();
            writer.write_all(GREETING.as_bytes()).await.unwrap();
            let auth = lines.next_line().await.unwrap().unwrap();
            assert_eq!(auth, "AUTH PLAIN \"admin\" \"admin\"");
            writer.write_all(b"AUTH OK 2 3\n").await.unwrap();
            Self { lines, writer }
        }

        async fn expect(&mut self) -> String {
            self.lines.next_line().await.unwrap().unwrap()
        }

        async fn send(&mut self, text: &str) {
            self.writer.write_all(text.as_bytes()).await.unwrap();
        }
    }

    fn test_config() -> TplConfig {
        TplConfig {
            wait_timeout_secs: 2,
            wait_sleep_ms: 5,
            ..TplConfig::default()
        }
    }

    async fn open_client(config: TplConfig) -> (Arc<TplClient>, ServerEnd) {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let connector = ScriptedConnector::new(vec![client_side]);
        let client = Arc::new(TplClient::with_connector(config, connector));
        let server = tokio::spawn(ServerEnd::handshake(server_side));
        client.open().await.unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_client_default_creation() {
        let client = TplClient::default();
        assert_eq!(client.config().host, "localhost");
        assert_eq!(client.config().port, crate::TPL_DEFAULT_PORT);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_send_without_connect_fails() {
        let client = TplClient::new("localhost", Some(65432));
        let result = client.get("SERVER.UPTIME", false).await;
        assert!(matches!(result, Err(TplError::NotConnected)));
        assert_eq!(client.history_len().await, 0);
    }

    #[tokio::test]
    async fn test_open_records_session_info() {
        let (client, _server) = open_client(test_config()).await;
        let info = client.session_info().await.unwrap();
        assert_eq!(info.protocol_version, "2.2");
        assert_eq!(info.connection_id, 17);
        assert_eq!(info.read_level, Some(2));
        assert_eq!(info.write_level, Some(3));
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let client = TplClient::with_connector(test_config(), ScriptedConnector::new(vec![client_side]));
        let server = tokio::spawn(async move {
            let (r, mut w) = tokio::io::split(server_side);
            let mut lines = BufReader::new(r).lines();
            w.write_all(GREETING.as_bytes()).await.unwrap();
            let _ = lines.next_line().await;
            w.write_all(b"AUTH FAILED 0 0\n").await.unwrap();
            (lines, w)
        });

        let result = client.open().await;
        assert!(matches!(result, Err(TplError::AuthRejected { .. })));
        assert!(!client.is_connected().await);
        drop(server.await);
    }

    #[tokio::test]
    async fn test_bad_greeting_is_protocol_error() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let client = TplClient::with_connector(test_config(), ScriptedConnector::new(vec![client_side]));
        let (_r, mut w) = tokio::io::split(server_side);
        w.write_all(b"HELLO THERE\n").await.unwrap();

        let result = client.connect().await;
        assert!(matches!(result, Err(TplError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_get_value_round_trip() {
        let (client, mut server) = open_client(test_config()).await;

        let server_task = tokio::spawn(async move {
            let request = server.expect().await;
            assert_eq!(
                request,
                "1 GET POSITION.HORIZONTAL.DOME!TYPE;POSITION.HORIZONTAL.DOME"
            );
            // Split mid-line to exercise buffering
            server.send("1 COMMAND OK\n1 DATA INLINE POSITION.HORIZONTAL.DOME!TY").await;
            server.send("PE=2\n1 DATA INLINE POSITION.HORIZONTAL.DOME=3.14\n").await;
            server.send("1 COMMAND COMPLETE\n").await;
            server
        });

        let value = client.get_value("POSITION.HORIZONTAL.DOME").await.unwrap();
        assert_eq!(value, TplValue::Float(3.14));

        let cmd = client.get_command(1).await.unwrap();
        assert!(cmd.ok());
        assert!(cmd.complete());
        assert_eq!(cmd.status_history(), ["OK", "COMPLETE"]);
        assert!(client.succeeded(1).await.unwrap());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_typed_getters() {
        let (client, mut server) = open_client(test_config()).await;
        let server_task = tokio::spawn(async move {
            let _ = server.expect().await;
            server
                .send("1 DATA INLINE SERVER.UPTIME!TYPE=1\n1 DATA INLINE SERVER.UPTIME=86400\n1 COMMAND COMPLETE\n")
                .await;
            let _ = server.expect().await;
            server
                .send("2 DATA INLINE SERVER.INFO.DEVICE!TYPE=3\n2 DATA INLINE SERVER.INFO.DEVICE=\"ASA DDM\"\n2 COMMAND COMPLETE\n")
                .await;
            let _ = server.expect().await;
            server
                .send("3 DATA INLINE SERVER.INFO.DEVICE=\"ASA DDM\"\n3 COMMAND COMPLETE\n")
                .await;
            server
        });

        assert_eq!(client.get_int("SERVER.UPTIME").await.unwrap(), 86400);
        assert_eq!(client.get_text("SERVER.INFO.DEVICE").await.unwrap(), "ASA DDM");
        let err = client.get_float("SERVER.INFO.DEVICE").await.unwrap_err();
        assert!(matches!(err, TplError::Decode { id: 3, .. }));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_value_no_data() {
        let (client, mut server) = open_client(test_config()).await;
        let server_task = tokio::spawn(async move {
            let _ = server.expect().await;
            server.send("1 EVENT ERROR NO.SUCH.OBJECT:unknown object\n").await;
            server.send("1 COMMAND COMPLETE\n").await;
            server
        });

        let result = client.get_value("NO.SUCH.OBJECT").await;
        assert!(matches!(result, Err(TplError::NoData { id: 1, .. })));
        let cmd = client.get_command(1).await.unwrap();
        assert_eq!(cmd.events()[0].message, "unknown object");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_command_incomplete() {
        let config = TplConfig {
            wait_timeout_secs: 0,
            ..test_config()
        };
        let (client, mut server) = open_client(config).await;

        let id = client.get("TELESCOPE.READY_STATE", true).await.unwrap();
        assert_eq!(server.expect().await, "1 GET TELESCOPE.READY_STATE!TYPE;TELESCOPE.READY_STATE");
        server.send("1 COMMAND OK\n").await;

        let outcome = client.wait_for(id, Duration::from_millis(50)).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        let cmd = client.get_command(id).await.unwrap();
        assert!(!cmd.complete());
        assert!(cmd.ok());

        let result = client.get_value("TELESCOPE.READY_STATE").await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_set_and_binary_set_wire_format() {
        let (client, mut server) = open_client(test_config()).await;

        let id = client.set("POINTING.TRACK", 1, false).await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(server.expect().await, "1 SET POINTING.TRACK=1");

        let id = client
            .set_binary("POINTING.MODEL.FILE", b"abc\n", false)
            .await
            .unwrap();
        assert_eq!(id, 2);
        assert_eq!(server.expect().await, "2 SET POINTING.MODEL.FILE:4");
        assert_eq!(server.expect().await, "abc");

        let cmd = client.get_command(1).await.unwrap();
        assert_eq!(cmd.verb(), Verb::Set);
        assert_eq!(cmd.target(), "POINTING.TRACK");
    }

    #[tokio::test]
    async fn test_waiter_progresses_via_background_tick() {
        let (client, mut server) = open_client(test_config()).await;

        let ticker = {
            let client = client.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    client.tick().await;
                    sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.set("TELESCOPE.STOP", 1, true).await })
        };

        assert_eq!(server.expect().await, "1 SET TELESCOPE.STOP=1");
        server.send("1 COMMAND OK\n1 COMMAND COMPLETE\n").await;

        let id = waiter.await.unwrap().unwrap();
        assert!(client.succeeded(id).await.unwrap());
        ticker.abort();
    }

    #[tokio::test]
    async fn test_tick_is_noop_without_pending_commands() {
        let (client, mut server) = open_client(test_config()).await;
        server.send("5 COMMAND COMPLETE\n").await;
        assert_eq!(client.tick().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_discarded() {
        let (client, mut server) = open_client(test_config()).await;
        client.get("SERVER.UPTIME", false).await.unwrap();
        let _ = server.expect().await;
        server.send("99 COMMAND COMPLETE\nnot a tpl line\n").await;

        let mut processed = 0;
        for _ in 0..100 {
            processed += client.poll().await;
            if processed >= 2 {
                break;
            }
            sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(processed, 2);
        let cmd = client.get_command(1).await.unwrap();
        assert!(cmd.raw_lines().is_empty());
        assert!(matches!(
            client.get_command(99).await,
            Err(TplError::UnknownCommand(99))
        ));
    }

    #[tokio::test]
    async fn test_eviction_makes_waiter_observe_vanished() {
        let config = TplConfig {
            history_limit: 2,
            ..test_config()
        };
        let (client, mut server) = open_client(config).await;
        let mut events = client.subscribe();

        for _ in 0..3 {
            client.get("SERVER.UPTIME", false).await.unwrap();
            let _ = server.expect().await;
        }
        assert_eq!(client.history_len().await, 3);

        assert_eq!(
            client.wait_for(1, Duration::from_millis(100)).await,
            WaitOutcome::Vanished
        );
        assert!(matches!(
            client.get_command(1).await,
            Err(TplError::UnknownCommand(1))
        ));
        assert!(matches!(client.succeeded(1).await, Err(TplError::UnknownCommand(1))));
        assert_eq!(client.history_len().await, 2);

        let mut saw_eviction = false;
        while let Ok(event) = events.try_recv() {
            if event == TplEvent::CommandsEvicted(vec![1]) {
                saw_eviction = true;
            }
        }
        assert!(saw_eviction);
    }

    #[tokio::test]
    async fn test_write_failure_reconnects_and_retries_once() {
        let (first_client, first_server) = tokio::io::duplex(4096);
        let (second_client, second_server) = tokio::io::duplex(4096);
        let connector = ScriptedConnector::new(vec![first_client, second_client]);
        let client = TplClient::with_connector(test_config(), connector.clone());
        let mut events = client.subscribe();

        let first = tokio::spawn(ServerEnd::handshake(first_server));
        client.open().await.unwrap();
        // Server goes away
        drop(first.await.unwrap());

        let second = tokio::spawn(async move {
            let mut server = ServerEnd::handshake(second_server).await;
            let request = server.expect().await;
            (server, request)
        });

        let id = client.get("SERVER.UPTIME", false).await.unwrap();
        let (_server, request) = second.await.unwrap();

        assert_eq!(id, 1);
        assert_eq!(request, "1 GET SERVER.UPTIME!TYPE;SERVER.UPTIME");
        assert_eq!(connector.opens(), 2);
        assert_eq!(client.history_len().await, 1);
        assert_eq!(client.allocate_id().await, 2);

        let mut reconnected = false;
        while let Ok(event) = events.try_recv() {
            reconnected |= event == TplEvent::Reconnected;
        }
        assert!(reconnected);
    }

    #[tokio::test]
    async fn test_write_failure_without_reconnect_keeps_command() {
        let (first_client, first_server) = tokio::io::duplex(4096);
        let connector = ScriptedConnector::new(vec![first_client]);
        let client = TplClient::with_connector(test_config(), connector.clone());

        let first = tokio::spawn(ServerEnd::handshake(first_server));
        client.open().await.unwrap();
        drop(first.await.unwrap());

        let result = client.set("TELESCOPE.STOP", 1, false).await;
        assert!(matches!(result, Err(TplError::Io { id: Some(1), .. })));
        let cmd = client.get_command(1).await.unwrap();
        assert!(!cmd.complete());
        assert_eq!(connector.opens(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (client, _server) = open_client(test_config()).await;
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected().await);
        assert!(matches!(
            client.get("SERVER.UPTIME", false).await,
            Err(TplError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_tick_alone_completes_outstanding_command() {
        let (client, mut server) = open_client(test_config()).await;

        let id = client.get("SERVER.UPTIME", false).await.unwrap();
        let _ = server.expect().await;
        server.send("1 COMMAND OK\n1 COMMAND COMPLETE\n").await;

        let mut processed = 0;
        for _ in 0..200 {
            processed += client.tick().await;
            if client.get_command(id).await.unwrap().complete() {
                break;
            }
            sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(processed, 2);
        assert!(client.succeeded(id).await.unwrap());
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unbounded_wait_timeout_does_not_overflow() {
        let (client, _server) = open_client(test_config()).await;
        let outcome = client.wait_for(1, Duration::from_secs(u64::MAX)).await;
        assert_eq!(outcome, WaitOutcome::Vanished);

        let config = TplConfig {
            wait_timeout_secs: u64::MAX,
            ..test_config()
        };
        let (client, mut server) = open_client(config).await;
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.get("SERVER.UPTIME", true).await })
        };
        let _ = server.expect().await;
        server.send("1 COMMAND COMPLETE\n").await;
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    async fn tcp_handshake(
        stream: tokio::net::TcpStream,
    ) -> (
        tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        tokio::net::tcp::OwnedWriteHalf,
    ) {
        let (r, mut w) = stream.into_split();
        let mut lines = BufReader::new(r).lines();
        w.write_all(GREETING.as_bytes()).await.unwrap();
        let auth = lines.next_line().await.unwrap().unwrap();
        assert!(auth.starts_with("AUTH PLAIN"));
        w.write_all(b"AUTH OK 2 3\n").await.unwrap();
        (lines, w)
    }

    #[tokio::test]
    async fn test_idle_peer_close_is_noticed_before_write() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();

        let server = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            let session = tcp_handshake(first).await;
            drop(session);
            let _ = closed_tx.send(());

            let (second, _) = listener.accept().await.unwrap();
            let (mut lines, _w) = tcp_handshake(second).await;
            lines.next_line().await.unwrap().unwrap()
        });

        let config = TplConfig {
            host: "127.0.0.1".to_string(),
            port,
            connection_timeout_secs: 5,
            ..test_config()
        };
        let client = TplClient::with_config(config);
        client.open().await.unwrap();
        closed_rx.await.unwrap();

        // Idle: nothing pending, so no poll ever runs
        let mut noticed = false;
        for _ in 0..200 {
            if !client.is_connected().await {
                noticed = true;
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(noticed);

        let id = client.get("SERVER.UPTIME", false).await.unwrap();
        assert_eq!(id, 1);
        let request = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request, "1 GET SERVER.UPTIME!TYPE;SERVER.UPTIME");
        assert!(client.is_connected().await);
        assert_eq!(client.history_len().await, 1);
    }
}
