//! TPL2 connection management
//!
//! This module owns the transport session:
//! - Opening the byte stream through a pluggable [`Connector`]
//! - Greeting and `AUTH PLAIN` handshake
//! - A reader task that forwards raw chunks over an mpsc channel, so the
//!   dispatcher can drain input without ever blocking on the socket
//! - Writes with exactly one transparent reconnect-and-retry on failure

use crate::client::TplEvent;
use crate::config::TplConfig;
use crate::error::{TplError, TplResult};
use crate::protocol::{self, Greeting};
use crate::tokenizer::LineTokenizer;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

/// Read half handed to the reader task
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half kept by the session
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Chunks buffered between the reader task and the dispatcher
const READ_CHANNEL_CAPACITY: usize = 256;

/// Size of a single socket read
const READ_CHUNK_SIZE: usize = 8192;

/// Stand-in deadline for timeouts too large to add to `Instant::now()`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + limit`, saturating to a far-future deadline instead of panicking
pub(crate) fn deadline_after(limit: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(limit).unwrap_or(now + FAR_FUTURE)
}

/// Opens a fresh byte stream to the server
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> TplResult<(BoxedReader, BoxedWriter)>;

    /// Human readable peer description for logs
    fn describe(&self) -> String;
}

/// Plain TCP transport
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout,
        }
    }

    pub fn from_config(config: &TplConfig) -> Self {
        Self::new(&config.host, config.port, config.connection_timeout())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> TplResult<(BoxedReader, BoxedWriter)> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TplError::ConnectionFailed(format!(
                    "Failed to connect to TPL2 server at {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                return Err(TplError::ConnectionTimeout {
                    host: self.host.clone(),
                    port: self.port,
                    duration: self.connect_timeout,
                });
            }
        };
        // Commands are small and latency matters more than throughput
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        Ok((Box::new(read_half), Box::new(write_half)))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the reader task forwards
#[derive(Debug)]
enum ReaderMessage {
    Data(Vec<u8>),
    Closed,
    Failed(String),
}

/// Reader task - forwards raw bytes until EOF or error
async fn reader_task(mut reader: BoxedReader, tx: mpsc::Sender<ReaderMessage>) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::info!("TPL2 connection closed (EOF)");
                let _ = tx.send(ReaderMessage::Closed).await;
                break;
            }
            Ok(n) => {
                if tx.send(ReaderMessage::Data(buf[..n].to_vec())).await.is_err() {
                    // Session dropped the connection
                    break;
                }
            }
            Err(e) => {
                tracing::error!("TPL2 read error: {}", e);
                let _ = tx.send(ReaderMessage::Failed(e.to_string())).await;
                break;
            }
        }
    }
}

/// Details negotiated by the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub protocol_version: String,
    pub connection_id: u64,
    pub auth_methods: Vec<String>,
    pub message: String,
    pub read_level: Option<u8>,
    pub write_level: Option<u8>,
}

impl SessionInfo {
    fn from_greeting(greeting: Greeting) -> Self {
        Self {
            protocol_version: greeting.protocol_version,
            connection_id: greeting.connection_id,
            auth_methods: greeting.auth_methods,
            message: greeting.message,
            read_level: None,
            write_level: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_level.is_some()
    }
}

/// One open transport session
pub struct Connection {
    writer: BoxedWriter,
    rx: mpsc::Receiver<ReaderMessage>,
    reader_handle: JoinHandle<()>,
    tokenizer: LineTokenizer,
    alive: bool,
    info: SessionInfo,
}

impl Connection {
    /// Open the transport and consume the server greeting
    pub async fn open(connector: &dyn Connector, handshake_timeout: Duration) -> TplResult<Self> {
        let (reader, writer) = connector.open().await?;
        let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let reader_handle = tokio::spawn(reader_task(reader, tx));

        let mut conn = Self {
            writer,
            rx,
            reader_handle,
            tokenizer: LineTokenizer::new(),
            alive: true,
            info: SessionInfo::default(),
        };

        let deadline = deadline_after(handshake_timeout);
        let line = conn
            .read_handshake_line("greeting", deadline, handshake_timeout)
            .await?;
        let greeting = protocol::parse_greeting(&line)?;
        tracing::info!(
            "TPL2 {} session {} on {} (auth: {}): {}",
            greeting.protocol_version,
            greeting.connection_id,
            connector.describe(),
            greeting.auth_methods.join(","),
            greeting.message
        );
        conn.info = SessionInfo::from_greeting(greeting);
        Ok(conn)
    }

    /// Send `AUTH PLAIN` and check the single reply line
    pub async fn authenticate(
        &mut self,
        user: &str,
        password: &str,
        accept_token: &str,
        handshake_timeout: Duration,
    ) -> TplResult<()> {
        tracing::debug!("Authenticating as '{}'", user);
        self.write_raw(protocol::auth_request(user, password).as_bytes())
            .await
            .map_err(|e| TplError::ConnectionFailed(format!("Failed to send AUTH: {}", e)))?;

        // Stray lines ahead of the reply are skipped, not treated as desync
        let deadline = deadline_after(handshake_timeout);
        let line = loop {
            let line = self
                .read_handshake_line("AUTH reply", deadline, handshake_timeout)
                .await?;
            if matches!(protocol::next_token(&line), Some(("AUTH", _))) {
                break line;
            }
            tracing::warn!("Skipping line before AUTH reply: {:?}", line);
        };
        let reply = protocol::parse_auth_reply(&line)?;
        if reply.status != accept_token {
            return Err(TplError::AuthRejected {
                user: user.to_string(),
                reply: line.trim().to_string(),
            });
        }

        self.info.read_level = Some(reply.read_level.unwrap_or(0));
        self.info.write_level = Some(reply.write_level.unwrap_or(0));
        tracing::info!(
            "TPL2 authenticated as '{}' (read level {}, write level {})",
            user,
            reply.read_level.unwrap_or(0),
            reply.write_level.unwrap_or(0)
        );
        Ok(())
    }

    /// Wait for one complete line during the handshake
    async fn read_handshake_line(
        &mut self,
        what: &str,
        deadline: Instant,
        limit: Duration,
    ) -> TplResult<String> {
        loop {
            if let Some(line) = self.tokenizer.next_line() {
                return Ok(line);
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(ReaderMessage::Data(chunk))) => self.tokenizer.push(&chunk),
                Ok(Some(ReaderMessage::Closed)) | Ok(None) => {
                    self.alive = false;
                    return Err(TplError::ConnectionFailed(format!(
                        "Server closed the connection while waiting for {}",
                        what
                    )));
                }
                Ok(Some(ReaderMessage::Failed(e))) => {
                    self.alive = false;
                    return Err(TplError::ConnectionFailed(format!(
                        "Read failed while waiting for {}: {}",
                        what, e
                    )));
                }
                Err(_) => {
                    return Err(TplError::Protocol(format!(
                        "No {} received within {:?}",
                        what, limit
                    )));
                }
            }
        }
    }

    /// Write raw bytes and flush
    pub async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Move everything the reader task has delivered into the tokenizer and
    /// return the complete lines; never waits
    pub fn drain_lines(&mut self) -> Vec<String> {
        self.pump();
        self.tokenizer.drain_lines()
    }

    /// Take queued chunks and EOF/error notices off the reader channel
    fn pump(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(ReaderMessage::Data(chunk)) => self.tokenizer.push(&chunk),
                Ok(ReaderMessage::Closed) => {
                    self.alive = false;
                    break;
                }
                Ok(ReaderMessage::Failed(e)) => {
                    tracing::warn!("TPL2 transport failed: {}", e);
                    self.alive = false;
                    break;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.alive = false;
                    break;
                }
            }
        }
    }

    /// False once the reader saw EOF or an error
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Liveness after taking any pending reader notices; buffered lines
    /// stay for the next drain
    pub fn refresh(&mut self) -> bool {
        self.pump();
        self.alive
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Close the transport
    pub async fn close(mut self) {
        self.reader_handle.abort();
        let _ = self.writer.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Owns the single live [`Connection`] and replaces it on reconnect
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: TplConfig,
    connection: Option<Connection>,
    /// Credentials of the last successful AUTH, replayed on reconnect
    credentials: Option<(String, String)>,
    /// Lines salvaged from a replaced connection, handed out by the next drain
    carried_lines: Vec<String>,
    /// Set by connect(), cleared by an explicit disconnect()
    session_wanted: bool,
    event_tx: broadcast::Sender<TplEvent>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: TplConfig,
        event_tx: broadcast::Sender<TplEvent>,
    ) -> Self {
        Self {
            connector,
            config,
            connection: None,
            credentials: None,
            carried_lines: Vec::new(),
            session_wanted: false,
            event_tx,
        }
    }

    /// Open the transport and read the greeting; replaces any open session
    pub async fn connect(&mut self) -> TplResult<&SessionInfo> {
        if let Some(old) = self.connection.take() {
            old.close().await;
        }
        tracing::info!("Connecting to TPL2 server @ {}", self.connector.describe());

        let conn = Connection::open(self.connector.as_ref(), self.config.connection_timeout()).await?;
        self.session_wanted = true;
        let _ = self.event_tx.send(TplEvent::ConnectionStateChanged(true));
        Ok(self.connection.insert(conn).info())
    }

    /// Authenticate the open session; the transport is closed on rejection
    pub async fn authenticate(&mut self, user: &str, password: &str) -> TplResult<()> {
        let conn = self.connection.as_mut().ok_or(TplError::NotConnected)?;
        let result = conn
            .authenticate(
                user,
                password,
                &self.config.tokens.auth_accept,
                self.config.connection_timeout(),
            )
            .await;

        match result {
            Ok(()) => {
                self.credentials = Some((user.to_string(), password.to_string()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("TPL2 authentication failed: {}", e);
                self.close_connection().await;
                self.session_wanted = false;
                Err(e)
            }
        }
    }

    /// Close the transport; calling it again is a no-op
    pub async fn disconnect(&mut self) {
        self.session_wanted = false;
        if self.connection.is_some() {
            tracing::info!("Disconnecting from {}", self.connector.describe());
            self.close_connection().await;
        }
    }

    async fn close_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close().await;
            let _ = self.event_tx.send(TplEvent::ConnectionStateChanged(false));
        }
    }

    /// Whether a write may be attempted (open, or eligible for reconnect)
    pub fn can_send(&self) -> bool {
        self.connection.is_some() || self.session_wanted
    }

    pub fn is_connected(&mut self) -> bool {
        self.refresh();
        self.connection.as_ref().is_some_and(|c| c.is_alive())
    }

    /// Pick up an EOF the reader task already saw
    fn refresh(&mut self) {
        if let Some(conn) = self.connection.as_mut() {
            let was_alive = conn.is_alive();
            if was_alive && !conn.refresh() {
                tracing::info!("TPL2 server closed the connection");
                let _ = self.event_tx.send(TplEvent::ConnectionStateChanged(false));
            }
        }
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.connection.as_ref().map(|c| c.info())
    }

    /// Lines salvaged from a replaced connection, then those of the live one
    pub fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = std::mem::take(&mut self.carried_lines);
        let Some(conn) = self.connection.as_mut() else {
            return lines;
        };
        let was_alive = conn.is_alive();
        lines.extend(conn.drain_lines());
        if was_alive && !conn.is_alive() {
            let _ = self.event_tx.send(TplEvent::ConnectionStateChanged(false));
        }
        lines
    }

    /// Send bytes; on failure reconnect once and retry once
    pub async fn write(&mut self, bytes: &[u8]) -> TplResult<()> {
        if !self.can_send() {
            return Err(TplError::NotConnected);
        }

        // A write into a socket the peer already closed can still succeed
        self.refresh();
        let first_error = match self.connection.as_mut() {
            Some(conn) if conn.is_alive() => match conn.write_raw(bytes).await {
                Ok(()) => return Ok(()),
                Err(e) => e.to_string(),
            },
            Some(_) => "connection closed by server".to_string(),
            None => "no open connection".to_string(),
        };

        tracing::warn!(
            "TPL2 write failed ({}), reconnecting to {} and retrying once",
            first_error,
            self.connector.describe()
        );
        if let Err(e) = self.reconnect().await {
            tracing::error!("TPL2 reconnect failed: {}", e);
            return Err(TplError::Io {
                id: None,
                message: format!("{}; reconnect failed: {}", first_error, e),
            });
        }

        let conn = self.connection.as_mut().ok_or(TplError::NotConnected)?;
        conn.write_raw(bytes).await.map_err(|e| {
            tracing::error!("TPL2 write failed again after reconnect: {}", e);
            TplError::Io {
                id: None,
                message: format!("write failed after reconnect: {}", e),
            }
        })
    }

    /// Replace the connection and replay the handshake
    async fn reconnect(&mut self) -> TplResult<()> {
        if let Some(old) = self.connection.as_mut() {
            let salvaged = old.drain_lines();
            self.carried_lines.extend(salvaged);
        }
        self.close_connection().await;
        let mut conn =
            Connection::open(self.connector.as_ref(), self.config.connection_timeout()).await?;
        if let Some((user, password)) = &self.credentials {
            let auth = conn
                .authenticate(
                    user,
                    password,
                    &self.config.tokens.auth_accept,
                    self.config.connection_timeout(),
                )
                .await;
            if let Err(e) = auth {
                conn.close().await;
                return Err(e);
            }
        }
        self.connection = Some(conn);
        tracing::info!("Reconnected to TPL2 server @ {}", self.connector.describe());
        let _ = self.event_tx.send(TplEvent::ConnectionStateChanged(true));
        let _ = self.event_tx.send(TplEvent::Reconnected);
        Ok(())
    }
}
