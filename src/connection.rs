//! Connection management for AMI

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, trace, warn};

use crate::{
    action::{AmiAction, AmiResponse},
    constants::{
        DEFAULT_AMI_PORT, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_EVENT_MASK,
        DEFAULT_LOGIN_TIMEOUT_MS, DEFAULT_RECONNECT_INITIAL_MS, DEFAULT_RECONNECT_MAX_MS,
        DEFAULT_TIMEOUT_MS, HEADER_ACTION_ID, MAX_EVENT_QUEUE_SIZE, SOCKET_BUF_SIZE,
    },
    correlator::Correlator,
    error::{AmiError, AmiResult},
    event::{AmiEvent, AmiEventType, EventFilter},
    protocol::{AmiMessage, AmiParser, MessageType},
    reconnect::Backoff,
};

/// Byte stream the client runs over: plain TCP or TLS.
trait AmiStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AmiStream for T {}

/// How long `shutdown` waits for the reader to see the socket close.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

type BoxedStream = Box<dyn AmiStream>;

/// Lifecycle of the manager connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnectionState {
    /// No socket; the supervisor may be waiting to reconnect.
    Disconnected,
    /// TCP (and TLS) setup in progress.
    Connecting,
    /// Greeting received, login in flight.
    Authenticating,
    /// Logged in; actions may be executed.
    Ready,
    /// [`AmiClient::shutdown`] was called.
    Closing,
    /// Shut down and the reader has exited. Terminal.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// PBX sent a `Shutdown` event
    ServerShutdown,
    /// Liveness timeout exceeded without any inbound traffic
    HeartbeatExpired,
    /// TCP I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Framing violation or buffer overflow
    ProtocolError(String),
    /// Clean EOF on the TCP connection
    ConnectionClosed,
    /// Client called shutdown()
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ServerShutdown => write!(f, "server shutting down"),
            DisconnectReason::HeartbeatExpired => write!(f, "liveness timeout expired"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "client requested shutdown"),
        }
    }
}

/// Options for AMI connection configuration.
///
/// Use [`AmiConnectOptions::new`] for the required fields and the public
/// fields for everything else.
#[derive(Debug, Clone)]
pub struct AmiConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: SecretString,
    /// Wrap the socket in TLS (rustls, webpki roots).
    pub tls: bool,
    /// SNI / certificate name; defaults to `host`.
    pub tls_server_name: Option<String>,
    pub connect_timeout: Duration,
    /// Deadline for greeting plus login response.
    pub login_timeout: Duration,
    /// Default per-action deadline.
    pub command_timeout: Duration,
    /// `Events:` value sent at login (`on`, `off`, or a class list).
    pub events: String,
    /// Capacity of each subscriber queue. Default: 1000.
    pub event_queue_size: usize,
    /// Disconnect when nothing arrives for this long. Disabled by default;
    /// an idle manager socket is silent.
    pub liveness_timeout: Option<Duration>,
    /// Reconnect in the background after the connection drops.
    pub auto_reconnect: bool,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl AmiConnectOptions {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            secret: SecretString::from(secret.into()),
            ..Self::default()
        }
    }

    fn server_name(&self) -> &str {
        self.tls_server_name
            .as_deref()
            .unwrap_or(&self.host)
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_initial_delay, self.reconnect_max_delay)
    }
}

impl Default for AmiConnectOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_AMI_PORT,
            username: String::new(),
            secret: SecretString::from(String::new()),
            tls: false,
            tls_server_name: None,
            connect_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            login_timeout: Duration::from_millis(DEFAULT_LOGIN_TIMEOUT_MS),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            events: DEFAULT_EVENT_MASK.to_string(),
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            liveness_timeout: None,
            auto_reconnect: true,
            reconnect_initial_delay: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            reconnect_max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        }
    }
}

/// Shared state between AmiClient handles, the reader task and the
/// reconnect supervisor
struct Inner {
    options: AmiConnectOptions,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    correlator: Correlator,
    next_action_id: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor_running: AtomicBool,
    last_disconnect: std::sync::Mutex<Option<DisconnectReason>>,
    greeting: std::sync::Mutex<Option<String>>,
}

/// AMI client handle (Clone + Send)
///
/// One socket carries every action and every event. Actions are correlated
/// by `ActionID`, so any number of [`execute`](Self::execute) calls may be
/// in flight at once and complete out of order.
#[derive(Clone)]
pub struct AmiClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AmiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiClient")
            .field("host", &self.inner.options.host)
            .field("port", &self.inner.options.port)
            .field("state", &self.state())
            .finish()
    }
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> AmiResult<TcpStream> {
    let tcp_result = timeout(connect_timeout, TcpStream::connect((host, port))).await;

    match tcp_result {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(AmiError::Io(e))
        }
        Err(_) => {
            warn!(
                "[CONNECT] TCP connect timed out after {}ms",
                connect_timeout.as_millis()
            );
            Err(AmiError::Timeout {
                timeout_ms: connect_timeout.as_millis() as u64,
            })
        }
    }
}

/// Wrap a TCP stream in TLS, verifying against the webpki root set.
async fn tls_connect(
    stream: TcpStream,
    server_name: &str,
    handshake_timeout: Duration,
) -> AmiResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.extend(
        webpki_roots::TLS_SERVER_ROOTS
            .iter()
            .cloned(),
    );
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let name = ServerName::try_from(server_name.to_owned())
        .map_err(|e| AmiError::Tls(format!("invalid server name '{}': {}", server_name, e)))?;

    let tls_stream = timeout(handshake_timeout, connector.connect(name, stream))
        .await
        .map_err(|_| AmiError::Timeout {
            timeout_ms: handshake_timeout.as_millis() as u64,
        })?
        .map_err(|e| AmiError::Tls(format!("TLS handshake failed: {}", e)))?;
    debug!("[CONNECT] TLS handshake complete");
    Ok(tls_stream)
}

/// Read until the parser yields one complete block.
async fn recv_message<S: AsyncRead + Unpin>(
    stream: &mut S,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
) -> AmiResult<AmiMessage> {
    loop {
        if let Some(message) = parser.parse_message()? {
            trace!(
                "[RECV] Parsed message from buffer: {:?}",
                message.message_type
            );
            return Ok(message);
        }
        let bytes_read = stream
            .read(read_buffer)
            .await?;
        if bytes_read == 0 {
            return Err(AmiError::ConnectionLost);
        }
        parser.add_data(&read_buffer[..bytes_read])?;
    }
}

/// Read the `Asterisk Call Manager/x.y` line.
async fn recv_greeting<S: AsyncRead + Unpin>(
    stream: &mut S,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
) -> AmiResult<String> {
    loop {
        if let Some(greeting) = parser.parse_greeting()? {
            return Ok(greeting);
        }
        let bytes_read = stream
            .read(read_buffer)
            .await?;
        if bytes_read == 0 {
            return Err(AmiError::ConnectionLost);
        }
        parser.add_data(&read_buffer[..bytes_read])?;
    }
}

/// Greeting plus `Action: Login` on the unsplit stream.
async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
    options: &AmiConnectOptions,
    action_id: &str,
) -> AmiResult<String> {
    debug!("[AUTH] Waiting for manager greeting");
    let greeting = recv_greeting(stream, parser, read_buffer).await?;
    debug!("[AUTH] Greeting: {}", greeting);

    let login = AmiAction::new("Login")
        .param("Username", options.username.as_str())
        .param(
            "Secret",
            options
                .secret
                .expose_secret(),
        )
        .param("Events", options.events.as_str());
    let frame = login.to_wire_format(action_id)?;
    debug!(
        "[AUTH] Sending Login: Username={} Secret=[REDACTED]",
        options.username
    );
    stream
        .write_all(frame.as_bytes())
        .await?;
    stream
        .flush()
        .await?;

    loop {
        let message = recv_message(stream, parser, read_buffer).await?;
        if message.message_type != MessageType::Response {
            trace!("[AUTH] Ignoring {:?} block before login response", message.message_type);
            continue;
        }
        if let Some(id) = message
            .headers
            .get(HEADER_ACTION_ID)
        {
            if id != action_id {
                trace!("[AUTH] Ignoring response for ActionID {}", id);
                continue;
            }
        }
        let response = AmiResponse::new(message.headers);
        if !response.is_success() {
            return Err(AmiError::auth_failed(
                response
                    .message()
                    .unwrap_or("Authentication failed")
                    .to_string(),
            ));
        }
        debug!("[AUTH] Authentication successful");
        return Ok(greeting);
    }
}

impl Inner {
    /// Publish a transition. Nothing leaves `Closed`.
    fn set_state(&self, state: ConnectionState) {
        self.state_tx
            .send_if_modified(|current| {
                if *current == state || *current == ConnectionState::Closed {
                    return false;
                }
                debug!("[STATE] {} -> {}", current, state);
                *current = state;
                true
            });
    }

    /// State to publish when no session is open.
    fn idle_state(&self) -> ConnectionState {
        if self.is_shutdown() {
            ConnectionState::Closed
        } else {
            ConnectionState::Disconnected
        }
    }

    fn state(&self) -> ConnectionState {
        *self
            .state_tx
            .borrow()
    }

    fn is_shutdown(&self) -> bool {
        *self
            .shutdown_tx
            .borrow()
    }

    fn next_action_id(&self) -> String {
        self.next_action_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }

    /// Open the socket, log in, and start the reader task.
    async fn establish(self: &Arc<Self>) -> AmiResult<()> {
        let options = &self.options;
        self.set_state(ConnectionState::Connecting);
        info!(
            "[CONNECT] Connecting to Asterisk manager at {}:{}{}",
            options.host,
            options.port,
            if options.tls { " (TLS)" } else { "" }
        );

        match self
            .open_session()
            .await
        {
            Ok((stream, parser)) => {
                let (read_half, write_half) = tokio::io::split(stream);
                // Checked under the writer lock so a concurrent shutdown
                // either sees this writer or stops us here.
                let mut writer = self
                    .writer
                    .lock()
                    .await;
                if self.is_shutdown() {
                    drop(writer);
                    debug!("[CONNECT] Shutdown during connect, dropping session");
                    self.set_state(ConnectionState::Closed);
                    return Err(AmiError::NotConnected);
                }
                *writer = Some(write_half);
                // Before the reader starts: its teardown must come after Ready.
                self.set_state(ConnectionState::Ready);
                drop(writer);
                tokio::spawn(reader_loop(self.clone(), read_half, parser));
                info!("[CONNECT] Connected and authenticated to Asterisk manager");
                Ok(())
            }
            Err(e) => {
                self.set_state(self.idle_state());
                Err(e)
            }
        }
    }

    async fn open_session(&self) -> AmiResult<(BoxedStream, AmiParser)> {
        let options = &self.options;
        let tcp = tcp_connect_with_timeout(&options.host, options.port, options.connect_timeout)
            .await?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("[CONNECT] Failed to set TCP_NODELAY: {}", e);
        }
        let mut stream: BoxedStream = if options.tls {
            Box::new(tls_connect(tcp, options.server_name(), options.connect_timeout).await?)
        } else {
            Box::new(tcp)
        };

        self.set_state(ConnectionState::Authenticating);
        let mut parser = AmiParser::new();
        let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];
        let action_id = self.next_action_id();
        let handshake = authenticate(
            &mut stream,
            &mut parser,
            &mut read_buffer,
            options,
            &action_id,
        );
        let greeting = match timeout(options.login_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "[AUTH] Login timed out after {}ms",
                    options
                        .login_timeout
                        .as_millis()
                );
                return Err(AmiError::Timeout {
                    timeout_ms: options
                        .login_timeout
                        .as_millis() as u64,
                });
            }
        };
        *self
            .greeting
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(greeting);
        Ok((stream, parser))
    }

    /// Tear down after the reader exits: drop the writer, fail pending
    /// actions, publish `Disconnected` (or `Closed` after shutdown).
    async fn connection_lost(&self, reason: DisconnectReason) {
        if let Some(mut writer) = self
            .writer
            .lock()
            .await
            .take()
        {
            let _ = writer
                .shutdown()
                .await;
        }
        self.correlator
            .fail_all();
        if self.is_shutdown() {
            info!("[CONNECT] Connection closed: {}", reason);
        } else {
            warn!("[CONNECT] Connection lost: {}", reason);
        }
        *self
            .last_disconnect
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(reason);
        self.set_state(self.idle_state());
    }
}

/// Background reader loop
async fn reader_loop(inner: Arc<Inner>, reader: ReadHalf<BoxedStream>, parser: AmiParser) {
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(&inner, reader, parser));
    let reason = match futures_util::FutureExt::catch_unwind(result).await {
        Ok(reason) => reason,
        Err(_) => {
            error!("reader task panicked");
            DisconnectReason::IoError("reader task panicked".to_string())
        }
    };
    inner
        .connection_lost(reason)
        .await;
}

async fn reader_loop_inner(
    inner: &Inner,
    mut reader: ReadHalf<BoxedStream>,
    mut parser: AmiParser,
) -> DisconnectReason {
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];
    let mut shutdown_rx = inner
        .shutdown_tx
        .subscribe();
    let liveness = inner
        .options
        .liveness_timeout;

    loop {
        // Drain complete blocks before touching the socket again
        match parser.parse_message() {
            Ok(Some(message)) => {
                if let Some(reason) = route_message(inner, message) {
                    return reason;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Parser error: {}", e);
                return DisconnectReason::ProtocolError(e.to_string());
            }
        }

        let read = async {
            match liveness {
                Some(limit) => timeout(limit, reader.read(&mut read_buffer))
                    .await
                    .ok(),
                None => Some(
                    reader
                        .read(&mut read_buffer)
                        .await,
                ),
            }
        };

        let read_result = tokio::select! {
            r = read => r,
            _ = shutdown_rx.wait_for(|closing| *closing) => {
                return DisconnectReason::ClientRequested;
            }
        };

        match read_result {
            Some(Ok(0)) => {
                return DisconnectReason::ConnectionClosed;
            }
            Some(Ok(n)) => {
                trace!("[RECV] Read {} bytes from socket", n);
                if let Err(e) = parser.add_data(&read_buffer[..n]) {
                    warn!("Buffer error: {}", e);
                    return DisconnectReason::ProtocolError(e.to_string());
                }
            }
            Some(Err(e)) => {
                warn!("Read error: {}", e);
                return DisconnectReason::IoError(e.to_string());
            }
            None => {
                let limit = liveness.unwrap_or_default();
                warn!(
                    "Liveness timeout: {}ms without traffic",
                    limit.as_millis()
                );
                return DisconnectReason::HeartbeatExpired;
            }
        }
    }
}

/// Hand one block to the correlator or the subscribers. Returns a reason
/// when the block ends the session.
fn route_message(inner: &Inner, message: AmiMessage) -> Option<DisconnectReason> {
    match message.message_type {
        MessageType::Response => {
            inner
                .correlator
                .on_response(message.headers);
        }
        MessageType::Event => {
            let event = AmiEvent::from_headers(message.headers)?;
            if inner
                .correlator
                .on_list_event(&event)
            {
                return None;
            }
            let shutting_down = event.event_type() == Some(AmiEventType::Shutdown);
            inner
                .correlator
                .publish(&event);
            if shutting_down {
                info!(
                    "Received Shutdown event from PBX ({})",
                    event
                        .header("Shutdown")
                        .unwrap_or("unspecified")
                );
                return Some(DisconnectReason::ServerShutdown);
            }
        }
        MessageType::Unknown => {
            warn!(
                "[RECV] Discarding unclassifiable block with {} headers",
                message
                    .headers
                    .len()
            );
        }
    }
    None
}

/// Single-flight reconnect loop; one per client.
async fn supervise(
    inner: Weak<Inner>,
    mut state_rx: watch::Receiver<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut backoff: Backoff,
) {
    loop {
        tokio::select! {
            changed = wait_for_state(&mut state_rx, ConnectionState::Disconnected) => {
                if !changed {
                    return;
                }
            }
            _ = shutdown_rx.wait_for(|closing| *closing) => return,
        }

        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            let delay = backoff.next_delay();
            info!(
                "[RECONNECT] Reconnecting in {}ms (attempt {})",
                delay.as_millis(),
                backoff.attempts()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.wait_for(|closing| *closing) => return,
            }
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match inner
                .establish()
                .await
            {
                Ok(()) => {
                    backoff.reset();
                    break;
                }
                Err(e) => warn!("[RECONNECT] Attempt failed: {}", e),
            }
        }
    }
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) -> bool {
    rx.wait_for(|s| *s == state)
        .await
        .is_ok()
}

impl AmiClient {
    /// Connect and log in.
    ///
    /// The first attempt is made inline; its failure is returned and no
    /// background reconnection is started. After that, with
    /// `auto_reconnect`, dropped connections are re-established in the
    /// background with exponential backoff.
    ///
    /// ```rust,no_run
    /// # async fn example() -> Result<(), asterisk_ami_tokio::AmiError> {
    /// use asterisk_ami_tokio::{AmiAction, AmiClient, AmiConnectOptions};
    ///
    /// let client = AmiClient::connect(AmiConnectOptions::new("pbx.local", 5038, "crm", "s3cret")).await?;
    /// let pong = client.execute(AmiAction::new("Ping")).await?;
    /// assert!(pong.is_success());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(options: AmiConnectOptions) -> AmiResult<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            options,
            writer: Mutex::new(None),
            correlator: Correlator::new(),
            next_action_id: AtomicU64::new(1),
            state_tx,
            shutdown_tx,
            supervisor_running: AtomicBool::new(false),
            last_disconnect: std::sync::Mutex::new(None),
            greeting: std::sync::Mutex::new(None),
        });

        inner
            .establish()
            .await?;

        let client = AmiClient { inner };
        if client
            .inner
            .options
            .auto_reconnect
        {
            client.spawn_supervisor();
        }
        Ok(client)
    }

    fn spawn_supervisor(&self) {
        if self
            .inner
            .supervisor_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            self.inner
                .state_tx
                .subscribe(),
            self.inner
                .shutdown_tx
                .subscribe(),
            self.inner
                .options
                .backoff(),
        ));
    }

    /// Send an action and wait for its correlated response.
    ///
    /// List queries return once the terminating `EventList: Complete` event
    /// arrives, with every record in [`AmiResponse::events`]. A non-success
    /// response is returned as-is; use [`AmiResponse::into_result`] to map it
    /// to [`AmiError::CommandRejected`].
    ///
    /// Fails fast with `ConnectionLost` while the client is not Ready.
    pub async fn execute(&self, action: AmiAction) -> AmiResult<AmiResponse> {
        if self
            .inner
            .is_shutdown()
        {
            return Err(AmiError::NotConnected);
        }
        match self.state() {
            ConnectionState::Ready => {}
            ConnectionState::Closing | ConnectionState::Closed => return Err(AmiError::NotConnected),
            _ => return Err(AmiError::ConnectionLost),
        }

        let action_id = self
            .inner
            .next_action_id();
        let frame = action.to_wire_format(&action_id)?;
        let correlator = &self
            .inner
            .correlator;
        let rx = correlator.register(&action_id);

        debug!("[SEND] {} ActionID={}", action.name(), action_id);
        if let Err(e) = self
            .send_frame(&frame)
            .await
        {
            correlator.cancel(&action_id);
            return Err(e);
        }

        let deadline = action
            .get_timeout()
            .unwrap_or(
                self.inner
                    .options
                    .command_timeout,
            );
        match timeout(deadline, rx).await {
            Ok(Ok(result)) => {
                if let Ok(response) = &result {
                    debug!(
                        "[RECV] {} ActionID={} status={:?}",
                        action.name(),
                        action_id,
                        response.status()
                    );
                }
                result
            }
            Ok(Err(_)) => Err(AmiError::ConnectionLost),
            Err(_) => {
                correlator.cancel(&action_id);
                warn!(
                    "{} ActionID={} timed out after {}ms",
                    action.name(),
                    action_id,
                    deadline.as_millis()
                );
                Err(AmiError::Timeout {
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    /// Execute and require a success response.
    pub async fn execute_ok(&self, action: AmiAction) -> AmiResult<AmiResponse> {
        self.execute(action)
            .await?
            .into_result()
    }

    /// Write one serialized frame under the writer lock.
    pub(crate) async fn send_frame(&self, frame: &str) -> AmiResult<()> {
        let mut guard = self
            .inner
            .writer
            .lock()
            .await;
        let Some(writer) = guard.as_mut() else {
            return Err(AmiError::ConnectionLost);
        };
        let written = async {
            writer
                .write_all(frame.as_bytes())
                .await?;
            writer
                .flush()
                .await
        }
        .await;
        if let Err(e) = written {
            warn!("Write error: {}", e);
            return Err(AmiError::ConnectionLost);
        }
        Ok(())
    }

    /// Invoke `listener` for every matching event, on its own task.
    ///
    /// The listener never runs on the reader task. If it falls more than
    /// `event_queue_size` events behind, events are dropped and counted in
    /// [`dropped_event_count`](Self::dropped_event_count). Dropping the
    /// returned [`Subscription`] unregisters it.
    pub fn subscribe<F>(&self, filter: impl Into<EventFilter>, listener: F) -> Subscription
    where
        F: Fn(AmiEvent) + Send + 'static,
    {
        let (id, mut rx) = self
            .inner
            .correlator
            .subscribe(
                filter.into(),
                self.inner
                    .options
                    .event_queue_size,
            );
        let task = tokio::spawn(async move {
            while let Some(item) = rx
                .recv()
                .await
            {
                match item {
                    Ok(event) => listener(event),
                    Err(e) => warn!("Subscriber {} fell behind: {}", id, e),
                }
            }
        });
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
            task: Some(task),
        }
    }

    /// Matching events as a [`Stream`](futures_util::Stream).
    ///
    /// An `Err(AmiError::QueueFull)` item means events were dropped since
    /// the last item because the consumer fell behind.
    pub fn event_stream(&self, filter: impl Into<EventFilter>) -> AmiEventStream {
        let (id, rx) = self
            .inner
            .correlator
            .subscribe(
                filter.into(),
                self.inner
                    .options
                    .event_queue_size,
            );
        AmiEventStream {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current connection state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.inner
            .state()
    }

    /// Receiver observing every state transition.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner
            .state_tx
            .subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Wait until the connection is Ready, up to `limit`.
    pub async fn wait_ready(&self, limit: Duration) -> AmiResult<()> {
        let mut rx = self.state_watch();
        let settled = async {
            rx.wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Closed))
                .await
                .map(|s| *s)
        };
        match timeout(limit, settled).await {
            Ok(Ok(ConnectionState::Ready)) => Ok(()),
            Ok(_) => Err(AmiError::NotConnected),
            Err(_) => Err(AmiError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Why the most recent connection ended.
    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.inner
            .last_disconnect
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Greeting line of the current (or last) session.
    pub fn greeting(&self) -> Option<String> {
        self.inner
            .greeting
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn options(&self) -> &AmiConnectOptions {
        &self.inner.options
    }

    /// Number of events dropped due to full subscriber queues.
    pub fn dropped_event_count(&self) -> u64 {
        self.inner
            .correlator
            .dropped_event_count()
    }

    /// Actions awaiting a response.
    pub fn pending_actions(&self) -> usize {
        self.inner
            .correlator
            .pending_count()
    }

    /// Log off and close the socket. Stops background reconnection.
    pub async fn shutdown(&self) -> AmiResult<()> {
        if self
            .inner
            .is_shutdown()
        {
            return Ok(());
        }
        info!("Client requested shutdown");
        if self.is_ready() {
            let logoff = AmiAction::new("Logoff").timeout(Duration::from_secs(2));
            if let Err(e) = self
                .execute(logoff)
                .await
            {
                debug!("Logoff failed: {}", e);
            }
        }
        self.inner
            .shutdown_tx
            .send_replace(true);
        self.inner
            .set_state(ConnectionState::Closing);
        let writer = self
            .inner
            .writer
            .lock()
            .await
            .take();
        let Some(mut writer) = writer else {
            self.inner
                .set_state(ConnectionState::Closed);
            return Ok(());
        };
        let closed = writer
            .shutdown()
            .await;
        drop(writer);
        let mut rx = self.state_watch();
        if timeout(SHUTDOWN_DRAIN, wait_for_state(&mut rx, ConnectionState::Closed))
            .await
            .is_err()
        {
            warn!("Reader still running {}ms after shutdown", SHUTDOWN_DRAIN.as_millis());
            self.inner
                .set_state(ConnectionState::Closed);
        }
        closed.map_err(AmiError::Io)
    }

    /// `shutdown` was called; the client will not reconnect.
    pub fn is_shutdown(&self) -> bool {
        self.inner
            .is_shutdown()
    }
}

/// Callback subscription handle; unregisters on drop.
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Explicit form of dropping the handle.
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self
            .inner
            .upgrade()
        {
            inner
                .correlator
                .unsubscribe(self.id);
        }
        if let Some(task) = self
            .task
            .take()
        {
            task.abort();
        }
    }
}

/// Event stream receiver (!Clone)
///
/// Events are delivered as `Result<AmiEvent, AmiError>`. An
/// `Err(AmiError::QueueFull)` indicates that one or more events were dropped
/// because the application fell behind.
pub struct AmiEventStream {
    id: u64,
    rx: mpsc::Receiver<Result<AmiEvent, AmiError>>,
    inner: Weak<Inner>,
}

impl std::fmt::Debug for AmiEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiEventStream")
            .field("id", &self.id)
            .finish()
    }
}

impl AmiEventStream {
    /// Receive the next event, or None once the client is gone.
    pub async fn recv(&mut self) -> Option<Result<AmiEvent, AmiError>> {
        self.rx
            .recv()
            .await
    }
}

impl futures_util::Stream for AmiEventStream {
    type Item = Result<AmiEvent, AmiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}

impl Drop for AmiEventStream {
    fn drop(&mut self) {
        if let Some(inner) = self
            .inner
            .upgrade()
        {
            inner
                .correlator
                .unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = AmiConnectOptions::default();
        assert_eq!(options.port, 5038);
        assert_eq!(options.events, "call,agent,system");
        assert!(options.auto_reconnect);
        assert!(options
            .liveness_timeout
            .is_none());
        assert_eq!(options.server_name(), "127.0.0.1");
    }

    #[test]
    fn test_options_debug_redacts_secret() {
        let options = AmiConnectOptions::new("pbx", 5038, "crm", "hunter2");
        let dbg = format!("{:?}", options);
        assert!(dbg.contains("crm"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn test_tls_server_name_override() {
        let mut options = AmiConnectOptions::new("10.0.0.5", 5039, "crm", "x");
        options.tls_server_name = Some("pbx.example.com".to_string());
        assert_eq!(options.server_name(), "pbx.example.com");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
        assert_eq!(
            DisconnectReason::IoError("reset".into()).to_string(),
            "I/O error: reset"
        );
    }

    #[tokio::test]
    async fn test_authenticate_over_duplex() {
        let (mut client_side, mut server_side) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            server_side
                .write_all(b"Asterisk Call Manager/5.0.1\r\n")
                .await
                .unwrap();
            let mut buf = vec![0u8; 1024];
            let n = server_side
                .read(&mut buf)
                .await
                .unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            server_side
                .write_all(
                    b"Response: Success\r\nActionID: 1\r\nMessage: Authentication accepted\r\n\r\nEvent: FullyBooted\r\nStatus: Fully Booted\r\n\r\n",
                )
                .await
                .unwrap();
            request
        });

        let options = AmiConnectOptions::new("pbx", 5038, "crm", "s3cret");
        let mut parser = AmiParser::new();
        let mut buf = vec![0u8; 1024];
        let greeting = authenticate(&mut client_side, &mut parser, &mut buf, &options, "1")
            .await
            .unwrap();
        assert_eq!(greeting, "Asterisk Call Manager/5.0.1");

        let request = server
            .await
            .unwrap();
        assert!(request.starts_with("Action: Login\r\nActionID: 1\r\n"));
        assert!(request.contains("Username: crm\r\n"));
        assert!(request.contains("Secret: s3cret\r\n"));
        assert!(request.contains("Events: call,agent,system\r\n"));

        // Events after the login response stay buffered for the reader
        let leftover = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(leftover.message_type, MessageType::Event);
    }

    #[tokio::test]
    async fn test_authenticate_rejected() {
        let (mut client_side, mut server_side) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server_side
                .write_all(b"Asterisk Call Manager/2.10.4\r\n")
                .await
                .unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = server_side
                .read(&mut buf)
                .await
                .unwrap();
            server_side
                .write_all(b"Response: Error\r\nActionID: 7\r\nMessage: Authentication failed\r\n\r\n")
                .await
                .unwrap();
            // Keep the pipe open until the client is done
            let _ = server_side
                .read(&mut buf)
                .await;
        });

        let options = AmiConnectOptions::new("pbx", 5038, "crm", "wrong");
        let mut parser = AmiParser::new();
        let mut buf = vec![0u8; 1024];
        let err = authenticate(&mut client_side, &mut parser, &mut buf, &options, "7")
            .await
            .unwrap_err();
        match err {
            AmiError::AuthFailed { reason } => assert_eq!(reason, "Authentication failed"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
