//! A persistent TCP connection to a game backend.
//!
//! Manages the full connection lifecycle: connecting, running the send and
//! receive loops, and clean teardown. State changes are broadcast via a
//! [`watch`] channel so any number of consumers can react without polling;
//! the reason a connection ended is delivered exactly once through a
//! [`oneshot`] channel.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch::DispatchRegistry;
use crate::framing::FrameError;
use crate::platform::SocketConfig;
use crate::recv_buffer::{DEFAULT_RECV_BUFFER_SIZE, RecvBuffer};
use crate::send_queue::{DEFAULT_SEND_BUFFER_CAPACITY, SendQueue};
use crate::service::ServiceCategory;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound on the TCP handshake. Default: 5 s.
    pub connect_timeout: Duration,
    /// How long [`Connection::stop`] waits for the loops before aborting them.
    /// Default: 2 s.
    pub stop_timeout: Duration,
    /// Longest the send loop sleeps when the queue is empty. Enqueues wake it
    /// earlier. Default: 10 ms.
    pub idle_backoff: Duration,
    /// Receive buffer size; raised to the largest frame size if smaller.
    /// Default: 64 KB.
    pub recv_buffer_size: usize,
    /// Initial capacity of each outbound buffer. Default: 8 KB.
    pub send_buffer_capacity: usize,
    /// Socket options applied after connecting.
    pub socket: SocketConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
            idle_backoff: Duration::from_millis(10),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            send_buffer_capacity: DEFAULT_SEND_BUFFER_CAPACITY,
            socket: SocketConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connecting.
    Idle,
    /// Attempting to establish a TCP connection.
    Connecting,
    /// TCP connection established, loops not running yet.
    Connected,
    /// Send and receive loops are running.
    Started,
    /// Cancellation requested, loops are exiting.
    Stopping,
    /// Socket closed and loops gone.
    Stopped,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Idle`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Idle);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

// ---------------------------------------------------------------------------
// Errors and disconnect notification
// ---------------------------------------------------------------------------

/// Errors returned when a connection cannot be established.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The socket-level connect failed.
    #[error("failed to connect to {addr}: {source}")]
    Io {
        /// The address we tried.
        addr: SocketAddr,
        /// The underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The handshake did not complete in time.
    #[error("timed out connecting to {addr} after {timeout:?}")]
    Timeout {
        /// The address we tried.
        addr: SocketAddr,
        /// The configured connect timeout.
        timeout: Duration,
    },

    /// The host name did not resolve to any address.
    #[error("could not resolve {0}")]
    Resolve(String),

    /// A connection to this endpoint is already live.
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// Stream-level failure, including the peer closing the connection.
    Io,
    /// Teardown requested locally.
    Cancel,
    /// Transport-level failure (reset, broken pipe, unreachable).
    Socket,
}

impl DisconnectKind {
    /// Classify an I/O error raised on an established connection.
    pub fn classify(err: &io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected | TimedOut
            | HostUnreachable | NetworkUnreachable | AddrNotAvailable => Self::Socket,
            _ => Self::Io,
        }
    }
}

impl fmt::Display for DisconnectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Io => "IO",
            Self::Cancel => "Cancel",
            Self::Socket => "Socket",
        })
    }
}

/// The single notification a connection emits when it terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Error category.
    pub kind: DisconnectKind,
    /// Human-readable reason.
    pub message: String,
}

/// Hands out the disconnect notification at most once, no matter how many
/// loops report a failure.
pub(crate) struct DisconnectNotifier {
    tx: Mutex<Option<oneshot::Sender<Disconnect>>>,
}

impl DisconnectNotifier {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Disconnect>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Report a disconnect. Returns `false` if one was already reported.
    pub(crate) fn notify(&self, kind: DisconnectKind, message: impl Into<String>) -> bool {
        let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return false;
        };
        let message = message.into();
        tracing::info!("Connection closed ({kind}): {message}");
        // The receiver may already be gone; the slot is spent either way.
        let _ = tx.send(Disconnect { kind, message });
        true
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// State shared between the connection handle and its two loops.
struct Shared {
    remote: SocketAddr,
    categories: ServiceCategory,
    queue: SendQueue,
    registry: Arc<DispatchRegistry>,
    notifier: DisconnectNotifier,
    state: ConnectionStateWatch,
    config: ConnectionConfig,
    /// Loops spawned and not yet finished.
    live_loops: AtomicUsize,
}

impl Shared {
    /// Record a fatal loop error, then stop the sibling loop.
    ///
    /// Reporting before cancelling makes this error, not the sibling's
    /// `Cancel`, the one the caller sees.
    fn fail(&self, kind: DisconnectKind, message: String, cancel: &CancellationToken) {
        self.state.set(ConnectionState::Stopping);
        self.queue.close();
        self.notifier.notify(kind, message);
        cancel.cancel();
    }
}

/// Held by each loop for its whole run, including when the task is aborted
/// before its first poll. The last one out marks the connection stopped.
struct LoopExit(Arc<Shared>);

impl Drop for LoopExit {
    fn drop(&mut self) {
        if self.0.live_loops.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.queue.close();
            self.0.state.set(ConnectionState::Stopped);
            tracing::debug!("Loops for {} finished", self.0.remote);
        }
    }
}

struct Running {
    cancel: CancellationToken,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

enum Lifecycle {
    Connected(TcpStream),
    Running(Running),
    Stopped,
}

/// Handle to one backend connection.
///
/// Created via [`Connection::connect`] (or [`Connection::connect_blocking`])
/// in the [`ConnectionState::Connected`] state; [`Connection::start`] spawns
/// the loops and [`Connection::stop`] tears them down.
pub struct Connection {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    disconnect_rx: Mutex<Option<oneshot::Receiver<Disconnect>>>,
}

impl Connection {
    /// Connect to `remote`.
    ///
    /// Handlers for incoming frames are resolved in `registry` against
    /// `categories`. The handshake is bounded by
    /// [`ConnectionConfig::connect_timeout`]. The returned connection is not
    /// started.
    pub async fn connect(
        remote: SocketAddr,
        categories: ServiceCategory,
        registry: Arc<DispatchRegistry>,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectError> {
        let state = ConnectionStateWatch::new();
        state.set(ConnectionState::Connecting);
        tracing::debug!("Connecting to {remote}");

        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(remote))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                tracing::warn!("Connect to {remote} failed: {source}");
                return Err(ConnectError::Io {
                    addr: remote,
                    source,
                });
            }
            Err(_) => {
                tracing::warn!("Connect to {remote} timed out");
                return Err(ConnectError::Timeout {
                    addr: remote,
                    timeout: config.connect_timeout,
                });
            }
        };

        Self::establish(stream, remote, categories, registry, config, state)
    }

    /// Blocking variant of [`Connection::connect`].
    ///
    /// Must be called from within a Tokio runtime context, since the socket is
    /// registered with the runtime's reactor.
    pub fn connect_blocking(
        remote: SocketAddr,
        categories: ServiceCategory,
        registry: Arc<DispatchRegistry>,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectError> {
        let state = ConnectionStateWatch::new();
        state.set(ConnectionState::Connecting);
        tracing::debug!("Connecting to {remote} (blocking)");

        let io_err = |source: io::Error| ConnectError::Io {
            addr: remote,
            source,
        };
        let std_stream = std::net::TcpStream::connect_timeout(&remote, config.connect_timeout)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::TimedOut {
                    ConnectError::Timeout {
                        addr: remote,
                        timeout: config.connect_timeout,
                    }
                } else {
                    io_err(source)
                }
            })?;
        std_stream.set_nonblocking(true).map_err(io_err)?;
        let stream = TcpStream::from_std(std_stream).map_err(io_err)?;

        Self::establish(stream, remote, categories, registry, config, state)
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(
        stream: TcpStream,
        categories: ServiceCategory,
        registry: Arc<DispatchRegistry>,
        config: ConnectionConfig,
    ) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        Self::establish(
            stream,
            remote,
            categories,
            registry,
            config,
            ConnectionStateWatch::new(),
        )
        .map_err(|err| match err {
            ConnectError::Io { source, .. } => source,
            other => io::Error::other(other.to_string()),
        })
    }

    fn establish(
        stream: TcpStream,
        remote: SocketAddr,
        categories: ServiceCategory,
        registry: Arc<DispatchRegistry>,
        config: ConnectionConfig,
        state: ConnectionStateWatch,
    ) -> Result<Self, ConnectError> {
        config.socket.apply(&stream).map_err(|source| ConnectError::Io {
            addr: remote,
            source,
        })?;

        let (notifier, disconnect_rx) = DisconnectNotifier::new();
        state.set(ConnectionState::Connected);
        tracing::info!("Connected to {remote} serving {categories:?}");

        Ok(Self {
            shared: Arc::new(Shared {
                remote,
                categories,
                queue: SendQueue::new(config.send_buffer_capacity),
                registry,
                notifier,
                state,
                config,
                live_loops: AtomicUsize::new(0),
            }),
            lifecycle: Mutex::new(Lifecycle::Connected(stream)),
            disconnect_rx: Mutex::new(Some(disconnect_rx)),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the send and receive loops.
    ///
    /// Returns `false` if the connection was already started or stopped.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        let stream = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Connected(stream) => stream,
            other => {
                *lifecycle = other;
                return false;
            }
        };

        let (reader, writer) = stream.into_split();
        let cancel = CancellationToken::new();
        self.shared.live_loops.store(2, Ordering::Release);
        let send_task = tokio::spawn(send_loop(
            writer,
            Arc::clone(&self.shared),
            cancel.clone(),
            LoopExit(Arc::clone(&self.shared)),
        ));
        let recv_task = tokio::spawn(receive_loop(
            reader,
            Arc::clone(&self.shared),
            cancel.clone(),
            LoopExit(Arc::clone(&self.shared)),
        ));

        *lifecycle = Lifecycle::Running(Running {
            cancel,
            send_task,
            recv_task,
        });
        self.shared.state.set(ConnectionState::Started);
        tracing::debug!("Connection to {} started", self.shared.remote);
        true
    }

    /// Stop the connection and release the socket.
    ///
    /// Idempotent. Waits up to [`ConnectionConfig::stop_timeout`] for both
    /// loops, then aborts whatever is still running.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        let running = match previous {
            Lifecycle::Stopped => return,
            Lifecycle::Connected(stream) => {
                drop(stream);
                self.shared.queue.close();
                self.shared
                    .notifier
                    .notify(DisconnectKind::Cancel, "connection stopped before start");
                self.shared.state.set(ConnectionState::Stopped);
                return;
            }
            Lifecycle::Running(running) => running,
        };

        // The loops may already have finished on their own.
        if self.shared.state.current() != ConnectionState::Stopped {
            self.shared.state.set(ConnectionState::Stopping);
        }
        self.shared.queue.close();
        tracing::debug!("Stopping connection to {}", self.shared.remote);

        let Running {
            cancel,
            send_task,
            recv_task,
        } = running;
        cancel.cancel();

        let send_abort = send_task.abort_handle();
        let recv_abort = recv_task.abort_handle();
        let joined = tokio::time::timeout(self.shared.config.stop_timeout, async {
            let _ = send_task.await;
            let _ = recv_task.await;
        })
        .await;
        if joined.is_err() {
            tracing::warn!(
                "Loops for {} did not exit within {:?}, aborting",
                self.shared.remote,
                self.shared.config.stop_timeout
            );
            send_abort.abort();
            recv_abort.abort();
        }

        // No-op if a loop already reported.
        self.shared
            .notifier
            .notify(DisconnectKind::Cancel, "connection stopped");
        self.shared.state.set(ConnectionState::Stopped);
    }

    /// Queue a frame for transmission. Never blocks on I/O.
    ///
    /// Frames queued before [`Connection::start`] are sent once the send loop
    /// runs. After a failure or [`Connection::stop`] frames are discarded and
    /// nothing accumulates.
    pub fn send(&self, message_id: u32, payload: &[u8]) -> Result<(), FrameError> {
        self.shared.queue.enqueue(message_id, payload)
    }

    /// Take the one-shot disconnect notification. Returns `None` after the
    /// first call.
    pub fn take_disconnect_receiver(&self) -> Option<oneshot::Receiver<Disconnect>> {
        self.disconnect_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The remote endpoint.
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote
    }

    /// Categories incoming message ids are resolved against.
    pub fn categories(&self) -> ServiceCategory {
        self.shared.categories
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &ConnectionStateWatch {
        &self.shared.state
    }

    /// Bytes queued but not yet handed to the send loop.
    pub fn pending_bytes(&self) -> usize {
        self.shared.queue.pending_bytes()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Dropping without `stop` still ends the loops; their socket halves
        // close when they return.
        if let Lifecycle::Running(running) = &*self.lifecycle() {
            running.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Drain the send queue into the socket until cancelled or a write fails.
async fn send_loop(
    mut writer: OwnedWriteHalf,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    _exit: LoopExit,
) {
    let idle = shared.config.idle_backoff;
    loop {
        let batch = shared.queue.take_ready_batch();
        if batch.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    shared.notifier.notify(DisconnectKind::Cancel, "send loop cancelled");
                    break;
                }
                _ = tokio::time::timeout(idle, shared.queue.notified()) => {}
            }
            continue;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                shared.notifier.notify(DisconnectKind::Cancel, "send cancelled during write");
                break;
            }
            result = write_batch(&mut writer, &batch) => result,
        };
        tracing::trace!("Wrote {} bytes to {}", batch.len(), shared.remote);
        shared.queue.recycle(batch);

        if let Err(err) = result {
            shared.fail(
                DisconnectKind::classify(&err),
                format!("send failed: {err}"),
                &cancel,
            );
            break;
        }
    }
}

async fn write_batch(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read, reassemble, and dispatch frames until cancelled or the stream fails.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    _exit: LoopExit,
) {
    let mut buf = RecvBuffer::new(shared.config.recv_buffer_size);
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                shared.notifier.notify(DisconnectKind::Cancel, "receive loop cancelled");
                break;
            }
            read = reader.read(buf.unfilled()) => read,
        };

        let n = match read {
            Ok(0) => {
                shared.fail(DisconnectKind::Io, "server disconnected".into(), &cancel);
                break;
            }
            Ok(n) => n,
            Err(err) => {
                shared.fail(
                    DisconnectKind::classify(&err),
                    format!("receive failed: {err}"),
                    &cancel,
                );
                break;
            }
        };

        let registry = &shared.registry;
        let categories = shared.categories;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            buf.process(n, |message_id, bytes, offset, len| {
                registry.dispatch(categories, message_id, bytes, offset, len);
            })
        }));
        match result {
            Ok(Ok(frames)) => {
                tracing::trace!(
                    "Received {n} bytes from {}, dispatched {frames} frames",
                    shared.remote
                );
            }
            Ok(Err(err)) => {
                tracing::warn!("Dropping connection to {}: {err}", shared.remote);
                shared.fail(DisconnectKind::Io, err.to_string(), &cancel);
                break;
            }
            Err(_) => {
                tracing::error!(
                    "Message handler panicked, dropping connection to {}",
                    shared.remote
                );
                shared.fail(
                    DisconnectKind::Io,
                    "message handler panicked".into(),
                    &cancel,
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    type Received = mpsc::UnboundedReceiver<(u32, Vec<u8>)>;

    /// Registry that records every payload of the given ids in `GAME`.
    fn recording_registry(ids: &[u32]) -> (Arc<DispatchRegistry>, Received) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = DispatchRegistry::new();
        for &id in ids {
            let tx = tx.clone();
            registry
                .register(
                    ServiceCategory::GAME,
                    id,
                    move |bytes: &[u8], offset: usize, len: usize| {
                        let _ = tx.send((id, bytes[offset..offset + len].to_vec()));
                    },
                )
                .unwrap();
        }
        (Arc::new(registry), rx)
    }

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    async fn connect_to(addr: SocketAddr, registry: Arc<DispatchRegistry>) -> Connection {
        Connection::connect(addr, ServiceCategory::GAME, registry, ConnectionConfig::default())
            .await
            .unwrap()
    }

    async fn next(rx: &mut Received) -> (u32, Vec<u8>) {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let (listener, addr) = listener().await;
        drop(listener);

        let result = Connection::connect(
            addr,
            ServiceCategory::GAME,
            Arc::new(DispatchRegistry::new()),
            ConnectionConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(ConnectError::Io { .. })));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(DispatchRegistry::new())).await;
        let (_server, _) = listener.accept().await.unwrap();

        assert_eq!(conn.state().current(), ConnectionState::Connected);
        assert!(conn.start());
        assert_eq!(conn.state().current(), ConnectionState::Started);
        assert!(!conn.start(), "second start should be refused");

        conn.stop().await;
        assert_eq!(conn.state().current(), ConnectionState::Stopped);
        conn.stop().await;
        assert_eq!(conn.state().current(), ConnectionState::Stopped);
        assert!(!conn.start(), "stopped connection cannot restart");
    }

    #[tokio::test]
    async fn test_stop_reports_cancel_once() {
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(DispatchRegistry::new())).await;
        let (_server, _) = listener.accept().await.unwrap();
        let rx = conn.take_disconnect_receiver().unwrap();
        assert!(conn.take_disconnect_receiver().is_none());

        conn.start();
        conn.stop().await;

        let disconnect = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(disconnect.kind, DisconnectKind::Cancel);
    }

    #[tokio::test]
    async fn test_stop_before_start_releases_socket() {
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(DispatchRegistry::new())).await;
        let (mut server, _) = listener.accept().await.unwrap();
        let rx = conn.take_disconnect_receiver().unwrap();

        conn.stop().await;
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(WAIT, server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "server should see EOF");
        assert_eq!(rx.await.unwrap().kind, DisconnectKind::Cancel);
    }

    #[tokio::test]
    async fn test_sent_frames_arrive_in_order() {
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(DispatchRegistry::new())).await;
        let (mut server, _) = listener.accept().await.unwrap();

        conn.send(1, b"queued before start").unwrap();
        conn.start();
        conn.send(2, b"a").unwrap();
        conn.send(3, b"bcdef").unwrap();

        let mut expected = encode(1, b"queued before start").unwrap().to_vec();
        expected.extend_from_slice(&encode(2, b"a").unwrap());
        expected.extend_from_slice(&encode(3, b"bcdef").unwrap());

        let mut received = vec![0u8; expected.len()];
        tokio::time::timeout(WAIT, server.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_send_fails_synchronously() {
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(DispatchRegistry::new())).await;
        let _server = listener.accept().await.unwrap();

        let result = conn.send(1, &vec![0; crate::framing::MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
        assert_eq!(conn.pending_bytes(), 0);
        assert_eq!(conn.state().current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_fragmented_frames_dispatched_in_order() {
        let (listener, addr) = listener().await;
        let (registry, mut rx) = recording_registry(&[1, 2]);
        let conn = connect_to(addr, registry).await;
        let (mut server, _) = listener.accept().await.unwrap();
        conn.start();

        let mut stream = encode(1, b"a").unwrap().to_vec();
        stream.extend_from_slice(&encode(2, b"bcdef").unwrap());
        for chunk in [&stream[..3], &stream[3..10], &stream[10..]] {
            server.write_all(chunk).await.unwrap();
            server.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(next(&mut rx).await, (1, b"a".to_vec()));
        assert_eq!(next(&mut rx).await, (2, b"bcdef".to_vec()));
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_id_does_not_drop_connection() {
        let (listener, addr) = listener().await;
        let (registry, mut rx) = recording_registry(&[2]);
        let conn = connect_to(addr, registry).await;
        let (mut server, _) = listener.accept().await.unwrap();
        conn.start();

        let mut stream = encode(999, b"nobody listens").unwrap().to_vec();
        stream.extend_from_slice(&encode(2, b"still here").unwrap());
        server.write_all(&stream).await.unwrap();

        assert_eq!(next(&mut rx).await, (2, b"still here".to_vec()));
        assert_eq!(conn.state().current(), ConnectionState::Started);
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_server_close_reports_io() {
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(DispatchRegistry::new())).await;
        let (server, _) = listener.accept().await.unwrap();
        let rx = conn.take_disconnect_receiver().unwrap();
        conn.start();

        drop(server);
        let disconnect = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(disconnect.kind, DisconnectKind::Io);
        assert_eq!(disconnect.message, "server disconnected");

        // Both loops are gone, so the connection settles without `stop`.
        let mut states = conn.state().subscribe();
        tokio::time::timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Stopped))
            .await
            .unwrap()
            .unwrap();

        conn.stop().await;
        assert_eq!(conn.state().current(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_send_after_teardown_does_not_accumulate() {
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(DispatchRegistry::new())).await;
        let (server, _) = listener.accept().await.unwrap();
        let rx = conn.take_disconnect_receiver().unwrap();
        conn.start();

        drop(server);
        tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        conn.send(1, &[0; 60_000]).unwrap();
        assert_eq!(conn.pending_bytes(), 0, "failed connection should discard");

        conn.stop().await;
        let payload = vec![0u8; 60_000];
        for _ in 0..1000 {
            conn.send(1, &payload).unwrap();
        }
        assert_eq!(conn.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn test_stop_before_start_discards_queued_frames() {
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(DispatchRegistry::new())).await;
        let _server = listener.accept().await.unwrap();

        conn.send(1, b"held until start").unwrap();
        assert!(conn.pending_bytes() > 0);
        conn.stop().await;
        assert_eq!(conn.pending_bytes(), 0);
        conn.send(2, b"after stop").unwrap();
        assert_eq!(conn.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_reports_io() {
        let mut registry = DispatchRegistry::new();
        registry
            .register(
                ServiceCategory::GAME,
                7,
                |_: &[u8], _: usize, len: usize| {
                    assert_eq!(len, 0, "handler bug");
                },
            )
            .unwrap();
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(registry)).await;
        let (mut server, _) = listener.accept().await.unwrap();
        let rx = conn.take_disconnect_receiver().unwrap();
        conn.start();

        server.write_all(&encode(7, b"boom").unwrap()).await.unwrap();
        let disconnect = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(disconnect.kind, DisconnectKind::Io);
        assert_eq!(disconnect.message, "message handler panicked");

        let mut states = conn.state().subscribe();
        tokio::time::timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Stopped))
            .await
            .unwrap()
            .unwrap();

        // The send loop was cancelled too: the server sees the socket close.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(WAIT, server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_reports_io() {
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(DispatchRegistry::new())).await;
        let (mut server, _) = listener.accept().await.unwrap();
        let rx = conn.take_disconnect_receiver().unwrap();
        conn.start();

        server.write_all(&[0x00, 0x02, 0, 0, 0, 1]).await.unwrap();
        let disconnect = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(disconnect.kind, DisconnectKind::Io);
        assert!(disconnect.message.contains("malformed"));
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_reset_reports_socket() {
        let (listener, addr) = listener().await;
        let conn = connect_to(addr, Arc::new(DispatchRegistry::new())).await;
        let (server, _) = listener.accept().await.unwrap();
        let rx = conn.take_disconnect_receiver().unwrap();
        conn.start();

        // Zero linger turns the close into an RST.
        socket2::SockRef::from(&server)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(server);

        let disconnect = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(disconnect.kind, DisconnectKind::Socket);
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_blocking_connect() {
        let (listener, addr) = listener().await;
        let (registry, mut rx) = recording_registry(&[4]);
        let conn = Connection::connect_blocking(
            addr,
            ServiceCategory::GAME,
            registry,
            ConnectionConfig::default(),
        )
        .unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        conn.start();

        server.write_all(&encode(4, b"sync").unwrap()).await.unwrap();
        assert_eq!(next(&mut rx).await, (4, b"sync".to_vec()));
        conn.stop().await;
    }

    #[test]
    fn test_notifier_fires_once_under_contention() {
        let (notifier, rx) = DisconnectNotifier::new();
        let notifier = Arc::new(notifier);
        let fired = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..16)
            .map(|i| {
                let notifier = Arc::clone(&notifier);
                let fired = Arc::clone(&fired);
                std::thread::spawn(move || {
                    let kind = if i % 2 == 0 {
                        DisconnectKind::Socket
                    } else {
                        DisconnectKind::Io
                    };
                    if notifier.notify(kind, format!("thread {i}")) {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(rx.blocking_recv().is_ok());
    }

    #[test]
    fn test_error_classification() {
        let socket = [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
        ];
        for kind in socket {
            assert_eq!(
                DisconnectKind::classify(&io::Error::from(kind)),
                DisconnectKind::Socket
            );
        }
        assert_eq!(
            DisconnectKind::classify(&io::Error::from(io::ErrorKind::UnexpectedEof)),
            DisconnectKind::Io
        );
        assert_eq!(DisconnectKind::Io.to_string(), "IO");
    }
}
