//! The client side of a framed connection.
//!
//! A [`ClientNetwork`] is single use: it connects once, runs until something tears it down, and is then done.
//! Reconnecting means building a new instance.
//!
//! Once connected, three tasks share the connection:
//!
//! - the **receive loop** reads from the socket into a bounded pipe of byte chunks,
//! - the **parse loop** drains the pipe, cuts frames out of the accumulated bytes and delivers them to the session,
//! - the **writer** takes packed frames off the send queue and writes them to the socket in order.
//!
//! All three stop when the connection's [`CancellationToken`] is cancelled. Teardown cancels it, so a fault seen by
//! any one task stops the others.

use std::{
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{error::NetworkError, lifecycle::Component, timer::TimerScheduler};

use super::{
    buffer_pool::BufferPool,
    dialer::{Dialer, TcpDialer},
    framing::{LengthPrefixedFramer, PacketFramer},
    AtomicConnectionState, ConnectionState, NetworkConfig, Session,
};

const SEND_BUFFER_CAPACITY: usize = 1024;

static CHANNEL_COUNTER: AtomicU64 = AtomicU64::new(1);

type Callback = Box<dyn FnOnce() + Send>;

/// Callbacks reporting the outcome of [`ClientNetwork::connect`].
///
/// Exactly one of `on_complete` and `on_fail` is called. `on_disconnect` is called once when the connection is
/// torn down, whichever way that happens.
#[derive(Default)]
pub struct ConnectCallbacks {
    on_complete: Option<Callback>,
    on_fail: Option<Callback>,
    on_disconnect: Option<Callback>,
}

impl ConnectCallbacks {
    /// Creates an empty set of callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once the connection is established, before any packet is received.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Called if the connection could not be established, including when the connect timeout elapses.
    pub fn on_fail<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_fail = Some(Box::new(f));
        self
    }

    /// Called when the connection is torn down.
    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_disconnect = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for ConnectCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectCallbacks")
            .field("on_complete", &self.on_complete.is_some())
            .field("on_fail", &self.on_fail.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

/// Builder for a [`ClientNetwork`].
#[derive(Default)]
pub struct ClientNetworkBuilder {
    config: NetworkConfig,
    framer: Option<Arc<dyn PacketFramer>>,
    buffer_pool: Option<Arc<BufferPool>>,
}

impl ClientNetworkBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default [`LengthPrefixedFramer`].
    pub fn framer(mut self, framer: impl PacketFramer) -> Self {
        self.framer = Some(Arc::new(framer));
        self
    }

    /// Shares an outbound buffer pool with other connections.
    pub fn buffer_pool(mut self, buffer_pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(buffer_pool);
        self
    }

    /// Builds a client connecting over TCP.
    pub fn build<S>(self, scheduler: Arc<TimerScheduler>, session: S) -> ClientNetwork
    where
        S: Session,
    {
        let dialer = TcpDialer::new(self.config.nodelay);
        self.build_with_dialer(dialer, scheduler, session)
    }

    /// Builds a client connecting through `dialer`.
    pub fn build_with_dialer<D, S>(
        self,
        dialer: D,
        scheduler: Arc<TimerScheduler>,
        session: S,
    ) -> ClientNetwork<D>
    where
        D: Dialer,
        S: Session,
    {
        let ClientNetworkBuilder {
            config,
            framer,
            buffer_pool,
        } = self;

        let framer = framer
            .unwrap_or_else(|| Arc::new(LengthPrefixedFramer::new(config.max_packet_size)));
        let buffer_pool = buffer_pool.unwrap_or_else(|| {
            Arc::new(BufferPool::new(
                config.send_buffer_pool_size,
                SEND_BUFFER_CAPACITY,
            ))
        });
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        ClientNetwork {
            dialer,
            connect_called: AtomicBool::new(false),
            inner: Arc::new(Inner {
                config,
                scheduler,
                framer,
                session: Arc::new(session),
                buffer_pool,
                state: AtomicConnectionState::new(ConnectionState::Idle),
                disposed: AtomicBool::new(false),
                connect_settled: AtomicBool::new(false),
                connect_timer: AtomicU64::new(0),
                channel_id: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                callbacks: Mutex::new(ConnectCallbacks::default()),
                send_tx,
                send_rx: Mutex::new(Some(send_rx)),
            }),
        }
    }
}

impl fmt::Debug for ClientNetworkBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientNetworkBuilder")
            .field("config", &self.config)
            .field("framer", &self.framer.is_some())
            .field("buffer_pool", &self.buffer_pool)
            .finish()
    }
}

/// A single-use client connection carrying framed packets.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use shardline::{
///     network::{ClientNetwork, ConnectCallbacks, Packet},
///     timer::{TimerScheduler, TokioClock},
/// };
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = Arc::new(TimerScheduler::new(Arc::new(TokioClock::new())));
/// let _driver = scheduler.spawn_driver(CancellationToken::new());
///
/// let (session, mut packets) = mpsc::unbounded_channel::<Packet>();
/// let client = ClientNetwork::new(scheduler, session);
/// client.connect(
///     "127.0.0.1:20000",
///     ConnectCallbacks::new()
///         .on_complete(|| println!("connected"))
///         .on_fail(|| println!("connect failed"))
///         .on_disconnect(|| println!("disconnected")),
/// )?;
///
/// client.send(0, 1001, 0, b"hello");
/// if let Some(packet) = packets.recv().await {
///     println!("received op code {}", packet.op_code);
/// }
/// # Ok(())
/// # }
/// ```
pub struct ClientNetwork<D: Dialer = TcpDialer> {
    dialer: D,
    connect_called: AtomicBool,
    inner: Arc<Inner>,
}

struct Inner {
    config: NetworkConfig,
    scheduler: Arc<TimerScheduler>,
    framer: Arc<dyn PacketFramer>,
    session: Arc<dyn Session>,
    buffer_pool: Arc<BufferPool>,
    state: AtomicConnectionState,
    disposed: AtomicBool,
    connect_settled: AtomicBool,
    connect_timer: AtomicU64,
    channel_id: AtomicU64,
    cancel: CancellationToken,
    callbacks: Mutex<ConnectCallbacks>,
    send_tx: mpsc::UnboundedSender<BytesMut>,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<BytesMut>>>,
}

impl ClientNetwork {
    /// Creates a TCP client with the default configuration.
    pub fn new<S: Session>(scheduler: Arc<TimerScheduler>, session: S) -> Self {
        ClientNetworkBuilder::new().build(scheduler, session)
    }

    /// Returns a builder for configuring a client.
    pub fn builder() -> ClientNetworkBuilder {
        ClientNetworkBuilder::new()
    }
}

impl<D: Dialer> ClientNetwork<D> {
    /// Connects to `remote_address` using the configured connect timeout.
    ///
    /// See [`connect_with_timeout`](ClientNetwork::connect_with_timeout).
    pub fn connect(
        &self,
        remote_address: &str,
        callbacks: ConnectCallbacks,
    ) -> Result<(), NetworkError> {
        let timeout = self.inner.config.connect_timeout_ms;
        self.connect_with_timeout(remote_address, callbacks, timeout)
    }

    /// Connects to `remote_address`, failing if the connection is not up within `timeout_ms` milliseconds.
    ///
    /// Returns once the attempt is started; the outcome is reported through `callbacks`. The timeout is a timer on
    /// the scheduler, so the scheduler must be driven for it to fire.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::AlreadyConnected`] if `connect` was called before on this instance, and
    /// [`NetworkError::Disposed`] if the instance was disposed without ever connecting.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn connect_with_timeout(
        &self,
        remote_address: &str,
        callbacks: ConnectCallbacks,
        timeout_ms: i64,
    ) -> Result<(), NetworkError> {
        if self.connect_called.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::AlreadyConnected);
        }
        *self.inner.callbacks.lock() = callbacks;
        if !self
            .inner
            .state
            .transition(ConnectionState::Idle, ConnectionState::Connecting)
        {
            // disposed before connecting, the callbacks will never run
            *self.inner.callbacks.lock() = ConnectCallbacks::default();
            return Err(NetworkError::Disposed);
        }

        let weak = Arc::downgrade(&self.inner);
        let timer_id = self.inner.scheduler.once(timeout_ms, move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.fail_connect(timeout_ms);
            }
        });
        self.inner.connect_timer.store(timer_id, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let dial = self.dialer.dial(remote_address);
        let remote_address = remote_address.to_owned();
        tokio::spawn(async move {
            let res = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => return,
                res = dial => res,
            };

            match res {
                Ok(stream) => inner.on_connected(stream, &remote_address),
                Err(err) => {
                    warn!(remote_address, "connect failed: {err}");
                    inner.fail_connect(timeout_ms);
                }
            }
        });

        Ok(())
    }

    /// Queues a packet for sending.
    ///
    /// Packets sent before the connection is up are held and written once it is. Packets sent after teardown are
    /// dropped, and so are packets the framer refuses to pack. Write failures tear the connection down and are never
    /// reported here.
    pub fn send(&self, rpc_id: u32, op_code: u32, route_id: u64, payload: &[u8]) {
        if self.inner.disposed.load(Ordering::Acquire) {
            trace!(op_code, "client network disposed, dropping packet");
            return;
        }

        let mut buffer = self.inner.buffer_pool.rent();
        if let Err(err) = self
            .inner
            .framer
            .pack(rpc_id, op_code, route_id, payload, &mut buffer)
        {
            warn!(op_code, rpc_id, route_id, "dropping outgoing packet: {err}");
            self.inner.buffer_pool.return_buffer(buffer);
            return;
        }
        if let Err(err) = self.inner.send_tx.send(buffer) {
            trace!(op_code, "send queue closed, dropping packet");
            self.inner.buffer_pool.return_buffer(err.0);
        }
    }

    /// Tears the connection down on behalf of its owner.
    pub fn remove_channel(&self, channel_id: u64) {
        debug!(channel_id, "removing client channel");
        self.inner.dispose();
    }

    /// Tears the connection down. Later calls do nothing.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Returns the connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// Returns `true` if the connection is up.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns `true` once the connection has been torn down.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Returns the id assigned to the connection when it came up, or `0` if it is not connected.
    pub fn channel_id(&self) -> u64 {
        self.inner.channel_id.load(Ordering::Acquire)
    }

    /// Returns the outbound buffer pool.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.inner.buffer_pool
    }
}

impl<D: Dialer> Drop for ClientNetwork<D> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<D: Dialer> Component for ClientNetwork<D> {
    fn name(&self) -> &'static str {
        "ClientNetwork"
    }

    fn on_destroy(&self) {
        self.inner.dispose();
    }
}

impl<D: Dialer> fmt::Debug for ClientNetwork<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientNetwork")
            .field("state", &self.state())
            .field("channel_id", &self.channel_id())
            .finish()
    }
}

impl Inner {
    fn on_connected<S>(self: &Arc<Self>, stream: S, remote_address: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.connect_settled.swap(true, Ordering::AcqRel) {
            trace!(remote_address, "connection completed after the attempt was settled");
            return;
        }
        self.cancel_connect_timer();
        if !self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
        {
            return;
        }

        let channel_id = CHANNEL_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.channel_id.store(channel_id, Ordering::Release);
        debug!(remote_address, channel_id, "client network connected");

        let on_complete = self.callbacks.lock().on_complete.take();
        if let Some(on_complete) = on_complete {
            if panic::catch_unwind(AssertUnwindSafe(on_complete)).is_err() {
                error!(channel_id, "connect completion callback panicked");
                self.dispose();
                return;
            }
        }

        let (reader, writer) = tokio::io::split(stream);
        let (pipe_tx, pipe_rx) = mpsc::channel(self.config.pipe_capacity.max(1));
        tokio::spawn(receive_loop(Arc::clone(self), reader, pipe_tx));
        tokio::spawn(parse_loop(Arc::clone(self), pipe_rx));

        let send_rx = self.send_rx.lock().take();
        if let Some(send_rx) = send_rx {
            tokio::spawn(write_loop(Arc::clone(self), writer, send_rx));
        }
    }

    fn fail_connect(&self, timeout_ms: i64) {
        if self.connect_settled.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(timeout_ms, "client network failed to connect");

        let on_fail = self.callbacks.lock().on_fail.take();
        if let Some(on_fail) = on_fail {
            on_fail();
        }
        self.dispose();
    }

    fn cancel_connect_timer(&self) {
        let timer_id = self.connect_timer.swap(0, Ordering::AcqRel);
        if timer_id != 0 {
            self.scheduler.cancel(timer_id);
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.connect_settled.store(true, Ordering::Release);
        self.state.store(ConnectionState::Closed);
        self.cancel_connect_timer();
        self.cancel.cancel();

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        if let Some(on_disconnect) = callbacks.on_disconnect {
            on_disconnect();
        }

        let send_rx = self.send_rx.lock().take();
        if let Some(mut send_rx) = send_rx {
            send_rx.close();
            while let Ok(buffer) = send_rx.try_recv() {
                self.buffer_pool.return_buffer(buffer);
            }
        }

        let channel_id = self.channel_id.swap(0, Ordering::AcqRel);
        debug!(channel_id, "client network disposed");
    }
}

async fn receive_loop<R>(inner: Arc<Inner>, mut reader: R, pipe: mpsc::Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let read_size = inner.config.receive_buffer_size.max(1);
    let mut buffer = BytesMut::with_capacity(read_size);

    loop {
        buffer.reserve(read_size);
        let read = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            read = reader.read_buf(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                // dropping the pipe lets the parse loop drain what was already read
                debug!("remote end closed the connection");
                break;
            }
            Ok(_) => {
                let chunk = buffer.split().freeze();
                let sent = tokio::select! {
                    biased;
                    _ = inner.cancel.cancelled() => break,
                    sent = pipe.send(chunk) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(err) => {
                log_io_error("receive", &err);
                inner.dispose();
                break;
            }
        }
    }
}

async fn parse_loop(inner: Arc<Inner>, mut pipe: mpsc::Receiver<Bytes>) {
    let mut buffer = BytesMut::new();

    'read: loop {
        let chunk = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            chunk = pipe.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            if !buffer.is_empty() {
                debug!(
                    len = buffer.len(),
                    "connection closed partway through a frame"
                );
            }
            inner.dispose();
            break;
        };
        buffer.extend_from_slice(&chunk);

        loop {
            if inner.cancel.is_cancelled() {
                break 'read;
            }

            match inner.framer.try_unpack(&mut buffer) {
                Ok(Some(packet)) => {
                    let op_code = packet.op_code;
                    let session = &inner.session;
                    if panic::catch_unwind(AssertUnwindSafe(|| session.receive(packet))).is_err() {
                        error!(op_code, "session panicked while receiving a packet");
                        inner.dispose();
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("malformed frame, closing connection: {err}");
                    inner.dispose();
                    break 'read;
                }
            }
        }
    }

    pipe.close();
}

async fn write_loop<W>(inner: Arc<Inner>, mut writer: W, mut queue: mpsc::UnboundedReceiver<BytesMut>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let buffer = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            buffer = queue.recv() => buffer,
        };
        let Some(buffer) = buffer else {
            break;
        };

        // flush once the queue runs dry
        let written = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => None,
            res = async {
                writer.write_all(&buffer).await?;
                if queue.is_empty() {
                    writer.flush().await?;
                }
                Ok::<_, io::Error>(())
            } => Some(res),
        };
        inner.buffer_pool.return_buffer(buffer);

        match written {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                log_io_error("send", &err);
                inner.dispose();
                break;
            }
            None => break,
        }
    }

    queue.close();
    while let Ok(buffer) = queue.try_recv() {
        inner.buffer_pool.return_buffer(buffer);
    }
    let _ = writer.shutdown().await;
}

fn log_io_error(op: &str, err: &io::Error) {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotConnected => debug!(op, "socket closed: {err}"),
        _ => error!(op, "socket error: {err}"),
    }
}
