//! Framed TCP client transport.
//!
//! A [`ClientNetwork`] owns one connection to a remote node. Bytes read from the socket flow through a bounded
//! pipeline into a parse loop, which cuts them into [`Packet`]s with a [`PacketFramer`] and hands each one to the
//! owning [`Session`] in arrival order. Outbound packets are packed into pooled buffers and written by a single
//! writer task, so they leave in the order `send` was called.
//!
//! Any fault on the connection (a socket error, end of stream, a malformed frame, the connect timeout firing)
//! leads to the same teardown, which runs once no matter how many of them race.

pub mod buffer_pool;
pub mod dialer;
pub mod framing;
pub mod tcp_client;

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

pub use buffer_pool::BufferPool;
pub use dialer::{Dialer, TcpDialer};
pub use framing::{LengthPrefixedFramer, Packet, PacketFramer};
pub use tcp_client::{ClientNetwork, ClientNetworkBuilder, ConnectCallbacks};

/// Configuration for a [`ClientNetwork`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Time allowed for the connection to be established, in milliseconds.
    pub connect_timeout_ms: i64,
    /// Bytes reserved for each socket read.
    pub receive_buffer_size: usize,
    /// Number of received chunks buffered between the receive and parse loops.
    pub pipe_capacity: usize,
    /// Largest payload accepted from the remote end.
    pub max_packet_size: usize,
    /// Number of outbound buffers retained for reuse.
    pub send_buffer_pool_size: usize,
    /// Sets `TCP_NODELAY` on connected sockets.
    pub nodelay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            connect_timeout_ms: 5000,
            receive_buffer_size: 8192,
            pipe_capacity: 64,
            max_packet_size: 1024 * 1024,
            send_buffer_pool_size: 128,
            nodelay: true,
        }
    }
}

/// Lifecycle state of a [`ClientNetwork`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// `connect` has not been called.
    Idle = 0,
    /// Waiting for the connection to be established.
    Connecting = 1,
    /// The connection is up and its loops are running.
    Connected = 2,
    /// Torn down. Terminal.
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub(crate) fn new(state: ConnectionState) -> Self {
        AtomicConnectionState(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ConnectionState {
        self.0.load(Ordering::Acquire).into()
    }

    pub(crate) fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves from `current` to `new`, returning `false` if the state was no longer `current`.
    pub(crate) fn transition(&self, current: ConnectionState, new: ConnectionState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Receives the packets decoded from a connection.
///
/// `receive` is called from the connection's parse loop, one packet at a time and in arrival order. It should
/// hand the packet off quickly; the loop does not read further frames until it returns.
pub trait Session: Send + Sync + 'static {
    /// Handles one decoded packet.
    fn receive(&self, packet: Packet);
}

impl Session for mpsc::UnboundedSender<Packet> {
    fn receive(&self, packet: Packet) {
        if let Err(err) = self.send(packet) {
            trace!(op_code = err.0.op_code, "session receiver dropped, discarding packet");
        }
    }
}
