//! Establishing the byte stream under a [`ClientNetwork`](super::ClientNetwork).

use std::io;

use futures::future::{BoxFuture, FutureExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

/// Opens the stream a client connection runs over.
pub trait Dialer: Send + Sync + 'static {
    /// The connected stream.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connects to `remote_address`.
    fn dial(&self, remote_address: &str) -> BoxFuture<'static, io::Result<Self::Stream>>;
}

/// Dials plain TCP. Addresses are `host:port`.
#[derive(Clone, Copy, Debug)]
pub struct TcpDialer {
    nodelay: bool,
}

impl TcpDialer {
    /// Creates a dialer, setting `TCP_NODELAY` on connected sockets when `nodelay` is `true`.
    pub fn new(nodelay: bool) -> Self {
        TcpDialer { nodelay }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        TcpDialer::new(true)
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    fn dial(&self, remote_address: &str) -> BoxFuture<'static, io::Result<TcpStream>> {
        let remote_address = remote_address.to_owned();
        let nodelay = self.nodelay;
        async move {
            let stream = TcpStream::connect(remote_address).await?;
            stream.set_nodelay(nodelay)?;
            Ok(stream)
        }
        .boxed()
    }
}
