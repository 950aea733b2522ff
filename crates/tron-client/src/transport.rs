use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tron_core::{ClientError, TimeoutKind};

use crate::config::Address;

/// Any bidirectional byte stream the pump can own.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a fresh stream to the daemon. Called once per connect attempt.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> io::Result<BoxedStream>;
}

/// Dials the configured Unix socket or TCP address.
#[derive(Clone, Debug)]
pub struct SocketDialer {
    address: Address,
}

impl SocketDialer {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

#[async_trait]
impl Dialer for SocketDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        match &self.address {
            #[cfg(unix)]
            Address::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Address::Unix(path) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unix sockets unavailable: {}", path.display()),
            )),
            Address::Tcp(host) => {
                let stream = TcpStream::connect(host.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Dial bounded by `timeout` and raced against `shutdown`.
pub(crate) async fn dial_with_timeout(
    dialer: &dyn Dialer,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<BoxedStream, ClientError> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(ClientError::Closed),
        res = tokio::time::timeout(timeout, dialer.dial()) => match res {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ClientError::Transport(format!("dial failed: {e}"))),
            Err(_) => Err(ClientError::timeout(TimeoutKind::Connect, timeout)),
        },
    }
}
