use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Opens outbound byte streams toward origins.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn dial(&self, host: &str, port: u16) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP dialer with an optional connect timeout.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let connect_future = TcpStream::connect((host, port));

        let stream = match self.connect_timeout {
            Some(timeout_duration) => match timeout(timeout_duration, connect_future).await {
                Ok(result) => result?,
                Err(_) => {
                    debug!("Upstream timeout {}:{}", host, port);
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {}:{} timed out", host, port),
                    ));
                }
            },
            None => connect_future.await?,
        };

        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}
