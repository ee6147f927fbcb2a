use crate::dialer::Dialer;
use crate::error::{ProxyError, ProxyResult};
use crate::resolver::Destination;
use crate::shutdown::Shutdown;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const RELAY_BUFFER_SIZE: usize = 4096;

pub const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
pub const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Handshake,
    Relaying,
    Closed,
}

/// Why one relay direction stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// Zero-length read: the reading side closed.
    Eof,
    Shutdown,
    Error(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    /// The direction that finished first and triggered the teardown.
    pub first_finished: Direction,
    pub end: RelayEnd,
}

/// CONNECT tunnel: `Handshake` dials the origin, `Relaying` copies bytes both
/// ways, `Closed` is terminal.
pub struct Tunnel<'a> {
    dest: &'a Destination,
    shutdown: &'a Shutdown,
    state: TunnelState,
}

impl<'a> Tunnel<'a> {
    pub fn new(dest: &'a Destination, shutdown: &'a Shutdown) -> Self {
        Self {
            dest,
            shutdown,
            state: TunnelState::Handshake,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Runs the tunnel to completion.
    ///
    /// `early_data` holds client bytes that arrived together with the CONNECT
    /// head; they are delivered upstream before relaying starts.
    pub async fn run<C, D>(
        &mut self,
        mut client: C,
        early_data: &[u8],
        dialer: &D,
    ) -> ProxyResult<RelayOutcome>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        D: Dialer,
    {
        debug_assert_eq!(self.state, TunnelState::Handshake);
        let authority = self.dest.authority();

        let mut upstream = match dialer.dial(&self.dest.host, self.dest.port).await {
            Ok(s) => s,
            Err(e) => {
                debug!("Tunnel handshake to {} failed: {}", authority, e);
                self.state = TunnelState::Closed;
                let _ = client.write_all(RESPONSE_502).await;
                let _ = client.shutdown().await;
                return Err(ProxyError::upstream(authority, e));
            }
        };

        client.write_all(RESPONSE_200_CONNECT).await?;
        client.flush().await?;

        if !early_data.is_empty() {
            upstream.write_all(early_data).await?;
        }

        self.state = TunnelState::Relaying;
        debug!("Tunnel to {} established", authority);

        let mut outcome = relay(client, upstream, self.shutdown).await;
        outcome.client_to_upstream += early_data.len() as u64;

        self.state = TunnelState::Closed;
        debug!(
            "Tunnel to {} closed ({:?} finished first, {:?}): up={} down={}",
            authority,
            outcome.first_finished,
            outcome.end,
            outcome.client_to_upstream,
            outcome.upstream_to_client
        );
        Ok(outcome)
    }
}

/// Copies bytes between `client` and `upstream` until either direction ends.
/// The other direction then stops at its next step boundary; each direction
/// shuts down its own write side on the way out.
pub async fn relay<C, U>(client: C, upstream: U, shutdown: &Shutdown) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let stop = Shutdown::new();

    let mut up = 0u64;
    let mut down = 0u64;

    let ((up_end, up_first), (down_end, _)) = tokio::join!(
        pump(&mut client_rd, &mut upstream_wr, &mut up, shutdown, &stop),
        pump(&mut upstream_rd, &mut client_wr, &mut down, shutdown, &stop),
    );

    let (first_finished, end) = if up_first {
        (Direction::ClientToUpstream, up_end)
    } else {
        (Direction::UpstreamToClient, down_end)
    };

    RelayOutcome {
        client_to_upstream: up,
        upstream_to_client: down,
        first_finished,
        end: end.unwrap_or(RelayEnd::Eof),
    }
}

/// One relay direction. Shutdown and `stop` are only observed while waiting
/// for the next read, so a chunk that was read is always written in full.
///
/// Returns how the direction ended (`None` when `stop` ended it) and whether
/// it was the first direction to finish.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &mut u64,
    shutdown: &Shutdown,
    stop: &Shutdown,
) -> (Option<RelayEnd>, bool)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUFFER_SIZE];
    let end = loop {
        let n = tokio::select! {
            biased;
            _ = shutdown.triggered() => break Some(RelayEnd::Shutdown),
            _ = stop.triggered() => break None,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Some(RelayEnd::Eof),
                Ok(n) => n,
                Err(e) => break Some(RelayEnd::Error(e)),
            },
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Some(RelayEnd::Error(e));
        }
        *counter += n as u64;
    };

    let first = !stop.is_triggered();
    stop.trigger();
    let _ = writer.shutdown().await;
    (end, first)
}
