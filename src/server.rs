use crate::cache::CacheStore;
use crate::config::ProxySettings;
use crate::dialer::Dialer;
use crate::error::{ProxyError, ProxyResult};
use crate::forward::{ForwardOutcome, HttpForwarder};
use crate::request::{read_request_body, read_request_head};
use crate::resolver::HostResolver;
use crate::shutdown::Shutdown;
use crate::tunnel::{RelayEnd, Tunnel, RESPONSE_502};
use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

// ============================================================================
// CONSTANTS
// ============================================================================

const LISTEN_BACKLOG: i32 = 1024;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

// ============================================================================
// STATIC RESPONSES
// ============================================================================

pub const RESPONSE_403: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\
Content-Type: text/html\r\n\
Content-Length: 76\r\n\
Connection: close\r\n\
\r\n\
<html><body><h1>403 Forbidden</h1><p>This site is blocked.</p></body></html>";

pub const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\
\r\n";

// ============================================================================
// STATISTICS
// ============================================================================

/// Process-wide counters, shared by every instance.
#[derive(Debug, Default)]
pub struct Stats {
    pub total: AtomicU64,
    pub active: AtomicU64,
    pub blocked: AtomicU64,
    pub tunnels: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print(&self) {
        info!(
            "📊 total={} active={} blocked={} tunnels={} cache_hits={} cache_misses={} failed={} in={}MB out={}MB",
            self.total.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.blocked.load(Ordering::Relaxed),
            self.tunnels.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed) / 1_000_000,
            self.bytes_out.load(Ordering::Relaxed) / 1_000_000,
        );
    }
}

/// Decrements `active` when a connection task ends, including by abort.
struct ActiveGuard(Arc<Stats>);

impl ActiveGuard {
    fn new(stats: Arc<Stats>) -> Self {
        stats.total.fetch_add(1, Ordering::Relaxed);
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

// ============================================================================
// PROXY CONTEXT
// ============================================================================

/// Everything a connection handler needs. One context is shared by all
/// instances of the process, so they see the same cache and shutdown signal.
pub struct ProxyContext<D> {
    resolver: HostResolver,
    dialer: Arc<D>,
    forwarder: HttpForwarder<D>,
    stats: Arc<Stats>,
    shutdown: Shutdown,
    request_timeout: Duration,
    tunnel_timeout: Option<Duration>,
}

impl<D: Dialer> ProxyContext<D> {
    pub fn new(
        settings: &ProxySettings,
        dialer: D,
        cache: Option<CacheStore>,
        tls: TlsConnector,
        own_address: IpAddr,
        shutdown: Shutdown,
    ) -> Self {
        let dialer = Arc::new(dialer);
        Self {
            resolver: HostResolver::new(
                settings.rules.clone(),
                settings.blocklist.clone(),
                own_address,
            ),
            forwarder: HttpForwarder::new(
                dialer.clone(),
                tls,
                cache,
                settings.cache_mode,
                settings.upstream_timeout,
            ),
            dialer,
            stats: Arc::new(Stats::new()),
            shutdown,
            request_timeout: settings.request_timeout,
            tunnel_timeout: settings.tunnel_timeout,
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}

// ============================================================================
// LISTENER
// ============================================================================

/// Binds a listening socket the way every instance does: address reuse,
/// non-blocking, deep backlog.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

// ============================================================================
// ACCEPTOR
// ============================================================================

/// One listening instance.
pub struct ProxyServer<D> {
    listener: TcpListener,
    ctx: Arc<ProxyContext<D>>,
    grace_period: Duration,
}

impl<D: Dialer> ProxyServer<D> {
    pub fn new(listener: TcpListener, ctx: Arc<ProxyContext<D>>, grace_period: Duration) -> Self {
        Self {
            listener,
            ctx,
            grace_period,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the shutdown signal fires, then gives open
    /// connections `grace_period` to finish before aborting them.
    pub async fn run(self) -> io::Result<()> {
        let addr = self.listener.local_addr()?;
        let shutdown = self.ctx.shutdown.clone();
        let mut connections = JoinSet::new();

        loop {
            while connections.try_join_next().is_some() {}

            let (stream, peer) = tokio::select! {
                _ = shutdown.triggered() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed on {}: {}", addr, e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                },
            };

            let _ = stream.set_nodelay(true);
            let ctx = self.ctx.clone();
            let guard = ActiveGuard::new(ctx.stats.clone());

            connections.spawn(async move {
                let _guard = guard;
                if let Err(e) = handle_connection(stream, peer, &ctx).await {
                    if e.is_benign() {
                        debug!("Connection from {} ended: {}", peer, e);
                    } else {
                        debug!("Connection error from {}: {}", peer, e);
                        ctx.stats.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }

        drop(self.listener);
        info!(
            "Listener {} closed, waiting up to {:?} for {} connection(s)",
            addr,
            self.grace_period,
            connections.len()
        );

        let drained = timeout(self.grace_period, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "Grace period over on {}, aborting {} connection(s)",
                addr,
                connections.len()
            );
            connections.shutdown().await;
        }
        Ok(())
    }
}

// ============================================================================
// CONNECTION HANDLER
// ============================================================================

/// Serves one client connection: one request, then close.
pub async fn handle_connection<S, D>(
    stream: S,
    peer: SocketAddr,
    ctx: &ProxyContext<D>,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    D: Dialer,
{
    let mut reader = BufReader::new(stream);

    // The timeout covers the head only; a declared body may arrive slowly.
    let head = match timeout(ctx.request_timeout, read_request_head(&mut reader)).await {
        Ok(head) => head,
        Err(_) => {
            debug!("Read timeout from {}", peer);
            return Ok(());
        }
    };
    let request = match head {
        Ok(mut request) => read_request_body(&mut reader, &mut request)
            .await
            .map(|()| request),
        Err(e) => Err(e),
    };

    let request = match request {
        Ok(request) => request,
        Err(ProxyError::MalformedRequest {
            reason,
            status_allowed,
        }) => {
            debug!("Malformed request from {}: {}", peer, reason);
            if status_allowed {
                let client = reader.get_mut();
                let _ = client.write_all(RESPONSE_400).await;
                let _ = client.shutdown().await;
            }
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    debug!("{} {} {} from {}", request.method, request.target, request.version, peer);

    let dest = match ctx.resolver.resolve(&request) {
        Ok(dest) => dest,
        Err(ProxyError::BlockedHost { host }) => {
            ctx.stats.blocked.fetch_add(1, Ordering::Relaxed);
            warn!("🚫 Blocked: {}", host);
            if !request.is_connect() {
                let client = reader.get_mut();
                client.write_all(RESPONSE_403).await?;
                client.shutdown().await?;
            }
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if request.is_connect() {
        let early_data = reader.buffer().to_vec();
        let client = reader.into_inner();
        ctx.stats.tunnels.fetch_add(1, Ordering::Relaxed);

        let mut tunnel = Tunnel::new(&dest, &ctx.shutdown);
        let run = tunnel.run(client, &early_data, ctx.dialer.as_ref());
        let outcome = match ctx.tunnel_timeout {
            Some(limit) => match timeout(limit, run).await {
                Ok(result) => result?,
                Err(_) => {
                    debug!("Tunnel timeout for {}", dest.authority());
                    return Ok(());
                }
            },
            None => run.await?,
        };

        ctx.stats
            .bytes_out
            .fetch_add(outcome.client_to_upstream, Ordering::Relaxed);
        ctx.stats
            .bytes_in
            .fetch_add(outcome.upstream_to_client, Ordering::Relaxed);
        return match outcome.end {
            RelayEnd::Error(e) => Err(ProxyError::RelayInterrupted(e)),
            RelayEnd::Eof | RelayEnd::Shutdown => Ok(()),
        };
    }

    let mut client = reader.into_inner();
    let forwarded = match ctx.forwarder.forward(&request, &dest).await {
        Ok(forwarded) => forwarded,
        Err(e) => {
            let _ = client.write_all(RESPONSE_502).await;
            let _ = client.shutdown().await;
            return Err(e);
        }
    };

    if ctx.forwarder.cache().is_some() {
        let counter = match forwarded.outcome {
            ForwardOutcome::CacheHit
            | ForwardOutcome::StaleFallback
            | ForwardOutcome::Revalidated { changed: false } => &ctx.stats.cache_hits,
            ForwardOutcome::Fetched { .. } | ForwardOutcome::Revalidated { changed: true } => {
                &ctx.stats.cache_misses
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    ctx.stats
        .bytes_out
        .fetch_add(request.body.len() as u64, Ordering::Relaxed);
    ctx.stats
        .bytes_in
        .fetch_add(forwarded.payload.len() as u64, Ordering::Relaxed);

    client.write_all(&forwarded.payload).await?;
    client.flush().await?;
    match client.shutdown().await {
        Err(e) if e.kind() != ErrorKind::NotConnected => Err(e.into()),
        _ => Ok(()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
