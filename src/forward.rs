use crate::cache::{cache_key, CacheStore};
use crate::dialer::Dialer;
use crate::error::{ProxyError, ProxyResult};
use crate::request::{read_line, Request};
use crate::resolver::{Destination, Scheme};
use rustls::pki_types::ServerName;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

const MAX_RESPONSE_LEN: u64 = 64 * 1024 * 1024;

/// Request headers that only concern the client-proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "expect",
    "content-length",
];

/// How a cache hit for a plain request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Serve the stored payload without contacting the origin.
    #[default]
    ServeStored,
    /// Re-fetch on every hit; replace the entry when the origin's answer changed.
    Revalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    CacheHit,
    Fetched { stored: bool },
    Revalidated { changed: bool },
    /// Revalidation failed; the stored payload was served instead.
    StaleFallback,
}

#[derive(Debug)]
pub struct Forwarded {
    pub payload: Vec<u8>,
    pub outcome: ForwardOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Status line, headers and body exactly as received.
    pub raw: Vec<u8>,
}

impl UpstreamResponse {
    pub fn is_cacheable(&self) -> bool {
        self.status < 500
    }
}

/// Builds the TLS client used for `https` origins, trusting the Mozilla root set.
pub fn tls_connector() -> ProxyResult<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ProxyError::Config(format!("TLS setup failed: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Plain-request path: cache lookup, upstream exchange, cache refresh.
pub struct HttpForwarder<D> {
    dialer: Arc<D>,
    tls: TlsConnector,
    cache: Option<CacheStore>,
    mode: CacheMode,
    io_timeout: Option<Duration>,
}

impl<D: Dialer> HttpForwarder<D> {
    pub fn new(
        dialer: Arc<D>,
        tls: TlsConnector,
        cache: Option<CacheStore>,
        mode: CacheMode,
        io_timeout: Option<Duration>,
    ) -> Self {
        Self {
            dialer,
            tls,
            cache,
            mode,
            io_timeout,
        }
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    /// Resolves `request` to a full response payload.
    ///
    /// Cache failures never fail the request: they are logged and the origin
    /// is contacted directly.
    pub async fn forward(&self, request: &Request, dest: &Destination) -> ProxyResult<Forwarded> {
        let key = cache_key(&request.method, &dest.url, &request.headers, &request.body);

        let stored = match &self.cache {
            Some(cache) => match cache.get(&key).await {
                Ok(hit) => hit,
                Err(e) => {
                    warn!("Cache lookup failed, fetching {} directly: {}", dest.url, e);
                    None
                }
            },
            None => None,
        };

        if let Some(payload) = &stored {
            if self.mode == CacheMode::ServeStored {
                debug!("Cache hit for {} {}", request.method, dest.url);
                return Ok(Forwarded {
                    payload: payload.clone(),
                    outcome: ForwardOutcome::CacheHit,
                });
            }
        }

        let response = match self.fetch(request, dest).await {
            Ok(r) => r,
            Err(e) => {
                return match stored {
                    Some(payload) => {
                        warn!("Revalidation of {} failed, serving stored copy: {}", dest.url, e);
                        Ok(Forwarded {
                            payload,
                            outcome: ForwardOutcome::StaleFallback,
                        })
                    }
                    None => Err(e),
                };
            }
        };

        if let Some(payload) = stored {
            if same_content(&payload, &response.raw) {
                debug!("Cache hit for {} (origin unchanged)", dest.url);
                return Ok(Forwarded {
                    payload,
                    outcome: ForwardOutcome::Revalidated { changed: false },
                });
            }
            debug!("Cache update for {}", dest.url);
            self.store(&key, &response).await;
            return Ok(Forwarded {
                payload: response.raw,
                outcome: ForwardOutcome::Revalidated { changed: true },
            });
        }

        let stored = self.store(&key, &response).await;
        Ok(Forwarded {
            payload: response.raw,
            outcome: ForwardOutcome::Fetched { stored },
        })
    }

    async fn store(&self, key: &str, response: &UpstreamResponse) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        if !response.is_cacheable() {
            return false;
        }
        match cache.put(key, response.raw.clone()).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Cache write failed: {}", e);
                false
            }
        }
    }

    /// One upstream exchange; no retries.
    pub async fn fetch(&self, request: &Request, dest: &Destination) -> ProxyResult<UpstreamResponse> {
        let target = dest.authority();
        let head = build_upstream_request(request, dest);
        let head_only = request.method.eq_ignore_ascii_case("HEAD");

        let stream = self
            .dialer
            .dial(&dest.host, dest.port)
            .await
            .map_err(|e| ProxyError::upstream(&target, e))?;

        let exchange_future = self.exchange_over(stream, dest, &head, &request.body, head_only);
        let result = match self.io_timeout {
            Some(limit) => match timeout(limit, exchange_future).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "upstream exchange timed out")),
            },
            None => exchange_future.await,
        };

        result.map_err(|e| ProxyError::upstream(target, e))
    }

    async fn exchange_over(
        &self,
        stream: D::Stream,
        dest: &Destination,
        head: &[u8],
        body: &[u8],
        head_only: bool,
    ) -> io::Result<UpstreamResponse> {
        match dest.scheme {
            Scheme::Http => exchange(stream, head, body, head_only).await,
            Scheme::Https => {
                let name = ServerName::try_from(dest.host.clone())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let tls_stream = self.tls.connect(name, stream).await?;
                exchange(tls_stream, head, body, head_only).await
            }
        }
    }
}

/// Serializes the request for the origin: origin-form path, hop-by-hop
/// headers removed, `Host` guaranteed and `Connection: close` appended.
pub fn build_upstream_request(request: &Request, dest: &Destination) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, dest.path);

    if !request.headers.contains("host") {
        if dest.port == dest.scheme.default_port() {
            head.push_str(&format!("Host: {}\r\n", dest.host));
        } else {
            head.push_str(&format!("Host: {}\r\n", dest.authority()));
        }
    }

    for (name, value) in request.headers.iter() {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    if !request.body.is_empty() || request.headers.contains("content-length") {
        head.push_str(&format!("Content-Length: {}\r\n", request.body.len()));
    }
    head.push_str("Connection: close\r\n\r\n");
    head.into_bytes()
}

async fn exchange<S>(stream: S, head: &[u8], body: &[u8], head_only: bool) -> io::Result<UpstreamResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    stream.get_mut().write_all(head).await?;
    if !body.is_empty() {
        stream.get_mut().write_all(body).await?;
    }
    stream.get_mut().flush().await?;

    read_response(&mut stream, head_only).await
}

/// Reads one response. The body length comes from `Content-Length`; without
/// it the body runs to EOF, which `Connection: close` guarantees.
pub async fn read_response<R>(reader: &mut R, head_only: bool) -> io::Result<UpstreamResponse>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(4096);
    let mut line = Vec::with_capacity(256);

    if !read_line(reader, &mut line).await.map_err(to_io)? {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty upstream response"));
    }
    let status = parse_status_line(&line)?;
    raw.extend_from_slice(&line);
    raw.extend_from_slice(b"\r\n");

    let mut content_length: Option<u64> = None;
    loop {
        if !read_line(reader, &mut line).await.map_err(to_io)? {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated response head"));
        }
        raw.extend_from_slice(&line);
        raw.extend_from_slice(b"\r\n");
        if line.is_empty() {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        if let Some((name, value)) = text.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    let bodiless = head_only || (100..200).contains(&status) || status == 204 || status == 304;
    if bodiless {
        return Ok(UpstreamResponse { status, raw });
    }

    match content_length {
        Some(len) if len > MAX_RESPONSE_LEN => {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response too large"));
        }
        Some(len) => {
            let start = raw.len();
            raw.resize(start + len as usize, 0);
            reader.read_exact(&mut raw[start..]).await?;
        }
        None => {
            let start = raw.len();
            (&mut *reader)
                .take(MAX_RESPONSE_LEN + 1)
                .read_to_end(&mut raw)
                .await?;
            if (raw.len() - start) as u64 > MAX_RESPONSE_LEN {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "response too large"));
            }
        }
    }

    Ok(UpstreamResponse { status, raw })
}

/// Status line and body match; header differences such as `Date` are ignored.
fn same_content(stored: &[u8], fetched: &[u8]) -> bool {
    fn split(raw: &[u8]) -> (&[u8], &[u8]) {
        let status_end = raw.windows(2).position(|w| w == b"\r\n").unwrap_or(raw.len());
        let body_start = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map_or(raw.len(), |i| i + 4);
        (&raw[..status_end], &raw[body_start..])
    }
    split(stored) == split(fetched)
}

fn parse_status_line(line: &[u8]) -> io::Result<u16> {
    let text = String::from_utf8_lossy(line);
    let mut parts = text.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().and_then(|c| c.parse::<u16>().ok());
    match code {
        Some(code) if version.starts_with("HTTP/") && (100..1000).contains(&code) => Ok(code),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad status line: {}", text),
        )),
    }
}

fn to_io(e: ProxyError) -> io::Error {
    match e {
        ProxyError::Io(e) => e,
        ProxyError::IncompleteRequest => io::Error::from(io::ErrorKind::UnexpectedEof),
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}
