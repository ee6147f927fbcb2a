use crate::error::{ProxyError, ProxyResult};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const MAX_LINE_LEN: usize = 16 * 1024;
const MAX_HEADERS: usize = 128;
const MAX_BODY_LEN: u64 = 64 * 1024 * 1024;
const MAX_LEADING_BLANK_LINES: usize = 4;

/// Request headers in arrival order. Lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A fully read client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Reads one request head and its `Content-Length` body from `reader`.
///
/// Partial delivery is fine: the reader is polled until the header block's
/// blank line and all declared body bytes have arrived. A stream that ends
/// earlier yields `IncompleteRequest`.
pub async fn read_request<R>(reader: &mut R) -> ProxyResult<Request>
where
    R: AsyncBufRead + Unpin,
{
    let mut request = read_request_head(reader).await?;
    read_request_body(reader, &mut request).await?;
    Ok(request)
}

/// Reads the request line and headers up to the blank line. The returned
/// request has an empty body.
pub async fn read_request_head<R>(reader: &mut R) -> ProxyResult<Request>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(256);

    let mut request_line = None;
    for _ in 0..=MAX_LEADING_BLANK_LINES {
        if !read_line(reader, &mut line).await? {
            return Err(ProxyError::IncompleteRequest);
        }
        if !line.is_empty() {
            let text = std::str::from_utf8(&line)
                .map_err(|_| ProxyError::malformed_line("request line is not UTF-8"))?;
            request_line = Some(text.to_string());
            break;
        }
    }
    let request_line =
        request_line.ok_or_else(|| ProxyError::malformed_line("no request line"))?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ProxyError::malformed_line(format!(
            "request line has {} tokens",
            parts.len()
        )));
    }
    let (method, target, version) = (parts[0], parts[1], parts[2]);

    let mut headers = Headers::new();
    loop {
        if !read_line(reader, &mut line).await? {
            return Err(ProxyError::IncompleteRequest);
        }
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ProxyError::malformed_header("too many headers"));
        }
        let text = std::str::from_utf8(&line)
            .map_err(|_| ProxyError::malformed_header("header is not UTF-8"))?;
        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| ProxyError::malformed_header(format!("header without colon: {text}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ProxyError::malformed_header("empty header name"));
        }
        headers.push(name, value.trim());
    }

    Ok(Request {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        body: Vec::new(),
    })
}

/// Reads the `Content-Length` body announced by `request`'s headers.
pub async fn read_request_body<R>(reader: &mut R, request: &mut Request) -> ProxyResult<()>
where
    R: AsyncBufRead + Unpin,
{
    // Chunked bodies are not decoded; the request is treated as bodiless.
    if request.is_chunked() {
        return Ok(());
    }

    if let Some(raw) = request.headers.get("content-length") {
        let len: u64 = raw
            .parse()
            .map_err(|_| ProxyError::malformed_header(format!("bad content-length: {raw}")))?;
        if len > MAX_BODY_LEN {
            return Err(ProxyError::malformed_header("body too large"));
        }
        let mut body = vec![0u8; len as usize];
        match reader.read_exact(&mut body).await {
            Ok(_) => request.body = body,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProxyError::IncompleteRequest)
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Reads one line into `buf` without its terminator. Returns `false` on a
/// clean EOF before any byte of the line.
pub(crate) async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> ProxyResult<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', buf)
        .await?;

    if n == 0 {
        return Ok(false);
    }

    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE_LEN {
            return Err(ProxyError::malformed_header("line too long"));
        }
        return Err(ProxyError::IncompleteRequest);
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(true)
}
