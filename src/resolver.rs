use crate::domain_filter::Blocklist;
use crate::error::{ProxyError, ProxyResult};
use crate::request::Request;
use std::fmt;
use std::net::IpAddr;
use url::{Host, Url};

/// Literal that stands for "this machine's own primary address" in a rule.
pub const OWN_ADDRESS_SENTINEL: &str = "0.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteTarget {
    OwnAddress,
    Host(String),
}

impl RewriteTarget {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == OWN_ADDRESS_SENTINEL {
            RewriteTarget::OwnAddress
        } else {
            RewriteTarget::Host(raw.to_string())
        }
    }
}

/// Custom-domain rule: hosts starting with `match_prefix` have that prefix
/// replaced by the rewrite target and are sent to `rewrite_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRule {
    pub match_prefix: String,
    pub rewrite_target: RewriteTarget,
    pub rewrite_port: u16,
}

/// Where a request is allowed to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    /// Path and query sent upstream; `/` for tunnels.
    pub path: String,
    /// Normalized absolute URL as the client asked for it, before rewriting.
    pub url: String,
    pub rewritten: bool,
}

impl Destination {
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Applies custom-domain rewriting and the blocklist to request targets.
#[derive(Debug, Clone)]
pub struct HostResolver {
    rules: Vec<DomainRule>,
    blocklist: Blocklist,
    own_address: IpAddr,
}

impl HostResolver {
    pub fn new(rules: Vec<DomainRule>, blocklist: Blocklist, own_address: IpAddr) -> Self {
        Self {
            rules,
            blocklist,
            own_address,
        }
    }

    /// Resolves the request target to an approved destination.
    ///
    /// Unparseable or empty hosts are reported as `BlockedHost` so that no
    /// connection is attempted for them.
    pub fn resolve(&self, request: &Request) -> ProxyResult<Destination> {
        let parsed = if request.is_connect() {
            parse_authority(&request.target, Scheme::Https)
        } else {
            parse_http_target(&request.target, request.headers.get("host"))
        };

        let mut dest = parsed.ok_or_else(|| ProxyError::BlockedHost {
            host: request.target.clone(),
        })?;

        self.rewrite(&mut dest);

        if self.blocklist.is_blocked(&dest.host) {
            return Err(ProxyError::BlockedHost { host: dest.host });
        }
        Ok(dest)
    }

    /// First matching rule wins; later rules are not consulted.
    fn rewrite(&self, dest: &mut Destination) {
        let Some(rule) = self
            .rules
            .iter()
            .find(|r| !r.match_prefix.is_empty() && dest.host.starts_with(&r.match_prefix))
        else {
            return;
        };

        let replacement = match &rule.rewrite_target {
            RewriteTarget::OwnAddress => self.own_address.to_string(),
            RewriteTarget::Host(h) => h.clone(),
        };
        let suffix = &dest.host[rule.match_prefix.len()..];

        tracing::debug!(
            "Rewriting {} via rule {:?} -> {}{}:{}",
            dest.host,
            rule.match_prefix,
            replacement,
            suffix,
            rule.rewrite_port
        );

        dest.host = format!("{}{}", replacement, suffix);
        dest.port = rule.rewrite_port;
        dest.rewritten = true;
    }
}

/// Parses `host:port` (CONNECT form). Missing port means the scheme default.
fn parse_authority(authority: &str, scheme: Scheme) -> Option<Destination> {
    let (host, port) = split_host_port(authority, scheme.default_port())?;
    Some(Destination {
        url: format!("{}://{}:{}", scheme, host, port),
        host,
        port,
        scheme,
        path: "/".to_string(),
        rewritten: false,
    })
}

fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return (!host.is_empty()).then(|| (host.to_string(), port));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, p.parse().ok()?),
        None => (authority, default_port),
    };
    if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == '/' || c == '@') {
        return None;
    }
    Some((host.to_string(), port))
}

/// Parses an absolute URL, or an origin-form path completed by the Host header.
fn parse_http_target(target: &str, host_header: Option<&str>) -> Option<Destination> {
    let url = if target.starts_with('/') {
        let host = host_header?.trim();
        if host.is_empty() {
            return None;
        }
        Url::parse(&format!("http://{}{}", host, target)).ok()?
    } else {
        Url::parse(target).ok()?
    };

    let scheme = match url.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        _ => return None,
    };

    let host = match url.host()? {
        Host::Domain(d) => d.to_string(),
        Host::Ipv4(a) => a.to_string(),
        Host::Ipv6(a) => a.to_string(),
    };
    if host.is_empty() {
        return None;
    }

    let port = url.port().unwrap_or(scheme.default_port());
    let mut path = url.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(q) = url.query() {
        path.push('?');
        path.push_str(q);
    }

    Some(Destination {
        host,
        port,
        scheme,
        path,
        url: url.to_string(),
        rewritten: false,
    })
}
