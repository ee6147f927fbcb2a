//! Forward HTTP/HTTPS proxy with CONNECT tunneling, custom-domain rewriting,
//! a host blocklist and a persistent LRFU response cache for plain requests.

pub mod cache;
pub mod config;
pub mod dialer;
pub mod domain_filter;
pub mod error;
pub mod forward;
pub mod netutil;
pub mod request;
pub mod resolver;
pub mod server;
pub mod shutdown;
pub mod tunnel;

pub use cache::CacheStore;
pub use config::{FileConfig, ProxySettings};
pub use dialer::{Dialer, TcpDialer};
pub use error::{ProxyError, ProxyResult};
pub use server::{bind_listener, ProxyContext, ProxyServer, Stats};
pub use shutdown::Shutdown;
