#![warn(clippy::all)]

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cachingproxy::config::CacheSettings;
use cachingproxy::forward::{tls_connector, CacheMode};
use cachingproxy::{
    bind_listener, netutil, CacheStore, FileConfig, ProxyContext, ProxyServer, ProxySettings,
    Shutdown, TcpDialer,
};
use clap::Parser;
use tracing::{error, info, warn};

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8100)]
    port: u16,

    /// Move to the next free port(s) when the requested one is taken
    #[arg(long)]
    auto_port: bool,

    /// Number of listening instances on consecutive ports (0 = one per CPU less one)
    #[arg(long, default_value_t = 1)]
    instances: usize,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra blocklist file, one host fragment per line
    #[arg(long)]
    blocklist: Option<PathBuf>,

    #[arg(long)]
    cache_db: Option<PathBuf>,

    #[arg(long)]
    cache_size: Option<usize>,

    #[arg(long)]
    no_cache: bool,

    /// Re-fetch cached responses and refresh entries that changed
    #[arg(long)]
    revalidate: bool,

    #[arg(long, default_value_t = 10)]
    timeout_connect: u64,

    #[arg(long, default_value_t = 30)]
    timeout_upstream: u64,

    #[arg(long, default_value_t = 0)]
    timeout_tunnel: u64,

    #[arg(long, default_value_t = 5)]
    timeout_request: u64,

    #[arg(long, default_value_t = 5)]
    grace_period: u64,

    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// ============================================================================
// SETTINGS
// ============================================================================

/// Defaults, then the configuration file, then command-line flags.
fn settings_from_args(args: &Args) -> anyhow::Result<ProxySettings> {
    let mut settings = ProxySettings::default();

    if let Some(ref path) = args.config {
        settings.apply_file(FileConfig::load(path)?)?;
    }

    if let Some(ref path) = args.blocklist {
        settings.blocklist.load_file(path)?;
    }

    settings.host = args.host.clone();
    settings.port = args.port;
    settings.instances = match args.instances {
        0 => num_cpus::get().saturating_sub(1).max(1),
        n => n,
    };

    if args.no_cache {
        settings.cache = None;
    } else {
        let cache = settings.cache.get_or_insert_with(|| CacheSettings {
            path: PathBuf::from(cachingproxy::config::DEFAULT_CACHE_FILE),
            max_entries: cachingproxy::config::DEFAULT_CACHE_SIZE,
        });
        if let Some(ref path) = args.cache_db {
            cache.path = path.clone();
        }
        if let Some(size) = args.cache_size {
            cache.max_entries = size;
        }
    }

    if args.revalidate {
        settings.cache_mode = CacheMode::Revalidate;
    }

    settings.connect_timeout = optional_secs(args.timeout_connect);
    settings.upstream_timeout = optional_secs(args.timeout_upstream);
    settings.tunnel_timeout = optional_secs(args.timeout_tunnel);
    settings.request_timeout = Duration::from_secs(args.timeout_request.max(1));
    settings.grace_period = Duration::from_secs(args.grace_period);

    settings.validate()?;
    Ok(settings)
}

fn instance_ports(settings: &ProxySettings, auto_port: bool) -> anyhow::Result<Vec<u16>> {
    if auto_port {
        return netutil::find_available_ports(&settings.host, settings.port, settings.instances)
            .with_context(|| format!("no {} free port(s) from {}", settings.instances, settings.port));
    }
    Ok((0..settings.instances)
        .map(|i| settings.port + i as u16)
        .collect())
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings = settings_from_args(&args)?;

    let own_address = if settings.needs_own_address() {
        let ip = netutil::primary_ipv4();
        info!("Own address for custom domains: {}", ip);
        ip
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };

    let cache = match &settings.cache {
        Some(cache) => match CacheStore::open(&cache.path, cache.max_entries) {
            Ok(store) => {
                info!(
                    "Cache at {:?} ({} of {} entries used)",
                    store.location().unwrap_or(cache.path.as_path()),
                    store.len().unwrap_or(0),
                    store.max_entries()
                );
                Some(store)
            }
            Err(e) => {
                warn!("Cache unavailable, continuing without it: {}", e);
                None
            }
        },
        None => None,
    };

    let shutdown = Shutdown::new();
    let ctx = Arc::new(ProxyContext::new(
        &settings,
        TcpDialer::new(settings.connect_timeout),
        cache,
        tls_connector()?,
        own_address,
        shutdown.clone(),
    ));

    let ports = instance_ports(&settings, args.auto_port)?;
    let mut servers = Vec::with_capacity(ports.len());
    for port in ports {
        let addr: SocketAddr = format!("{}:{}", settings.host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", settings.host, port))?;

        let listener = match bind_listener(addr) {
            Ok(listener) => listener,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                anyhow::bail!("port {} already in use (try --auto-port or --port)", port);
            }
            Err(e) => return Err(e).with_context(|| format!("bind {} failed", addr)),
        };

        info!("🚀 Proxy listening on http://{}", addr);
        let server = ProxyServer::new(listener, ctx.clone(), settings.grace_period);
        servers.push(tokio::spawn(server.run()));
    }

    if args.stats_interval > 0 {
        let stats = ctx.stats().clone();
        let stop = shutdown.clone();
        let interval = args.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = stop.triggered() => break,
                    _ = timer.tick() => stats.print(),
                }
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupt received, shutting down"),
                Err(e) => error!("Cannot listen for interrupt, shutting down: {}", e),
            }
            shutdown.trigger();
        });
    }

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Instance failed: {}", e),
            Err(e) => error!("Instance task failed: {}", e),
        }
    }

    ctx.stats().print();
    info!("Shutdown complete");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("cachingproxy").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let settings = settings_from_args(&parse(&[])).unwrap();
        assert_eq!(settings.port, 8100);
        assert_eq!(settings.instances, 1);
        assert_eq!(settings.cache_mode, CacheMode::ServeStored);
        assert_eq!(settings.tunnel_timeout, None);
        assert_eq!(settings.connect_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("Config.json");
        std::fs::write(
            &config,
            r#"{"MAX_CACHE_SIZE": 25, "CACHE_FILE": "from_file.db", "BlockSites": ["tiktok"]}"#,
        )
        .unwrap();

        let settings = settings_from_args(&parse(&[
            "--config",
            config.to_str().unwrap(),
            "--cache-size",
            "7",
            "--revalidate",
        ]))
        .unwrap();

        let cache = settings.cache.unwrap();
        assert_eq!(cache.max_entries, 7);
        assert_eq!(cache.path, PathBuf::from("from_file.db"));
        assert_eq!(settings.cache_mode, CacheMode::Revalidate);
        assert!(settings.blocklist.is_blocked("www.tiktok.com"));
    }

    #[test]
    fn test_no_cache_and_auto_instances() {
        let settings = settings_from_args(&parse(&["--no-cache", "--instances", "0"])).unwrap();
        assert!(settings.cache.is_none());
        assert!(settings.instances >= 1);
    }

    #[test]
    fn test_missing_config_file_fails() {
        assert!(settings_from_args(&parse(&["--config", "/nonexistent/Config.json"])).is_err());
    }

    #[test]
    fn test_instance_ports_consecutive() {
        let mut settings = ProxySettings::default();
        settings.port = 9000;
        settings.instances = 3;
        assert_eq!(instance_ports(&settings, false).unwrap(), vec![9000, 9001, 9002]);
    }
}
