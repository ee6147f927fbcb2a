use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cachingproxy::forward::tls_connector;
use cachingproxy::resolver::{DomainRule, RewriteTarget};
use cachingproxy::{
    bind_listener, CacheStore, ProxyContext, ProxyServer, ProxySettings, Shutdown, TcpDialer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const ORIGIN_REPLY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\nhello origin";

/// Origin that answers every request head with `ORIGIN_REPLY` and counts
/// connections.
async fn spawn_origin() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(ORIGIN_REPLY).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, hits)
}

/// Origin that echoes every byte back.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

struct RunningProxy {
    addr: SocketAddr,
    ctx: Arc<ProxyContext<TcpDialer>>,
    task: JoinHandle<std::io::Result<()>>,
    _dir: tempfile::TempDir,
}

async fn spawn_proxy(origin_port: u16) -> RunningProxy {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheStore::open(dir.path().join("cache.db"), 10).unwrap();

    let mut settings = ProxySettings::default();
    settings.blocklist.add("blocked.test");
    settings.rules.push(DomainRule {
        match_prefix: "origin.test".into(),
        rewrite_target: RewriteTarget::Host("127.0.0.1".into()),
        rewrite_port: origin_port,
    });
    settings.grace_period = Duration::from_millis(200);

    let ctx = Arc::new(ProxyContext::new(
        &settings,
        TcpDialer::new(Some(Duration::from_secs(2))),
        Some(cache),
        tls_connector().unwrap(),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        Shutdown::new(),
    ));

    let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
    let server = ProxyServer::new(listener, ctx.clone(), settings.grace_period);
    let addr = server.local_addr().unwrap();
    let task = tokio::spawn(server.run());

    RunningProxy {
        addr,
        ctx,
        task,
        _dir: dir,
    }
}

async fn send(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(request).await.unwrap();
    let mut reply = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    reply
}

async fn stop(proxy: RunningProxy) {
    proxy.ctx.shutdown().trigger();
    timeout(Duration::from_secs(2), proxy.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_repeated_get_is_served_from_cache() {
    let (origin, hits) = spawn_origin().await;
    let proxy = spawn_proxy(origin.port()).await;
    let request = format!(
        "GET http://127.0.0.1:{}/page HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nUser-Agent: first\r\n\r\n",
        origin.port(),
        origin.port()
    );

    let first = send(proxy.addr, request.as_bytes()).await;
    let second = send(
        proxy.addr,
        request.replace("User-Agent: first", "User-Agent: second").as_bytes(),
    )
    .await;

    assert_eq!(first, ORIGIN_REPLY);
    assert_eq!(second, ORIGIN_REPLY);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.ctx.stats().cache_hits.load(Ordering::Relaxed), 1);

    stop(proxy).await;
}

#[tokio::test]
async fn test_custom_domain_reaches_rewritten_origin() {
    let (origin, hits) = spawn_origin().await;
    let proxy = spawn_proxy(origin.port()).await;

    let reply = send(
        proxy.addr,
        b"GET http://origin.test/ HTTP/1.1\r\nHost: origin.test\r\n\r\n",
    )
    .await;

    assert_eq!(reply, ORIGIN_REPLY);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    stop(proxy).await;
}

#[tokio::test]
async fn test_connect_tunnel_relays_both_ways() {
    let echo = spawn_echo().await;
    let proxy = spawn_proxy(1).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo.port()).as_bytes())
        .await
        .unwrap();

    let established = b"HTTP/1.1 200 Connection established\r\n\r\n";
    let mut head = vec![0u8; established.len()];
    client.read_exact(&mut head).await.unwrap();
    assert_eq!(head, established);

    let payload = vec![0x5a; 10_000];
    client.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);

    drop(client);
    stop(proxy).await;
}

#[tokio::test]
async fn test_blocked_hosts() {
    let (origin, hits) = spawn_origin().await;
    let proxy = spawn_proxy(origin.port()).await;

    let reply = send(
        proxy.addr,
        b"GET http://www.blocked.test/ HTTP/1.1\r\nHost: www.blocked.test\r\n\r\n",
    )
    .await;
    assert!(reply.starts_with(b"HTTP/1.1 403 Forbidden"));

    let reply = send(proxy.addr, b"CONNECT blocked.test:443 HTTP/1.1\r\n\r\n").await;
    assert!(reply.is_empty());

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(proxy.ctx.stats().blocked.load(Ordering::Relaxed), 2);

    stop(proxy).await;
}

#[tokio::test]
async fn test_shutdown_ends_open_tunnel() {
    let echo = spawn_echo().await;
    let proxy = spawn_proxy(1).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo.port()).as_bytes())
        .await
        .unwrap();
    let mut head = [0u8; 39];
    client.read_exact(&mut head).await.unwrap();

    proxy.ctx.shutdown().trigger();

    let mut rest = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());

    timeout(Duration::from_secs(2), proxy.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
