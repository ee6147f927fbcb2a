//! Persistent response cache with hybrid recency/frequency (LRFU) eviction.
//!
//! Entries live in a SQLite table keyed by a request fingerprint. Every entry
//! carries a hit counter and the time of its last access; when an insert takes
//! the table past capacity, the entries with the lowest
//! `hits / (now - last_access + 1)` score are deleted in the same transaction.

use crate::error::{ProxyError, ProxyResult};
use crate::request::Headers;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Headers that vary between otherwise identical requests and must not split
/// cache entries.
const VOLATILE_HEADERS: &[&str] = &[
    "user-agent",
    "date",
    "connection",
    "proxy-connection",
    "keep-alive",
];

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS cache_entries (
    key         TEXT PRIMARY KEY,
    payload     BLOB NOT NULL,
    hits        INTEGER NOT NULL DEFAULT 1,
    last_access REAL NOT NULL
)";

/// Fingerprint of a cacheable request: method, normalized URL, non-volatile
/// headers (order-insensitive) and body.
pub fn cache_key(method: &str, url: &str, headers: &Headers, body: &[u8]) -> String {
    let mut relevant: Vec<(String, &str)> = headers
        .iter()
        .map(|(n, v)| (n.to_ascii_lowercase(), v))
        .filter(|(n, _)| !VOLATILE_HEADERS.contains(&n.as_str()))
        .collect();
    relevant.sort();

    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(url.as_bytes());
    hasher.update([0u8]);
    for (name, value) in &relevant {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update([0u8]);
    hasher.update((body.len() as u64).to_be_bytes());
    hasher.update(body);

    format!("{:x}", hasher.finalize())
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Metadata of one stored entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMeta {
    pub hit_count: u64,
    pub last_access: f64,
    pub payload_len: usize,
}

struct StoreInner {
    conn: Mutex<Connection>,
    max_entries: usize,
    location: Option<PathBuf>,
}

/// Shared handle to the cache. Clones refer to the same store.
///
/// The `*_at` methods take the clock reading explicitly and run on the calling
/// thread; the async `get`/`put` wrappers move the work to the blocking pool.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("location", &self.inner.location)
            .field("max_entries", &self.inner.max_entries)
            .finish()
    }
}

impl CacheStore {
    pub fn open(path: impl AsRef<Path>, max_entries: usize) -> ProxyResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProxyError::CacheUnavailable(format!("cannot create {:?}: {}", parent, e))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn, max_entries, Some(path.to_path_buf()))
    }

    pub fn open_in_memory(max_entries: usize) -> ProxyResult<Self> {
        Self::init(Connection::open_in_memory()?, max_entries, None)
    }

    fn init(conn: Connection, max_entries: usize, location: Option<PathBuf>) -> ProxyResult<Self> {
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                max_entries,
                location,
            }),
        };
        // A smaller capacity than the previous run takes effect immediately.
        let pruned = store.prune_at(max_entries, unix_now())?;
        if pruned > 0 {
            tracing::info!("Pruned {} cache entries down to capacity {}", pruned, max_entries);
        }
        Ok(store)
    }

    pub fn max_entries(&self) -> usize {
        self.inner.max_entries
    }

    pub fn location(&self) -> Option<&Path> {
        self.inner.location.as_deref()
    }

    /// Returns the payload and records the access, or `None` on a miss.
    pub fn get_at(&self, key: &str, now: f64) -> ProxyResult<Option<Vec<u8>>> {
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;

        let payload: Option<Vec<u8>> = tx
            .query_row(
                "SELECT payload FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        if payload.is_some() {
            tx.execute(
                "UPDATE cache_entries SET hits = hits + 1, last_access = ?2 WHERE key = ?1",
                params![key, now],
            )?;
        }
        tx.commit()?;
        Ok(payload)
    }

    /// Inserts or refreshes `key`, then evicts down to capacity. Returns the
    /// number of evicted entries.
    pub fn put_at(&self, key: &str, payload: &[u8], now: f64) -> ProxyResult<usize> {
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO cache_entries (key, payload, hits, last_access) VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 payload = excluded.payload,
                 hits = cache_entries.hits + 1,
                 last_access = excluded.last_access",
            params![key, payload, now],
        )?;
        let evicted = evict_lowest(&tx, self.inner.max_entries, now)?;

        tx.commit()?;
        Ok(evicted)
    }

    /// Evicts lowest-scoring entries until at most `max_entries` remain.
    pub fn prune_at(&self, max_entries: usize, now: f64) -> ProxyResult<usize> {
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;
        let evicted = evict_lowest(&tx, max_entries, now)?;
        tx.commit()?;
        Ok(evicted)
    }

    pub fn len(&self) -> ProxyResult<usize> {
        let conn = self.inner.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> ProxyResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Metadata lookup that does not count as an access.
    pub fn entry(&self, key: &str) -> ProxyResult<Option<EntryMeta>> {
        let conn = self.inner.conn.lock();
        let meta = conn
            .query_row(
                "SELECT hits, last_access, length(payload) FROM cache_entries WHERE key = ?1",
                params![key],
                |row| {
                    Ok(EntryMeta {
                        hit_count: row.get::<_, i64>(0)? as u64,
                        last_access: row.get(1)?,
                        payload_len: row.get::<_, i64>(2)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    pub async fn get(&self, key: &str) -> ProxyResult<Option<Vec<u8>>> {
        let store = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.get_at(&key, unix_now()))
            .await
            .map_err(|e| ProxyError::CacheUnavailable(format!("cache task failed: {}", e)))?
    }

    pub async fn put(&self, key: &str, payload: Vec<u8>) -> ProxyResult<usize> {
        let store = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.put_at(&key, &payload, unix_now()))
            .await
            .map_err(|e| ProxyError::CacheUnavailable(format!("cache task failed: {}", e)))?
    }
}

fn evict_lowest(conn: &Connection, max_entries: usize, now: f64) -> ProxyResult<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?;
    let excess = count - max_entries as i64;
    if excess <= 0 {
        return Ok(0);
    }

    let evicted = conn.execute(
        "DELETE FROM cache_entries WHERE key IN (
             SELECT key FROM cache_entries
             ORDER BY CAST(hits AS REAL) / (MAX(?1 - last_access, 0.0) + 1.0) ASC
             LIMIT ?2
         )",
        params![now, excess],
    )?;
    tracing::debug!("Evicted {} cache entries (capacity {})", evicted, max_entries);
    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut h = Headers::new();
        for (n, v) in pairs {
            h.push(*n, *v);
        }
        h
    }

    #[test]
    fn test_key_determinism() {
        let h = headers(&[("Accept", "text/html"), ("User-Agent", "curl/8")]);
        let a = cache_key("GET", "http://example.com/", &h, b"");
        let b = cache_key("get", "http://example.com/", &h, b"");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_key_ignores_volatile_headers_and_order() {
        let a = cache_key(
            "GET",
            "http://example.com/",
            &headers(&[("Accept", "*/*"), ("User-Agent", "curl/8"), ("X-A", "1")]),
            b"",
        );
        let b = cache_key(
            "GET",
            "http://example.com/",
            &headers(&[("x-a", "1"), ("User-Agent", "Firefox"), ("Date", "now"), ("Accept", "*/*")]),
            b"",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_changes_with_body_method_url_and_headers() {
        let h = headers(&[("Accept", "*/*")]);
        let base = cache_key("POST", "http://example.com/", &h, b"a=1");
        assert_ne!(base, cache_key("POST", "http://example.com/", &h, b"a=2"));
        assert_ne!(base, cache_key("PUT", "http://example.com/", &h, b"a=1"));
        assert_ne!(base, cache_key("POST", "http://example.com/x", &h, b"a=1"));
        assert_ne!(
            base,
            cache_key("POST", "http://example.com/", &headers(&[("Accept", "text/html")]), b"a=1")
        );
    }

    #[test]
    fn test_get_miss_and_hit_counting() {
        let store = CacheStore::open_in_memory(10).unwrap();
        assert_eq!(store.get_at("k", 1.0).unwrap(), None);

        store.put_at("k", b"payload", 1.0).unwrap();
        assert_eq!(store.entry("k").unwrap().unwrap().hit_count, 1);

        assert_eq!(store.get_at("k", 2.0).unwrap().as_deref(), Some(&b"payload"[..]));
        let meta = store.entry("k").unwrap().unwrap();
        assert_eq!(meta.hit_count, 2);
        assert_eq!(meta.last_access, 2.0);

        store.put_at("k", b"newer", 3.0).unwrap();
        let meta = store.entry("k").unwrap().unwrap();
        assert_eq!(meta.hit_count, 3);
        assert_eq!(meta.payload_len, 5);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let store = CacheStore::open_in_memory(5).unwrap();
        for i in 0..60u32 {
            let key = format!("k{}", i % 17);
            store.put_at(&key, b"x", i as f64).unwrap();
            if i % 3 == 0 {
                store.get_at(&format!("k{}", i % 5), i as f64).unwrap();
            }
            assert!(store.len().unwrap() <= 5);
        }
    }

    #[test]
    fn test_two_slot_scenario_evicts_older_of_equal_hits() {
        let store = CacheStore::open_in_memory(2).unwrap();
        store.put_at("A", b"a", 100.0).unwrap();
        store.put_at("B", b"b", 101.0).unwrap();
        let evicted = store.put_at("C", b"c", 102.0).unwrap();

        assert_eq!(evicted, 1);
        assert_eq!(store.len().unwrap(), 2);
        assert!(store.entry("A").unwrap().is_none());
        assert!(store.entry("B").unwrap().is_some());
        assert!(store.entry("C").unwrap().is_some());
    }

    #[test]
    fn test_equal_access_time_evicts_lower_hits() {
        let store = CacheStore::open_in_memory(3).unwrap();
        for key in ["A", "B", "C"] {
            store.put_at(key, b"v", 50.0).unwrap();
        }
        store.get_at("A", 50.0).unwrap();
        store.get_at("C", 50.0).unwrap();

        assert_eq!(store.prune_at(2, 50.0).unwrap(), 1);
        assert!(store.entry("B").unwrap().is_none());
        assert!(store.entry("A").unwrap().is_some());
        assert!(store.entry("C").unwrap().is_some());
    }

    #[test]
    fn test_hot_entry_survives_recent_cold_ones() {
        let store = CacheStore::open_in_memory(2).unwrap();
        store.put_at("hot", b"v", 0.0).unwrap();
        for t in 1..=20 {
            store.get_at("hot", t as f64).unwrap();
        }
        store.put_at("cold", b"v", 20.0).unwrap();
        store.put_at("new", b"v", 25.0).unwrap();

        // hot: 21 / 6, cold: 1 / 6, new: 1 / 1
        assert!(store.entry("hot").unwrap().is_some());
        assert!(store.entry("cold").unwrap().is_none());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        {
            let store = CacheStore::open(&path, 10).unwrap();
            store.put_at("persist", b"body", 1.0).unwrap();
        }
        let store = CacheStore::open(&path, 10).unwrap();
        assert_eq!(store.get_at("persist", 2.0).unwrap().as_deref(), Some(&b"body"[..]));
        assert_eq!(store.location(), Some(path.as_path()));
    }

    #[test]
    fn test_reopen_with_smaller_capacity_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let store = CacheStore::open(&path, 10).unwrap();
            for i in 0..6 {
                store.put_at(&format!("k{i}"), b"v", i as f64).unwrap();
            }
        }
        let store = CacheStore::open(&path, 3).unwrap();
        assert_eq!(store.len().unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_async_access() {
        let store = CacheStore::open_in_memory(8).unwrap();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let key = format!("k{}", i % 12);
                store.put(&key, vec![i as u8]).await.unwrap();
                store.get(&key).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(store.len().unwrap() <= 8);
    }
}
