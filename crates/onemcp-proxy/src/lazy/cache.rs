//! Bounded schema cache with request coalescing.
//!
//! Keyed by `(server, tool)`, LRU-evicted past `max_entries`, optionally
//! TTL-expired. Concurrent misses for one key share a single loader
//! invocation; the loader runs in a detached task, so a waiter giving up
//! does not abort the load for the others.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;

use onemcp_protocol::Tool;

use crate::config::SchemaCacheConfig;

/// Schema cache failures.
#[derive(Debug, Error)]
pub enum SchemaCacheError {
    /// The loader failed; the failure is surfaced, never cached.
    #[error("schema load failed: {0}")]
    Loader(String),

    #[error("schema cache internal error: {0}")]
    Internal(String),
}

type ToolKey = (String, String);

struct CacheEntry {
    tool: Tool,
    expires_at: Option<Instant>,
    last_access_seq: u64,
}

struct CacheEntries {
    map: HashMap<ToolKey, CacheEntry>,
    seq: u64,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    coalesced: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub coalesced_requests: u64,
    pub size: usize,
    pub max_entries: usize,
}

struct CacheShared {
    config: SchemaCacheConfig,
    entries: StdMutex<CacheEntries>,
    inflight: tokio::sync::Mutex<HashMap<ToolKey, broadcast::Sender<Result<Tool, String>>>>,
    counters: CacheCounters,
}

/// Shared-handle schema cache.
#[derive(Clone)]
pub struct SchemaCache {
    inner: Arc<CacheShared>,
}

impl SchemaCache {
    pub fn new(config: SchemaCacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheShared {
                config,
                entries: StdMutex::new(CacheEntries {
                    map: HashMap::new(),
                    seq: 0,
                }),
                inflight: tokio::sync::Mutex::new(HashMap::new()),
                counters: CacheCounters::default(),
            }),
        }
    }

    fn lookup(&self, key: &ToolKey, count_stats: bool) -> Option<Tool> {
        let mut entries = self.inner.entries.lock().expect("cache entries poisoned");
        let now = Instant::now();

        let expired = entries
            .map
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|deadline| now >= deadline);
        if expired {
            entries.map.remove(key);
        }

        entries.seq += 1;
        let seq = entries.seq;
        let found = entries.map.get_mut(key).map(|entry| {
            entry.last_access_seq = seq;
            entry.tool.clone()
        });

        if count_stats {
            if found.is_some() {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        found
    }

    /// Pure lookup; bumps recency and hit/miss counters.
    pub fn get_if_cached(&self, server: &str, tool: &str) -> Option<Tool> {
        self.lookup(&(server.to_string(), tool.to_string()), true)
    }

    /// Lookup, loading via `loader` on miss with per-key single-flight.
    ///
    /// The first caller for a key counts a miss and triggers the loader; a
    /// coalesced waiter counts a hit once the shared load lands. Loader
    /// failures propagate to every waiter and nothing is cached.
    pub async fn get<F, Fut>(
        &self,
        server: &str,
        tool: &str,
        loader: F,
    ) -> Result<Tool, SchemaCacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Tool, SchemaCacheError>> + Send + 'static,
    {
        let key: ToolKey = (server.to_string(), tool.to_string());

        if let Some(tool) = self.lookup(&key, false) {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(tool);
        }

        let mut loader = Some(loader);
        loop {
            if let Some(tool) = self.lookup(&key, false) {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(tool);
            }

            let mut inflight = self.inner.inflight.lock().await;
            if let Some(tx) = inflight.get(&key) {
                let mut rx = tx.subscribe();
                drop(inflight);
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                match rx.recv().await {
                    Ok(Ok(tool)) => {
                        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(tool);
                    }
                    Ok(Err(message)) => return Err(SchemaCacheError::Loader(message)),
                    // Producer vanished without publishing; re-evaluate.
                    Err(_) => continue,
                }
            }

            let Some(loader) = loader.take() else {
                return Err(SchemaCacheError::Internal(
                    "loader already consumed".to_string(),
                ));
            };

            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            let (tx, mut rx) = broadcast::channel(1);
            inflight.insert(key.clone(), tx.clone());
            drop(inflight);

            let cache = self.clone();
            let task_key = key.clone();
            let future = loader();
            tokio::spawn(async move {
                let result = future.await;
                if let Ok(tool) = &result {
                    cache.set(&task_key.0, &task_key.1, tool.clone());
                }
                cache.inner.inflight.lock().await.remove(&task_key);
                let _ = tx.send(result.map_err(|e| e.to_string()));
            });

            return match rx.recv().await {
                Ok(Ok(tool)) => Ok(tool),
                Ok(Err(message)) => Err(SchemaCacheError::Loader(message)),
                Err(_) => Err(SchemaCacheError::Internal(
                    "schema load task dropped its result".to_string(),
                )),
            };
        }
    }

    /// Insert or update, evicting the least-recently-used entry past
    /// capacity.
    pub fn set(&self, server: &str, tool: &str, schema: Tool) {
        let key: ToolKey = (server.to_string(), tool.to_string());
        let mut entries = self.inner.entries.lock().expect("cache entries poisoned");
        entries.seq += 1;
        let seq = entries.seq;
        let expires_at = self.inner.config.ttl().map(|ttl| Instant::now() + ttl);
        entries.map.insert(
            key,
            CacheEntry {
                tool: schema,
                expires_at,
                last_access_seq: seq,
            },
        );

        while entries.map.len() > self.inner.config.max_entries {
            let victim = entries
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.last_access_seq)
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    entries.map.remove(&key);
                    self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .expect("cache entries poisoned")
            .map
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SchemaCacheStats {
        let hits = self.inner.counters.hits.load(Ordering::Relaxed);
        let misses = self.inner.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        SchemaCacheStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            evictions: self.inner.counters.evictions.load(Ordering::Relaxed),
            coalesced_requests: self.inner.counters.coalesced.load(Ordering::Relaxed),
            size: self.len(),
            max_entries: self.inner.config.max_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemcp_protocol::ToolSchema;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn tool(name: &str) -> Tool {
        Tool::new(name, ToolSchema::object())
    }

    fn cache(max_entries: usize, ttl_ms: Option<u64>) -> SchemaCache {
        SchemaCache::new(SchemaCacheConfig {
            max_entries,
            ttl_ms,
        })
    }

    #[test]
    fn lru_eviction_past_capacity() {
        let cache = cache(2, None);
        cache.set("s", "a", tool("a"));
        cache.set("s", "b", tool("b"));

        // Touch "a" so "b" is the eviction victim.
        assert!(cache.get_if_cached("s", "a").is_some());
        cache.set("s", "c", tool("c"));

        assert!(cache.get_if_cached("s", "a").is_some());
        assert!(cache.get_if_cached("s", "b").is_none());
        assert!(cache.get_if_cached("s", "c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn ttl_expiry_counts_as_miss() {
        let cache = cache(8, Some(20));
        cache.set("s", "a", tool("a"));
        assert!(cache.get_if_cached("s", "a").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get_if_cached("s", "a").is_none());
        assert_eq!(cache.len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn concurrent_gets_invoke_loader_once() {
        let cache = cache(8, None);
        let loads = Arc::new(AtomicUsize::new(0));

        let make_loader = |loads: Arc<AtomicUsize>| {
            move || async move {
                loads.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(tool("read"))
            }
        };

        let (a, b) = tokio::join!(
            cache.get("fs", "read", make_loader(loads.clone())),
            cache.get("fs", "read", make_loader(loads.clone())),
        );

        assert_eq!(a.unwrap().name, "read");
        assert_eq!(b.unwrap().name, "read");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert!(stats.coalesced_requests >= 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits + stats.misses, 2);
    }

    #[tokio::test]
    async fn loader_error_is_not_cached() {
        let cache = cache(8, None);

        let result = cache
            .get("fs", "read", || async { Err(SchemaCacheError::Loader("boom".into())) })
            .await;
        assert!(matches!(result, Err(SchemaCacheError::Loader(_))));
        assert_eq!(cache.len(), 0);

        // A later call retries the loader rather than serving a cached error.
        let result = cache.get("fs", "read", || async { Ok(tool("read")) }).await;
        assert_eq!(result.unwrap().name, "read");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn waiter_cancellation_does_not_abort_shared_load() {
        let cache = cache(8, None);

        let slow = cache.clone();
        let load_started = Arc::new(tokio::sync::Notify::new());
        let started = load_started.clone();
        let first = tokio::spawn(async move {
            slow.get("fs", "read", move || async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(tool("read"))
            })
            .await
        });

        load_started.notified().await;

        // Second waiter coalesces, then gets cancelled mid-wait.
        let waiter_cache = cache.clone();
        let waiter = tokio::spawn(async move {
            waiter_cache
                .get("fs", "read", || async { Ok(tool("never")) })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();

        // The shared load still completes and lands in the cache.
        assert_eq!(first.await.unwrap().unwrap().name, "read");
        assert!(cache.get_if_cached("fs", "read").is_some());
    }
}
