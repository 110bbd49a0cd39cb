//! Optional, droppable caches: query embeddings and hot retrieval results.
//! Losing either costs latency, never correctness.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::ai::Embedder;
use crate::db::{Memory, Scope};
use crate::error::MemoryError;
use crate::scoring::ScoredMemory;

fn cap(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

fn sha_hex(parts: &[&str]) -> String {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p.as_bytes());
        h.update([0u8]);
    }
    format!("{:x}", h.finalize())
}

#[derive(Clone)]
pub struct EmbedCache {
    inner: Arc<Mutex<EmbedCacheInner>>,
}

struct EmbedCacheInner {
    cache: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmbedCacheInner {
                cache: LruCache::new(cap(capacity)),
                hits: 0,
                misses: 0,
            })),
        }
    }

    /// Cache key: model and text, hashed.
    pub fn key(model: &str, text: &str) -> String {
        sha_hex(&[model, text])
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock();
        let val = inner.cache.get(key).cloned();
        if val.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        val
    }

    pub fn insert(&self, key: String, value: Vec<f32>) {
        let mut inner = self.inner.lock();
        inner.cache.put(key, value);
    }

    /// (len, capacity, hits, misses)
    pub fn stats(&self) -> (usize, usize, u64, u64) {
        let inner = self.inner.lock();
        (inner.cache.len(), inner.cache.cap().get(), inner.hits, inner.misses)
    }
}

/// Embed `texts`, serving what we can from `cache` and sending the rest in one batch.
pub async fn embed_cached(
    embedder: &dyn Embedder,
    cache: Option<&EmbedCache>,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, MemoryError> {
    let Some(cache) = cache else {
        return embedder.embed(texts).await;
    };
    let model = embedder.model_name().to_string();
    let keys: Vec<String> = texts.iter().map(|t| EmbedCache::key(&model, t)).collect();
    let mut out: Vec<Option<Vec<f32>>> = keys.iter().map(|k| cache.get(k)).collect();

    let missing: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_none()).collect();
    if !missing.is_empty() {
        let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
        let vectors = embedder.embed(&batch).await?;
        if vectors.len() != batch.len() {
            return Err(MemoryError::AiBackend(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            )));
        }
        for (i, v) in missing.into_iter().zip(vectors) {
            cache.insert(keys[i].clone(), v.clone());
            out[i] = Some(v);
        }
    }
    out.into_iter()
        .map(|v| v.ok_or_else(|| MemoryError::Internal("embedding slot left empty".into())))
        .collect()
}

/// A ranked candidate list for one query fingerprint.
#[derive(Debug, Clone)]
pub struct CachedRanking {
    pub fingerprint: String,
    pub candidates: Vec<ScoredMemory>,
    pub signals_hit: Vec<String>,
    pub degraded: Vec<String>,
    pub embedding_failed: bool,
    stored_at: Instant,
}

type SlotKey = (String, String, Option<String>);

/// Hot-result cache keyed by `(team, agent, user)`. Each slot holds the
/// ranking of the last query seen for that caller.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Mutex<LruCache<SlotKey, CachedRanking>>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(LruCache::new(cap(capacity)))), ttl }
    }

    /// Query text plus conversation anchors.
    pub fn fingerprint(query: &str, conversation_id: Option<&str>, session_started_at: Option<i64>) -> String {
        let since = session_started_at.map(|t| t.to_string()).unwrap_or_default();
        sha_hex(&[query.trim(), conversation_id.unwrap_or(""), &since])
    }

    fn slot(scope: &Scope) -> SlotKey {
        (scope.team_id.clone(), scope.agent_id.clone(), scope.user_id.clone())
    }

    /// A fresh slot whose fingerprint matches. Expired slots are evicted.
    pub fn get(&self, scope: &Scope, fingerprint: &str) -> Option<CachedRanking> {
        let key = Self::slot(scope);
        let mut inner = self.inner.lock();
        let expired = match inner.get(&key) {
            Some(slot) if slot.stored_at.elapsed() > self.ttl => true,
            Some(slot) if slot.fingerprint == fingerprint => return Some(slot.clone()),
            _ => false,
        };
        if expired {
            inner.pop(&key);
        }
        None
    }

    pub fn put(
        &self,
        scope: &Scope,
        fingerprint: String,
        candidates: Vec<ScoredMemory>,
        signals_hit: Vec<String>,
        degraded: Vec<String>,
        embedding_failed: bool,
    ) {
        let slot = CachedRanking {
            fingerprint,
            candidates,
            signals_hit,
            degraded,
            embedding_failed,
            stored_at: Instant::now(),
        };
        self.inner.lock().put(Self::slot(scope), slot);
    }

    /// Drop slots a write may have made stale. `agent_id = None` clears the
    /// whole team (unscoped and team-visible rows reach every agent).
    pub fn invalidate(&self, team_id: &str, agent_id: Option<&str>) {
        let mut inner = self.inner.lock();
        let stale: Vec<SlotKey> = inner
            .iter()
            .filter(|(k, _)| k.0 == team_id && agent_id.map_or(true, |a| k.1 == a))
            .map(|(k, _)| k.clone())
            .collect();
        for k in stale {
            inner.pop(&k);
        }
    }

    /// Invalidate whatever could see `m`. Rows visible beyond their owning
    /// agent, or writes that also changed other rows, clear the whole team.
    pub fn invalidate_for(&self, m: &Memory, team_wide: bool) {
        let agent_only = !team_wide && !m.memory_type.is_team_visible() && m.agent_id.is_some();
        if agent_only {
            self.invalidate(&m.team_id, m.agent_id.as_deref());
        } else {
            self.invalidate(&m.team_id, None);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn embed_cache_serves_repeats() {
        let e = CountingEmbedder { calls: AtomicUsize::new(0), texts: AtomicUsize::new(0) };
        let cache = EmbedCache::new(16);
        let texts = vec!["a".to_string(), "bb".to_string()];
        let first = embed_cached(&e, Some(&cache), &texts).await.unwrap();
        let again = embed_cached(&e, Some(&cache), &["bb".to_string(), "ccc".to_string()]).await.unwrap();
        assert_eq!(first[1], again[0]);
        assert_eq!(e.calls.load(Ordering::SeqCst), 2);
        assert_eq!(e.texts.load(Ordering::SeqCst), 3);
        let (len, _, hits, _) = cache.stats();
        assert_eq!(len, 3);
        assert_eq!(hits, 1);
    }

    #[test]
    fn result_slot_matches_fingerprint_only() {
        let cache = ResultCache::new(8, Duration::from_secs(30));
        let scope = Scope::new("t1", "a1", None);
        let fp = ResultCache::fingerprint("what's my timezone?", None, None);
        cache.put(&scope, fp.clone(), vec![], vec!["recency".into()], vec![], false);
        assert!(cache.get(&scope, &fp).is_some());
        let other = ResultCache::fingerprint("something else", None, None);
        assert!(cache.get(&scope, &other).is_none());
        assert!(cache.get(&Scope::new("t1", "a2", None), &fp).is_none());
    }

    #[test]
    fn expired_slots_are_dropped() {
        let cache = ResultCache::new(8, Duration::ZERO);
        let scope = Scope::new("t1", "a1", None);
        cache.put(&scope, "fp".into(), vec![], vec![], vec![], false);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(&scope, "fp").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_by_agent_or_team() {
        let cache = ResultCache::new(8, Duration::from_secs(30));
        for agent in ["a1", "a2"] {
            cache.put(&Scope::new("t1", agent, None), "fp".into(), vec![], vec![], vec![], false);
        }
        cache.put(&Scope::new("t2", "a1", None), "fp".into(), vec![], vec![], vec![], false);
        cache.invalidate("t1", Some("a1"));
        assert_eq!(cache.len(), 2);
        cache.invalidate("t1", None);
        assert_eq!(cache.len(), 1);
    }
}
