//! Five-signal retrieval: concurrent scoped queries, merge and score,
//! budget allocation, dispute markers, formatted prompt block.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::access::AccessTracker;
use crate::ai::Embedder;
use crate::budget::allocate;
use crate::cache::{embed_cached, EmbedCache, ResultCache};
use crate::config::EngineConfig;
use crate::contradiction::{check_on_retrieve, ContradictionMarker};
use crate::db::{now_ms, MemoryDB, Scope};
use crate::error::MemoryError;
use crate::prompt::format_memories;
use crate::scoring::{merge_candidates, ScoreContext, ScoredMemory, Signal, SignalHits};
use crate::{db_call, SharedDB};

/// Retrieval request parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    pub team_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Rows created at or after this time (unix ms) count as session continuity.
    #[serde(default)]
    pub session_started_at: Option<i64>,
    pub token_budget: usize,
}

impl RetrievalRequest {
    pub fn new(
        query: impl Into<String>,
        team_id: impl Into<String>,
        agent_id: impl Into<String>,
        token_budget: usize,
    ) -> Self {
        Self {
            query: query.into(),
            team_id: team_id.into(),
            agent_id: agent_id.into(),
            user_id: None,
            conversation_id: None,
            session_started_at: None,
            token_budget,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn session_started_at(mut self, ts: i64) -> Self {
        self.session_started_at = Some(ts);
        self
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.team_id.clone(), self.agent_id.clone(), self.user_id.clone())
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RetrievalStats {
    pub signals_hit: Vec<String>,
    /// Signals whose query failed or timed out and counted as empty.
    pub degraded_signals: Vec<String>,
    pub embedding_failed: bool,
    pub cache_hit: bool,
    pub candidates_considered: usize,
    pub excluded_count: usize,
    pub total_tokens: usize,
    pub elapsed_ms: u64,
    pub budget_overflow: bool,
}

#[derive(Debug, Serialize)]
pub struct RetrievalResult {
    /// Included memories, best first.
    pub memories: Vec<ScoredMemory>,
    /// Sectioned prompt block for the included memories.
    pub prompt: String,
    pub stats: RetrievalStats,
    pub contradictions: Vec<ContradictionMarker>,
}

/// Retrieval half of the engine. Cheap to clone.
#[derive(Clone)]
pub struct Retriever {
    pub(crate) db: SharedDB,
    pub(crate) embedder: Option<Arc<dyn Embedder>>,
    pub(crate) embed_cache: Option<EmbedCache>,
    pub(crate) results: Option<ResultCache>,
    pub(crate) access: Option<AccessTracker>,
    pub(crate) config: Arc<EngineConfig>,
}

/// Run one signal query on the blocking pool under a deadline. Failure and
/// timeout both come back as `None`.
async fn timed<T, F>(db: &SharedDB, limit: Duration, signal: Signal, f: F) -> Option<Vec<T>>
where
    F: FnOnce(&MemoryDB) -> Result<Vec<T>, MemoryError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, db_call(db, f)).await {
        Ok(Ok(Ok(rows))) => Some(rows),
        Ok(Ok(Err(e))) | Ok(Err(e)) => {
            warn!(signal = signal.as_str(), error = %e, "signal query failed");
            None
        }
        Err(_) => {
            warn!(signal = signal.as_str(), timeout_ms = limit.as_millis() as u64, "signal query timed out");
            None
        }
    }
}

impl Retriever {
    pub async fn retrieve(&self, req: &RetrievalRequest) -> Result<RetrievalResult, MemoryError> {
        if req.team_id.trim().is_empty() || req.agent_id.trim().is_empty() {
            return Err(MemoryError::Validation("team_id and agent_id are required".into()));
        }
        let started = Instant::now();
        let scope = req.scope();
        let mut stats = RetrievalStats::default();

        let query_embedding = self.embed_query(&req.query).await;
        stats.embedding_failed = query_embedding.is_none();

        let fingerprint = ResultCache::fingerprint(
            &req.query,
            req.conversation_id.as_deref(),
            req.session_started_at,
        );
        let cached = self.results.as_ref().and_then(|c| c.get(&scope, &fingerprint));

        let candidates = match cached {
            Some(slot) => {
                stats.cache_hit = true;
                stats.signals_hit = slot.signals_hit;
                stats.degraded_signals = slot.degraded;
                slot.candidates
            }
            None => {
                let (hits, degraded) = self.gather(&scope, req, query_embedding.clone()).await;
                stats.signals_hit = Signal::ALL
                    .iter()
                    .filter(|s| hits.count(**s) > 0)
                    .map(|s| s.as_str().to_string())
                    .collect();
                stats.degraded_signals = degraded.iter().map(|s| s.as_str().to_string()).collect();

                let ctx = ScoreContext {
                    query_embedding: query_embedding.as_deref(),
                    conversation_id: req.conversation_id.as_deref(),
                    session_started_at: req.session_started_at,
                    now: now_ms(),
                    recency_lambda: self.config.recency_lambda,
                    weights: self.config.weights,
                };
                let scored = merge_candidates(hits, &ctx);
                // degraded rankings are not worth replaying
                if let Some(cache) = &self.results {
                    if !stats.embedding_failed && degraded.is_empty() {
                        cache.put(
                            &scope,
                            fingerprint,
                            scored.clone(),
                            stats.signals_hit.clone(),
                            vec![],
                            false,
                        );
                    }
                }
                scored
            }
        };

        stats.candidates_considered = candidates.len();
        if let Some(access) = &self.access {
            access.record(candidates.iter().map(|c| c.memory.id.clone()).collect());
        }

        let alloc = allocate(candidates, req.token_budget, &self.config.reservations);
        let contradictions = check_on_retrieve(&alloc.included);
        let prompt = format_memories(&alloc.included);

        stats.excluded_count = alloc.excluded.len();
        stats.total_tokens = alloc.total_tokens;
        stats.budget_overflow = alloc.overflow;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;

        debug!(
            team_id = %req.team_id,
            agent_id = %req.agent_id,
            considered = stats.candidates_considered,
            included = alloc.included.len(),
            tokens = stats.total_tokens,
            cache_hit = stats.cache_hit,
            embedding_failed = stats.embedding_failed,
            elapsed_ms = stats.elapsed_ms,
            "retrieval done"
        );

        Ok(RetrievalResult { memories: alloc.included, prompt, stats, contradictions })
    }

    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        let embedder = self.embedder.as_deref()?;
        match embed_cached(embedder, self.embed_cache.as_ref(), &[query.to_string()]).await {
            Ok(mut v) => v.pop(),
            Err(e) => {
                warn!(error = %e, "query embedding failed, semantic signals skipped");
                None
            }
        }
    }

    /// Fan out the four independent signal queries, then follow `related_to`
    /// from the semantic hits.
    async fn gather(
        &self,
        scope: &Scope,
        req: &RetrievalRequest,
        query_embedding: Option<Vec<f32>>,
    ) -> (SignalHits, Vec<Signal>) {
        let limits = self.config.limits;
        let deadline = self.config.signal_timeout;
        let has_embedding = query_embedding.is_some();

        let semantic = {
            let scope = scope.clone();
            async move {
                match query_embedding {
                    Some(q) => {
                        timed(&self.db, deadline, Signal::Semantic, move |d| {
                            d.search_semantic(&scope, &q, limits.semantic)
                        })
                        .await
                    }
                    None => Some(vec![]),
                }
            }
        };
        let recency = {
            let scope = scope.clone();
            timed(&self.db, deadline, Signal::Recency, move |d| d.recent(&scope, limits.recency))
        };
        let importance = {
            let scope = scope.clone();
            timed(&self.db, deadline, Signal::Importance, move |d| d.important(&scope, limits.importance))
        };
        let continuity = {
            let scope = scope.clone();
            let conv = req.conversation_id.clone();
            let since = req.session_started_at;
            timed(&self.db, deadline, Signal::Continuity, move |d| {
                d.continuity(&scope, conv.as_deref(), since, limits.continuity)
            })
        };

        let (semantic, recency, importance, continuity) =
            tokio::join!(semantic, recency, importance, continuity);

        let mut degraded = Vec::new();
        let mut take = |signal: Signal, rows: Option<Vec<_>>| {
            rows.unwrap_or_else(|| {
                degraded.push(signal);
                vec![]
            })
        };
        let hits_recency = take(Signal::Recency, recency);
        let hits_importance = take(Signal::Importance, importance);
        let hits_continuity = take(Signal::Continuity, continuity);
        let semantic = semantic.unwrap_or_else(|| {
            degraded.push(Signal::Semantic);
            vec![]
        });

        let mut relationship = vec![];
        if has_embedding && !semantic.is_empty() {
            let seen: HashSet<&str> = semantic.iter().map(|(m, _)| m.id.as_str()).collect();
            let mut ids: Vec<String> = Vec::new();
            for (m, _) in &semantic {
                for rel in &m.related_to {
                    if !seen.contains(rel.as_str()) && !ids.contains(rel) {
                        ids.push(rel.clone());
                    }
                }
            }
            if !ids.is_empty() {
                let scope = scope.clone();
                match timed(&self.db, deadline, Signal::Relationship, move |d| {
                    d.visible_by_ids(&scope, &ids, limits.relationship)
                })
                .await
                {
                    Some(rows) => relationship = rows,
                    None => degraded.push(Signal::Relationship),
                }
            }
        }

        let hits = SignalHits {
            semantic,
            recency: hits_recency,
            importance: hits_importance,
            continuity: hits_continuity,
            relationship,
        };
        (hits, degraded)
    }
}
