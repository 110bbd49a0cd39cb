//! The public face of the crate: one `Engine` wiring store, collaborators,
//! caches and background workers together.

use std::sync::Arc;

use tracing::info;

use crate::access::AccessTracker;
use crate::ai::{AiConfig, Completer, Embedder};
use crate::cache::{EmbedCache, ResultCache};
use crate::compaction::{CompactionResult, CompactionShield};
use crate::config::EngineConfig;
use crate::consolidate::{ConsolidationReport, Consolidator};
use crate::db::{AuditLogEntry, Memory, MemoryInput, MemorySnapshot, Stats, Tier};
use crate::error::MemoryError;
use crate::extract::{ConversationTurn, ExtractionContext, ExtractionResult, Extractor, PassMode, StoreOutcome};
use crate::links;
use crate::locks::KeyedLocks;
use crate::prompt::{AssembledPrompt, PromptAssembler};
use crate::recall::{RetrievalRequest, RetrievalResult, Retriever};
use crate::thresholds::STRONG_FEEDBACK;
use crate::tiers::{self, SweepReport};
use crate::{db_call, SharedDB};

/// Confidence moved per unit of feedback score.
const FEEDBACK_STEP: f64 = 0.1;

pub struct EngineBuilder {
    db: SharedDB,
    config: EngineConfig,
    embedder: Option<Arc<dyn Embedder>>,
    completer: Option<Arc<dyn Completer>>,
    caches: bool,
}

impl EngineBuilder {
    pub fn new(db: SharedDB) -> Self {
        Self { db, config: EngineConfig::default(), embedder: None, completer: None, caches: true }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn embedder(mut self, e: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(e);
        self
    }

    pub fn completer(mut self, c: Arc<dyn Completer>) -> Self {
        self.completer = Some(c);
        self
    }

    /// Use an OpenAI-compatible endpoint for whichever halves it configures.
    pub fn ai(mut self, cfg: AiConfig) -> Self {
        let cfg = Arc::new(cfg);
        if cfg.has_embed() {
            self.embedder = Some(cfg.clone() as Arc<dyn Embedder>);
        }
        if cfg.has_llm() {
            self.completer = Some(cfg as Arc<dyn Completer>);
        }
        self
    }

    /// Run without the embedding and result caches.
    pub fn without_caches(mut self) -> Self {
        self.caches = false;
        self
    }

    /// Validate the configuration and start the access tracker. Must be
    /// called inside a tokio runtime.
    pub fn build(self) -> Result<Engine, MemoryError> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let embed_cache = self.caches.then(|| EmbedCache::new(config.embed_cache_capacity));
        let results = self
            .caches
            .then(|| ResultCache::new(config.result_cache_capacity, config.result_cache_ttl));
        let locks = KeyedLocks::new();
        let access = AccessTracker::spawn(self.db.clone(), config.tiers, config.access_queue_capacity);

        let extractor = Extractor {
            db: self.db.clone(),
            embedder: self.embedder.clone(),
            completer: self.completer.clone(),
            embed_cache: embed_cache.clone(),
            results: results.clone(),
            locks: locks.clone(),
            duplicate_threshold: config.duplicate_threshold,
            conflict_threshold: config.conflict_threshold,
        };
        let retriever = Retriever {
            db: self.db.clone(),
            embedder: self.embedder.clone(),
            embed_cache: embed_cache.clone(),
            results: results.clone(),
            access: Some(access.clone()),
            config: config.clone(),
        };
        let shield = CompactionShield { extractor: extractor.clone(), enabled: config.compaction_enabled };
        let consolidator = Consolidator {
            db: self.db.clone(),
            embedder: self.embedder,
            completer: self.completer.clone(),
            embed_cache,
            results: results.clone(),
            locks,
            policy: config.consolidation.clone(),
            tiers: config.tiers,
            merge_threshold: config.duplicate_threshold,
        };

        let embedder_name = extractor
            .embedder
            .as_ref()
            .map(|e| e.model_name().to_string())
            .unwrap_or_else(|| "none".into());
        info!(
            embedder = %embedder_name,
            completer = self.completer.is_some(),
            caches = results.is_some(),
            "memory engine ready"
        );
        Ok(Engine { db: self.db, config, retriever, extractor, shield, consolidator, access, results })
    }
}

#[derive(Clone)]
pub struct Engine {
    db: SharedDB,
    config: Arc<EngineConfig>,
    retriever: Retriever,
    extractor: Extractor,
    shield: CompactionShield,
    consolidator: Consolidator,
    access: AccessTracker,
    results: Option<ResultCache>,
}

impl Engine {
    pub fn builder(db: SharedDB) -> EngineBuilder {
        EngineBuilder::new(db)
    }

    pub fn db(&self) -> &SharedDB {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn invalidate(&self, m: &Memory) {
        if let Some(cache) = &self.results {
            cache.invalidate_for(m, false);
        }
    }

    pub async fn retrieve(&self, req: &RetrievalRequest) -> Result<RetrievalResult, MemoryError> {
        self.retriever.retrieve(req).await
    }

    /// Periodic extraction: a failed second pass degrades to pass-1 output.
    pub async fn extract_from_conversation(
        &self,
        turns: &[ConversationTurn],
        ctx: &ExtractionContext,
    ) -> Result<ExtractionResult, MemoryError> {
        self.extractor.extract(turns, ctx, PassMode::Lenient).await
    }

    /// Strict extraction before turns leave the context window. Only an `Ok`
    /// carries a discard permit.
    pub async fn extract_before_compaction(
        &self,
        turns: &[ConversationTurn],
        ctx: &ExtractionContext,
    ) -> Result<CompactionResult, MemoryError> {
        self.shield.extract_before_compaction(turns, ctx).await
    }

    /// Explicit "remember this". `is_update` marks a correction of an earlier fact.
    pub async fn remember(&self, input: MemoryInput, is_update: bool) -> Result<StoreOutcome, MemoryError> {
        self.extractor.remember(input, is_update).await
    }

    /// Pin and promote straight to hot.
    pub async fn pin(&self, id: &str) -> Result<Memory, MemoryError> {
        let id = id.to_string();
        let m = db_call(&self.db, move |d| {
            let pinned = d.set_pinned(&id, true, "pin", "pinned")?;
            Ok::<_, MemoryError>(tiers::promote_to_hot(d, &id, "pin", "pinned")?.unwrap_or(pinned))
        })
        .await??;
        self.invalidate(&m);
        Ok(m)
    }

    /// Unpin. The tier is left for the next sweep to decide.
    pub async fn unpin(&self, id: &str) -> Result<Memory, MemoryError> {
        let id = id.to_string();
        let m = db_call(&self.db, move |d| d.set_pinned(&id, false, "unpin", "unpinned")).await??;
        self.invalidate(&m);
        Ok(m)
    }

    /// Nudge confidence by `0.1 × score`; strongly positive feedback promotes to hot.
    pub async fn record_feedback(&self, id: &str, score: f64) -> Result<Memory, MemoryError> {
        if !score.is_finite() || !(-1.0..=1.0).contains(&score) {
            return Err(MemoryError::Validation(format!("feedback score {score} out of range -1..1")));
        }
        let id = id.to_string();
        let m = db_call(&self.db, move |d| {
            let current = d.get(&id)?.ok_or_else(|| MemoryError::NotFound(id.clone()))?;
            let confidence = (current.confidence + FEEDBACK_STEP * score).clamp(0.0, 1.0);
            let reason = format!("feedback {score:+.2}");
            let mut m = d.set_confidence(&id, confidence, "feedback", &reason)?;
            if score >= STRONG_FEEDBACK {
                if let Some(hot) = tiers::promote_to_hot(d, &id, "feedback", &reason)? {
                    m = hot;
                }
            }
            Ok::<_, MemoryError>(m)
        })
        .await??;
        self.invalidate(&m);
        Ok(m)
    }

    /// Keep one side of a dispute; the other is superseded by it.
    pub async fn resolve_dispute(&self, keep_id: &str, drop_id: &str) -> Result<(Memory, Memory), MemoryError> {
        let (keep, drop) = (keep_id.to_string(), drop_id.to_string());
        let pair = db_call(&self.db, move |d| {
            let pair = d.resolve_dispute(&keep, &drop, "dispute_resolution", "resolved by caller")?;
            links::repair_rows(d, &[keep.clone(), drop.clone()])?;
            let kept = d.get(&keep)?.unwrap_or(pair.0);
            let dropped = d.get(&drop)?.unwrap_or(pair.1);
            Ok::<_, MemoryError>((kept, dropped))
        })
        .await??;
        if let Some(cache) = &self.results {
            cache.invalidate_for(&pair.0, true);
        }
        Ok(pair)
    }

    /// Explicit demotion. Protected memories refuse with `InvariantViolation`.
    pub async fn demote(&self, id: &str, to: Tier) -> Result<Memory, MemoryError> {
        let id = id.to_string();
        db_call(&self.db, move |d| tiers::demote(d, &id, to, "demote", "explicit demotion")).await?
    }

    pub async fn run_tier_sweep(&self, team_id: &str, agent_id: Option<&str>) -> Result<SweepReport, MemoryError> {
        let (t, a) = (team_id.to_string(), agent_id.map(String::from));
        let policy = self.config.tiers;
        let now = crate::db::now_ms();
        db_call(&self.db, move |d| tiers::sweep(d, &t, a.as_deref(), &policy, now)).await?
    }

    pub async fn consolidate(&self, team_id: &str, agent_id: Option<&str>) -> Result<ConsolidationReport, MemoryError> {
        self.consolidator.consolidate(team_id, agent_id).await
    }

    /// Consolidate every scope that has rows.
    pub async fn consolidate_all(&self) -> Result<Vec<(String, Option<String>, ConsolidationReport)>, MemoryError> {
        self.consolidator.consolidate_all().await
    }

    /// Start the background consolidation loop, if an interval is configured.
    pub fn spawn_consolidation(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.consolidator.clone().spawn_periodic()
    }

    pub async fn history(&self, id: &str) -> Result<Vec<AuditLogEntry>, MemoryError> {
        let id = id.to_string();
        db_call(&self.db, move |d| d.history(&id)).await?
    }

    pub async fn reconstruct_at(&self, id: &str, timestamp: i64) -> Result<Option<MemorySnapshot>, MemoryError> {
        let id = id.to_string();
        db_call(&self.db, move |d| d.reconstruct_at(&id, timestamp)).await?
    }

    pub async fn stats(&self, team_id: &str) -> Result<Stats, MemoryError> {
        let t = team_id.to_string();
        db_call(&self.db, move |d| d.stats(&t)).await?
    }

    /// Build the full prompt around a retrieval result.
    pub fn assemble_prompt(
        &self,
        system: &str,
        retrieval: &RetrievalResult,
        session_summary: Option<&str>,
        recent_turns: &[ConversationTurn],
        budget: usize,
    ) -> AssembledPrompt {
        PromptAssembler::new(system)
            .memories(&retrieval.memories)
            .contradictions(&retrieval.contradictions)
            .session_summary(session_summary)
            .recent_turns(recent_turns)
            .assemble(budget)
    }

    /// Wait for queued access updates to land.
    pub async fn flush_access(&self) {
        self.access.flush().await;
    }
}
