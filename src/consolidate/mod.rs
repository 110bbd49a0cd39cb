//! Periodic upkeep of one `(team, agent)` scope: expire, merge near
//! duplicates, roll up stale episodes, backfill vectors, sweep tiers, repair
//! links. Every step can fail on its own without stopping the others.

mod merge;
mod summary;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::{Completer, Embedder};
use crate::cache::{embed_cached, EmbedCache, ResultCache};
use crate::db::{now_ms, AuditAction, Memory, MemoryDB, Status};
use crate::error::MemoryError;
use crate::links::{self, LinkRepairReport};
use crate::locks::KeyedLocks;
use crate::tiers::{self, SweepReport, TierPolicy};
use crate::{db_call, SharedDB};

const PAGE: usize = 500;
const BACKFILL_BATCH: usize = 32;
const CHANGED_BY: &str = "consolidator";

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationPolicy {
    /// Minutes between background runs; 0 disables the loop.
    pub interval_mins: u64,
    /// Roll stale episodic rows into summaries (needs a completer).
    pub summarize: bool,
    /// Smallest group of stale episodes worth summarizing.
    pub summary_min_batch: usize,
    /// Episodes unaccessed this long are stale.
    pub stale_days: i64,
    /// Only episodes below this importance are rolled up.
    pub max_importance: u8,
}

impl Default for ConsolidationPolicy {
    fn default() -> Self {
        Self { interval_mins: 60, summarize: true, summary_min_batch: 5, stale_days: 30, max_importance: 4 }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ConsolidationReport {
    pub expired: usize,
    pub merged: usize,
    /// Episodes archived into summaries.
    pub summarized: usize,
    pub summaries_created: usize,
    pub embeddings_backfilled: usize,
    pub tiers: SweepReport,
    pub links: LinkRepairReport,
    /// Steps that failed or were skipped.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
}

#[derive(Clone)]
pub struct Consolidator {
    pub(crate) db: SharedDB,
    pub(crate) embedder: Option<Arc<dyn Embedder>>,
    pub(crate) completer: Option<Arc<dyn Completer>>,
    pub(crate) embed_cache: Option<EmbedCache>,
    pub(crate) results: Option<ResultCache>,
    pub(crate) locks: KeyedLocks,
    pub(crate) policy: ConsolidationPolicy,
    pub(crate) tiers: TierPolicy,
    pub(crate) merge_threshold: f64,
}

/// Every row of a scope, any status.
pub(crate) fn load_scope(db: &MemoryDB, team_id: &str, agent_id: Option<&str>) -> Result<Vec<Memory>, MemoryError> {
    let mut all = Vec::new();
    loop {
        let page = db.list_scope(team_id, agent_id, PAGE, all.len())?;
        let n = page.len();
        all.extend(page);
        if n < PAGE {
            return Ok(all);
        }
    }
}

/// Archive active rows whose `expires_at` has passed.
fn expire_due(db: &MemoryDB, team_id: &str, agent_id: Option<&str>, now: i64) -> Result<usize, MemoryError> {
    let mut expired = 0;
    for m in load_scope(db, team_id, agent_id)? {
        if m.status == Status::Active && m.expires_at.is_some_and(|t| t <= now) {
            db.archive(&m.id, None, AuditAction::Expired, CHANGED_BY, "expired")?;
            expired += 1;
        }
    }
    Ok(expired)
}

fn degrade<T>(report: &mut ConsolidationReport, step: &str, r: Result<Result<T, MemoryError>, MemoryError>) -> Option<T> {
    match r {
        Ok(Ok(v)) => Some(v),
        Ok(Err(e)) | Err(e) => {
            warn!(step, error = %e, "consolidation step failed");
            report.degraded.push(step.to_string());
            None
        }
    }
}

impl Consolidator {
    pub async fn consolidate(
        &self,
        team_id: &str,
        agent_id: Option<&str>,
    ) -> Result<ConsolidationReport, MemoryError> {
        if team_id.trim().is_empty() {
            return Err(MemoryError::Validation("team_id must not be empty".into()));
        }
        let _guard = self.locks.lock(team_id, agent_id).await;
        let now = now_ms();
        let mut report = ConsolidationReport::default();
        let team = team_id.to_string();
        let agent = agent_id.map(String::from);

        let (t, a) = (team.clone(), agent.clone());
        let r = db_call(&self.db, move |d| expire_due(d, &t, a.as_deref(), now)).await;
        report.expired = degrade(&mut report, "expire", r).unwrap_or(0);

        let (t, a) = (team.clone(), agent.clone());
        let threshold = self.merge_threshold;
        let r = db_call(&self.db, move |d| merge::merge_near_duplicates(d, &t, a.as_deref(), threshold)).await;
        report.merged = degrade(&mut report, "merge", r).unwrap_or(0);

        if self.policy.summarize {
            match self.completer.as_deref() {
                Some(completer) => {
                    match summary::summarize_stale(self, completer, team_id, agent_id, now).await {
                        Ok((archived, created)) => {
                            report.summarized = archived;
                            report.summaries_created = created;
                        }
                        Err(e) => {
                            warn!(error = %e, "episodic summary failed, skipping");
                            report.degraded.push("summarize".into());
                        }
                    }
                }
                None => {
                    debug!("no completer configured, skipping episodic summaries");
                    report.degraded.push("summarize".into());
                }
            }
        }

        match self.backfill_embeddings(team_id, agent_id).await {
            Ok(n) => report.embeddings_backfilled = n,
            Err(e) => {
                warn!(error = %e, "embedding backfill failed");
                report.degraded.push("backfill".into());
            }
        }

        let (t, a) = (team.clone(), agent.clone());
        let policy = self.tiers;
        let r = db_call(&self.db, move |d| tiers::sweep(d, &t, a.as_deref(), &policy, now)).await;
        report.tiers = degrade(&mut report, "tier_sweep", r).unwrap_or_default();

        let (t, a) = (team.clone(), agent.clone());
        let r = db_call(&self.db, move |d| links::repair_links(d, &t, a.as_deref())).await;
        report.links = degrade(&mut report, "link_repair", r).unwrap_or_default();

        if let Some(cache) = &self.results {
            cache.invalidate(team_id, None);
        }

        info!(
            team_id,
            agent_id = agent_id.unwrap_or("-"),
            expired = report.expired,
            merged = report.merged,
            summarized = report.summarized,
            backfilled = report.embeddings_backfilled,
            promoted = report.tiers.promoted,
            demoted = report.tiers.demoted,
            degraded = ?report.degraded,
            "consolidation done"
        );
        Ok(report)
    }

    /// Consolidate every scope that has rows.
    pub async fn consolidate_all(&self) -> Result<Vec<(String, Option<String>, ConsolidationReport)>, MemoryError> {
        let scopes = db_call(&self.db, |d| d.list_scopes()).await??;
        let mut out = Vec::with_capacity(scopes.len());
        for (team, agent) in scopes {
            let report = self.consolidate(&team, agent.as_deref()).await?;
            out.push((team, agent, report));
        }
        Ok(out)
    }

    /// Run `consolidate_all` every `interval_mins` until the task is dropped.
    pub fn spawn_periodic(self) -> Option<tokio::task::JoinHandle<()>> {
        let mins = self.policy.interval_mins;
        if mins == 0 {
            return None;
        }
        let handle = tokio::spawn(async move {
            let interval = Duration::from_secs(mins.saturating_mul(60));
            // wait a bit before first run so startup isn't slowed
            tokio::time::sleep(Duration::from_secs(60)).await;
            loop {
                if let Err(e) = self.consolidate_all().await {
                    warn!(error = %e, "background consolidation failed");
                }
                tokio::time::sleep(interval).await;
            }
        });
        info!(every_mins = mins, "background consolidation enabled");
        Some(handle)
    }

    /// Embed live rows stored without a vector.
    async fn backfill_embeddings(&self, team_id: &str, agent_id: Option<&str>) -> Result<usize, MemoryError> {
        let Some(embedder) = self.embedder.as_deref() else {
            return Ok(0);
        };
        let (t, a) = (team_id.to_string(), agent_id.map(String::from));
        let missing: Vec<(String, String)> = db_call(&self.db, move |d| load_scope(d, &t, a.as_deref()))
            .await??
            .into_iter()
            .filter(|m| m.embedding.is_none() && m.status.is_retrievable())
            .map(|m| (m.id, m.content))
            .collect();

        let mut filled = 0;
        for chunk in missing.chunks(BACKFILL_BATCH) {
            let texts: Vec<String> = chunk.iter().map(|(_, c)| c.clone()).collect();
            let vectors = embed_cached(embedder, self.embed_cache.as_ref(), &texts).await?;
            let pairs: Vec<(String, Vec<f32>)> =
                chunk.iter().map(|(id, _)| id.clone()).zip(vectors).collect();
            filled += db_call(&self.db, move |d| {
                for (id, v) in &pairs {
                    d.set_embedding(id, v.clone(), CHANGED_BY)?;
                }
                Ok::<_, MemoryError>(pairs.len())
            })
            .await??;
        }
        if filled > 0 {
            debug!(team_id, filled, "embeddings backfilled");
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryInput;

    #[test]
    fn expiry_archives_only_due_active_rows() {
        let db = MemoryDB::open(":memory:").unwrap();
        let now = now_ms();
        let due = db
            .insert(MemoryInput::new("t1", "Standup moved to 10am today").agent("a1").expires_at(now - 1), "test", "")
            .unwrap();
        let later = db
            .insert(MemoryInput::new("t1", "Offsite next month").agent("a1").expires_at(now + 3_600_000), "test", "")
            .unwrap();
        let n = expire_due(&db, "t1", Some("a1"), now).unwrap();
        assert_eq!(n, 1);
        assert_eq!(db.get(&due.id).unwrap().unwrap().status, Status::Archived);
        assert_eq!(db.get(&later.id).unwrap().unwrap().status, Status::Active);
        assert_eq!(db.audit_count(&due.id, AuditAction::Expired).unwrap(), 1);
        // re-running is a no-op
        assert_eq!(expire_due(&db, "t1", Some("a1"), now).unwrap(), 0);
    }

    #[test]
    fn default_policy_matches_stale_rule() {
        let p = ConsolidationPolicy::default();
        assert_eq!(p.summary_min_batch, 5);
        assert_eq!(p.stale_days, 30);
        assert_eq!(p.max_importance, 4);
    }
}
