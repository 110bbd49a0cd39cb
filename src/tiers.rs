//! Hot/warm/cold lifecycle. Decisions are pure; `apply` and `sweep` write
//! them through the store so every move lands in the audit log.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::{Memory, MemoryDB, Status, Tier};
use crate::error::MemoryError;
use crate::thresholds::HOT_IMPORTANCE;

const DAY_MS: i64 = 24 * 3600 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// warm → hot once accessed more than this many times...
    pub hot_access_count: i64,
    /// ...with the last access inside this window.
    pub hot_window_days: i64,
    /// cold → warm needs at least this many accesses inside the window.
    pub rewarm_access_count: i64,
    /// hot → warm after this long without access.
    pub hot_idle_days: i64,
    /// warm → cold for low-value rows older than this.
    pub cold_age_days: i64,
    pub cold_max_importance: u8,
    pub cold_max_access_count: i64,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            hot_access_count: 10,
            hot_window_days: 7,
            rewarm_access_count: 2,
            hot_idle_days: 30,
            cold_age_days: 90,
            cold_max_importance: 3,
            cold_max_access_count: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierDecision {
    pub id: String,
    pub from: Tier,
    pub to: Tier,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub promoted: usize,
    pub demoted: usize,
    /// Demotion candidates held back by the protection guard.
    pub protected: usize,
}

/// Placement for a freshly stored memory.
pub fn initial_tier(importance: u8, pinned: bool) -> Tier {
    if pinned || importance >= HOT_IMPORTANCE {
        Tier::Hot
    } else {
        Tier::Warm
    }
}

pub fn is_protected(m: &Memory) -> bool {
    m.is_protected()
}

fn decision(m: &Memory, to: Tier, reason: impl Into<String>) -> Option<TierDecision> {
    Some(TierDecision { id: m.id.clone(), from: m.tier, to, reason: reason.into() })
}

/// Access-driven promotion.
pub fn evaluate_promotion(m: &Memory, policy: &TierPolicy, now: i64) -> Option<TierDecision> {
    if !m.status.is_retrievable() {
        return None;
    }
    let recent = now - m.last_accessed_at <= policy.hot_window_days * DAY_MS;
    match m.tier {
        Tier::Warm if recent && m.access_count > policy.hot_access_count => decision(
            m,
            Tier::Hot,
            format!("accessed {} times within {} days", m.access_count, policy.hot_window_days),
        ),
        Tier::Cold
            if m.status == Status::Active && recent && m.access_count >= policy.rewarm_access_count =>
        {
            decision(m, Tier::Warm, "accessed again")
        }
        _ => None,
    }
}

/// Age/idle/retirement-driven demotion, before the protection guard.
fn demotion_candidate(m: &Memory, policy: &TierPolicy, now: i64) -> Option<TierDecision> {
    let retired = matches!(m.status, Status::Superseded | Status::Archived);
    match m.tier {
        Tier::Hot if retired => decision(m, Tier::Warm, format!("{} memory leaves hot", m.status)),
        Tier::Hot if now - m.last_accessed_at >= policy.hot_idle_days * DAY_MS => decision(
            m,
            Tier::Warm,
            format!("not accessed for {} days", policy.hot_idle_days),
        ),
        Tier::Warm if retired => decision(m, Tier::Cold, format!("{} memory goes cold", m.status)),
        Tier::Warm
            if m.importance < policy.cold_max_importance
                && m.access_count < policy.cold_max_access_count
                && now - m.created_at > policy.cold_age_days * DAY_MS =>
        {
            decision(
                m,
                Tier::Cold,
                format!("low importance, rarely accessed, older than {} days", policy.cold_age_days),
            )
        }
        _ => None,
    }
}

/// Demotion with the protection guard applied: protected memories never move down.
pub fn evaluate_demotion(m: &Memory, policy: &TierPolicy, now: i64) -> Option<TierDecision> {
    if is_protected(m) {
        return None;
    }
    demotion_candidate(m, policy, now)
}

/// Promotion wins over demotion.
pub fn evaluate(m: &Memory, policy: &TierPolicy, now: i64) -> Option<TierDecision> {
    evaluate_promotion(m, policy, now).or_else(|| evaluate_demotion(m, policy, now))
}

/// Write a decision. A stale decision (row already moved) is a no-op.
pub fn apply(db: &MemoryDB, d: &TierDecision, changed_by: &str) -> Result<Option<Memory>, MemoryError> {
    let moved = db.set_tier(&d.id, d.to, changed_by, &d.reason)?;
    if let Some(ref m) = moved {
        debug!(id = %m.id, from = %d.from, to = %d.to, reason = %d.reason, "tier change");
    }
    Ok(moved)
}

/// Promote straight to hot (pin, strong feedback).
pub fn promote_to_hot(db: &MemoryDB, id: &str, changed_by: &str, reason: &str) -> Result<Option<Memory>, MemoryError> {
    db.set_tier(id, Tier::Hot, changed_by, reason)
}

/// Explicit demotion request. Protected memories refuse with an invariant violation.
pub fn demote(db: &MemoryDB, id: &str, to: Tier, changed_by: &str, reason: &str) -> Result<Memory, MemoryError> {
    let m = db.get(id)?.ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
    if !m.tier.is_above(to) {
        return Err(MemoryError::Validation(format!(
            "cannot demote {id} from {} to {to}",
            m.tier
        )));
    }
    if is_protected(&m) {
        return Err(MemoryError::InvariantViolation(format!(
            "memory {id} is protected (identity, pinned or importance >= 8)"
        )));
    }
    db.set_tier(id, to, changed_by, reason)?
        .ok_or_else(|| MemoryError::Internal(format!("memory {id} did not move")))
}

/// Re-evaluate every row in a `(team, agent)` scope.
pub fn sweep(
    db: &MemoryDB,
    team_id: &str,
    agent_id: Option<&str>,
    policy: &TierPolicy,
    now: i64,
) -> Result<SweepReport, MemoryError> {
    const PAGE: usize = 500;
    let mut report = SweepReport::default();
    let mut offset = 0;
    loop {
        let page = db.list_scope(team_id, agent_id, PAGE, offset)?;
        let n = page.len();
        for m in &page {
            report.examined += 1;
            if let Some(d) = evaluate_promotion(m, policy, now) {
                if apply(db, &d, "tier_manager")?.is_some() {
                    report.promoted += 1;
                }
                continue;
            }
            if demotion_candidate(m, policy, now).is_some() && is_protected(m) {
                report.protected += 1;
                continue;
            }
            if let Some(d) = evaluate_demotion(m, policy, now) {
                if apply(db, &d, "tier_manager")?.is_some() {
                    report.demoted += 1;
                }
            }
        }
        if n < PAGE {
            break;
        }
        offset += n;
    }
    if report.promoted > 0 || report.demoted > 0 {
        info!(
            team = team_id,
            agent = agent_id.unwrap_or("-"),
            promoted = report.promoted,
            demoted = report.demoted,
            protected = report.protected,
            "tier sweep"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryType, SourceType};

    const NOW: i64 = 1_700_000_000_000;

    fn mem(importance: u8, access_count: i64, age_days: i64, tier: Tier) -> Memory {
        let t = NOW - age_days * DAY_MS;
        Memory {
            id: "m1".into(),
            team_id: "t1".into(),
            agent_id: None,
            user_id: None,
            memory_type: MemoryType::Semantic,
            content: "x".into(),
            subject: None,
            embedding: None,
            importance,
            confidence: 0.8,
            access_count,
            is_pinned: false,
            source_type: SourceType::Extraction,
            source_conversation_id: None,
            source_message_ids: vec![],
            extraction_model: None,
            version: 1,
            superseded_by: None,
            contradicts: vec![],
            related_to: vec![],
            tier,
            status: Status::Active,
            created_at: t,
            updated_at: t,
            last_accessed_at: t,
            expires_at: None,
        }
    }

    #[test]
    fn initial_placement() {
        assert_eq!(initial_tier(9, false), Tier::Hot);
        assert_eq!(initial_tier(8, false), Tier::Warm);
        assert_eq!(initial_tier(1, true), Tier::Hot);
    }

    #[test]
    fn stale_low_value_goes_cold() {
        let p = TierPolicy::default();
        let d = evaluate(&mem(2, 0, 120, Tier::Warm), &p, NOW).unwrap();
        assert_eq!(d.to, Tier::Cold);
    }

    #[test]
    fn pinned_is_never_demoted() {
        let p = TierPolicy::default();
        let mut m = mem(2, 0, 120, Tier::Warm);
        m.is_pinned = true;
        assert!(evaluate(&m, &p, NOW).is_none());
    }

    #[test]
    fn identity_and_high_importance_are_guarded() {
        let p = TierPolicy::default();
        let mut m = mem(2, 0, 120, Tier::Hot);
        m.memory_type = MemoryType::Identity;
        assert!(evaluate_demotion(&m, &p, NOW).is_none());
        let mut m = mem(8, 0, 120, Tier::Hot);
        m.status = Status::Superseded;
        assert!(evaluate_demotion(&m, &p, NOW).is_none());
    }

    #[test]
    fn frequent_recent_access_promotes() {
        let p = TierPolicy::default();
        let mut m = mem(5, 11, 30, Tier::Warm);
        m.last_accessed_at = NOW - DAY_MS;
        assert_eq!(evaluate(&m, &p, NOW).unwrap().to, Tier::Hot);
        m.access_count = 10;
        assert!(evaluate_promotion(&m, &p, NOW).is_none());
    }

    #[test]
    fn cold_rewarms_on_access() {
        let p = TierPolicy::default();
        let mut m = mem(2, 2, 200, Tier::Cold);
        m.last_accessed_at = NOW - 3600_000;
        assert_eq!(evaluate(&m, &p, NOW).unwrap().to, Tier::Warm);
        m.status = Status::Superseded;
        assert!(evaluate_promotion(&m, &p, NOW).is_none());
    }

    #[test]
    fn idle_hot_cools() {
        let p = TierPolicy::default();
        let d = evaluate(&mem(5, 3, 31, Tier::Hot), &p, NOW).unwrap();
        assert_eq!(d.to, Tier::Warm);
        assert!(evaluate(&mem(5, 3, 29, Tier::Hot), &p, NOW).is_none());
    }

    #[test]
    fn superseded_warm_goes_cold() {
        let p = TierPolicy::default();
        let mut m = mem(5, 3, 1, Tier::Warm);
        m.status = Status::Superseded;
        assert_eq!(evaluate(&m, &p, NOW).unwrap().to, Tier::Cold);
    }
}
