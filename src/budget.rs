//! Token-budgeted selection over reserved pools: identity, pinned, user
//! profile, then everything else by score.

use serde::Serialize;
use tracing::warn;

use crate::config::BudgetReservations;
use crate::db::MemoryType;
use crate::scoring::{sort_scored, ScoredMemory};
use crate::thresholds::CHARS_PER_TOKEN;

/// `ceil(chars / 3.5)`, counted in chars so multi-byte text isn't overcounted.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    (chars as f64 / CHARS_PER_TOKEN).ceil() as usize
}

/// Tokens one memory costs against the budget, estimated from its content.
pub fn memory_tokens(item: &ScoredMemory) -> usize {
    estimate_tokens(&item.memory.content)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct PoolUsage {
    pub identity: usize,
    pub pinned: usize,
    pub user_profile: usize,
    pub general: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct Allocation {
    /// Included items, score order.
    pub included: Vec<ScoredMemory>,
    pub excluded: Vec<ScoredMemory>,
    /// Tokens spent from each pool.
    pub reserved: PoolUsage,
    pub total_tokens: usize,
    /// Identity alone exceeded the budget (or its reservation).
    pub overflow: bool,
}

enum Pool {
    Identity,
    Pinned,
    Profile,
    General,
}

fn pool_of(item: &ScoredMemory) -> Pool {
    let m = &item.memory;
    if m.memory_type == MemoryType::Identity {
        Pool::Identity
    } else if m.is_pinned {
        Pool::Pinned
    } else if m.memory_type == MemoryType::UserProfile {
        Pool::Profile
    } else {
        Pool::General
    }
}

/// Greedy fill of one pool, skipping items that don't fit. Returns tokens used;
/// items that didn't fit land in `spill`.
fn fill(
    items: Vec<(ScoredMemory, usize)>,
    cap: usize,
    included: &mut Vec<ScoredMemory>,
    spill: &mut Vec<(ScoredMemory, usize)>,
) -> usize {
    let mut used = 0;
    for (item, tokens) in items {
        if used + tokens <= cap {
            used += tokens;
            included.push(item);
        } else {
            spill.push((item, tokens));
        }
    }
    used
}

/// Select from `scored` (any order) within `budget` tokens. Identity memories
/// are always included, even past the budget.
pub fn allocate(scored: Vec<ScoredMemory>, budget: usize, res: &BudgetReservations) -> Allocation {
    let mut scored = scored;
    sort_scored(&mut scored);

    let (mut identity, mut pinned, mut profile, mut general) = (vec![], vec![], vec![], vec![]);
    for item in scored {
        let tokens = memory_tokens(&item);
        match pool_of(&item) {
            Pool::Identity => identity.push((item, tokens)),
            Pool::Pinned => pinned.push((item, tokens)),
            Pool::Profile => profile.push((item, tokens)),
            Pool::General => general.push((item, tokens)),
        }
    }

    let mut included = Vec::new();
    let mut usage = PoolUsage::default();

    usage.identity = identity.iter().map(|(_, t)| t).sum();
    included.extend(identity.into_iter().map(|(i, _)| i));
    let overflow = usage.identity > budget || usage.identity > res.identity;
    if overflow {
        warn!(
            identity_tokens = usage.identity,
            reservation = res.identity,
            budget,
            "identity memories exceed their reservation"
        );
    }
    let mut remaining = budget.saturating_sub(usage.identity);
    let mut carry = res.identity.saturating_sub(usage.identity);

    let mut spill = Vec::new();

    let cap = (res.pinned + carry).min(remaining);
    usage.pinned = fill(pinned, cap, &mut included, &mut spill);
    remaining -= usage.pinned;
    carry = cap - usage.pinned;

    let cap = (res.user_profile + carry).min(remaining);
    usage.user_profile = fill(profile, cap, &mut included, &mut spill);
    remaining -= usage.user_profile;

    // leftovers from the reserved pools compete on score with everything else
    general.extend(spill);
    general.sort_by(|a, b| {
        b.0.final_score
            .total_cmp(&a.0.final_score)
            .then_with(|| b.0.memory.created_at.cmp(&a.0.memory.created_at))
            .then_with(|| a.0.memory.id.cmp(&b.0.memory.id))
    });
    let mut excluded = Vec::new();
    usage.general = fill(general, remaining, &mut included, &mut excluded);

    sort_scored(&mut included);
    let mut excluded: Vec<ScoredMemory> = excluded.into_iter().map(|(i, _)| i).collect();
    sort_scored(&mut excluded);

    Allocation {
        included,
        excluded,
        total_tokens: usage.identity + usage.pinned + usage.user_profile + usage.general,
        reserved: usage,
        overflow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Memory, SourceType, Status, Tier};
    use crate::scoring::SignalScores;

    fn item(id: &str, t: MemoryType, pinned: bool, score: f64, content_len: usize) -> ScoredMemory {
        ScoredMemory {
            memory: Memory {
                id: id.into(),
                team_id: "t1".into(),
                agent_id: None,
                user_id: None,
                memory_type: t,
                content: "x".repeat(content_len),
                subject: None,
                embedding: None,
                importance: 5,
                confidence: 0.8,
                access_count: 0,
                is_pinned: pinned,
                source_type: SourceType::Extraction,
                source_conversation_id: None,
                source_message_ids: vec![],
                extraction_model: None,
                version: 1,
                superseded_by: None,
                contradicts: vec![],
                related_to: vec![],
                tier: Tier::Warm,
                status: Status::Active,
                created_at: 0,
                updated_at: 0,
                last_accessed_at: 0,
                expires_at: None,
            },
            final_score: score,
            signals: SignalScores::default(),
        }
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefg"), 2);
        assert_eq!(estimate_tokens("abcdefgh"), 3);
        assert_eq!(estimate_tokens("你好世界"), 2);
    }

    #[test]
    fn identity_survives_zero_budget() {
        let items = vec![
            item("id", MemoryType::Identity, false, 1.0, 40),
            item("f", MemoryType::Semantic, false, 0.9, 10),
        ];
        let a = allocate(items, 0, &BudgetReservations::default());
        assert_eq!(a.included.len(), 1);
        assert_eq!(a.included[0].memory.id, "id");
        assert!(a.overflow);
        assert_eq!(a.excluded.len(), 1);
    }

    #[test]
    fn total_stays_within_budget() {
        let items: Vec<_> = (0..50)
            .map(|i| item(&format!("m{i:02}"), MemoryType::Semantic, i % 7 == 0, 1.0 - i as f64 / 100.0, 100 + i * 3))
            .collect();
        for budget in [0, 50, 137, 500, 2000] {
            let a = allocate(items.clone(), budget, &BudgetReservations::default());
            let sum: usize = a.included.iter().map(memory_tokens).sum();
            assert!(sum <= budget, "budget {budget}: {sum}");
            assert_eq!(sum, a.total_tokens);
            assert_eq!(a.included.len() + a.excluded.len(), 50);
        }
    }

    #[test]
    fn skips_large_item_and_keeps_filling() {
        let items = vec![
            item("big", MemoryType::Semantic, false, 0.9, 3000),
            item("small", MemoryType::Semantic, false, 0.5, 20),
        ];
        let a = allocate(items, 100, &BudgetReservations::default());
        assert_eq!(a.included.len(), 1);
        assert_eq!(a.included[0].memory.id, "small");
    }

    #[test]
    fn pinned_pool_spills_into_general() {
        let res = BudgetReservations { identity: 0, pinned: 20, user_profile: 0 };
        let items = vec![
            item("p1", MemoryType::Semantic, true, 0.95, 100),
            item("g1", MemoryType::Semantic, false, 0.5, 50),
        ];
        let a = allocate(items, 1000, &res);
        assert_eq!(a.included.len(), 2);
        assert_eq!(a.reserved.pinned, 0);
        assert!(a.reserved.general > 0);
        assert_eq!(a.included[0].memory.id, "p1");
    }

    #[test]
    fn item_exactly_at_budget_fits() {
        let one = item("m", MemoryType::Semantic, false, 0.7, 35);
        assert_eq!(memory_tokens(&one), 10);
        let a = allocate(vec![one.clone()], 10, &BudgetReservations::default());
        assert_eq!(a.included.len(), 1);
        assert_eq!(a.total_tokens, 10);
        let a = allocate(vec![one], 9, &BudgetReservations::default());
        assert!(a.included.is_empty());
        assert_eq!(a.excluded.len(), 1);
    }

    #[test]
    fn reserved_pools_are_clamped_to_budget() {
        let items = vec![
            item("u", MemoryType::UserProfile, false, 0.2, 200),
            item("g", MemoryType::Semantic, false, 0.9, 200),
        ];
        let a = allocate(items, 80, &BudgetReservations::default());
        assert!(a.total_tokens <= 80);
    }
}
