//! Candidate merging and the weighted five-signal score. Pure: no I/O, no locks.

use std::collections::HashMap;

use serde::Serialize;

use crate::ai::cosine_similarity;
use crate::config::SignalWeights;
use crate::db::{Memory, MemoryType, Status};
use crate::thresholds::{DISPUTED_PENALTY, PINNED_FLOOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Semantic,
    Recency,
    Importance,
    Continuity,
    Relationship,
}

impl Signal {
    pub const ALL: [Signal; 5] = [
        Signal::Semantic,
        Signal::Recency,
        Signal::Importance,
        Signal::Continuity,
        Signal::Relationship,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Semantic => "semantic",
            Signal::Recency => "recency",
            Signal::Importance => "importance",
            Signal::Continuity => "continuity",
            Signal::Relationship => "relationship",
        }
    }
}

/// Per-signal breakdown, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SignalScores {
    pub semantic: f64,
    pub recency: f64,
    pub importance: f64,
    pub continuity: f64,
    pub relationship: f64,
}

impl SignalScores {
    pub fn weighted(&self, w: &SignalWeights) -> f64 {
        w.semantic * self.semantic
            + w.recency * self.recency
            + w.importance * self.importance
            + w.continuity * self.continuity
            + w.relationship * self.relationship
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub final_score: f64,
    pub signals: SignalScores,
}

/// Raw rows returned by each signal query.
#[derive(Debug, Default)]
pub struct SignalHits {
    /// Rows with their cosine to the query.
    pub semantic: Vec<(Memory, f64)>,
    pub recency: Vec<Memory>,
    pub importance: Vec<Memory>,
    pub continuity: Vec<Memory>,
    /// One-hop `related_to` neighbours of the semantic hits.
    pub relationship: Vec<Memory>,
}

impl SignalHits {
    pub fn count(&self, s: Signal) -> usize {
        match s {
            Signal::Semantic => self.semantic.len(),
            Signal::Recency => self.recency.len(),
            Signal::Importance => self.importance.len(),
            Signal::Continuity => self.continuity.len(),
            Signal::Relationship => self.relationship.len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScoreContext<'a> {
    pub query_embedding: Option<&'a [f32]>,
    pub conversation_id: Option<&'a str>,
    pub session_started_at: Option<i64>,
    pub now: i64,
    pub recency_lambda: f64,
    pub weights: SignalWeights,
}

/// `exp(-λ · hours since last access)`.
pub fn recency_score(last_accessed_at: i64, now: i64, lambda: f64) -> f64 {
    let hours = ((now - last_accessed_at).max(0) as f64) / 3_600_000.0;
    (-lambda * hours).exp()
}

pub fn importance_score(m: &Memory) -> f64 {
    if m.is_pinned || m.memory_type == MemoryType::Identity {
        1.0
    } else {
        m.importance as f64 / 10.0
    }
}

pub fn continuity_score(m: &Memory, conversation_id: Option<&str>, session_started_at: Option<i64>) -> f64 {
    let same_conv = conversation_id.is_some() && m.source_conversation_id.as_deref() == conversation_id;
    let this_session = session_started_at.is_some_and(|t| m.created_at >= t);
    if same_conv || this_session {
        1.0
    } else {
        0.0
    }
}

/// Disputed halves, pinned floors at 0.95, identity is always 1.0.
pub fn apply_overrides(m: &Memory, score: f64) -> f64 {
    let mut s = score;
    if m.status == Status::Disputed {
        s *= DISPUTED_PENALTY;
    }
    if m.is_pinned {
        s = s.max(PINNED_FLOOR);
    }
    if m.memory_type == MemoryType::Identity {
        s = 1.0;
    }
    s.clamp(0.0, 1.0)
}

/// Deterministic order: score descending, then newest, then id.
pub fn sort_scored(items: &mut [ScoredMemory]) {
    items.sort_by(|a, b| {
        b.final_score
            .total_cmp(&a.final_score)
            .then_with(|| b.memory.created_at.cmp(&a.memory.created_at))
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
}

/// Merge signal hits by id and score every candidate on all five signals.
pub fn merge_candidates(hits: SignalHits, ctx: &ScoreContext) -> Vec<ScoredMemory> {
    // relationship strength = cosine of the strongest semantic hit linking to the row
    let mut link: HashMap<String, f64> = HashMap::new();
    for (m, sim) in &hits.semantic {
        for rel in &m.related_to {
            let e = link.entry(rel.clone()).or_insert(0.0);
            *e = e.max(sim.clamp(0.0, 1.0));
        }
    }

    let mut by_id: HashMap<String, Memory> = HashMap::new();
    let SignalHits { semantic, recency, importance, continuity, relationship } = hits;
    let all = semantic
        .into_iter()
        .map(|(m, _)| m)
        .chain(recency)
        .chain(importance)
        .chain(continuity)
        .chain(relationship);
    for m in all {
        by_id.entry(m.id.clone()).or_insert(m);
    }

    let mut out: Vec<ScoredMemory> = by_id
        .into_values()
        .map(|m| {
            let semantic = match (ctx.query_embedding, m.embedding.as_deref()) {
                (Some(q), Some(e)) => cosine_similarity(q, e).clamp(0.0, 1.0),
                _ => 0.0,
            };
            let signals = SignalScores {
                semantic,
                recency: recency_score(m.last_accessed_at, ctx.now, ctx.recency_lambda),
                importance: importance_score(&m),
                continuity: continuity_score(&m, ctx.conversation_id, ctx.session_started_at),
                relationship: link.get(&m.id).copied().unwrap_or(0.0),
            };
            let final_score = apply_overrides(&m, signals.weighted(&ctx.weights));
            ScoredMemory { memory: m, final_score, signals }
        })
        .collect();
    sort_scored(&mut out);
    out
}
