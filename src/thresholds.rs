//! Cosine similarity and scoring thresholds shared across components.
//!
//! Higher = stricter (only very similar items match).
//! The hierarchy: conflict (loose) < duplicate (tight) = merge (tight)

/// Extraction/remember: candidate is a near-duplicate of a stored row
pub const DUPLICATE_SIM: f64 = 0.95;

/// Consolidation: auto-merge rows above this similarity
pub const MERGE_SIM: f64 = DUPLICATE_SIM;

/// Contradiction: semantically close enough that opposite polarity conflicts
pub const CONFLICT_SIM: f64 = 0.70;

/// Contradiction: same-subject facts whose token Jaccard falls below this differ materially
pub const MATERIAL_DIFF_JACCARD: f64 = 0.85;

/// Importance at or above which a memory is never demoted
pub const PROTECTED_IMPORTANCE: u8 = 8;

/// Extraction: initial placement is hot at or above this importance
pub const HOT_IMPORTANCE: u8 = 9;

/// Feedback score at or above which a memory is promoted to hot
pub const STRONG_FEEDBACK: f64 = 0.8;

/// Score multiplier for disputed memories
pub const DISPUTED_PENALTY: f64 = 0.5;

/// Score floor for pinned memories
pub const PINNED_FLOOR: f64 = 0.95;

/// Characters per token for budget estimates
pub const CHARS_PER_TOKEN: f64 = 3.5;
