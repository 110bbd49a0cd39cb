//! Conflict detection between a candidate fact and stored facts, and the
//! read-only dispute markers attached to retrieval results.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::ai::cosine_similarity;
use crate::db::{Memory, Status};
use crate::scoring::ScoredMemory;
use crate::thresholds::{CONFLICT_SIM, MATERIAL_DIFF_JACCARD};
use crate::util::truncate_chars;

/// A fact about to be stored.
#[derive(Debug, Clone)]
pub struct CandidateFact {
    pub content: String,
    pub subject: Option<String>,
    pub embedding: Option<Vec<f32>>,
    /// Extraction marked this as a change to an earlier fact.
    pub is_update: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Coexist,
    Supersede,
    Dispute,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContradictionCheck {
    /// Ids of the stored facts the candidate conflicts with.
    pub contradicts: Vec<String>,
    pub action: ResolutionAction,
    pub reason: String,
    /// Highest version among superseded facts; the new fact gets this + 1.
    pub superseded_version: Option<i64>,
}

impl ContradictionCheck {
    fn coexist() -> Self {
        Self {
            contradicts: vec![],
            action: ResolutionAction::Coexist,
            reason: "no conflict".into(),
            superseded_version: None,
        }
    }
}

/// Two disputed memories that both made it into one result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContradictionMarker {
    pub memory_id: String,
    pub other_id: String,
    pub summary: String,
}

fn update_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(now|no longer|not anymore|anymore|actually|switched|switching|changed (?:to|my)|correction|instead|from now on)\b",
        )
        .unwrap_or_else(|_| unreachable!())
    })
}

fn negation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(not|no|never|none|don't|doesn't|didn't|isn't|aren't|wasn't|won't|can't|cannot|dislikes?|hates?|avoids?|stopped)\b",
        )
        .unwrap_or_else(|_| unreachable!())
    })
}

/// Phrasing that marks a statement as replacing an earlier one.
pub fn has_update_framing(text: &str) -> bool {
    update_re().is_match(text)
}

/// True when the statement is negated.
pub fn is_negated(text: &str) -> bool {
    negation_re().find_iter(text).count() % 2 == 1
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity of lower-cased word sets.
pub fn token_jaccard(a: &str, b: &str) -> f64 {
    let (ta, tb) = (tokens(a), tokens(b));
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let inter = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    inter / union
}

fn conflict_reason(candidate: &CandidateFact, m: &Memory) -> Option<String> {
    if let (Some(cs), Some(ms)) = (&candidate.subject, &m.subject) {
        if cs == ms {
            let j = token_jaccard(&candidate.content, &m.content);
            if j < MATERIAL_DIFF_JACCARD {
                return Some(format!("same subject '{cs}' with different content (jaccard {j:.2})"));
            }
        }
    }
    if let (Some(ce), Some(me)) = (&candidate.embedding, &m.embedding) {
        let sim = cosine_similarity(ce, me);
        if sim > CONFLICT_SIM && is_negated(&candidate.content) != is_negated(&m.content) {
            return Some(format!("opposite polarity at similarity {sim:.2}"));
        }
    }
    None
}

/// Decide how a candidate relates to the live facts around it.
pub fn check_on_store(candidate: &CandidateFact, existing: &[Memory]) -> ContradictionCheck {
    let conflicts: Vec<(&Memory, String)> = existing
        .iter()
        .filter(|m| m.status.is_retrievable())
        .filter_map(|m| conflict_reason(candidate, m).map(|r| (m, r)))
        .collect();
    if conflicts.is_empty() {
        return ContradictionCheck::coexist();
    }

    let ids: Vec<String> = conflicts.iter().map(|(m, _)| m.id.clone()).collect();
    let reasons = conflicts.iter().map(|(_, r)| r.as_str()).collect::<Vec<_>>().join("; ");
    let framed = candidate.is_update || has_update_framing(&candidate.content);
    let newest = conflicts.iter().all(|(m, _)| candidate.created_at > m.created_at);

    if framed && newest {
        let max_version = conflicts.iter().map(|(m, _)| m.version).max();
        ContradictionCheck {
            contradicts: ids,
            action: ResolutionAction::Supersede,
            reason: format!("update supersedes earlier fact: {reasons}"),
            superseded_version: max_version,
        }
    } else {
        let why = if framed { "update is not newer than the stored fact" } else { "no update framing" };
        ContradictionCheck {
            contradicts: ids,
            action: ResolutionAction::Dispute,
            reason: format!("{why}: {reasons}"),
            superseded_version: None,
        }
    }
}

/// Markers for every disputed pair present together in `set`. Never mutates.
pub fn check_on_retrieve(set: &[ScoredMemory]) -> Vec<ContradictionMarker> {
    let by_id: HashMap<&str, &Memory> = set.iter().map(|s| (s.memory.id.as_str(), &s.memory)).collect();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut markers = Vec::new();
    for s in set {
        let m = &s.memory;
        if m.status != Status::Disputed {
            continue;
        }
        for other_id in &m.contradicts {
            let Some(other) = by_id.get(other_id.as_str()) else {
                continue;
            };
            let key = if m.id < *other_id {
                (m.id.clone(), other_id.clone())
            } else {
                (other_id.clone(), m.id.clone())
            };
            if !seen.insert(key) {
                continue;
            }
            markers.push(ContradictionMarker {
                memory_id: m.id.clone(),
                other_id: other_id.clone(),
                summary: format!(
                    "\"{}\" conflicts with \"{}\"",
                    truncate_chars(&m.content, 80),
                    truncate_chars(&other.content, 80)
                ),
            });
        }
    }
    markers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryType, SourceType, Tier};
    use crate::scoring::SignalScores;

    const DAY: i64 = 86_400_000;

    fn stored(id: &str, content: &str, subject: Option<&str>, created_at: i64) -> Memory {
        Memory {
            id: id.into(),
            team_id: "t1".into(),
            agent_id: None,
            user_id: None,
            memory_type: MemoryType::Semantic,
            content: content.into(),
            subject: subject.map(String::from),
            embedding: None,
            importance: 5,
            confidence: 0.8,
            access_count: 0,
            is_pinned: false,
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
            created_at,
            updated_at: created_at,
            last_accessed_at: created_at,
            expires_at: None,
        }
    }

    fn candidate(content: &str, subject: Option<&str>, is_update: bool) -> CandidateFact {
        CandidateFact {
            content: content.into(),
            subject: subject.map(String::from),
            embedding: None,
            is_update,
            created_at: 100 * DAY,
        }
    }

    const SUBJ: Option<&str> = Some("user.preference.language");

    #[test]
    fn framed_update_supersedes() {
        let old = stored("old", "User prefers TypeScript", SUBJ, 86 * DAY);
        let c = check_on_store(&candidate("User now prefers JavaScript", SUBJ, false), &[old]);
        assert_eq!(c.action, ResolutionAction::Supersede);
        assert_eq!(c.contradicts, vec!["old".to_string()]);
        assert_eq!(c.superseded_version, Some(1));
    }

    #[test]
    fn explicit_flag_counts_as_framing() {
        let old = stored("old", "User prefers TypeScript", SUBJ, 86 * DAY);
        let c = check_on_store(&candidate("User prefers JavaScript", SUBJ, true), &[old]);
        assert_eq!(c.action, ResolutionAction::Supersede);
    }

    #[test]
    fn ambiguous_conflict_disputes() {
        let old = stored("old", "User prefers TypeScript", SUBJ, 86 * DAY);
        let c = check_on_store(&candidate("User prefers JavaScript", SUBJ, false), &[old]);
        assert_eq!(c.action, ResolutionAction::Dispute);
        assert_eq!(c.contradicts.len(), 1);
    }

    #[test]
    fn update_older_than_stored_fact_disputes() {
        let newer = stored("new", "User prefers TypeScript", SUBJ, 200 * DAY);
        let c = check_on_store(&candidate("User now prefers JavaScript", SUBJ, false), &[newer]);
        assert_eq!(c.action, ResolutionAction::Dispute);
    }

    #[test]
    fn rephrasing_same_subject_coexists() {
        let old = stored("old", "User prefers TypeScript for frontend work", SUBJ, DAY);
        let c = check_on_store(&candidate("user prefers typescript for frontend work", SUBJ, false), &[old]);
        assert_eq!(c.action, ResolutionAction::Coexist);
    }

    #[test]
    fn different_subjects_coexist() {
        let old = stored("old", "User prefers TypeScript", Some("user.preference.editor"), DAY);
        let c = check_on_store(&candidate("User prefers JavaScript", SUBJ, false), &[old]);
        assert_eq!(c.action, ResolutionAction::Coexist);
    }

    #[test]
    fn opposite_polarity_on_close_vectors() {
        let mut old = stored("old", "User likes meetings in the morning", None, DAY);
        old.embedding = Some(vec![1.0, 0.1]);
        let mut cand = candidate("User does not like meetings in the morning", None, false);
        cand.embedding = Some(vec![1.0, 0.0]);
        let c = check_on_store(&cand, &[old.clone()]);
        assert_eq!(c.action, ResolutionAction::Dispute);

        cand.content = "User likes meetings in the morning a lot".into();
        assert_eq!(check_on_store(&cand, &[old]).action, ResolutionAction::Coexist);
    }

    #[test]
    fn framing_detection() {
        assert!(has_update_framing("I now prefer JS"));
        assert!(has_update_framing("Actually it's Tuesday"));
        assert!(has_update_framing("I no longer use vim"));
        assert!(!has_update_framing("I know the answer"));
        assert!(is_negated("User doesn't drink coffee"));
        assert!(!is_negated("User drinks coffee"));
    }

    #[test]
    fn retrieve_markers_are_pairwise_and_read_only() {
        let mut a = stored("a", "User prefers tabs", None, DAY);
        let mut b = stored("b", "User prefers spaces", None, DAY);
        a.status = Status::Disputed;
        b.status = Status::Disputed;
        a.contradicts = vec!["b".into()];
        b.contradicts = vec!["a".into()];
        let set: Vec<ScoredMemory> = [a, b]
            .into_iter()
            .map(|m| ScoredMemory { memory: m, final_score: 0.5, signals: SignalScores::default() })
            .collect();
        let markers = check_on_retrieve(&set);
        assert_eq!(markers.len(), 1);
        assert!(markers[0].summary.contains("tabs"));
        assert_eq!(set[0].memory.status, Status::Disputed);

        assert!(check_on_retrieve(&set[..1]).is_empty());
    }
}
