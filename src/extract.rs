//! Two-pass LLM fact extraction and the store path every new memory goes
//! through: dedup, contradiction check, then insert, version or dispute.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ai::{complete_as, Completer, CompletionRequest, Embedder};
use crate::cache::{embed_cached, EmbedCache, ResultCache};
use crate::contradiction::{check_on_store, CandidateFact, ResolutionAction};
use crate::db::{
    now_ms, validate_confidence, validate_importance, validate_subject, Memory, MemoryInput,
    MemoryType, SourceType,
};
use crate::error::MemoryError;
use crate::links;
use crate::locks::KeyedLocks;
use crate::prompts;
use crate::util::truncate_chars;
use crate::{db_call, SharedDB};

/// Neighbors pulled by embedding for the contradiction check.
const NEIGHBOR_LIMIT: usize = 20;

/// Importance given to explicit "remember this" requests that don't set one.
const EXPLICIT_IMPORTANCE: u8 = 9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl ConversationTurn {
    pub fn new(id: impl Into<String>, role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { id: id.into(), role: role.into(), content: content.into(), created_at: None }
    }
}

/// Who the extracted memories belong to.
#[derive(Debug, Clone, Default)]
pub struct ExtractionContext {
    pub team_id: String,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl ExtractionContext {
    pub fn new(team_id: impl Into<String>) -> Self {
        Self { team_id: team_id.into(), ..Default::default() }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }
}

/// One fact as the model returns it. Validated before anything is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub content: String,
    pub memory_type: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub importance: i64,
    pub confidence: f64,
    #[serde(default)]
    pub is_update: bool,
    #[serde(default)]
    pub source_message_ids: Vec<String>,
}

#[derive(Deserialize)]
struct FactList {
    #[serde(default)]
    facts: Vec<serde_json::Value>,
}

/// Whether a failed second pass aborts the extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    /// Periodic extraction: keep pass-1 output and warn.
    Lenient,
    /// Compaction: every pass must succeed.
    Strict,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ExtractionResult {
    pub created: Vec<String>,
    pub versioned: Vec<String>,
    pub disputed: Vec<String>,
    pub duplicates_skipped: usize,
    pub contradictions_found: usize,
    pub rejected: usize,
    /// Pass 2 failed and only pass-1 facts were stored.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pass2_degraded: bool,
}

impl ExtractionResult {
    /// Rows written by this run.
    pub fn stored(&self) -> usize {
        self.created.len() + self.versioned.len() + self.disputed.len()
    }

    fn absorb(&mut self, outcome: &StoreOutcome) {
        match outcome {
            StoreOutcome::Created { memory } => self.created.push(memory.id.clone()),
            StoreOutcome::Versioned { memory, superseded } => {
                self.versioned.push(memory.id.clone());
                self.contradictions_found += superseded.len();
            }
            StoreOutcome::Disputed { memory, contradicts } => {
                self.disputed.push(memory.id.clone());
                self.contradictions_found += contradicts.len();
            }
            StoreOutcome::Duplicate { .. } => self.duplicates_skipped += 1,
        }
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StoreOutcome {
    Created { memory: Memory },
    Versioned { memory: Memory, superseded: Vec<String> },
    Disputed { memory: Memory, contradicts: Vec<String> },
    Duplicate { existing_id: String },
}

impl StoreOutcome {
    pub fn memory_id(&self) -> &str {
        match self {
            Self::Created { memory }
            | Self::Versioned { memory, .. }
            | Self::Disputed { memory, .. } => &memory.id,
            Self::Duplicate { existing_id } => existing_id,
        }
    }
}

fn is_rejection(e: &MemoryError) -> bool {
    matches!(
        e,
        MemoryError::EmptyContent | MemoryError::ContentTooLong | MemoryError::Validation(_)
    )
}

pub(crate) fn render_transcript(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("[{}] {}: {}", t.id, t.role, truncate_chars(t.content.trim(), 4000)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Check a model-produced fact and turn it into an insert request.
fn fact_to_input(
    fact: ExtractedFact,
    ctx: &ExtractionContext,
    turn_ids: &[String],
    model: &str,
) -> Result<(MemoryInput, bool), MemoryError> {
    let content = fact.content.trim();
    if content.is_empty() {
        return Err(MemoryError::EmptyContent);
    }
    let memory_type = MemoryType::parse(fact.memory_type.trim())?;
    let importance = u8::try_from(fact.importance)
        .map_err(|_| MemoryError::Validation(format!("importance {} out of range 1-10", fact.importance)))?;
    validate_importance(importance)?;
    validate_confidence(fact.confidence)?;
    let subject = fact.subject.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    if let Some(ref s) = subject {
        validate_subject(s)?;
    }

    let mut ids: Vec<String> = fact
        .source_message_ids
        .into_iter()
        .filter(|id| turn_ids.contains(id))
        .collect();
    ids.dedup();
    if ids.is_empty() {
        ids = turn_ids.to_vec();
    }

    let input = MemoryInput {
        team_id: ctx.team_id.clone(),
        agent_id: ctx.agent_id.clone(),
        user_id: ctx.user_id.clone(),
        memory_type,
        content: content.to_string(),
        subject,
        importance: Some(importance),
        confidence: Some(fact.confidence),
        source_type: SourceType::Extraction,
        source_conversation_id: ctx.conversation_id.clone(),
        source_message_ids: ids,
        extraction_model: Some(model.to_string()),
        ..Default::default()
    };
    Ok((input, fact.is_update))
}

/// Extraction and the explicit store path. Cheap to clone.
#[derive(Clone)]
pub struct Extractor {
    pub(crate) db: SharedDB,
    pub(crate) embedder: Option<Arc<dyn Embedder>>,
    pub(crate) completer: Option<Arc<dyn Completer>>,
    pub(crate) embed_cache: Option<EmbedCache>,
    pub(crate) results: Option<ResultCache>,
    pub(crate) locks: KeyedLocks,
    pub(crate) duplicate_threshold: f64,
    pub(crate) conflict_threshold: f64,
}

impl Extractor {
    /// Run both passes over `turns` and store what survives.
    pub async fn extract(
        &self,
        turns: &[ConversationTurn],
        ctx: &ExtractionContext,
        mode: PassMode,
    ) -> Result<ExtractionResult, MemoryError> {
        let mut result = ExtractionResult::default();
        if turns.is_empty() {
            return Ok(result);
        }
        let completer = self.completer.as_deref().ok_or(MemoryError::AiNotConfigured)?;
        let model = completer.model_for("extract");
        let transcript = render_transcript(turns);

        let pass1: FactList = complete_as(
            completer,
            CompletionRequest {
                component: "extract".into(),
                system: prompts::EXTRACT_PASS1_SYSTEM.into(),
                user: transcript.clone(),
                tool_name: "store_memories".into(),
                tool_description: "Store the memories extracted from the conversation".into(),
                schema: prompts::extract_schema(),
            },
        )
        .await?;
        let mut raw = pass1.facts;

        let already = raw
            .iter()
            .filter_map(|v| v.get("content").and_then(|c| c.as_str()))
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        let pass2 = complete_as::<FactList>(
            completer,
            CompletionRequest {
                component: "extract".into(),
                system: prompts::EXTRACT_PASS2_SYSTEM.into(),
                user: format!("{transcript}\n\n## Already extracted\n{already}"),
                tool_name: "store_missed_memories".into(),
                tool_description: "Store memories the first pass missed".into(),
                schema: prompts::extract_schema(),
            },
        )
        .await;
        match pass2 {
            Ok(extra) => {
                debug!(pass1 = raw.len(), pass2 = extra.facts.len(), "extraction passes done");
                raw.extend(extra.facts);
            }
            Err(e) if mode == PassMode::Strict => return Err(e),
            Err(e) => {
                warn!(error = %e, "extraction pass 2 failed, keeping pass-1 facts");
                result.pass2_degraded = true;
            }
        }

        let turn_ids: Vec<String> = turns.iter().map(|t| t.id.clone()).collect();
        let mut inputs = Vec::with_capacity(raw.len());
        for value in raw {
            let parsed = serde_json::from_value::<ExtractedFact>(value)
                .map_err(|e| MemoryError::Validation(format!("malformed fact: {e}")))
                .and_then(|f| fact_to_input(f, ctx, &turn_ids, &model));
            match parsed {
                Ok(pair) => inputs.push(pair),
                Err(e) => {
                    warn!(error = %e, "rejected extracted fact");
                    result.rejected += 1;
                }
            }
        }

        let texts: Vec<String> = inputs.iter().map(|(i, _)| i.content.clone()).collect();
        if let Some(vectors) = self.embed_batch(&texts).await {
            for ((input, _), v) in inputs.iter_mut().zip(vectors) {
                input.embedding = Some(v);
            }
        }

        let _guard = self.locks.lock(&ctx.team_id, ctx.agent_id.as_deref()).await;
        for (input, is_update) in inputs {
            match self.store_unlocked(input, is_update, "extractor").await {
                Ok(outcome) => result.absorb(&outcome),
                Err(e) if is_rejection(&e) => {
                    warn!(error = %e, "rejected extracted fact");
                    result.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            team_id = %ctx.team_id,
            agent_id = ?ctx.agent_id,
            created = result.created.len(),
            versioned = result.versioned.len(),
            disputed = result.disputed.len(),
            duplicates = result.duplicates_skipped,
            rejected = result.rejected,
            "extraction stored"
        );
        Ok(result)
    }

    /// The explicit "remember this" path: no LLM, same dedup and conflict handling.
    pub async fn remember(&self, mut input: MemoryInput, is_update: bool) -> Result<StoreOutcome, MemoryError> {
        input.source_type = SourceType::Explicit;
        input.importance = Some(input.importance.unwrap_or(EXPLICIT_IMPORTANCE));
        self.store(input, is_update, "remember").await
    }

    /// Store one memory under the scope lock, embedding it first if needed.
    pub async fn store(
        &self,
        mut input: MemoryInput,
        is_update: bool,
        changed_by: &'static str,
    ) -> Result<StoreOutcome, MemoryError> {
        if input.embedding.is_none() {
            let text = input.content.trim().to_string();
            if !text.is_empty() {
                input.embedding = self.embed_batch(&[text]).await.and_then(|mut v| v.pop());
            }
        }
        let _guard = self.locks.lock(&input.team_id, input.agent_id.as_deref()).await;
        self.store_unlocked(input, is_update, changed_by).await
    }

    /// Embed through the cache. `None` when no embedder is configured or the
    /// call fails; callers store without vectors and rely on hash dedup.
    async fn embed_batch(&self, texts: &[String]) -> Option<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return None;
        }
        let embedder = self.embedder.as_deref()?;
        match embed_cached(embedder, self.embed_cache.as_ref(), texts).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, count = texts.len(), "embedding failed, storing without vectors");
                None
            }
        }
    }

    async fn store_unlocked(
        &self,
        input: MemoryInput,
        is_update: bool,
        changed_by: &'static str,
    ) -> Result<StoreOutcome, MemoryError> {
        let dup_threshold = self.duplicate_threshold;
        let conflict_threshold = self.conflict_threshold;
        let outcome = db_call(&self.db, move |d| {
            let team = input.team_id.clone();
            let agent = input.agent_id.clone();
            let user = input.user_id.clone();
            let (agent, user) = (agent.as_deref(), user.as_deref());

            let mut duplicate = d.find_by_hash(&team, agent, user, &input.content)?.map(|m| (m, 1.0));
            if duplicate.is_none() {
                if let Some(ref e) = input.embedding {
                    duplicate = d.find_similar(&team, agent, user, e, dup_threshold)?;
                }
            }
            if let Some((existing, sim)) = duplicate {
                let reason = format!(
                    "duplicate of \"{}\" (similarity {sim:.2})",
                    truncate_chars(input.content.trim(), 120)
                );
                d.log_duplicate_skipped(Some(&existing), &existing, changed_by, &reason)?;
                return Ok(StoreOutcome::Duplicate { existing_id: existing.id });
            }

            let mut nearby = match input.subject {
                Some(ref s) => d.list_same_subject(&team, agent, user, s)?,
                None => vec![],
            };
            if let Some(ref e) = input.embedding {
                for (m, _) in d.list_neighbors(&team, agent, user, e, conflict_threshold, NEIGHBOR_LIMIT)? {
                    if !nearby.iter().any(|n| n.id == m.id) {
                        nearby.push(m);
                    }
                }
            }
            let candidate = CandidateFact {
                content: input.content.trim().to_string(),
                subject: input.subject.clone(),
                embedding: input.embedding.clone(),
                is_update,
                created_at: now_ms(),
            };
            let check = check_on_store(&candidate, &nearby);

            let outcome = match check.action {
                ResolutionAction::Coexist => {
                    StoreOutcome::Created { memory: d.insert(input, changed_by, "")? }
                }
                ResolutionAction::Supersede => {
                    let (memory, old) = d.insert_version(input, &check.contradicts, changed_by, &check.reason)?;
                    StoreOutcome::Versioned {
                        memory,
                        superseded: old.into_iter().map(|m| m.id).collect(),
                    }
                }
                ResolutionAction::Dispute => {
                    let mut memory = d.insert(input, changed_by, "")?;
                    for other in &check.contradicts {
                        memory = d.mark_disputed(&memory.id, other, changed_by, &check.reason)?.0;
                    }
                    StoreOutcome::Disputed { memory, contradicts: check.contradicts.clone() }
                }
            };
            let mut touched = vec![outcome.memory_id().to_string()];
            touched.extend(check.contradicts);
            links::repair_rows(d, &touched)?;
            Ok::<_, MemoryError>(outcome)
        })
        .await??;

        if let Some(cache) = &self.results {
            match &outcome {
                StoreOutcome::Duplicate { .. } => {}
                StoreOutcome::Created { memory } => cache.invalidate_for(memory, false),
                // the other side of a version or dispute may have another owner
                StoreOutcome::Versioned { memory, .. } | StoreOutcome::Disputed { memory, .. } => {
                    cache.invalidate_for(memory, true)
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExtractionContext {
        ExtractionContext::new("t1").agent("a1").conversation("c1")
    }

    fn fact(json: serde_json::Value) -> ExtractedFact {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn fact_ids_are_restricted_to_turns() {
        let f = fact(serde_json::json!({
            "content": "User lives in Berlin",
            "memory_type": "user_profile",
            "subject": "user.location",
            "importance": 6,
            "confidence": 0.9,
            "source_message_ids": ["m2", "m9"]
        }));
        let ids = vec!["m1".to_string(), "m2".to_string()];
        let (input, is_update) = fact_to_input(f, &ctx(), &ids, "test-model").unwrap();
        assert!(!is_update);
        assert_eq!(input.source_message_ids, vec!["m2"]);
        assert_eq!(input.memory_type, MemoryType::UserProfile);
        assert_eq!(input.extraction_model.as_deref(), Some("test-model"));
        assert_eq!(input.source_conversation_id.as_deref(), Some("c1"));
    }

    #[test]
    fn unknown_ids_fall_back_to_all_turns() {
        let f = fact(serde_json::json!({
            "content": "User lives in Berlin",
            "memory_type": "semantic",
            "importance": 5,
            "confidence": 0.7,
            "source_message_ids": ["zzz"]
        }));
        let ids = vec!["m1".to_string(), "m2".to_string()];
        let (input, _) = fact_to_input(f, &ctx(), &ids, "m").unwrap();
        assert_eq!(input.source_message_ids, ids);
    }

    #[test]
    fn invalid_facts_are_rejected() {
        let ids = vec!["m1".to_string()];
        let cases = [
            serde_json::json!({"content": "x", "memory_type": "semantic", "importance": 11, "confidence": 0.5}),
            serde_json::json!({"content": "x", "memory_type": "semantic", "importance": 0, "confidence": 0.5}),
            serde_json::json!({"content": "x", "memory_type": "semantic", "importance": 5, "confidence": 1.5}),
            serde_json::json!({"content": "x", "memory_type": "gossip", "importance": 5, "confidence": 0.5}),
            serde_json::json!({"content": "  ", "memory_type": "semantic", "importance": 5, "confidence": 0.5}),
            serde_json::json!({"content": "x", "memory_type": "semantic", "subject": "User Prefs", "importance": 5, "confidence": 0.5}),
        ];
        for c in cases {
            let r = fact_to_input(fact(c.clone()), &ctx(), &ids, "m");
            assert!(r.is_err(), "accepted {c}");
        }
    }

    #[test]
    fn transcript_lists_ids_and_roles() {
        let turns = vec![
            ConversationTurn::new("m1", "user", "I now prefer JS"),
            ConversationTurn::new("m2", "assistant", "Noted."),
        ];
        let t = render_transcript(&turns);
        assert_eq!(t, "[m1] user: I now prefer JS\n[m2] assistant: Noted.");
    }
}
