use std::collections::HashMap;

use serde::Deserialize;
use tracing::{info, warn};

use crate::ai::{complete_as, Completer, CompletionRequest};
use crate::cache::embed_cached;
use crate::db::{Memory, MemoryInput, MemoryType, SourceType, Status};
use crate::error::MemoryError;
use crate::prompts;
use crate::util::truncate_chars;
use crate::db_call;

use super::{load_scope, Consolidator, CHANGED_BY};

const DAY_MS: i64 = 24 * 3600 * 1000;
/// Episodes per summary call.
const MAX_BATCH: usize = 50;

#[derive(Deserialize)]
struct SummaryOut {
    summary: String,
}

fn is_stale(m: &Memory, c: &Consolidator, now: i64) -> bool {
    m.memory_type == MemoryType::Episodic
        && m.status == Status::Active
        && !m.is_pinned
        && m.importance < c.policy.max_importance
        && now - m.last_accessed_at >= c.policy.stale_days * DAY_MS
}

fn render(batch: &[Memory]) -> String {
    batch
        .iter()
        .map(|m| format!("- {}", truncate_chars(&m.content, 500)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Roll stale low-importance episodes into one consolidation memory per user
/// group. Returns `(episodes archived, summaries created)`.
pub(super) async fn summarize_stale(
    c: &Consolidator,
    completer: &dyn Completer,
    team_id: &str,
    agent_id: Option<&str>,
    now: i64,
) -> Result<(usize, usize), MemoryError> {
    let (t, a) = (team_id.to_string(), agent_id.map(String::from));
    let rows = db_call(&c.db, move |d| load_scope(d, &t, a.as_deref())).await??;

    let mut groups: HashMap<Option<String>, Vec<Memory>> = HashMap::new();
    for m in rows.into_iter().filter(|m| is_stale(m, c, now)) {
        groups.entry(m.user_id.clone()).or_default().push(m);
    }

    let (mut archived, mut created) = (0, 0);
    for (user_id, group) in groups {
        for batch in group.chunks(MAX_BATCH) {
            if batch.len() < c.policy.summary_min_batch {
                continue;
            }
            let out: SummaryOut = complete_as(
                completer,
                CompletionRequest {
                    component: "summary".into(),
                    system: prompts::EPISODIC_SUMMARY_SYSTEM.into(),
                    user: render(batch),
                    tool_name: "store_summary".into(),
                    tool_description: "Store the consolidated summary".into(),
                    schema: prompts::summary_schema(),
                },
            )
            .await?;
            let text = out.summary.trim();
            if text.is_empty() {
                warn!(team_id, episodes = batch.len(), "empty episodic summary, leaving sources");
                continue;
            }

            let embedding = match c.embedder.as_deref() {
                Some(e) => embed_cached(e, c.embed_cache.as_ref(), &[text.to_string()])
                    .await
                    .ok()
                    .and_then(|mut v| v.pop()),
                None => None,
            };
            let source_ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
            let input = MemoryInput {
                team_id: team_id.to_string(),
                agent_id: agent_id.map(String::from),
                user_id: user_id.clone(),
                memory_type: MemoryType::Episodic,
                content: truncate_chars(text, 4000),
                embedding,
                importance: batch.iter().map(|m| m.importance).max(),
                confidence: Some(0.8),
                source_type: SourceType::Consolidation,
                source_message_ids: batch.iter().flat_map(|m| m.source_message_ids.clone()).collect(),
                extraction_model: Some(completer.model_for("summary")),
                ..Default::default()
            };

            let n = source_ids.len();
            db_call(&c.db, move |d| d.insert_summary(input, &source_ids, CHANGED_BY, "stale episodes rolled up"))
                .await??;
            archived += n;
            created += 1;
        }
    }
    if created > 0 {
        info!(team_id, summaries = created, episodes = archived, "stale episodes summarized");
    }
    Ok((archived, created))
}
