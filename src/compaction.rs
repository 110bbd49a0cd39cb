//! The compaction shield. Before a caller trims turns out of its context
//! window it asks for a permit; the permit only exists once every fact and a
//! rolling summary of those turns are safely stored.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ai::{complete_as, CompletionRequest};
use crate::db::{MemoryInput, MemoryType, SourceType};
use crate::error::MemoryError;
use crate::extract::{render_transcript, ConversationTurn, ExtractionContext, ExtractionResult, Extractor, PassMode};
use crate::prompts;
use crate::util::truncate_chars;

/// Upper bound on the stored summary.
const MAX_SUMMARY_CHARS: usize = 4000;

/// Proof that the listed turns are captured and may be discarded. Only this
/// module can mint one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscardPermit {
    message_ids: Vec<String>,
}

impl DiscardPermit {
    fn new(turns: &[ConversationTurn]) -> Self {
        Self { message_ids: turns.iter().map(|t| t.id.clone()).collect() }
    }

    pub fn message_ids(&self) -> &[String] {
        &self.message_ids
    }

    pub fn covers(&self, message_id: &str) -> bool {
        self.message_ids.iter().any(|id| id == message_id)
    }
}

#[derive(Debug, Serialize)]
pub struct CompactionResult {
    pub extraction: ExtractionResult,
    /// The episodic summary row, when one was written.
    pub summary_memory_id: Option<String>,
    pub permit: DiscardPermit,
}

#[derive(Deserialize)]
struct SummaryOut {
    summary: String,
}

#[derive(Clone)]
pub struct CompactionShield {
    pub(crate) extractor: Extractor,
    pub(crate) enabled: bool,
}

impl CompactionShield {
    /// Extract and summarize `turns`, strictly. Any failure is returned as an
    /// error and no permit is issued.
    pub async fn extract_before_compaction(
        &self,
        turns: &[ConversationTurn],
        ctx: &ExtractionContext,
    ) -> Result<CompactionResult, MemoryError> {
        if !self.enabled || turns.is_empty() {
            return Ok(CompactionResult {
                extraction: ExtractionResult::default(),
                summary_memory_id: None,
                permit: DiscardPermit::new(turns),
            });
        }

        let extraction = self.extractor.extract(turns, ctx, PassMode::Strict).await?;

        let completer = self.extractor.completer.as_deref().ok_or(MemoryError::AiNotConfigured)?;
        let out: SummaryOut = complete_as(
            completer,
            CompletionRequest {
                component: "summary".into(),
                system: prompts::COMPACTION_SUMMARY_SYSTEM.into(),
                user: render_transcript(turns),
                tool_name: "store_summary".into(),
                tool_description: "Store the rolling summary of the discarded turns".into(),
                schema: prompts::summary_schema(),
            },
        )
        .await?;
        let summary = out.summary.trim();
        if summary.is_empty() {
            return Err(MemoryError::AiBackend("compaction summary came back empty".into()));
        }

        let input = MemoryInput {
            team_id: ctx.team_id.clone(),
            agent_id: ctx.agent_id.clone(),
            user_id: ctx.user_id.clone(),
            memory_type: MemoryType::Episodic,
            content: truncate_chars(summary, MAX_SUMMARY_CHARS),
            importance: Some(5),
            confidence: Some(0.9),
            source_type: SourceType::Compaction,
            source_conversation_id: ctx.conversation_id.clone(),
            source_message_ids: turns.iter().map(|t| t.id.clone()).collect(),
            extraction_model: Some(completer.model_for("summary")),
            ..Default::default()
        };
        let stored = self.extractor.store(input, false, "compaction_shield").await?;

        info!(
            team_id = %ctx.team_id,
            turns = turns.len(),
            facts = extraction.stored(),
            "compaction shield passed"
        );
        Ok(CompactionResult {
            extraction,
            summary_memory_id: Some(stored.memory_id().to_string()),
            permit: DiscardPermit::new(turns),
        })
    }
}
