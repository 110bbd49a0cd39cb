//! Rendering memories into prompt sections, and the seven-layer prompt
//! assembler with its fixed trim order.

use std::collections::HashMap;

use serde::Serialize;

use crate::budget::estimate_tokens;
use crate::contradiction::ContradictionMarker;
use crate::db::{Memory, MemoryType, Status};
use crate::extract::ConversationTurn;
use crate::scoring::ScoredMemory;
use crate::util::truncate_chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Section {
    Identity,
    AboutUser,
    Facts,
    RecentEvents,
    LearnedPatterns,
    TeamKnowledge,
}

const KNOWLEDGE: [Section; 4] = [
    Section::Facts,
    Section::RecentEvents,
    Section::LearnedPatterns,
    Section::TeamKnowledge,
];

impl Section {
    fn of(t: MemoryType) -> Self {
        match t {
            MemoryType::Identity => Section::Identity,
            MemoryType::UserProfile => Section::AboutUser,
            MemoryType::Semantic | MemoryType::AgentPrivate => Section::Facts,
            MemoryType::Episodic => Section::RecentEvents,
            MemoryType::Procedural => Section::LearnedPatterns,
            MemoryType::Shared => Section::TeamKnowledge,
        }
    }

    fn header(self) -> &'static str {
        match self {
            Section::Identity => "## Identity",
            Section::AboutUser => "## About This User",
            Section::Facts => "## Facts",
            Section::RecentEvents => "## Recent Events",
            Section::LearnedPatterns => "## Learned Patterns",
            Section::TeamKnowledge => "## Team Knowledge",
        }
    }
}

fn type_label(t: MemoryType) -> String {
    t.as_str().to_uppercase()
}

/// `[TYPE]: content (importance: N, confidence: C)`
pub fn format_line(m: &Memory) -> String {
    format!(
        "[{}]: {} (importance: {}, confidence: {:.2})",
        type_label(m.memory_type),
        m.content,
        m.importance,
        m.confidence
    )
}

/// `[TYPE DISPUTED]: content (contradicts: <summary>)`
pub fn format_disputed_line(m: &Memory, summary: &str) -> String {
    format!("[{} DISPUTED]: {} (contradicts: {})", type_label(m.memory_type), m.content, summary)
}

fn render_line(m: &Memory, contents: &HashMap<&str, &str>) -> String {
    if m.status != Status::Disputed {
        return format_line(m);
    }
    let others: Vec<String> = m
        .contradicts
        .iter()
        .filter_map(|id| contents.get(id.as_str()))
        .map(|c| truncate_chars(c, 60))
        .collect();
    let summary = if others.is_empty() {
        format!("{} other fact(s)", m.contradicts.len().max(1))
    } else {
        others.join("; ")
    };
    format_disputed_line(m, &summary)
}

fn content_index(items: &[ScoredMemory]) -> HashMap<&str, &str> {
    items.iter().map(|s| (s.memory.id.as_str(), s.memory.content.as_str())).collect()
}

/// Sectioned rendering of retrieved memories, in the given (score) order
/// within each section. Empty sections are omitted.
pub fn format_memories(items: &[ScoredMemory]) -> String {
    let contents = content_index(items);
    let mut sections: Vec<(Section, Vec<String>)> = Vec::new();
    for s in items {
        let sec = Section::of(s.memory.memory_type);
        let line = render_line(&s.memory, &contents);
        match sections.iter_mut().find(|(k, _)| *k == sec) {
            Some((_, lines)) => lines.push(line),
            None => sections.push((sec, vec![line])),
        }
    }
    sections.sort_by_key(|(k, _)| *k);
    sections
        .into_iter()
        .map(|(k, lines)| format!("{}\n{}", k.header(), lines.join("\n")))
        .collect::<Vec<_>>()
        .join("\n\n")
}

struct Line {
    section: Section,
    text: String,
    score: f64,
    pinned: bool,
}

/// What was dropped to fit the budget.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TrimReport {
    pub recent_turns: usize,
    pub session_summary: bool,
    pub contradiction_notices: usize,
    pub knowledge: usize,
    pub user_profile: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembledPrompt {
    pub text: String,
    pub tokens: usize,
    pub trimmed: TrimReport,
    /// System and identity alone exceed the budget.
    pub over_budget: bool,
}

/// Seven ordered layers: system, identity, user profile, knowledge,
/// contradiction notices, session summary, recent turns.
pub struct PromptAssembler {
    system: String,
    identity: Vec<Line>,
    profile: Vec<Line>,
    knowledge: Vec<Line>,
    notices: Vec<String>,
    summary: Option<String>,
    turns: Vec<String>,
}

impl PromptAssembler {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            identity: vec![],
            profile: vec![],
            knowledge: vec![],
            notices: vec![],
            summary: None,
            turns: vec![],
        }
    }

    pub fn memories(mut self, items: &[ScoredMemory]) -> Self {
        let contents = content_index(items);
        for s in items {
            let line = Line {
                section: Section::of(s.memory.memory_type),
                text: render_line(&s.memory, &contents),
                score: s.final_score,
                pinned: s.memory.is_pinned,
            };
            match line.section {
                Section::Identity => self.identity.push(line),
                Section::AboutUser => self.profile.push(line),
                _ => self.knowledge.push(line),
            }
        }
        self
    }

    pub fn contradictions(mut self, markers: &[ContradictionMarker]) -> Self {
        self.notices.extend(markers.iter().map(|m| format!("- {}", m.summary)));
        self
    }

    pub fn session_summary(mut self, summary: Option<&str>) -> Self {
        self.summary = summary.filter(|s| !s.trim().is_empty()).map(String::from);
        self
    }

    /// Turns oldest first.
    pub fn recent_turns(mut self, turns: &[ConversationTurn]) -> Self {
        self.turns.extend(turns.iter().map(|t| format!("{}: {}", t.role, t.content)));
        self
    }

    fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !self.system.trim().is_empty() {
            parts.push(self.system.trim().to_string());
        }
        let mut block = |header: &str, lines: Vec<&str>| {
            if !lines.is_empty() {
                parts.push(format!("{header}\n{}", lines.join("\n")));
            }
        };
        block(Section::Identity.header(), self.identity.iter().map(|l| l.text.as_str()).collect());
        block(Section::AboutUser.header(), self.profile.iter().map(|l| l.text.as_str()).collect());
        for sec in KNOWLEDGE {
            block(
                sec.header(),
                self.knowledge.iter().filter(|l| l.section == sec).map(|l| l.text.as_str()).collect(),
            );
        }
        block("## Contradictions", self.notices.iter().map(String::as_str).collect());
        if let Some(ref s) = self.summary {
            block("## Session Summary", vec![s.as_str()]);
        }
        block("## Recent Conversation", self.turns.iter().map(String::as_str).collect());
        parts.join("\n\n")
    }

    /// Index of the next line to drop: lowest-scored unpinned, then lowest-scored pinned.
    fn weakest(lines: &[Line]) -> Option<usize> {
        lines
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.pinned.cmp(&b.pinned).then_with(|| a.score.total_cmp(&b.score)))
            .map(|(i, _)| i)
    }

    /// Drop one item following the trim order. False when only untrimmable
    /// layers remain.
    fn trim_one(&mut self, report: &mut TrimReport) -> bool {
        if !self.turns.is_empty() {
            self.turns.remove(0);
            report.recent_turns += 1;
        } else if self.summary.is_some() {
            self.summary = None;
            report.session_summary = true;
        } else if self.notices.pop().is_some() {
            report.contradiction_notices += 1;
        } else if let Some(i) = Self::weakest(&self.knowledge) {
            self.knowledge.remove(i);
            report.knowledge += 1;
        } else if let Some(i) = Self::weakest(&self.profile) {
            self.profile.remove(i);
            report.user_profile += 1;
        } else {
            return false;
        }
        true
    }

    pub fn assemble(mut self, budget: usize) -> AssembledPrompt {
        let mut report = TrimReport::default();
        let mut text = self.render();
        let mut tokens = estimate_tokens(&text);
        while tokens > budget {
            if !self.trim_one(&mut report) {
                break;
            }
            text = self.render();
            tokens = estimate_tokens(&text);
        }
        AssembledPrompt { over_budget: tokens > budget, text, tokens, trimmed: report }
    }
}
