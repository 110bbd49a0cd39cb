//! Centralised prompt texts and tool-call JSON schemas.
//!
//! Every LLM prompt and structured-output schema lives here so they can be
//! audited, tuned, and versioned in one place.  The rest of the codebase
//! imports from `crate::prompts`.

// ---------------------------------------------------------------------------
// extract.rs: pass 1
// ---------------------------------------------------------------------------

pub const EXTRACT_PASS1_SYSTEM: &str = r#"You are a memory extraction engine for an AI agent. Read the conversation and extract durable facts, preferences, events and procedures as discrete memories.

Each memory must be self-contained and one fact long. Write it in third person about the user ("User prefers ...") unless it describes the agent itself.

memory_type:
- "semantic": facts, decisions, preferences that stay true until changed
- "episodic": something that happened at a point in time
- "procedural": a reusable how-to the agent learned
- "user_profile": stable facts about the user (name, timezone, role, language)
- "identity": who the agent is (only when the user defines the agent's persona)
- "shared": team-wide conventions every agent should know

subject: a lower-case dotted key naming what the fact is about, e.g. "user.preference.language", "user.timezone", "project.deploy.target". Facts about the same thing MUST share a subject.

importance (integer 1-10):
- 9-10: the user explicitly asked to remember it, or it defines identity
- 7-8: significant decisions, strong preferences, hard constraints
- 4-6: useful context, minor preferences
- 1-3: background detail, probably not worth keeping long-term

confidence (0.0-1.0): how sure you are the user actually stated or clearly implied this. Hedged or inferred statements stay below 0.7.

is_update: true when the user is changing or correcting something said earlier ("I now prefer", "actually", "no longer", "switched to").

source_message_ids: ids of the turns the fact came from, exactly as given.

Skip greetings, small talk, transient states and anything the assistant merely explained. Zero memories is a fine answer."#;

// ---------------------------------------------------------------------------
// extract.rs: pass 2
// ---------------------------------------------------------------------------

pub const EXTRACT_PASS2_SYSTEM: &str = r#"You are reviewing a memory extraction for completeness. You get the conversation and the memories already extracted from it.

Return ONLY memories that were missed: facts, preferences, events or procedures present in the conversation but absent from the extracted list. Do not repeat, rephrase or correct existing entries. Use the same fields and rubric as the first pass. If nothing was missed, return an empty list."#;

pub fn extract_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "content": {"type": "string", "description": "One self-contained fact, under 300 chars"},
                        "memory_type": {
                            "type": "string",
                            "enum": ["semantic", "episodic", "procedural", "user_profile", "identity", "shared"]
                        },
                        "subject": {"type": "string", "description": "Lower-case dotted key, e.g. user.preference.language"},
                        "importance": {"type": "integer", "minimum": 1, "maximum": 10},
                        "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                        "is_update": {"type": "boolean"},
                        "source_message_ids": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["content", "memory_type", "importance", "confidence"]
                }
            }
        },
        "required": ["facts"]
    })
}

// ---------------------------------------------------------------------------
// compaction.rs: rolling summary
// ---------------------------------------------------------------------------

pub const COMPACTION_SUMMARY_SYSTEM: &str = r#"The following conversation turns are about to be dropped from the agent's context window. Write a short rolling summary (3-6 sentences) of what happened in them: topics discussed, decisions reached, open threads. Keep names, numbers and dates. No commentary."#;

// ---------------------------------------------------------------------------
// consolidate/summary.rs: stale episodic roll-up
// ---------------------------------------------------------------------------

pub const EPISODIC_SUMMARY_SYSTEM: &str = r#"You condense a set of old, low-importance episodic memories into one consolidated memory. Keep what would still be useful weeks from now (recurring patterns, outcomes, names, dates); drop trivia. 2-4 sentences, third person, no commentary."#;

pub fn summary_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string", "description": "The summary text"}
        },
        "required": ["summary"]
    })
}
