#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use strata::ai::{Completer, CompletionRequest, Embedder};
use strata::db::*;
use strata::{Engine, MemoryError, SharedDB};

pub const DIMS: usize = 64;
pub const DAY: i64 = 86_400_000;

/// Hashed bag of words over letters only, so "run 1" and "run 2" embed the same.
pub fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0f32; DIMS];
    for word in text.split(|c: char| !c.is_alphabetic()).filter(|w| !w.is_empty()) {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in word.to_lowercase().bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x0100_0000_01b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    v
}

#[derive(Default)]
pub struct MockEmbedder {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(MemoryError::AiBackend("embedder down".into()));
        }
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

/// Answers each tool call with a canned value.
#[derive(Default)]
pub struct MockCompleter {
    responses: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockCompleter {
    pub fn respond(&self, tool: &str, value: Value) {
        self.responses.lock().insert(tool.to_string(), value);
    }

    pub fn fail(&self, tool: &str) {
        self.failing.lock().insert(tool.to_string());
    }

    pub fn calls(&self, tool: &str) -> usize {
        self.calls.lock().iter().filter(|t| *t == tool).count()
    }
}

#[async_trait]
impl Completer for MockCompleter {
    async fn complete(&self, req: CompletionRequest) -> Result<Value, MemoryError> {
        self.calls.lock().push(req.tool_name.clone());
        if self.failing.lock().contains(&req.tool_name) {
            return Err(MemoryError::AiBackend(format!("{} failed", req.tool_name)));
        }
        self.responses
            .lock()
            .get(&req.tool_name)
            .cloned()
            .ok_or_else(|| MemoryError::AiBackend(format!("no canned response for {}", req.tool_name)))
    }

    fn model_for(&self, component: &str) -> String {
        format!("mock-{component}")
    }
}

pub struct Harness {
    pub engine: Engine,
    pub db: SharedDB,
    pub embedder: Arc<MockEmbedder>,
    pub completer: Arc<MockCompleter>,
}

pub fn test_db() -> SharedDB {
    Arc::new(MemoryDB::open(":memory:").expect("in-memory db"))
}

/// Engine over a fresh in-memory store with mock AI. Needs a tokio runtime.
pub fn harness() -> Harness {
    let db = test_db();
    let embedder = Arc::new(MockEmbedder::default());
    let completer = Arc::new(MockCompleter::default());
    let engine = Engine::builder(db.clone())
        .embedder(embedder.clone())
        .completer(completer.clone())
        .build()
        .expect("engine");
    Harness { engine, db, embedder, completer }
}

/// A fully-specified row for `MemoryDB::import`, embedded with `embed_text`.
pub fn memory(id: &str, memory_type: MemoryType, content: &str, importance: u8, created_at: i64) -> Memory {
    Memory {
        id: id.into(),
        team_id: "t1".into(),
        agent_id: Some("a1".into()),
        user_id: None,
        memory_type,
        content: content.into(),
        subject: None,
        embedding: Some(embed_text(content)),
        importance,
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

/// Store through the plain insert path with a mock vector attached.
pub fn seed(db: &MemoryDB, input: MemoryInput) -> Memory {
    let emb = embed_text(&input.content);
    db.insert(input.embedding(emb), "test", "").expect("seed insert")
}

pub fn fact(content: &str, memory_type: &str, subject: Option<&str>, importance: i64, is_update: bool) -> Value {
    serde_json::json!({
        "content": content,
        "memory_type": memory_type,
        "subject": subject,
        "importance": importance,
        "confidence": 0.9,
        "is_update": is_update,
        "source_message_ids": ["m1"],
    })
}
