//! SQLite-backed memory store: rows, scoped similarity queries, and the audit log.

use std::sync::OnceLock;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::MemoryError;

/// Set busy_timeout on every connection handed out by the pool.
/// Prevents SQLITE_BUSY under concurrent write pressure (consolidation + access tracking).
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

const MAX_CONTENT_LEN: usize = 8192;
const MAX_SUBJECT_LEN: usize = 128;
const MAX_ID_LEN: usize = 128;

macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }

            pub fn parse(v: &str) -> Result<Self, MemoryError> {
                match v {
                    $($s => Ok(Self::$variant),)+
                    other => Err(MemoryError::Validation(format!(
                        concat!("invalid ", stringify!($name), ": {}"), other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

mod audit;
mod memory;
mod signals;

pub use audit::{AuditAction, AuditLogEntry, MemorySnapshot};

str_enum!(
    #[derive(Default)]
    MemoryType {
        #[default]
        Semantic => "semantic",
        Episodic => "episodic",
        Procedural => "procedural",
        AgentPrivate => "agent_private",
        Shared => "shared",
        Identity => "identity",
        UserProfile => "user_profile",
    }
);

impl MemoryType {
    /// Visible to every agent on the team.
    pub fn is_team_visible(self) -> bool {
        matches!(self, Self::Shared | Self::UserProfile)
    }

    /// May be owned by a single agent (`agent_id` set).
    pub fn is_agent_scoped(self) -> bool {
        matches!(
            self,
            Self::Semantic | Self::Episodic | Self::Procedural | Self::AgentPrivate | Self::Identity
        )
    }

    /// May live without an owning agent (`agent_id` null).
    pub fn is_unscoped(self) -> bool {
        matches!(self, Self::Semantic | Self::Episodic | Self::Procedural | Self::Identity)
    }
}

str_enum!(
    #[derive(Default)]
    SourceType {
        #[default]
        Extraction => "extraction",
        Explicit => "explicit",
        System => "system",
        Feedback => "feedback",
        Consolidation => "consolidation",
        Compaction => "compaction",
    }
);

str_enum!(
    /// Hot → Warm → Cold placement. Hot is always scanned first; cold is only
    /// eligible for low-signal pruning.
    Tier {
        Hot => "hot",
        Warm => "warm",
        Cold => "cold",
    }
);

impl Tier {
    fn rank(self) -> u8 {
        match self {
            Tier::Cold => 0,
            Tier::Warm => 1,
            Tier::Hot => 2,
        }
    }

    pub fn is_above(self, other: Tier) -> bool {
        self.rank() > other.rank()
    }
}

str_enum!(Status {
    Active => "active",
    Superseded => "superseded",
    Archived => "archived",
    Disputed => "disputed",
});

impl Status {
    /// Status only moves away from `active`; a dispute can be resolved back
    /// to active or into superseded. Re-applying the current status is allowed.
    pub fn can_transition_to(self, to: Status) -> bool {
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Status::Active, Status::Superseded)
                | (Status::Active, Status::Archived)
                | (Status::Active, Status::Disputed)
                | (Status::Disputed, Status::Active)
                | (Status::Disputed, Status::Superseded)
        )
    }

    pub fn is_retrievable(self) -> bool {
        matches!(self, Status::Active | Status::Disputed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub team_id: String,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub memory_type: MemoryType,
    pub content: String,
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub importance: u8,
    pub confidence: f64,
    pub access_count: i64,
    pub is_pinned: bool,
    pub source_type: SourceType,
    pub source_conversation_id: Option<String>,
    pub source_message_ids: Vec<String>,
    pub extraction_model: Option<String>,
    pub version: i64,
    pub superseded_by: Option<String>,
    pub contradicts: Vec<String>,
    pub related_to: Vec<String>,
    pub tier: Tier,
    pub status: Status,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_accessed_at: i64,
    pub expires_at: Option<i64>,
}

impl Memory {
    /// Identity, pinned, or importance ≥ 8: never demoted.
    pub fn is_protected(&self) -> bool {
        self.memory_type == MemoryType::Identity
            || self.is_pinned
            || self.importance >= crate::thresholds::PROTECTED_IMPORTANCE
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryInput {
    pub team_id: String,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub memory_type: MemoryType,
    #[serde(default)]
    pub content: String,
    pub subject: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub importance: Option<u8>,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub source_type: SourceType,
    pub source_conversation_id: Option<String>,
    #[serde(default)]
    pub source_message_ids: Vec<String>,
    pub extraction_model: Option<String>,
    /// Set when this row is a new version of a superseded one.
    pub version: Option<i64>,
    /// Initial status; only `active` and `disputed` are accepted on insert.
    pub status: Option<Status>,
    /// Explicit initial tier; defaults to the placement rule.
    pub tier: Option<Tier>,
    #[serde(default)]
    pub contradicts: Vec<String>,
    #[serde(default)]
    pub related_to: Vec<String>,
    pub expires_at: Option<i64>,
}

impl MemoryInput {
    pub fn new(team_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn memory_type(mut self, t: MemoryType) -> Self {
        self.memory_type = t;
        self
    }

    pub fn subject(mut self, s: impl Into<String>) -> Self {
        self.subject = Some(s.into());
        self
    }

    pub fn importance(mut self, i: u8) -> Self {
        self.importance = Some(i);
        self
    }

    pub fn confidence(mut self, c: f64) -> Self {
        self.confidence = Some(c);
        self
    }

    pub fn pinned(mut self) -> Self {
        self.is_pinned = true;
        self
    }

    pub fn source(mut self, s: SourceType) -> Self {
        self.source_type = s;
        self
    }

    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.source_conversation_id = Some(id.into());
        self
    }

    pub fn message_ids(mut self, ids: Vec<String>) -> Self {
        self.source_message_ids = ids;
        self
    }

    pub fn embedding(mut self, e: Vec<f32>) -> Self {
        self.embedding = Some(e);
        self
    }

    pub fn expires_at(mut self, ts: i64) -> Self {
        self.expires_at = Some(ts);
        self
    }
}

/// Who is asking: a team, an agent on it, optionally a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub team_id: String,
    pub agent_id: String,
    pub user_id: Option<String>,
}

impl Scope {
    pub fn new(team_id: impl Into<String>, agent_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self { team_id: team_id.into(), agent_id: agent_id.into(), user_id }
    }

    fn params(&self) -> Vec<(&'static str, &dyn rusqlite::ToSql)> {
        vec![
            (":team", &self.team_id as &dyn rusqlite::ToSql),
            (":agent", &self.agent_id as &dyn rusqlite::ToSql),
            (":user", &self.user_id as &dyn rusqlite::ToSql),
        ]
    }
}

/// Tenant/agent/user visibility, applied in SQL on every retrieval query.
const VISIBLE: &str = "team_id = :team \
    AND status IN ('active', 'disputed') \
    AND (memory_type IN ('shared', 'user_profile') \
         OR (agent_id = :agent AND memory_type IN ('semantic', 'episodic', 'procedural', 'agent_private', 'identity')) \
         OR (agent_id IS NULL AND memory_type IN ('semantic', 'episodic', 'procedural', 'identity'))) \
    AND (user_id IS NULL OR user_id = :user)";

#[derive(Debug, Default, Serialize)]
pub struct Stats {
    pub total: usize,
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub active: usize,
    pub disputed: usize,
    pub superseded: usize,
    pub archived: usize,
    pub missing_embedding: usize,
    pub audit_entries: usize,
}

fn subject_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_]+(\.[a-z0-9_]+)*$").unwrap_or_else(|_| unreachable!()))
}

pub fn validate_subject(subject: &str) -> Result<(), MemoryError> {
    if subject.len() > MAX_SUBJECT_LEN || !subject_re().is_match(subject) {
        return Err(MemoryError::Validation(format!(
            "malformed subject '{subject}' (expected lower-case dotted key)"
        )));
    }
    Ok(())
}

pub fn validate_importance(importance: u8) -> Result<(), MemoryError> {
    if !(1..=10).contains(&importance) {
        return Err(MemoryError::Validation(format!("importance {importance} out of range 1-10")));
    }
    Ok(())
}

pub fn validate_confidence(confidence: f64) -> Result<(), MemoryError> {
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(MemoryError::Validation(format!("confidence {confidence} out of range 0-1")));
    }
    Ok(())
}

fn validate_input(input: &MemoryInput) -> Result<(), MemoryError> {
    let content = input.content.trim();
    if content.is_empty() {
        return Err(MemoryError::EmptyContent);
    }
    if content.chars().count() > MAX_CONTENT_LEN {
        return Err(MemoryError::ContentTooLong);
    }
    if input.team_id.trim().is_empty() {
        return Err(MemoryError::Validation("team_id must not be empty".into()));
    }
    for id in [&input.agent_id, &input.user_id, &input.source_conversation_id].into_iter().flatten() {
        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(MemoryError::Validation(format!("bad identifier '{id}'")));
        }
    }
    if input.memory_type == MemoryType::AgentPrivate && input.agent_id.is_none() {
        return Err(MemoryError::Validation("agent_private memory needs an agent_id".into()));
    }
    if let Some(ref s) = input.subject {
        validate_subject(s)?;
    }
    if let Some(i) = input.importance {
        validate_importance(i)?;
    }
    if let Some(c) = input.confidence {
        validate_confidence(c)?;
    }
    if let Some(v) = input.version {
        if v < 1 {
            return Err(MemoryError::Validation(format!("version {v} must be >= 1")));
        }
    }
    if let Some(s) = input.status {
        if !matches!(s, Status::Active | Status::Disputed) {
            return Err(MemoryError::InvariantViolation(format!("cannot insert a memory as {s}")));
        }
    }
    Ok(())
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// SHA-256 over whitespace-normalized, lower-cased content.
pub fn content_hash(content: &str) -> String {
    let normalized: String = content
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    agent_id TEXT,
    user_id TEXT,
    memory_type TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    subject TEXT,
    embedding BLOB,
    importance INTEGER NOT NULL CHECK (importance BETWEEN 1 AND 10),
    confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
    access_count INTEGER NOT NULL DEFAULT 0 CHECK (access_count >= 0),
    is_pinned INTEGER NOT NULL DEFAULT 0,
    source_type TEXT NOT NULL,
    source_conversation_id TEXT,
    source_message_ids TEXT NOT NULL DEFAULT '[]',
    extraction_model TEXT,
    version INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
    superseded_by TEXT,
    contradicts TEXT NOT NULL DEFAULT '[]',
    related_to TEXT NOT NULL DEFAULT '[]',
    tier TEXT NOT NULL DEFAULT 'warm',
    status TEXT NOT NULL DEFAULT 'active',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_mem_scope ON memories(team_id, agent_id, status);
CREATE INDEX IF NOT EXISTS idx_mem_subject ON memories(team_id, subject);
CREATE INDEX IF NOT EXISTS idx_mem_conversation ON memories(source_conversation_id);
CREATE INDEX IF NOT EXISTS idx_mem_hash ON memories(team_id, content_hash);
CREATE INDEX IF NOT EXISTS idx_mem_accessed ON memories(last_accessed_at);

CREATE TRIGGER IF NOT EXISTS memories_no_delete
BEFORE DELETE ON memories
BEGIN
    SELECT RAISE(ABORT, 'memories are never physically deleted');
END;

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id TEXT NOT NULL,
    action TEXT NOT NULL,
    before_content TEXT,
    after_content TEXT,
    before_importance INTEGER,
    after_importance INTEGER,
    before_tier TEXT,
    after_tier TEXT,
    before_status TEXT,
    after_status TEXT,
    changed_by TEXT NOT NULL,
    reason TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_memory ON audit_log(memory_id, created_at);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

CREATE TABLE IF NOT EXISTS strata_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite-backed memory store.
pub struct MemoryDB {
    pool: Pool<SqliteConnectionManager>,
}

impl MemoryDB {
    fn conn(&self) -> Result<PooledConn, MemoryError> {
        self.pool.get().map_err(|e| MemoryError::Internal(format!("pool: {e}")))
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.conn().ok().and_then(|c| {
            c.query_row("SELECT value FROM strata_meta WHERE key = ?1", [key], |r| r.get(0)).ok()
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), MemoryError> {
        let c = self.conn()?;
        c.execute(
            "INSERT OR REPLACE INTO strata_meta (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Open (or create) a database at the given path.
    /// Pool size defaults to 8 (1 writer + 7 readers in WAL mode). In-memory
    /// databases use a single connection: shared-cache table locks don't honor
    /// busy_timeout, so concurrent writers would fail instead of waiting.
    pub fn open(path: &str) -> Result<Self, MemoryError> {
        let pool_size = if path == ":memory:" { 1 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each instance gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| MemoryError::Internal(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| MemoryError::Internal(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);
        Ok(Self { pool })
    }

    pub fn stats(&self, team_id: &str) -> Result<Stats, MemoryError> {
        let c = self.conn()?;
        let mut stats = Stats::default();
        let mut stmt = c.prepare(
            "SELECT tier, status, embedding IS NULL, COUNT(*) FROM memories \
             WHERE team_id = ?1 GROUP BY tier, status, embedding IS NULL",
        )?;
        let rows = stmt.query_map([team_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, bool>(2)?, r.get::<_, i64>(3)?))
        })?;
        for row in rows {
            let (tier, status, no_emb, n) = row?;
            let n = n as usize;
            stats.total += n;
            match tier.as_str() {
                "hot" => stats.hot += n,
                "warm" => stats.warm += n,
                _ => stats.cold += n,
            }
            match status.as_str() {
                "active" => stats.active += n,
                "disputed" => stats.disputed += n,
                "superseded" => stats.superseded += n,
                _ => stats.archived += n,
            }
            if no_emb {
                stats.missing_embedding += n;
            }
        }
        let audit: i64 = c.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE memory_id IN (SELECT id FROM memories WHERE team_id = ?1)",
            [team_id],
            |r| r.get(0),
        )?;
        stats.audit_entries = audit as usize;
        Ok(stats)
    }
}

/// Decode a JSON id list column. A corrupt value reads as empty so the row
/// stays loadable, but it is logged: link repair would otherwise hide it.
fn json_list(id: &str, column: &str, s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_else(|e| {
        warn!(memory_id = id, column, error = %e, "corrupt id list column, reading as empty");
        Vec::new()
    })
}

fn to_json_list(v: &[String]) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".into())
}

fn parse_col<T>(
    idx: &str,
    raw: String,
    parse: fn(&str) -> Result<T, MemoryError>,
) -> rusqlite::Result<T> {
    parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("{idx}: {e}").into(),
        )
    })
}

fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    let id: String = row.get("id")?;
    let list = |column: &str| -> rusqlite::Result<Vec<String>> {
        Ok(json_list(&id, column, &row.get::<_, String>(column)?))
    };
    let (source_message_ids, contradicts, related_to) =
        (list("source_message_ids")?, list("contradicts")?, list("related_to")?);
    Ok(Memory {
        source_message_ids,
        contradicts,
        related_to,
        id,
        team_id: row.get("team_id")?,
        agent_id: row.get("agent_id")?,
        user_id: row.get("user_id")?,
        memory_type: parse_col("memory_type", row.get("memory_type")?, MemoryType::parse)?,
        content: row.get("content")?,
        subject: row.get("subject")?,
        embedding: embedding.map(|b| crate::ai::bytes_to_embedding(&b)),
        importance: row.get("importance")?,
        confidence: row.get("confidence")?,
        access_count: row.get("access_count")?,
        is_pinned: row.get("is_pinned")?,
        source_type: parse_col("source_type", row.get("source_type")?, SourceType::parse)?,
        source_conversation_id: row.get("source_conversation_id")?,
        extraction_model: row.get("extraction_model")?,
        version: row.get("version")?,
        superseded_by: row.get("superseded_by")?,
        tier: parse_col("tier", row.get("tier")?, Tier::parse)?,
        status: parse_col("status", row.get("status")?, Status::parse)?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        last_accessed_at: row.get("last_accessed_at")?,
        expires_at: row.get("expires_at")?,
    })
}
