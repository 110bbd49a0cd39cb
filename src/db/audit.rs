//! Append-only provenance log. `memory_id` is plain data, not a foreign key,
//! so entries outlive anything that happens to the row they describe.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::*;

str_enum!(AuditAction {
    Created => "created",
    Updated => "updated",
    Superseded => "superseded",
    Promoted => "promoted",
    Demoted => "demoted",
    ContradictionDetected => "contradiction_detected",
    DuplicateSkipped => "duplicate_skipped",
    Accessed => "accessed",
    Archived => "archived",
    Pinned => "pinned",
    Unpinned => "unpinned",
    DisputeResolved => "dispute_resolved",
    Merged => "merged",
    Expired => "expired",
});

/// The audited slice of a memory row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub content: String,
    pub importance: u8,
    pub tier: Tier,
    pub status: Status,
}

impl From<&Memory> for MemorySnapshot {
    fn from(m: &Memory) -> Self {
        Self {
            content: m.content.clone(),
            importance: m.importance,
            tier: m.tier,
            status: m.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub memory_id: String,
    pub action: AuditAction,
    pub before: Option<MemorySnapshot>,
    pub after: Option<MemorySnapshot>,
    pub changed_by: String,
    pub reason: Option<String>,
    pub created_at: i64,
}

#[allow(clippy::too_many_arguments)]
pub(super) fn write_entry(
    conn: &Connection,
    memory_id: &str,
    action: AuditAction,
    before: Option<&MemorySnapshot>,
    after: Option<&MemorySnapshot>,
    changed_by: &str,
    reason: &str,
    at: i64,
) -> Result<i64, MemoryError> {
    conn.execute(
        "INSERT INTO audit_log \
         (memory_id, action, before_content, after_content, before_importance, after_importance, \
          before_tier, after_tier, before_status, after_status, changed_by, reason, created_at) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
        params![
            memory_id,
            action.as_str(),
            before.map(|s| s.content.as_str()),
            after.map(|s| s.content.as_str()),
            before.map(|s| s.importance),
            after.map(|s| s.importance),
            before.map(|s| s.tier.as_str()),
            after.map(|s| s.tier.as_str()),
            before.map(|s| s.status.as_str()),
            after.map(|s| s.status.as_str()),
            changed_by,
            if reason.is_empty() { None } else { Some(reason) },
            at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Record a mutation of `after`, snapshotting `before` when there was one.
pub(super) fn record(
    conn: &Connection,
    action: AuditAction,
    before: Option<&Memory>,
    after: &Memory,
    changed_by: &str,
    reason: &str,
) -> Result<i64, MemoryError> {
    let before = before.map(MemorySnapshot::from);
    let after_snap = MemorySnapshot::from(after);
    write_entry(
        conn,
        &after.id,
        action,
        before.as_ref(),
        Some(&after_snap),
        changed_by,
        reason,
        now_ms(),
    )
}

fn snapshot_cols(
    row: &rusqlite::Row,
    content: &str,
    importance: &str,
    tier: &str,
    status: &str,
) -> rusqlite::Result<Option<MemorySnapshot>> {
    let content: Option<String> = row.get(content)?;
    let Some(content) = content else {
        return Ok(None);
    };
    let importance: Option<u8> = row.get(importance)?;
    let tier: Option<String> = row.get(tier)?;
    let status: Option<String> = row.get(status)?;
    Ok(Some(MemorySnapshot {
        content,
        importance: importance.unwrap_or(5),
        tier: parse_col("tier", tier.unwrap_or_else(|| "warm".into()), Tier::parse)?,
        status: parse_col("status", status.unwrap_or_else(|| "active".into()), Status::parse)?,
    }))
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<AuditLogEntry> {
    Ok(AuditLogEntry {
        id: row.get("id")?,
        memory_id: row.get("memory_id")?,
        action: parse_col("action", row.get("action")?, AuditAction::parse)?,
        before: snapshot_cols(row, "before_content", "before_importance", "before_tier", "before_status")?,
        after: snapshot_cols(row, "after_content", "after_importance", "after_tier", "after_status")?,
        changed_by: row.get("changed_by")?,
        reason: row.get("reason")?,
        created_at: row.get("created_at")?,
    })
}

macro_rules! log_fns {
    ($($name:ident => $action:ident),+ $(,)?) => {
        impl MemoryDB {
            $(
                pub fn $name(
                    &self,
                    before: Option<&Memory>,
                    after: &Memory,
                    changed_by: &str,
                    reason: &str,
                ) -> Result<i64, MemoryError> {
                    self.log(AuditAction::$action, before, after, changed_by, reason)
                }
            )+
        }
    };
}

log_fns! {
    log_created => Created,
    log_updated => Updated,
    log_superseded => Superseded,
    log_promoted => Promoted,
    log_demoted => Demoted,
    log_contradiction => ContradictionDetected,
    log_duplicate_skipped => DuplicateSkipped,
    log_accessed => Accessed,
    log_archived => Archived,
    log_merged => Merged,
    log_expired => Expired,
    log_pinned => Pinned,
    log_dispute_resolved => DisputeResolved,
}

impl MemoryDB {
    /// Append one immutable entry.
    pub fn log(
        &self,
        action: AuditAction,
        before: Option<&Memory>,
        after: &Memory,
        changed_by: &str,
        reason: &str,
    ) -> Result<i64, MemoryError> {
        let conn = self.conn()?;
        record(&conn, action, before, after, changed_by, reason)
    }

    /// All entries for a memory, oldest first.
    pub fn history(&self, memory_id: &str) -> Result<Vec<AuditLogEntry>, MemoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM audit_log WHERE memory_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![memory_id], row_to_entry)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// State of a memory as of `timestamp`: the "after" snapshot of the latest
    /// entry written at or before it. `None` if the memory did not exist yet.
    pub fn reconstruct_at(
        &self,
        memory_id: &str,
        timestamp: i64,
    ) -> Result<Option<MemorySnapshot>, MemoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM audit_log \
             WHERE memory_id = ?1 AND created_at <= ?2 AND after_content IS NOT NULL \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![memory_id, timestamp])?;
        match rows.next()? {
            Some(row) => Ok(row_to_entry(row)?.after),
            None => Ok(None),
        }
    }

    pub fn audit_count(&self, memory_id: &str, action: AuditAction) -> Result<usize, MemoryError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE memory_id = ?1 AND action = ?2",
            params![memory_id, action.as_str()],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }
}
