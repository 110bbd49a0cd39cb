//! Memory CRUD. Every mutation writes its audit entry in the same transaction.

use rusqlite::{params, Connection};
use uuid::Uuid;

use super::audit::record;
use super::*;

fn load(conn: &Connection, id: &str) -> Result<Option<Memory>, MemoryError> {
    let mut stmt = conn.prepare("SELECT * FROM memories WHERE id = ?1")?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_memory(row)?)),
        None => Ok(None),
    }
}

fn load_required(conn: &Connection, id: &str) -> Result<Memory, MemoryError> {
    load(conn, id)?.ok_or_else(|| MemoryError::NotFound(id.to_string()))
}

fn write_back(conn: &Connection, m: &Memory) -> Result<(), MemoryError> {
    conn.execute(
        "UPDATE memories SET content = ?2, content_hash = ?3, subject = ?4, embedding = ?5, \
         importance = ?6, confidence = ?7, is_pinned = ?8, version = ?9, superseded_by = ?10, \
         contradicts = ?11, related_to = ?12, tier = ?13, status = ?14, updated_at = ?15, \
         expires_at = ?16 WHERE id = ?1",
        params![
            m.id,
            m.content,
            content_hash(&m.content),
            m.subject,
            m.embedding.as_deref().map(crate::ai::embedding_to_bytes),
            m.importance,
            m.confidence,
            m.is_pinned,
            m.version,
            m.superseded_by,
            to_json_list(&m.contradicts),
            to_json_list(&m.related_to),
            m.tier.as_str(),
            m.status.as_str(),
            m.updated_at,
            m.expires_at,
        ],
    )?;
    Ok(())
}

fn insert_row(conn: &Connection, m: &Memory) -> Result<usize, MemoryError> {
    Ok(conn.execute(
        "INSERT INTO memories \
         (id, team_id, agent_id, user_id, memory_type, content, content_hash, subject, embedding, \
          importance, confidence, access_count, is_pinned, source_type, source_conversation_id, \
          source_message_ids, extraction_model, version, superseded_by, contradicts, related_to, \
          tier, status, created_at, updated_at, last_accessed_at, expires_at) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27) \
         ON CONFLICT(id) DO NOTHING",
        params![
            m.id,
            m.team_id,
            m.agent_id,
            m.user_id,
            m.memory_type.as_str(),
            m.content,
            content_hash(&m.content),
            m.subject,
            m.embedding.as_deref().map(crate::ai::embedding_to_bytes),
            m.importance,
            m.confidence,
            m.access_count,
            m.is_pinned,
            m.source_type.as_str(),
            m.source_conversation_id,
            to_json_list(&m.source_message_ids),
            m.extraction_model,
            m.version,
            m.superseded_by,
            to_json_list(&m.contradicts),
            to_json_list(&m.related_to),
            m.tier.as_str(),
            m.status.as_str(),
            m.created_at,
            m.updated_at,
            m.last_accessed_at,
            m.expires_at,
        ],
    )?)
}

fn build(input: MemoryInput, now: i64) -> Memory {
    let importance = input.importance.unwrap_or(5);
    let tier = input
        .tier
        .unwrap_or_else(|| crate::tiers::initial_tier(importance, input.is_pinned));
    Memory {
        id: Uuid::new_v4().to_string(),
        team_id: input.team_id,
        agent_id: input.agent_id,
        user_id: input.user_id,
        memory_type: input.memory_type,
        content: input.content.trim().to_string(),
        subject: input.subject,
        embedding: input.embedding,
        importance,
        confidence: input.confidence.unwrap_or(0.8),
        access_count: 0,
        is_pinned: input.is_pinned,
        source_type: input.source_type,
        source_conversation_id: input.source_conversation_id,
        source_message_ids: input.source_message_ids,
        extraction_model: input.extraction_model,
        version: input.version.unwrap_or(1),
        superseded_by: None,
        contradicts: input.contradicts,
        related_to: input.related_to,
        tier,
        status: input.status.unwrap_or(Status::Active),
        created_at: now,
        updated_at: now,
        last_accessed_at: now,
        expires_at: input.expires_at,
    }
}

fn check_transition(m: &Memory, to: Status) -> Result<(), MemoryError> {
    if !m.status.can_transition_to(to) {
        return Err(MemoryError::InvariantViolation(format!(
            "memory {} cannot move from {} to {}",
            m.id, m.status, to
        )));
    }
    Ok(())
}

fn push_unique(list: &mut Vec<String>, id: &str) -> bool {
    if list.iter().any(|x| x == id) {
        false
    } else {
        list.push(id.to_string());
        true
    }
}

fn remove_id(list: &mut Vec<String>, id: &str) -> bool {
    let before = list.len();
    list.retain(|x| x != id);
    list.len() != before
}

impl MemoryDB {
    /// Run `f` inside one write transaction.
    fn in_tx<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(v) => {
                conn.execute_batch("COMMIT")?;
                Ok(v)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Load, mutate and write back one row. `f` returns whether anything
    /// changed; unchanged rows are neither written nor audited.
    fn mutate(
        &self,
        id: &str,
        action: AuditAction,
        changed_by: &str,
        reason: &str,
        f: impl FnOnce(&mut Memory) -> Result<bool, MemoryError>,
    ) -> Result<Memory, MemoryError> {
        self.in_tx(|conn| {
            let before = load_required(conn, id)?;
            let mut after = before.clone();
            if !f(&mut after)? {
                return Ok(before);
            }
            after.updated_at = now_ms().max(before.updated_at);
            write_back(conn, &after)?;
            record(conn, action, Some(&before), &after, changed_by, reason)?;
            Ok(after)
        })
    }

    pub fn insert(
        &self,
        input: MemoryInput,
        changed_by: &str,
        reason: &str,
    ) -> Result<Memory, MemoryError> {
        validate_input(&input)?;
        let mem = build(input, now_ms());
        self.in_tx(|conn| {
            insert_row(conn, &mem)?;
            record(conn, AuditAction::Created, None, &mem, changed_by, reason)?;
            Ok(())
        })?;
        Ok(mem)
    }

    /// Insert `input` as the next version of `old_ids`, superseding each of them.
    /// The new row's version is one past the highest superseded version.
    pub fn insert_version(
        &self,
        mut input: MemoryInput,
        old_ids: &[String],
        changed_by: &str,
        reason: &str,
    ) -> Result<(Memory, Vec<Memory>), MemoryError> {
        validate_input(&input)?;
        self.in_tx(|conn| {
            let olds = old_ids
                .iter()
                .map(|id| load_required(conn, id))
                .collect::<Result<Vec<_>, _>>()?;
            for old in &olds {
                check_transition(old, Status::Superseded)?;
            }
            let max_version = olds.iter().map(|m| m.version).max().unwrap_or(0);
            input.version = Some(input.version.unwrap_or(1).max(max_version + 1));
            let mem = build(input, now_ms());
            insert_row(conn, &mem)?;
            record(conn, AuditAction::Created, None, &mem, changed_by, reason)?;

            let mut superseded = Vec::with_capacity(olds.len());
            for before in olds {
                let mut after = before.clone();
                after.status = Status::Superseded;
                after.superseded_by = Some(mem.id.clone());
                after.updated_at = mem.created_at.max(before.updated_at);
                write_back(conn, &after)?;
                record(conn, AuditAction::Superseded, Some(&before), &after, changed_by, reason)?;
                superseded.push(after);
            }
            Ok((mem, superseded))
        })
    }

    /// Insert rows as-is (migrations, fixtures). Existing ids are left
    /// untouched. Each new row gets a `created` entry dated at its creation.
    pub fn import(&self, memories: &[Memory], changed_by: &str) -> Result<usize, MemoryError> {
        self.in_tx(|conn| {
            let mut imported = 0;
            for m in memories {
                if insert_row(conn, m)? == 0 {
                    continue;
                }
                let snap = MemorySnapshot::from(m);
                super::audit::write_entry(
                    conn,
                    &m.id,
                    AuditAction::Created,
                    None,
                    Some(&snap),
                    changed_by,
                    "imported",
                    m.created_at,
                )?;
                imported += 1;
            }
            Ok(imported)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Memory>, MemoryError> {
        let conn = self.conn()?;
        load(&conn, id)
    }

    pub fn get_many(&self, ids: &[String]) -> Result<Vec<Memory>, MemoryError> {
        let conn = self.conn()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(m) = load(&conn, id)? {
                out.push(m);
            }
        }
        Ok(out)
    }

    /// Memories are never physically removed; use `archive` instead.
    pub fn delete(&self, id: &str) -> Result<(), MemoryError> {
        Err(MemoryError::InvariantViolation(format!(
            "refusing to delete memory {id}: rows are archived, never deleted"
        )))
    }

    /// Move a row to `to`, refusing illegal transitions. Re-applying the
    /// current status is a no-op.
    pub fn set_status(
        &self,
        id: &str,
        to: Status,
        action: AuditAction,
        changed_by: &str,
        reason: &str,
    ) -> Result<Memory, MemoryError> {
        self.mutate(id, action, changed_by, reason, |m| {
            check_transition(m, to)?;
            if m.status == to {
                return Ok(false);
            }
            m.status = to;
            Ok(true)
        })
    }

    /// Archive a row, optionally pointing at the row that replaces it.
    pub fn archive(
        &self,
        id: &str,
        replaced_by: Option<&str>,
        action: AuditAction,
        changed_by: &str,
        reason: &str,
    ) -> Result<Memory, MemoryError> {
        self.mutate(id, action, changed_by, reason, |m| {
            check_transition(m, Status::Archived)?;
            if m.status == Status::Archived {
                return Ok(false);
            }
            m.status = Status::Archived;
            if let Some(r) = replaced_by {
                m.superseded_by = Some(r.to_string());
            }
            Ok(true)
        })
    }

    /// Mark two rows as contradicting each other: both disputed, linked both ways.
    pub fn mark_disputed(
        &self,
        a: &str,
        b: &str,
        changed_by: &str,
        reason: &str,
    ) -> Result<(Memory, Memory), MemoryError> {
        if a == b {
            return Err(MemoryError::Validation("a memory cannot contradict itself".into()));
        }
        self.in_tx(|conn| {
            let ba = load_required(conn, a)?;
            let bb = load_required(conn, b)?;
            check_transition(&ba, Status::Disputed)?;
            check_transition(&bb, Status::Disputed)?;
            let now = now_ms();
            let mut pair = Vec::with_capacity(2);
            for (before, other) in [(ba, b), (bb, a)] {
                let mut after = before.clone();
                after.status = Status::Disputed;
                push_unique(&mut after.contradicts, other);
                after.updated_at = now.max(before.updated_at);
                write_back(conn, &after)?;
                record(
                    conn,
                    AuditAction::ContradictionDetected,
                    Some(&before),
                    &after,
                    changed_by,
                    reason,
                )?;
                pair.push(after);
            }
            let second = pair.pop().ok_or_else(|| MemoryError::Internal("dispute pair".into()))?;
            let first = pair.pop().ok_or_else(|| MemoryError::Internal("dispute pair".into()))?;
            Ok((first, second))
        })
    }

    /// Settle a dispute in favour of `keep`: `drop` becomes superseded by it
    /// and the link between them is removed from both sides. `keep` returns to
    /// active once it contradicts nothing else.
    pub fn resolve_dispute(
        &self,
        keep: &str,
        drop: &str,
        changed_by: &str,
        reason: &str,
    ) -> Result<(Memory, Memory), MemoryError> {
        self.in_tx(|conn| {
            let bk = load_required(conn, keep)?;
            let bd = load_required(conn, drop)?;
            if !bk.contradicts.iter().any(|x| x == drop) && !bd.contradicts.iter().any(|x| x == keep) {
                return Err(MemoryError::Validation(format!(
                    "{keep} and {drop} are not in dispute with each other"
                )));
            }
            check_transition(&bd, Status::Superseded)?;
            let now = now_ms();

            let mut kept = bk.clone();
            remove_id(&mut kept.contradicts, drop);
            if kept.status == Status::Disputed && kept.contradicts.is_empty() {
                kept.status = Status::Active;
            }
            kept.updated_at = now.max(bk.updated_at);
            write_back(conn, &kept)?;
            record(conn, AuditAction::DisputeResolved, Some(&bk), &kept, changed_by, reason)?;

            let mut dropped = bd.clone();
            remove_id(&mut dropped.contradicts, keep);
            dropped.status = Status::Superseded;
            dropped.superseded_by = Some(keep.to_string());
            dropped.updated_at = now.max(bd.updated_at);
            write_back(conn, &dropped)?;
            record(conn, AuditAction::DisputeResolved, Some(&bd), &dropped, changed_by, reason)?;
            Ok((kept, dropped))
        })
    }

    /// Move a row to another tier. Demoting a protected memory is refused.
    /// Returns `None` when the row is already in `to`.
    pub fn set_tier(
        &self,
        id: &str,
        to: Tier,
        changed_by: &str,
        reason: &str,
    ) -> Result<Option<Memory>, MemoryError> {
        let current = self.get(id)?.ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        if current.tier == to {
            return Ok(None);
        }
        let action = if to.is_above(current.tier) {
            AuditAction::Promoted
        } else {
            AuditAction::Demoted
        };
        let after = self.mutate(id, action, changed_by, reason, |m| {
            if m.tier == to {
                return Ok(false);
            }
            if action == AuditAction::Demoted && m.is_protected() {
                return Err(MemoryError::InvariantViolation(format!(
                    "memory {} is protected from demotion",
                    m.id
                )));
            }
            m.tier = to;
            Ok(true)
        })?;
        Ok(Some(after))
    }

    pub fn set_pinned(
        &self,
        id: &str,
        pinned: bool,
        changed_by: &str,
        reason: &str,
    ) -> Result<Memory, MemoryError> {
        let action = if pinned { AuditAction::Pinned } else { AuditAction::Unpinned };
        self.mutate(id, action, changed_by, reason, |m| {
            if m.is_pinned == pinned {
                return Ok(false);
            }
            m.is_pinned = pinned;
            Ok(true)
        })
    }

    pub fn set_confidence(
        &self,
        id: &str,
        confidence: f64,
        changed_by: &str,
        reason: &str,
    ) -> Result<Memory, MemoryError> {
        validate_confidence(confidence)?;
        self.mutate(id, AuditAction::Updated, changed_by, reason, |m| {
            if (m.confidence - confidence).abs() < f64::EPSILON {
                return Ok(false);
            }
            m.confidence = confidence;
            Ok(true)
        })
    }

    pub fn set_embedding(
        &self,
        id: &str,
        embedding: Vec<f32>,
        changed_by: &str,
    ) -> Result<Memory, MemoryError> {
        self.mutate(id, AuditAction::Updated, changed_by, "embedding backfilled", |m| {
            m.embedding = Some(embedding);
            Ok(true)
        })
    }

    /// Replace a row's link sets. Used by link repair.
    pub fn set_links(
        &self,
        id: &str,
        contradicts: Vec<String>,
        related_to: Vec<String>,
        changed_by: &str,
        reason: &str,
    ) -> Result<Memory, MemoryError> {
        self.mutate(id, AuditAction::Updated, changed_by, reason, |m| {
            if m.contradicts == contradicts && m.related_to == related_to {
                return Ok(false);
            }
            m.contradicts = contradicts;
            m.related_to = related_to;
            if m.status == Status::Disputed && m.contradicts.is_empty() {
                m.status = Status::Active;
            }
            Ok(true)
        })
    }

    /// Fold `absorbed` into `survivor`: the absorbed row is archived and points
    /// at the survivor, which keeps the higher importance and links back.
    pub fn merge_into(
        &self,
        survivor: &str,
        absorbed: &str,
        changed_by: &str,
        reason: &str,
    ) -> Result<(Memory, Memory), MemoryError> {
        self.in_tx(|conn| {
            let bs = load_required(conn, survivor)?;
            let ba = load_required(conn, absorbed)?;
            check_transition(&ba, Status::Archived)?;
            let now = now_ms();

            let mut gone = ba.clone();
            gone.status = Status::Archived;
            gone.superseded_by = Some(survivor.to_string());
            push_unique(&mut gone.related_to, survivor);
            gone.updated_at = now.max(ba.updated_at);
            write_back(conn, &gone)?;
            record(conn, AuditAction::Merged, Some(&ba), &gone, changed_by, reason)?;

            let mut kept = bs.clone();
            kept.importance = kept.importance.max(ba.importance);
            push_unique(&mut kept.related_to, absorbed);
            kept.updated_at = now.max(bs.updated_at);
            write_back(conn, &kept)?;
            record(conn, AuditAction::Merged, Some(&bs), &kept, changed_by, reason)?;
            Ok((kept, gone))
        })
    }

    /// Store a roll-up of `source_ids` and archive every source into it.
    /// All or nothing: a source that can no longer be archived aborts the
    /// whole roll-up.
    pub fn insert_summary(
        &self,
        mut input: MemoryInput,
        source_ids: &[String],
        changed_by: &str,
        reason: &str,
    ) -> Result<Memory, MemoryError> {
        for id in source_ids {
            push_unique(&mut input.related_to, id);
        }
        validate_input(&input)?;
        let summary = build(input, now_ms());
        self.in_tx(|conn| {
            insert_row(conn, &summary)?;
            record(conn, AuditAction::Created, None, &summary, changed_by, reason)?;
            for id in source_ids {
                let before = load_required(conn, id)?;
                check_transition(&before, Status::Archived)?;
                let mut after = before.clone();
                after.status = Status::Archived;
                after.superseded_by = Some(summary.id.clone());
                push_unique(&mut after.related_to, &summary.id);
                after.updated_at = summary.created_at.max(before.updated_at);
                write_back(conn, &after)?;
                record(conn, AuditAction::Archived, Some(&before), &after, changed_by, reason)?;
            }
            Ok(())
        })?;
        Ok(summary)
    }

    /// Link two rows through `related_to`, both ways.
    pub fn link_related(
        &self,
        a: &str,
        b: &str,
        changed_by: &str,
        reason: &str,
    ) -> Result<(), MemoryError> {
        self.in_tx(|conn| {
            let now = now_ms();
            for (id, other) in [(a, b), (b, a)] {
                let before = load_required(conn, id)?;
                let mut after = before.clone();
                if !push_unique(&mut after.related_to, other) {
                    continue;
                }
                after.updated_at = now.max(before.updated_at);
                write_back(conn, &after)?;
                record(conn, AuditAction::Updated, Some(&before), &after, changed_by, reason)?;
            }
            Ok(())
        })
    }

    /// Record accesses. Idempotent under retry: the count increments and the
    /// access time only moves forward.
    pub fn touch_many(
        &self,
        ids: &[String],
        at: i64,
        changed_by: &str,
    ) -> Result<Vec<Memory>, MemoryError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        self.in_tx(|conn| {
            let mut touched = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(before) = load(conn, id)? else {
                    continue;
                };
                conn.execute(
                    "UPDATE memories SET access_count = access_count + 1, \
                     last_accessed_at = MAX(last_accessed_at, ?2) WHERE id = ?1",
                    params![id, at],
                )?;
                let after = load_required(conn, id)?;
                record(conn, AuditAction::Accessed, Some(&before), &after, changed_by, "")?;
                touched.push(after);
            }
            Ok(touched)
        })
    }
}
