//! Scoped read queries: the retrieval signals, duplicate lookups, and the
//! candidate sets for contradiction checks and background jobs.

use rusqlite::{Connection, ToSql};

use super::*;
use crate::ai::cosine_similarity;

type NamedParams<'a> = Vec<(&'a str, &'a dyn ToSql)>;

fn query_memories(
    conn: &Connection,
    sql: &str,
    params: &[(&str, &dyn ToSql)],
) -> Result<Vec<Memory>, MemoryError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_memory)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Rank rows with embeddings by cosine against `query`, keeping those above `min_sim`.
fn rank_by_similarity(rows: Vec<Memory>, query: &[f32], min_sim: f64, limit: usize) -> Vec<(Memory, f64)> {
    let mut scored: Vec<(Memory, f64)> = rows
        .into_iter()
        .filter_map(|m| {
            let sim = m.embedding.as_deref().map(|e| cosine_similarity(e, query))?;
            (sim > min_sim).then_some((m, sim))
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
    scored.truncate(limit);
    scored
}

/// Rows a new fact from this owner would sit next to: same team, and the
/// same or no agent and user.
const NEIGHBORHOOD: &str = "team_id = :team \
    AND (agent_id IS :agent OR agent_id IS NULL) \
    AND (user_id IS :user OR user_id IS NULL) \
    AND status IN ('active', 'disputed')";

/// Live rows stored under exactly this owner. Superseded and archived rows
/// never count as duplicates, so a retired fact can be asserted again.
const OWNED_LIVE: &str = "team_id = :team AND agent_id IS :agent AND user_id IS :user \
    AND status IN ('active', 'disputed')";

impl MemoryDB {
    /// Semantic signal: visible rows ranked by cosine to the query vector.
    pub fn search_semantic(
        &self,
        scope: &Scope,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(Memory, f64)>, MemoryError> {
        let conn = self.conn()?;
        let sql = format!("SELECT * FROM memories WHERE {VISIBLE} AND embedding IS NOT NULL");
        let rows = query_memories(&conn, &sql, &scope.params())?;
        Ok(rank_by_similarity(rows, query, 0.0, limit))
    }

    /// Recency signal: most recently accessed visible rows.
    pub fn recent(&self, scope: &Scope, limit: usize) -> Result<Vec<Memory>, MemoryError> {
        let conn = self.conn()?;
        let limit = limit as i64;
        let mut params: NamedParams = scope.params();
        params.push((":limit", &limit));
        let sql = format!(
            "SELECT * FROM memories WHERE {VISIBLE} \
             ORDER BY last_accessed_at DESC, id ASC LIMIT :limit"
        );
        query_memories(&conn, &sql, &params)
    }

    /// Importance signal: every visible identity row plus the top pinned /
    /// high-importance rows.
    pub fn important(&self, scope: &Scope, limit: usize) -> Result<Vec<Memory>, MemoryError> {
        let conn = self.conn()?;
        let identity_sql =
            format!("SELECT * FROM memories WHERE {VISIBLE} AND memory_type = 'identity'");
        let mut out = query_memories(&conn, &identity_sql, &scope.params())?;

        let limit = limit as i64;
        let mut params: NamedParams = scope.params();
        params.push((":limit", &limit));
        let top_sql = format!(
            "SELECT * FROM memories WHERE {VISIBLE} AND memory_type != 'identity' \
             ORDER BY is_pinned DESC, importance DESC, created_at DESC LIMIT :limit"
        );
        out.extend(query_memories(&conn, &top_sql, &params)?);
        Ok(out)
    }

    /// Continuity signal: rows from the current conversation or created
    /// since the session started.
    pub fn continuity(
        &self,
        scope: &Scope,
        conversation_id: Option<&str>,
        session_started_at: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Memory>, MemoryError> {
        if conversation_id.is_none() && session_started_at.is_none() {
            return Ok(vec![]);
        }
        let conn = self.conn()?;
        let limit = limit as i64;
        let mut params: NamedParams = scope.params();
        params.push((":conv", &conversation_id));
        params.push((":since", &session_started_at));
        params.push((":limit", &limit));
        let sql = format!(
            "SELECT * FROM memories WHERE {VISIBLE} \
             AND (source_conversation_id = :conv OR created_at >= :since) \
             ORDER BY created_at DESC, id ASC LIMIT :limit"
        );
        query_memories(&conn, &sql, &params)
    }

    /// Visible rows among `ids`, for relationship hops.
    pub fn visible_by_ids(
        &self,
        scope: &Scope,
        ids: &[String],
        limit: usize,
    ) -> Result<Vec<Memory>, MemoryError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.conn()?;
        let ids_json = to_json_list(ids);
        let limit = limit as i64;
        let mut params: NamedParams = scope.params();
        params.push((":ids", &ids_json));
        params.push((":limit", &limit));
        let sql = format!(
            "SELECT * FROM memories WHERE {VISIBLE} \
             AND id IN (SELECT value FROM json_each(:ids)) \
             ORDER BY importance DESC, id ASC LIMIT :limit"
        );
        query_memories(&conn, &sql, &params)
    }

    /// Exact live duplicate under the same owner.
    pub fn find_by_hash(
        &self,
        team_id: &str,
        agent_id: Option<&str>,
        user_id: Option<&str>,
        content: &str,
    ) -> Result<Option<Memory>, MemoryError> {
        let conn = self.conn()?;
        let hash = content_hash(content);
        let params = rusqlite::named_params! {
            ":team": team_id,
            ":agent": agent_id,
            ":user": user_id,
            ":hash": hash,
        };
        let sql = format!(
            "SELECT * FROM memories WHERE {OWNED_LIVE} AND content_hash = :hash \
             ORDER BY created_at ASC LIMIT 1"
        );
        Ok(query_memories(&conn, &sql, &params)?.into_iter().next())
    }

    /// Most similar live row under the same owner above `threshold`.
    pub fn find_similar(
        &self,
        team_id: &str,
        agent_id: Option<&str>,
        user_id: Option<&str>,
        embedding: &[f32],
        threshold: f64,
    ) -> Result<Option<(Memory, f64)>, MemoryError> {
        let conn = self.conn()?;
        let params = rusqlite::named_params! { ":team": team_id, ":agent": agent_id, ":user": user_id };
        let sql = format!("SELECT * FROM memories WHERE {OWNED_LIVE} AND embedding IS NOT NULL");
        let rows = query_memories(&conn, &sql, &params)?;
        Ok(rank_by_similarity(rows, embedding, threshold, 1).into_iter().next())
    }

    /// Live rows sharing `subject` that a new fact from this owner could conflict with.
    pub fn list_same_subject(
        &self,
        team_id: &str,
        agent_id: Option<&str>,
        user_id: Option<&str>,
        subject: &str,
    ) -> Result<Vec<Memory>, MemoryError> {
        let conn = self.conn()?;
        let params = rusqlite::named_params! {
            ":team": team_id,
            ":agent": agent_id,
            ":user": user_id,
            ":subject": subject,
        };
        let sql = format!(
            "SELECT * FROM memories WHERE {NEIGHBORHOOD} AND subject = :subject \
             ORDER BY created_at ASC"
        );
        query_memories(&conn, &sql, &params)
    }

    /// Live rows semantically close to `embedding` that a new fact could conflict with.
    pub fn list_neighbors(
        &self,
        team_id: &str,
        agent_id: Option<&str>,
        user_id: Option<&str>,
        embedding: &[f32],
        min_sim: f64,
        limit: usize,
    ) -> Result<Vec<(Memory, f64)>, MemoryError> {
        let conn = self.conn()?;
        let params = rusqlite::named_params! { ":team": team_id, ":agent": agent_id, ":user": user_id };
        let sql = format!("SELECT * FROM memories WHERE {NEIGHBORHOOD} AND embedding IS NOT NULL");
        let rows = query_memories(&conn, &sql, &params)?;
        Ok(rank_by_similarity(rows, embedding, min_sim, limit))
    }

    /// Every row owned by `(team, agent)` regardless of user and status,
    /// paged by creation order. Background jobs walk scopes with this.
    pub fn list_scope(
        &self,
        team_id: &str,
        agent_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Memory>, MemoryError> {
        let conn = self.conn()?;
        let (limit, offset) = (limit as i64, offset as i64);
        let params = rusqlite::named_params! {
            ":team": team_id,
            ":agent": agent_id,
            ":limit": limit,
            ":offset": offset,
        };
        query_memories(
            &conn,
            "SELECT * FROM memories WHERE team_id = :team AND agent_id IS :agent \
             ORDER BY created_at ASC, id ASC LIMIT :limit OFFSET :offset",
            &params,
        )
    }

    /// Distinct `(team, agent)` scopes with at least one row.
    pub fn list_scopes(&self) -> Result<Vec<(String, Option<String>)>, MemoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT team_id, agent_id FROM memories ORDER BY team_id, agent_id",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
