use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::ai::cosine_similarity;
use crate::db::{Memory, MemoryDB, MemoryType, Status};
use crate::error::MemoryError;

use super::{load_scope, CHANGED_BY};

/// Strength order for picking the survivor: importance, then accesses,
/// then the older row.
fn strength(m: &Memory) -> (u8, i64, Reverse<i64>) {
    (m.importance, m.access_count, Reverse(m.created_at))
}

/// `(survivor, absorbed)` for a near-duplicate pair.
fn pick_survivor<'a>(a: &'a Memory, b: &'a Memory) -> (&'a Memory, &'a Memory) {
    match strength(a).cmp(&strength(b)).then_with(|| b.id.cmp(&a.id)) {
        std::cmp::Ordering::Less => (b, a),
        _ => (a, b),
    }
}

/// Fold active near-duplicates (same type and user, cosine above `threshold`,
/// neither protected) into the stronger row. Returns how many rows were absorbed.
pub(super) fn merge_near_duplicates(
    db: &MemoryDB,
    team_id: &str,
    agent_id: Option<&str>,
    threshold: f64,
) -> Result<usize, MemoryError> {
    let rows: Vec<Memory> = load_scope(db, team_id, agent_id)?
        .into_iter()
        .filter(|m| m.status == Status::Active && m.embedding.is_some() && !m.is_protected())
        .collect();

    let mut groups: HashMap<(MemoryType, Option<String>), Vec<Memory>> = HashMap::new();
    for m in rows {
        groups.entry((m.memory_type, m.user_id.clone())).or_default().push(m);
    }

    let mut merged = 0;
    for (_, mut group) in groups {
        if group.len() < 2 {
            continue;
        }
        let mut gone: HashSet<String> = HashSet::new();
        for i in 0..group.len() {
            if gone.contains(&group[i].id) {
                continue;
            }
            for j in (i + 1)..group.len() {
                if gone.contains(&group[j].id) || gone.contains(&group[i].id) {
                    continue;
                }
                let (Some(ea), Some(eb)) = (group[i].embedding.as_deref(), group[j].embedding.as_deref()) else {
                    continue;
                };
                let sim = cosine_similarity(ea, eb);
                if sim <= threshold {
                    continue;
                }
                let (survivor, absorbed) = pick_survivor(&group[i], &group[j]);
                let (survivor_id, absorbed_id) = (survivor.id.clone(), absorbed.id.clone());
                let reason = format!("near duplicate (similarity {sim:.3})");
                let (kept, _) = db.merge_into(&survivor_id, &absorbed_id, CHANGED_BY, &reason)?;
                debug!(survivor = %survivor_id, absorbed = %absorbed_id, sim, "merged near duplicate");
                gone.insert(absorbed_id);
                let idx = if survivor_id == group[i].id { i } else { j };
                group[idx] = kept;
                merged += 1;
            }
        }
    }
    if merged > 0 {
        info!(team_id, agent_id = agent_id.unwrap_or("-"), merged, "near duplicates merged");
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AuditAction, MemoryInput};

    fn seed(db: &MemoryDB, content: &str, importance: u8, emb: Vec<f32>) -> Memory {
        db.insert(
            MemoryInput::new("t1", content).agent("a1").importance(importance).embedding(emb),
            "test",
            "",
        )
        .unwrap()
    }

    #[test]
    fn weaker_row_is_archived_into_survivor() {
        let db = MemoryDB::open(":memory:").unwrap();
        let strong = seed(&db, "User likes hiking in the Alps", 6, vec![1.0, 0.0, 0.01]);
        let weak = seed(&db, "User enjoys hiking in the Alps", 3, vec![1.0, 0.0, 0.0]);
        let other = seed(&db, "User owns a cat", 3, vec![0.0, 1.0, 0.0]);

        let n = merge_near_duplicates(&db, "t1", Some("a1"), 0.95).unwrap();
        assert_eq!(n, 1);

        let weak = db.get(&weak.id).unwrap().unwrap();
        assert_eq!(weak.status, Status::Archived);
        assert_eq!(weak.superseded_by.as_deref(), Some(strong.id.as_str()));
        let strong = db.get(&strong.id).unwrap().unwrap();
        assert_eq!(strong.status, Status::Active);
        assert!(strong.related_to.contains(&weak.id));
        assert_eq!(db.get(&other.id).unwrap().unwrap().status, Status::Active);
        assert_eq!(db.audit_count(&weak.id, AuditAction::Merged).unwrap(), 1);
    }

    #[test]
    fn protected_rows_are_never_merged() {
        let db = MemoryDB::open(":memory:").unwrap();
        seed(&db, "User's name is Ada", 9, vec![1.0, 0.0]);
        seed(&db, "User is called Ada", 3, vec![1.0, 0.0]);
        assert_eq!(merge_near_duplicates(&db, "t1", Some("a1"), 0.95).unwrap(), 0);
    }

    #[test]
    fn ties_keep_the_older_row() {
        let db = MemoryDB::open(":memory:").unwrap();
        let mut a = seed(&db, "User likes tea", 5, vec![1.0]);
        a.created_at = 1;
        let mut b = a.clone();
        b.id = "b".into();
        b.created_at = 2;
        let (s, g) = pick_survivor(&b, &a);
        assert_eq!(s.id, a.id);
        assert_eq!(g.id, "b");
    }
}
