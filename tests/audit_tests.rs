mod common;

use common::*;
use strata::db::*;
use strata::MemoryError;

fn actions(entries: &[AuditLogEntry]) -> Vec<AuditAction> {
    entries.iter().map(|e| e.action).collect()
}

#[tokio::test]
async fn history_follows_every_change() {
    let h = harness();
    let outcome = h
        .engine
        .remember(MemoryInput::new("t1", "User's standup is at 9:30").agent("a1").importance(5), false)
        .await
        .unwrap();
    let id = outcome.memory_id().to_string();
    h.engine.pin(&id).await.unwrap();
    h.engine.record_feedback(&id, -0.5).await.unwrap();

    let history = h.engine.history(&id).await.unwrap();
    assert_eq!(
        actions(&history),
        vec![AuditAction::Created, AuditAction::Pinned, AuditAction::Promoted, AuditAction::Updated]
    );
    let created = &history[0];
    assert!(created.before.is_none());
    assert_eq!(created.changed_by, "remember");
    let promoted = &history[2];
    assert_eq!(promoted.before.as_ref().unwrap().tier, Tier::Warm);
    assert_eq!(promoted.after.as_ref().unwrap().tier, Tier::Hot);
    assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[tokio::test]
async fn state_can_be_reconstructed_at_any_time() {
    let h = harness();
    let t0 = now_ms() - 3 * DAY;
    let m = memory("m1", MemoryType::Semantic, "User's team uses Linear", 5, t0);
    h.db.import(&[m], "fixture").unwrap();
    h.engine.pin("m1").await.unwrap();

    assert!(h.engine.reconstruct_at("m1", t0 - 1).await.unwrap().is_none());
    let then = h.engine.reconstruct_at("m1", t0 + 1).await.unwrap().unwrap();
    assert_eq!(then.tier, Tier::Warm);
    assert_eq!(then.status, Status::Active);
    assert_eq!(then.content, "User's team uses Linear");
    let now = h.engine.reconstruct_at("m1", now_ms() + 1000).await.unwrap().unwrap();
    assert_eq!(now.tier, Tier::Hot);
    assert!(h.engine.reconstruct_at("unknown", now_ms()).await.unwrap().is_none());
}

#[tokio::test]
async fn supersede_is_audited_with_both_snapshots() {
    let h = harness();
    let old = seed(&h.db, MemoryInput::new("t1", "User drives a Civic").agent("a1").subject("user.car"));
    let (new, _) = h
        .db
        .insert_version(
            MemoryInput::new("t1", "User now drives a Model 3").agent("a1").subject("user.car"),
            &[old.id.clone()],
            "test",
            "new car",
        )
        .unwrap();

    let history = h.engine.history(&old.id).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.action, AuditAction::Superseded);
    assert_eq!(last.before.as_ref().unwrap().status, Status::Active);
    assert_eq!(last.after.as_ref().unwrap().status, Status::Superseded);
    assert_eq!(last.reason.as_deref(), Some("new car"));
    assert_eq!(h.db.audit_count(&new.id, AuditAction::Created).unwrap(), 1);
}

#[tokio::test]
async fn skipped_duplicates_are_logged_on_the_existing_row() {
    let h = harness();
    let first = h
        .engine
        .remember(MemoryInput::new("t1", "User speaks Portuguese").agent("a1"), false)
        .await
        .unwrap();
    h.engine
        .remember(MemoryInput::new("t1", "User speaks  PORTUGUESE").agent("a1"), false)
        .await
        .unwrap();

    let history = h.engine.history(first.memory_id()).await.unwrap();
    let skip = history.iter().find(|e| e.action == AuditAction::DuplicateSkipped).unwrap();
    assert!(skip.reason.as_deref().unwrap_or("").contains("similarity"));
    assert_eq!(h.engine.stats("t1").await.unwrap().total, 1);
}

#[test]
fn memories_are_never_deleted() {
    let db = MemoryDB::open(":memory:").unwrap();
    let m = db.insert(MemoryInput::new("t1", "User lives in Oslo"), "test", "").unwrap();
    let err = db.delete(&m.id).unwrap_err();
    assert!(matches!(err, MemoryError::InvariantViolation(_)));
    assert!(db.get(&m.id).unwrap().is_some());
}

#[test]
fn storage_refuses_raw_deletes_and_audit_rewrites() {
    let path = std::env::temp_dir().join(format!("strata-audit-{}.db", uuid::Uuid::new_v4()));
    let path_str = path.to_string_lossy().to_string();
    let id = {
        let db = MemoryDB::open(&path_str).unwrap();
        db.insert(MemoryInput::new("t1", "User lives in Oslo"), "test", "").unwrap().id
    };

    let conn = rusqlite::Connection::open(&path).unwrap();
    assert!(conn.execute("DELETE FROM memories WHERE id = ?1", [&id]).is_err());
    assert!(conn.execute("UPDATE audit_log SET reason = 'edited'", []).is_err());
    assert!(conn.execute("DELETE FROM audit_log", []).is_err());
    let n: i64 = conn
        .query_row("SELECT COUNT(*) FROM audit_log WHERE memory_id = ?1", [&id], |r| r.get(0))
        .unwrap();
    assert_eq!(n, 1);
    drop(conn);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{path_str}{suffix}"));
    }
}

#[tokio::test]
async fn stats_count_tiers_and_audit() {
    let h = harness();
    seed(&h.db, MemoryInput::new("t1", "User likes tea").agent("a1").importance(9));
    seed(&h.db, MemoryInput::new("t1", "User likes scones").agent("a1").importance(4));
    seed(&h.db, MemoryInput::new("t2", "Other team row").agent("a1"));

    let stats = h.engine.stats("t1").await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.hot, 1);
    assert_eq!(stats.warm, 1);
    assert_eq!(stats.active, 2);
    assert_eq!(stats.missing_embedding, 0);
    assert_eq!(stats.audit_entries, 2);
}
