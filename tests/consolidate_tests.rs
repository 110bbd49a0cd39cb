mod common;

use std::sync::Arc;

use common::*;
use serde_json::json;
use strata::db::*;
use strata::Engine;

#[tokio::test]
async fn expired_rows_are_archived() {
    let h = harness();
    let gone = seed(
        &h.db,
        MemoryInput::new("t1", "User is travelling this week").agent("a1").expires_at(now_ms() - 1000),
    );
    let kept = seed(
        &h.db,
        MemoryInput::new("t1", "User is on call next month").agent("a1").expires_at(now_ms() + DAY),
    );

    let report = h.engine.consolidate("t1", Some("a1")).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(h.db.get(&gone.id).unwrap().unwrap().status, Status::Archived);
    assert_eq!(h.db.get(&kept.id).unwrap().unwrap().status, Status::Active);
    assert_eq!(h.db.audit_count(&gone.id, AuditAction::Expired).unwrap(), 1);
}

#[tokio::test]
async fn near_duplicates_fold_into_the_stronger_row() {
    let h = harness();
    let strong = seed(&h.db, MemoryInput::new("t1", "User likes hiking in the Alps").agent("a1").importance(6));
    let weak = seed(&h.db, MemoryInput::new("t1", "User likes hiking in the Alps 2").agent("a1").importance(3));
    let other = seed(&h.db, MemoryInput::new("t1", "User keeps bees").agent("a1").importance(3));

    let report = h.engine.consolidate("t1", Some("a1")).await.unwrap();
    assert_eq!(report.merged, 1);

    let weak = h.db.get(&weak.id).unwrap().unwrap();
    assert_eq!(weak.status, Status::Archived);
    assert_eq!(weak.superseded_by.as_deref(), Some(strong.id.as_str()));
    assert_eq!(h.db.get(&strong.id).unwrap().unwrap().status, Status::Active);
    assert_eq!(h.db.get(&other.id).unwrap().unwrap().status, Status::Active);
}

const EPISODES: [&str; 6] = [
    "User asked about the weather",
    "User booked a dentist appointment",
    "User watched a documentary on whales",
    "User fixed a leaky faucet",
    "User called their sister",
    "User baked sourdough bread",
];

fn import_stale_episodes(db: &MemoryDB) -> Vec<String> {
    let at = now_ms() - 40 * DAY;
    let rows: Vec<Memory> = EPISODES
        .iter()
        .enumerate()
        .map(|(i, c)| memory(&format!("ep{i}"), MemoryType::Episodic, c, 2, at))
        .collect();
    db.import(&rows, "fixture").unwrap();
    rows.into_iter().map(|m| m.id).collect()
}

#[tokio::test]
async fn stale_episodes_roll_into_a_summary() {
    let h = harness();
    let ids = import_stale_episodes(&h.db);
    h.completer.respond(
        "store_summary",
        json!({ "summary": "Over a few weeks the user handled errands, family calls and some baking." }),
    );

    let report = h.engine.consolidate("t1", Some("a1")).await.unwrap();
    assert_eq!(report.summaries_created, 1);
    assert_eq!(report.summarized, EPISODES.len());
    assert!(report.degraded.is_empty());

    let first = h.db.get(&ids[0]).unwrap().unwrap();
    assert_eq!(first.status, Status::Archived);
    let summary_id = first.superseded_by.clone().unwrap();
    let summary = h.db.get(&summary_id).unwrap().unwrap();
    assert_eq!(summary.memory_type, MemoryType::Episodic);
    assert_eq!(summary.source_type, SourceType::Consolidation);
    assert_eq!(summary.status, Status::Active);
    for id in &ids {
        assert!(summary.related_to.contains(id));
        let src = h.db.get(id).unwrap().unwrap();
        assert_eq!(src.status, Status::Archived);
        assert!(src.related_to.contains(&summary_id));
    }
}

#[tokio::test]
async fn too_few_stale_episodes_are_left_alone() {
    let h = harness();
    let at = now_ms() - 40 * DAY;
    h.db.import(&[memory("ep", MemoryType::Episodic, "User renewed a passport", 2, at)], "fixture").unwrap();
    h.completer.respond("store_summary", json!({ "summary": "unused" }));

    let report = h.engine.consolidate("t1", Some("a1")).await.unwrap();
    assert_eq!(report.summaries_created, 0);
    assert_eq!(h.completer.calls("store_summary"), 0);
    assert_eq!(h.db.get("ep").unwrap().unwrap().status, Status::Active);
}

#[tokio::test]
async fn summary_failure_degrades_without_losing_rows() {
    let h = harness();
    let ids = import_stale_episodes(&h.db);
    h.completer.fail("store_summary");

    let report = h.engine.consolidate("t1", Some("a1")).await.unwrap();
    assert_eq!(report.degraded, vec!["summarize"]);
    for id in &ids {
        assert_eq!(h.db.get(id).unwrap().unwrap().status, Status::Active);
    }
}

#[tokio::test]
async fn missing_vectors_are_backfilled() {
    let h = harness();
    let bare = h.db.insert(MemoryInput::new("t1", "User collects vinyl").agent("a1"), "test", "").unwrap();
    assert!(bare.embedding.is_none());

    let report = h.engine.consolidate("t1", Some("a1")).await.unwrap();
    assert_eq!(report.embeddings_backfilled, 1);
    let filled = h.db.get(&bare.id).unwrap().unwrap();
    assert_eq!(filled.embedding, Some(embed_text("User collects vinyl")));
}

#[tokio::test]
async fn consolidation_without_ai_still_runs_local_steps() {
    let db = test_db();
    let engine = Engine::builder(db.clone()).build().unwrap();
    let m = db
        .insert(MemoryInput::new("t1", "User is away").agent("a1").expires_at(now_ms() - 1), "test", "")
        .unwrap();

    let report = engine.consolidate("t1", Some("a1")).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.embeddings_backfilled, 0);
    assert!(report.degraded.contains(&"summarize".to_string()));
    assert_eq!(db.get(&m.id).unwrap().unwrap().status, Status::Archived);
}

#[tokio::test]
async fn every_scope_is_consolidated() {
    let h = harness();
    seed(&h.db, MemoryInput::new("t1", "Row for agent one").agent("a1").expires_at(now_ms() - 1));
    seed(&h.db, MemoryInput::new("t1", "Row for agent two").agent("a2").expires_at(now_ms() - 1));
    seed(&h.db, MemoryInput::new("t2", "Unscoped row").expires_at(now_ms() - 1));

    let reports = h.engine.consolidate_all().await.unwrap();
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|(_, _, r)| r.expired == 1));
}

#[tokio::test]
async fn consolidation_invalidates_cached_rankings() {
    let h = harness();
    seed(&h.db, MemoryInput::new("t1", "User plays chess").agent("a1"));
    let req = strata::recall::RetrievalRequest::new("chess", "t1", "a1", 500);
    h.engine.retrieve(&req).await.unwrap();
    assert!(h.engine.retrieve(&req).await.unwrap().stats.cache_hit);

    h.engine.consolidate("t1", Some("a1")).await.unwrap();
    assert!(!h.engine.retrieve(&req).await.unwrap().stats.cache_hit);
}

#[tokio::test]
async fn background_loop_is_optional() {
    let db = test_db();
    let mut config = strata::config::EngineConfig::default();
    config.consolidation.interval_mins = 0;
    let engine = Engine::builder(db)
        .config(config)
        .embedder(Arc::new(MockEmbedder::default()))
        .build()
        .unwrap();
    assert!(engine.spawn_consolidation().is_none());
}
