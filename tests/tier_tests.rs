mod common;

use common::*;
use strata::db::*;
use strata::MemoryError;

#[tokio::test]
async fn old_unused_memory_goes_cold_unless_pinned() {
    let h = harness();
    let created = now_ms() - 120 * DAY;
    let plain = memory("plain", MemoryType::Semantic, "User once asked about parking", 2, created);
    let mut pinned = memory("pinned", MemoryType::Semantic, "User once asked about bike racks", 2, created);
    pinned.is_pinned = true;
    h.db.import(&[plain, pinned], "fixture").unwrap();

    let report = h.engine.run_tier_sweep("t1", Some("a1")).await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.demoted, 1);
    assert_eq!(report.protected, 1);

    assert_eq!(h.db.get("plain").unwrap().unwrap().tier, Tier::Cold);
    assert_eq!(h.db.get("pinned").unwrap().unwrap().tier, Tier::Warm);
    assert_eq!(h.db.audit_count("plain", AuditAction::Demoted).unwrap(), 1);
    assert_eq!(h.db.audit_count("pinned", AuditAction::Demoted).unwrap(), 0);

    // a second sweep has nothing left to do
    let again = h.engine.run_tier_sweep("t1", Some("a1")).await.unwrap();
    assert_eq!(again.demoted, 0);
}

#[tokio::test]
async fn idle_hot_memory_cools_to_warm() {
    let h = harness();
    let mut m = memory("idle", MemoryType::Semantic, "User asked for weekly reports", 5, now_ms() - 40 * DAY);
    m.tier = Tier::Hot;
    h.db.import(&[m], "fixture").unwrap();

    let report = h.engine.run_tier_sweep("t1", Some("a1")).await.unwrap();
    assert_eq!(report.demoted, 1);
    assert_eq!(h.db.get("idle").unwrap().unwrap().tier, Tier::Warm);
}

#[tokio::test]
async fn high_importance_and_identity_are_never_demoted() {
    let h = harness();
    let old = now_ms() - 400 * DAY;
    let mut important = memory("important", MemoryType::Semantic, "User is diabetic", 8, old);
    important.tier = Tier::Hot;
    let mut identity = memory("identity", MemoryType::Identity, "I am Atlas", 2, old);
    identity.tier = Tier::Hot;
    h.db.import(&[important, identity], "fixture").unwrap();

    let report = h.engine.run_tier_sweep("t1", Some("a1")).await.unwrap();
    assert_eq!(report.demoted, 0);
    assert_eq!(report.protected, 2);
    for id in ["important", "identity"] {
        assert_eq!(h.db.get(id).unwrap().unwrap().tier, Tier::Hot);
        let err = h.engine.demote(id, Tier::Warm).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }
}

#[tokio::test]
async fn pin_promotes_and_blocks_demotion() {
    let h = harness();
    let m = seed(&h.db, MemoryInput::new("t1", "User prefers short answers").agent("a1").importance(4));
    assert_eq!(m.tier, Tier::Warm);

    let pinned = h.engine.pin(&m.id).await.unwrap();
    assert!(pinned.is_pinned);
    assert_eq!(pinned.tier, Tier::Hot);
    assert_eq!(h.db.audit_count(&m.id, AuditAction::Pinned).unwrap(), 1);
    assert_eq!(h.db.audit_count(&m.id, AuditAction::Promoted).unwrap(), 1);

    let err = h.engine.demote(&m.id, Tier::Cold).await.unwrap_err();
    assert!(matches!(err, MemoryError::InvariantViolation(_)));

    let unpinned = h.engine.unpin(&m.id).await.unwrap();
    assert!(!unpinned.is_pinned);
    assert_eq!(unpinned.tier, Tier::Hot);
    let cooled = h.engine.demote(&m.id, Tier::Warm).await.unwrap();
    assert_eq!(cooled.tier, Tier::Warm);
}

#[tokio::test]
async fn demotion_must_move_down() {
    let h = harness();
    let m = seed(&h.db, MemoryInput::new("t1", "User owns a boat").agent("a1").importance(5));
    let cold = h.engine.demote(&m.id, Tier::Cold).await.unwrap();
    assert_eq!(cold.tier, Tier::Cold);
    let err = h.engine.demote(&m.id, Tier::Warm).await.unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
    let err = h.engine.demote("missing", Tier::Cold).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound(_)));
}

#[tokio::test]
async fn feedback_moves_confidence_and_promotes() {
    let h = harness();
    let m = seed(
        &h.db,
        MemoryInput::new("t1", "User's manager is Priya").agent("a1").importance(5).confidence(0.5),
    );

    let up = h.engine.record_feedback(&m.id, 1.0).await.unwrap();
    assert!((up.confidence - 0.6).abs() < 1e-9);
    assert_eq!(up.tier, Tier::Hot);

    let down = h.engine.record_feedback(&m.id, -0.5).await.unwrap();
    assert!((down.confidence - 0.55).abs() < 1e-9);
    assert_eq!(down.tier, Tier::Hot);

    assert!(matches!(h.engine.record_feedback(&m.id, 2.0).await, Err(MemoryError::Validation(_))));
    assert!(matches!(h.engine.record_feedback("nope", 0.5).await, Err(MemoryError::NotFound(_))));
}

#[tokio::test]
async fn feedback_confidence_is_clamped() {
    let h = harness();
    let m = seed(&h.db, MemoryInput::new("t1", "User is vegan").agent("a1").confidence(0.95));
    let up = h.engine.record_feedback(&m.id, 1.0).await.unwrap();
    assert_eq!(up.confidence, 1.0);
}
