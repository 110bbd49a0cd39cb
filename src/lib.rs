//! strata: tiered memory for multi-tenant AI agents.
//!
//! Facts extracted from conversations are stored with full provenance,
//! ranked on five signals at retrieval time, fitted to a token budget, and
//! moved between hot, warm and cold tiers. Nothing is ever deleted: every
//! change lands in an append-only audit log.

pub mod access;
pub mod ai;
pub mod budget;
pub mod cache;
pub mod compaction;
pub mod config;
pub mod consolidate;
pub mod contradiction;
pub mod db;
pub mod engine;
pub mod error;
pub mod extract;
pub mod links;
pub mod locks;
pub mod prompt;
pub mod prompts;
pub mod recall;
pub mod scoring;
pub mod thresholds;
pub mod tiers;
pub mod util;

use std::sync::Arc;

pub use engine::{Engine, EngineBuilder};
pub use error::MemoryError;

pub type SharedDB = Arc<db::MemoryDB>;

/// Run a blocking DB operation on tokio's blocking thread pool.
///
/// All synchronous MemoryDB calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn db_call<F, T>(db: &SharedDB, f: F) -> Result<T, MemoryError>
where
    F: FnOnce(&db::MemoryDB) -> T + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| MemoryError::Internal(e.to_string()))
}
