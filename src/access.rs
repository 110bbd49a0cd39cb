//! Fire-and-forget access tracking. Retrieval enqueues the ids it considered;
//! a background task bumps counters, audits the access, and runs the
//! access-driven tier promotions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::db::now_ms;
use crate::tiers::{self, TierPolicy};
use crate::{db_call, SharedDB};

enum AccessMsg {
    Touch { ids: Vec<String>, at: i64 },
    Flush(oneshot::Sender<()>),
}

/// Overflow sends still waiting for queue space.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone)]
pub struct AccessTracker {
    tx: mpsc::Sender<AccessMsg>,
    overflow: Arc<InFlight>,
}

impl AccessTracker {
    /// Start the background worker. Must be called inside a tokio runtime.
    pub fn spawn(db: SharedDB, policy: TierPolicy, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(worker(db, policy, rx));
        Self { tx, overflow: Arc::default() }
    }

    /// Enqueue without blocking. A full queue hands the message to a detached
    /// task so the caller never waits.
    pub fn record(&self, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        let msg = AccessMsg::Touch { ids, at: now_ms() };
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                debug!("access queue full, sending detached");
                let tx = self.tx.clone();
                let overflow = Arc::clone(&self.overflow);
                overflow.count.fetch_add(1, Ordering::AcqRel);
                tokio::spawn(async move {
                    let _ = tx.send(msg).await;
                    overflow.done();
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("access tracker stopped, dropping access update");
            }
        }
    }

    /// Wait until everything enqueued so far has been written. Overflow
    /// sends must reach the queue first so the flush marker lands behind them.
    pub async fn flush(&self) {
        self.overflow.wait_drained().await;
        let (tx, rx) = oneshot::channel();
        if self.tx.send(AccessMsg::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn worker(db: SharedDB, policy: TierPolicy, mut rx: mpsc::Receiver<AccessMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            AccessMsg::Touch { ids, at } => {
                let n = ids.len();
                let result = db_call(&db, move |d| {
                    let touched = d.touch_many(&ids, at, "access_tracker")?;
                    let mut promoted = 0;
                    for m in &touched {
                        if let Some(dec) = tiers::evaluate_promotion(m, &policy, at) {
                            if tiers::apply(d, &dec, "access_tracker")?.is_some() {
                                promoted += 1;
                            }
                        }
                    }
                    Ok::<_, crate::error::MemoryError>(promoted)
                })
                .await;
                match result {
                    Ok(Ok(promoted)) => {
                        debug!(touched = n, promoted, "access batch written");
                    }
                    Ok(Err(e)) | Err(e) => warn!(error = %e, "access update failed"),
                }
            }
            AccessMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
