//! Per-key async mutexes. Extraction and consolidation take the lock for
//! their `(team, agent)` so two writers never interleave in one scope.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type ScopeKey = (String, Option<String>);

#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<ScopeKey, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(team_id: &str, agent_id: Option<&str>) -> ScopeKey {
        (team_id.to_string(), agent_id.map(String::from))
    }

    /// Wait for the lock on `(team, agent)`. Held until the guard drops.
    pub async fn lock(&self, team_id: &str, agent_id: Option<&str>) -> OwnedMutexGuard<()> {
        let m = {
            let mut map = self.inner.lock();
            // drop entries nobody holds or waits on
            if map.len() > 1024 {
                map.retain(|_, m| Arc::strong_count(m) > 1);
            }
            map.entry(Self::key(team_id, agent_id)).or_default().clone()
        };
        m.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_scope_is_serialized() {
        let locks = KeyedLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let (locks, active, peak) = (locks.clone(), active.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _g = locks.lock("t1", Some("a1")).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_scopes_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("t1", Some("a1")).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("t1", Some("a2"))).await;
        assert!(b.is_ok());
        let none = tokio::time::timeout(Duration::from_millis(50), locks.lock("t1", None)).await;
        assert!(none.is_ok());
        assert_eq!(locks.len(), 3);
    }
}
