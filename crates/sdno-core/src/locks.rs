//! Per-switch install locks.
//!
//! VLAN allocation and collision probes read the store and then install;
//! two sessions interleaving on the same switch could both see an id as
//! free. Every realisation therefore acquires the locks of all switches it
//! will touch, in canonical (sorted, deduplicated) order so two sessions
//! can never deadlock, and holds them until its flows are installed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct SwitchLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SwitchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the locks of every listed switch in canonical order and
    /// returns the guards; dropping them releases everything together.
    pub async fn acquire_all(&self, switches: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut ordered: Vec<&String> = switches.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut handles = Vec::with_capacity(ordered.len());
        {
            let mut locks = self.locks.lock().await;
            for switch in &ordered {
                let lock = locks
                    .entry((*switch).clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();
                handles.push(lock);
            }
        }

        let mut guards = Vec::with_capacity(handles.len());
        for lock in handles {
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_switch_serialises() {
        let locks = Arc::new(SwitchLocks::new());
        let guards = locks.acquire_all(&["s1".to_string()]).await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire_all(&["s1".to_string()]).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guards);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_switches_run_in_parallel() {
        let locks = Arc::new(SwitchLocks::new());
        let _guards = locks.acquire_all(&["s1".to_string()]).await;
        // A disjoint set must not block.
        let other = tokio::time::timeout(
            Duration::from_millis(200),
            locks.acquire_all(&["s2".to_string(), "s3".to_string()]),
        )
        .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_switches_deduplicated() {
        let locks = SwitchLocks::new();
        let guards = locks
            .acquire_all(&["s1".to_string(), "s1".to_string(), "s1".to_string()])
            .await;
        assert_eq!(guards.len(), 1);
    }
}
