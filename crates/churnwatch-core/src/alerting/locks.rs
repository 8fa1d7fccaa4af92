//! Per-channel mutual exclusion

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of async mutexes keyed by channel id.
///
/// Work on one channel is serialized; different channels never contend.
#[derive(Default, Clone)]
pub struct ChannelLocks {
    locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
}

impl ChannelLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `channel_id`
    pub async fn lock(&self, channel_id: i64) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(channel_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Number of channels that have been locked at least once
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no channel has been locked yet
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_channel_is_serialized() {
        let locks = ChannelLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(7).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_different_channels_do_not_block() {
        let locks = ChannelLocks::new();
        let _first = locks.lock(1).await;
        let second = tokio::time::timeout(Duration::from_secs(1), locks.lock(2)).await;
        assert!(second.is_ok());
    }
}
