//! Expired record sweeper
//!
//! Periodically deletes expired job records, leases and cancel flags from
//! the keyed store. Reads never see expired entries, so this only keeps the
//! table and prefix scans small.

use docprobe_store::KeyedStore;
use std::sync::Arc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ExpirySweeper {
    kv: Arc<dyn KeyedStore>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(kv: Arc<dyn KeyedStore>, interval: Duration) -> Self {
        Self { kv, interval }
    }

    /// Sweeps every `interval` until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting expiry sweeper (interval: {:?})", self.interval);

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }

        info!("Expiry sweeper stopped");
    }

    /// Runs a single sweep, logging instead of failing
    ///
    /// # Returns
    /// Number of entries removed
    pub async fn sweep_once(&self) -> u64 {
        match self.kv.purge_expired().await {
            Ok(0) => {
                debug!("No expired entries to purge");
                0
            }
            Ok(removed) => {
                info!("Purged {} expired entries", removed);
                removed
            }
            Err(e) => {
                warn!("Failed to purge expired entries: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docprobe_store::MemoryStore;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let kv = Arc::new(MemoryStore::new());
        kv.put("job:old", json!({}), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        kv.put("lease:job:old", json!("w"), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        kv.put("job:kept", json!({}), None).await.unwrap();

        let sweeper = ExpirySweeper::new(
            Arc::clone(&kv) as Arc<dyn KeyedStore>,
            Duration::from_secs(60),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { sweeper.run(shutdown).await }
        });

        // First tick fires immediately and finds nothing expired
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(kv.stored_len(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(kv.stored_len(), 1);
        assert!(kv.get("job:kept").await.unwrap().is_some());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_once_counts_removed() {
        let kv = Arc::new(MemoryStore::new());
        kv.put("cancel:job:a", json!(true), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let sweeper = ExpirySweeper::new(
            Arc::clone(&kv) as Arc<dyn KeyedStore>,
            Duration::from_secs(60),
        );

        assert_eq!(sweeper.sweep_once().await, 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(sweeper.sweep_once().await, 1);
        assert_eq!(sweeper.sweep_once().await, 0);
    }
}
