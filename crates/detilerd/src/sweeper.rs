//! Background removal of expired keys.
//!
//! Reads already hide expired keys; the sweep reclaims their storage.

use std::time::Duration;

use detiler_state::Engine;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct ExpirySweeper {
    engine: Engine,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(engine: Engine, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// One sweep. Errors are logged and the sweep counts as empty.
    pub fn sweep(&self) -> usize {
        match self.engine.purge_expired() {
            Ok(purged) => {
                if purged > 0 {
                    debug!(purged, "expired keys swept");
                }
                purged
            }
            Err(e) => {
                error!(error = %e, "expiry sweep failed");
                0
            }
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "expiry sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep();
                }
                _ = shutdown.changed() => {
                    info!("expiry sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detiler_state::Transaction;
    use serde_json::json;

    #[test]
    fn sweep_removes_expired_keys() {
        let engine = Engine::open_in_memory().unwrap();
        let mut txn = Transaction::new();
        txn.json_set("cooldown:a", json!({"n": 1}))
            .pexpire("cooldown:a", 1)
            .json_set("cooldown:b", json!({"n": 2}));
        engine.exec(txn).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let sweeper = ExpirySweeper::new(engine.clone(), Duration::from_secs(60));
        assert_eq!(sweeper.sweep(), 1);
        assert_eq!(sweeper.sweep(), 0);
        assert!(engine.exists("cooldown:b").unwrap());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let engine = Engine::open_in_memory().unwrap();
        let sweeper = ExpirySweeper::new(engine, Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { sweeper.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
