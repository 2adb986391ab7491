//! Periodic eviction of expired worker records
//!
//! The sweeper exists to reclaim idle expired workers promptly; correctness
//! does not depend on it, because resolve checks validity lazily on access.
//! It is an owned task with an explicit stop: the shutdown channel ends the
//! loop, and no timer runs at all when sweeping is disabled in configuration.

use crate::launcher::WorkerLauncher;
use crate::registry::PoolRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct Sweeper<L: WorkerLauncher> {
    registry: Arc<PoolRegistry<L>>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<L: WorkerLauncher> Sweeper<L> {
    pub fn new(
        registry: Arc<PoolRegistry<L>>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            interval,
            shutdown_rx,
        }
    }

    /// Run until the shutdown channel fires. Each tick scans the registry
    /// and evicts every record whose age has reached its class TTL.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let evicted = self.registry.evict_expired().await;
                    debug!(evicted, "Sweep complete");
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Sweeper stopped");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassConfig, ClassDefaults};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct CountingLauncher {
        releases: Arc<AtomicUsize>,
    }

    impl WorkerLauncher for CountingLauncher {
        type Handle = ();

        async fn launch(
            &self,
            _class: &str,
            _config: &ClassConfig,
            _port: u16,
            _address_path: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn release(&self, _handle: ()) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn classes(ttl_secs: u64) -> HashMap<String, ClassConfig> {
        let mut alpha = ClassConfig::new("alpha-worker", 20000);
        alpha.ttl_secs = Some(ttl_secs);
        HashMap::from([("alpha".to_string(), alpha)])
    }

    #[tokio::test]
    async fn test_sweeper_evicts_expired_records() {
        let launcher = CountingLauncher::default();
        let registry =
            PoolRegistry::new(classes(0), ClassDefaults::default(), launcher.clone());
        registry.resolve("alpha", Some(0)).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = Sweeper::new(
            Arc::clone(&registry),
            Duration::from_millis(20),
            shutdown_rx,
        );
        let handle = tokio::spawn(sweeper.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.is_empty());
        assert_eq!(launcher.releases.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_leaves_valid_records() {
        let launcher = CountingLauncher::default();
        let registry =
            PoolRegistry::new(classes(3600), ClassDefaults::default(), launcher.clone());
        registry.resolve("alpha", Some(0)).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = Sweeper::new(
            Arc::clone(&registry),
            Duration::from_millis(20),
            shutdown_rx,
        );
        let handle = tokio::spawn(sweeper.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.len(), 1);
        assert_eq!(launcher.releases.load(Ordering::SeqCst), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let launcher = CountingLauncher::default();
        let registry = PoolRegistry::new(classes(3600), ClassDefaults::default(), launcher);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = Sweeper::new(registry, Duration::from_secs(60), shutdown_rx);
        let handle = tokio::spawn(sweeper.run());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop promptly")
            .unwrap();
    }
}
