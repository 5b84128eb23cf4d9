//! Background maintenance tasks.
//!
//! Tickers for the in-flight leak scan, pool gauge refresh, draining-pool
//! reaping, and warning store cleanup. All of them stop on the shared
//! shutdown signal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::manager::RouterManager;
use crate::warning::WarningService;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// In-flight leak scan cadence.
    pub leak_scan_interval: Duration,
    /// Pool gauge refresh cadence.
    pub gauge_refresh_interval: Duration,
    /// Draining-pool reap cadence.
    pub drain_reap_interval: Duration,
    /// Warning store cleanup cadence.
    pub warning_cleanup_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            leak_scan_interval: Duration::from_secs(30),
            gauge_refresh_interval: Duration::from_millis(500),
            drain_reap_interval: Duration::from_secs(10),
            warning_cleanup_interval: Duration::from_secs(300),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    pub fn start(
        manager: Arc<RouterManager>,
        warnings: Arc<WarningService>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        spawn_ticker(
            "leak-scan",
            config.leak_scan_interval,
            shutdown_tx.subscribe(),
            {
                let manager = Arc::clone(&manager);
                move || {
                    let manager = Arc::clone(&manager);
                    async move {
                        manager.check_for_leaks();
                    }
                }
            },
        );

        spawn_ticker(
            "gauge-refresh",
            config.gauge_refresh_interval,
            shutdown_tx.subscribe(),
            {
                let manager = Arc::clone(&manager);
                move || {
                    let manager = Arc::clone(&manager);
                    async move {
                        manager.publish_gauges();
                    }
                }
            },
        );

        spawn_ticker(
            "drain-reap",
            config.drain_reap_interval,
            shutdown_tx.subscribe(),
            {
                let manager = Arc::clone(&manager);
                move || {
                    let manager = Arc::clone(&manager);
                    async move {
                        manager.cleanup_draining_pools().await;
                    }
                }
            },
        );

        spawn_ticker(
            "warning-cleanup",
            config.warning_cleanup_interval,
            shutdown_tx.subscribe(),
            {
                let warnings = Arc::clone(&warnings);
                move || {
                    let warnings = Arc::clone(&warnings);
                    async move {
                        warnings.cleanup();
                    }
                }
            },
        );

        Self { shutdown_tx }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn spawn_ticker<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut tick: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!(task = name, "Lifecycle tick");
                    tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!(task = name, "Lifecycle task stopping");
                    break;
                }
            }
        }
    });
}
