//! Control-plane configuration: fetch, diff, apply.
//!
//! The router periodically GETs a JSON document describing queues, consumer
//! connections, and pools, and applies it through the manager's incremental
//! reconciliation. An unchanged document (by hash) is skipped entirely so a
//! no-op sync never restarts anything.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use relay_core::{PoolSpec, QueueSpec, Topology, WarningKind, WarningSeverity};

use crate::manager::RouterManager;
use crate::warning::WarningService;

// ============================================================================
// Wire format
// ============================================================================

/// The control-plane document. Unknown fields are ignored by serde default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneDocument {
    #[serde(default)]
    pub queues: Vec<QueueDocument>,
    #[serde(default = "default_connections")]
    pub connections: u32,
    #[serde(default)]
    pub processing_pools: Vec<PoolDocument>,
}

fn default_connections() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDocument {
    pub queue_name: String,
    #[serde(default)]
    pub queue_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDocument {
    pub code: String,
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

impl From<ControlPlaneDocument> for Topology {
    fn from(doc: ControlPlaneDocument) -> Self {
        Topology {
            queues: doc
                .queues
                .into_iter()
                .map(|q| QueueSpec {
                    name: q.queue_name,
                    uri: q.queue_uri,
                })
                .collect(),
            connections: doc.connections.max(1),
            pools: doc
                .processing_pools
                .into_iter()
                .map(|p| PoolSpec {
                    code: p.code,
                    concurrency: p.concurrency.max(1),
                    rate_limit_per_minute: p.rate_limit_per_minute.filter(|r| *r > 0),
                })
                .collect(),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConfigSyncConfig {
    pub config_url: String,
    /// How often the sync ticker fires.
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    /// Fetch attempts per sync before giving up for this tick.
    pub max_fetch_attempts: u32,
    pub fetch_retry_delay: Duration,
}

impl Default for ConfigSyncConfig {
    fn default() -> Self {
        Self {
            config_url: String::new(),
            sync_interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            max_fetch_attempts: 3,
            fetch_retry_delay: Duration::from_secs(5),
        }
    }
}

impl ConfigSyncConfig {
    pub fn new(config_url: impl Into<String>) -> Self {
        Self {
            config_url: config_url.into(),
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

pub struct ConfigSync {
    config: ConfigSyncConfig,
    http: reqwest::Client,
    manager: Arc<RouterManager>,
    warnings: Arc<WarningService>,
    last_applied_hash: Mutex<Option<u64>>,
}

impl ConfigSync {
    pub fn new(
        config: ConfigSyncConfig,
        manager: Arc<RouterManager>,
        warnings: Arc<WarningService>,
    ) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            config,
            http,
            manager,
            warnings,
            last_applied_hash: Mutex::new(None),
        })
    }

    pub fn sync_interval(&self) -> Duration {
        self.config.sync_interval
    }

    /// Fetch the current topology, with a short retry burst.
    pub async fn fetch(&self) -> Result<Topology, String> {
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_fetch_attempts {
            match self.fetch_once().await {
                Ok(topology) => {
                    if attempt > 1 {
                        info!(attempt, "Configuration fetched after retry");
                    }
                    return Ok(topology);
                }
                Err(e) => {
                    last_error = e;
                    if attempt < self.config.max_fetch_attempts {
                        warn!(
                            attempt,
                            error = %last_error,
                            "Config fetch failed, retrying"
                        );
                        tokio::time::sleep(self.config.fetch_retry_delay).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    async fn fetch_once(&self) -> Result<Topology, String> {
        let response = self
            .http
            .get(&self.config.config_url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("config source returned {}", response.status()));
        }

        let document: ControlPlaneDocument = response
            .json()
            .await
            .map_err(|e| format!("malformed config document: {e}"))?;

        Ok(document.into())
    }

    fn topology_hash(topology: &Topology) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        topology.connections.hash(&mut hasher);
        for pool in &topology.pools {
            pool.code.hash(&mut hasher);
            pool.concurrency.hash(&mut hasher);
            pool.rate_limit_per_minute.hash(&mut hasher);
        }
        for queue in &topology.queues {
            queue.name.hash(&mut hasher);
            queue.uri.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// One sync pass: fetch, skip if unchanged, otherwise apply. Fetch or
    /// apply failures leave the previous topology running.
    pub async fn sync(&self) -> bool {
        let topology = match self.fetch().await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "Config sync failed; keeping previous configuration");
                self.warnings.add_warning(
                    WarningKind::Configuration,
                    WarningSeverity::Warn,
                    format!("Config fetch failed: {e}"),
                    "ConfigSync".to_string(),
                );
                return false;
            }
        };

        let hash = Self::topology_hash(&topology);
        if *self.last_applied_hash.lock() == Some(hash) {
            debug!("Configuration unchanged, skipping reload");
            return true;
        }

        info!(
            pools = topology.pools.len(),
            queues = topology.queues.len(),
            connections = topology.connections,
            "Configuration changed, applying"
        );

        match self.manager.reload(&topology).await {
            Ok(report) => {
                *self.last_applied_hash.lock() = Some(hash);
                debug!(?report, "Configuration applied");
                true
            }
            Err(e) => {
                error!(error = %e, "Configuration apply failed; keeping previous configuration");
                self.warnings.add_warning(
                    WarningKind::Configuration,
                    WarningSeverity::Error,
                    format!("Config apply failed: {e}"),
                    "ConfigSync".to_string(),
                );
                false
            }
        }
    }

    /// First sync at startup. Failure here means the router must not start
    /// consuming: readiness stays false and the error propagates.
    pub async fn initial_sync(&self) -> Result<Topology, String> {
        info!(url = %self.config.config_url, "Initial configuration sync");

        let topology = self.fetch().await?;

        self.manager
            .reload(&topology)
            .await
            .map_err(|e| format!("initial config apply failed: {e}"))?;

        *self.last_applied_hash.lock() = Some(Self::topology_hash(&topology));

        info!(
            pools = topology.pools.len(),
            queues = topology.queues.len(),
            "Initial configuration applied"
        );

        Ok(topology)
    }
}

/// Background ticker driving periodic sync until shutdown.
pub fn spawn_config_sync_task(
    sync: Arc<ConfigSync>,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let interval = sync.sync_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // initial sync already happened

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Scheduled configuration sync");
                    sync.sync().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Config sync ticker stopping");
                    break;
                }
            }
        }
    })
}
