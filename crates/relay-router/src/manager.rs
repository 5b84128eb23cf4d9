//! Router manager: composition root of the message router.
//!
//! Owns the pool set, the consumer set, and the global in-flight dedup map.
//! Consumers call [`RouterManager::route`] for every polled message; pools
//! report one terminal disposition per accepted message, which the manager
//! translates into the broker-specific ack/nack/visibility call and the
//! in-flight removal.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use relay_broker::BrokerConsumer;
use relay_core::{
    Disposition, InFlightEntry, PolledMessage, PoolSnapshot, PoolSpec, QueueSpec, RouteOutcome,
    Topology, WarningKind, WarningSeverity,
};

use crate::error::RouterError;
use crate::mediator::Mediator;
use crate::metrics::{self, PoolMetrics};
use crate::pool::{DispatchJob, ProcessPool, DEFAULT_IDLE_TIMEOUT};
use crate::warning::WarningService;
use crate::Result;

/// Builds broker consumers during config sync. One impl per deployment
/// (SQS, AMQP, embedded); without one, new queues are logged but not
/// auto-created.
#[async_trait::async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create_consumer(&self, queue: &QueueSpec) -> Result<Arc<dyn BrokerConsumer>>;
}

#[derive(Debug, Clone)]
pub struct RouterManagerConfig {
    /// Hard cap on configured pools; a reload asking for more is rejected.
    pub max_pools: usize,
    /// Pool count that triggers an early warning.
    pub pool_warning_threshold: usize,
    /// In-flight entries older than this are reported as leaks.
    pub leak_threshold: Duration,
    /// Idle window for group workers inside pools.
    pub group_idle_timeout: Duration,
    /// Messages requested per broker poll (broker max applies).
    pub max_messages_per_poll: u32,
    /// Grace given to a pool between drain and forced shutdown.
    pub pool_shutdown_grace: Duration,
}

impl Default for RouterManagerConfig {
    fn default() -> Self {
        Self {
            max_pools: 2000,
            pool_warning_threshold: 1000,
            leak_threshold: Duration::from_secs(1200),
            group_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_messages_per_poll: 10,
            pool_shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Counts from one reconciliation pass, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub pools_created: usize,
    pub pools_replaced: usize,
    pub pools_removed: usize,
    pub consumers_created: usize,
    pub consumers_removed: usize,
}

impl ReloadReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RouterManager {
    config: RouterManagerConfig,
    mediator: Arc<dyn Mediator>,
    metrics: Arc<dyn PoolMetrics>,
    warnings: Arc<WarningService>,

    /// Global in-flight dedup map, keyed by pointer id.
    in_flight: Arc<DashMap<String, InFlightEntry>>,

    /// Live pools by code. Swapped atomically during reconciliation so the
    /// routing hot path sees either the old or the new pool, never both.
    pools: DashMap<String, Arc<ProcessPool>>,
    /// Replaced/removed pools finishing their in-flight work.
    draining_pools: DashMap<u64, Arc<ProcessPool>>,
    drain_seq: AtomicU64,

    consumers: RwLock<HashMap<String, Arc<dyn BrokerConsumer>>>,
    queue_specs: RwLock<HashMap<String, QueueSpec>>,
    connections: AtomicU32,
    consumer_factory: Option<Arc<dyn ConsumerFactory>>,

    /// Serializes reconciliation; reloads are globally ordered.
    reload_lock: Mutex<()>,

    accepting: AtomicBool,
    /// First successful sync completed.
    synced: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    poll_batch_seq: AtomicU64,
}

impl RouterManager {
    pub fn new(
        mediator: Arc<dyn Mediator>,
        metrics: Arc<dyn PoolMetrics>,
        warnings: Arc<WarningService>,
    ) -> Self {
        Self::with_config(mediator, metrics, warnings, RouterManagerConfig::default())
    }

    pub fn with_config(
        mediator: Arc<dyn Mediator>,
        metrics: Arc<dyn PoolMetrics>,
        warnings: Arc<WarningService>,
        config: RouterManagerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            mediator,
            metrics,
            warnings,
            in_flight: Arc::new(DashMap::new()),
            pools: DashMap::new(),
            draining_pools: DashMap::new(),
            drain_seq: AtomicU64::new(0),
            consumers: RwLock::new(HashMap::new()),
            queue_specs: RwLock::new(HashMap::new()),
            connections: AtomicU32::new(1),
            consumer_factory: None,
            reload_lock: Mutex::new(()),
            accepting: AtomicBool::new(true),
            synced: AtomicBool::new(false),
            shutdown_tx,
            poll_batch_seq: AtomicU64::new(0),
        }
    }

    pub fn set_consumer_factory(&mut self, factory: Arc<dyn ConsumerFactory>) {
        self.consumer_factory = Some(factory);
    }

    pub fn warnings(&self) -> &Arc<WarningService> {
        &self.warnings
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn max_messages_per_poll(&self) -> u32 {
        self.config.max_messages_per_poll
    }

    /// Mint an id for one broker poll; pointers without a wire batch id
    /// inherit it so the failure cascade covers "arrived together".
    pub fn next_poll_batch(&self) -> Arc<str> {
        let seq = self.poll_batch_seq.fetch_add(1, Ordering::SeqCst);
        Arc::from(format!("poll-{seq}"))
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Route one polled message into its pool.
    ///
    /// Exactly one broker finalization follows for every message passed in,
    /// on every path: rejected and duplicate messages are nacked here,
    /// accepted ones get their ack/nack when the pool reports its verdict.
    pub async fn route(
        &self,
        msg: PolledMessage,
        consumer: &Arc<dyn BrokerConsumer>,
        poll_batch: &Arc<str>,
    ) -> RouteOutcome {
        if !self.accepting.load(Ordering::SeqCst) {
            let _ = consumer.nack(&msg.handle, None).await;
            return RouteOutcome::Rejected;
        }

        let pool = self
            .pools
            .get(&msg.pointer.pool_code)
            .map(|entry| entry.value().clone());
        let pool = match pool {
            Some(pool) => pool,
            None => {
                warn!(
                    message_id = %msg.pointer.id,
                    pool_code = %msg.pointer.pool_code,
                    "No pool for message, rejecting"
                );
                self.warnings.add_warning(
                    WarningKind::UnknownPool,
                    WarningSeverity::Warn,
                    format!(
                        "Message [{}] addressed unknown pool [{}]",
                        msg.pointer.id, msg.pointer.pool_code
                    ),
                    "RouterManager".to_string(),
                );
                let _ = consumer.nack(&msg.handle, None).await;
                metrics::record_route_outcome("REJECTED_UNKNOWN_POOL");
                return RouteOutcome::Rejected;
            }
        };

        let batch_id: Arc<str> = msg
            .pointer
            .batch_id
            .as_deref()
            .map(Arc::from)
            .unwrap_or_else(|| Arc::clone(poll_batch));

        // Global in-flight dedup: put-if-absent; a collision means another
        // copy of this id is still being processed somewhere. The entry
        // guard must drop before any await below.
        let message_id = msg.pointer.id.clone();
        let duplicate = match self.in_flight.entry(message_id.clone()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(InFlightEntry::new(
                    &msg.pointer,
                    Some(batch_id.to_string()),
                    msg.queue.clone(),
                ));
                false
            }
        };

        if duplicate {
            debug!(
                message_id = %message_id,
                queue = %msg.queue,
                "Duplicate in-flight delivery, suppressing"
            );
            let _ = consumer.nack(&msg.handle, None).await;
            metrics::record_route_outcome("DUPLICATE_SUPPRESSED");
            return RouteOutcome::DuplicateSuppressed;
        }

        let (done_tx, done_rx) = oneshot::channel::<Disposition>();

        // Finisher: one per accepted message. Removes the dedup entry the
        // moment the verdict lands, then talks to the broker; a dropped
        // channel (refusal, worker death) reads as a nack.
        {
            let in_flight = Arc::clone(&self.in_flight);
            let consumer = Arc::clone(consumer);
            let handle = msg.handle.clone();
            let message_id = message_id.clone();
            tokio::spawn(async move {
                let verdict = done_rx.await;
                in_flight.remove(&message_id);

                let finalized = match verdict {
                    Ok(Disposition::Ack) => consumer.ack(&handle).await,
                    Ok(Disposition::Nack { delay_seconds }) => {
                        consumer.nack(&handle, delay_seconds).await
                    }
                    Ok(Disposition::FastRetry) => {
                        consumer.set_fast_fail_visibility(&handle).await
                    }
                    Err(_) => consumer.nack(&handle, Some(5)).await,
                };

                if let Err(e) = finalized {
                    warn!(
                        message_id = %message_id,
                        error = %e,
                        "Broker finalization failed; broker will redeliver after visibility"
                    );
                }
            });
        }

        let job = DispatchJob {
            pointer: msg.pointer,
            batch_id: Some(batch_id),
            done: done_tx,
        };

        match pool.try_submit(job) {
            Ok(()) => {
                metrics::record_route_outcome("ACCEPTED");
                RouteOutcome::Accepted
            }
            Err(refused) => {
                debug!(
                    message_id = %message_id,
                    pool_code = %pool.code(),
                    "Pool refused submission (full or draining)"
                );
                // keep the dedup map clean right away; the finisher's remove
                // is idempotent
                self.in_flight.remove(&message_id);
                drop(refused); // dropped channel -> finisher nacks
                metrics::record_route_outcome("REJECTED_BACKPRESSURE");
                RouteOutcome::Rejected
            }
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Apply a control-plane topology incrementally. Unchanged pools keep
    /// running untouched; changed pools are replaced and the old instance
    /// drains off-path; a topology over the pool limit is rejected whole.
    pub async fn reload(self: &Arc<Self>, topology: &Topology) -> Result<ReloadReport> {
        let _guard = self.reload_lock.lock().await;

        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RouterError::ShutdownInProgress);
        }

        if topology.pools.len() > self.config.max_pools {
            error!(
                requested = topology.pools.len(),
                max = self.config.max_pools,
                "Topology exceeds pool limit, rejecting reload"
            );
            self.warnings.add_warning(
                WarningKind::PoolLimitExceeded,
                WarningSeverity::Critical,
                format!(
                    "Rejected configuration with {} pools (limit {})",
                    topology.pools.len(),
                    self.config.max_pools
                ),
                "RouterManager".to_string(),
            );
            return Err(RouterError::PoolLimitExceeded {
                requested: topology.pools.len(),
                max: self.config.max_pools,
            });
        }

        if topology.pools.len() >= self.config.pool_warning_threshold {
            self.warnings.add_warning(
                WarningKind::PoolLimitExceeded,
                WarningSeverity::Warn,
                format!(
                    "Pool count {} approaching limit {} (threshold {})",
                    topology.pools.len(),
                    self.config.max_pools,
                    self.config.pool_warning_threshold
                ),
                "RouterManager".to_string(),
            );
        }

        let mut report = ReloadReport::default();

        let desired: HashMap<String, PoolSpec> = topology
            .pools
            .iter()
            .map(|p| (p.code.clone(), p.clone()))
            .collect();

        // Existing pools: keep, replace, or retire.
        let current_codes: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for code in current_codes {
            match desired.get(&code) {
                Some(spec) => {
                    let unchanged = self
                        .pools
                        .get(&code)
                        .map(|p| p.spec() == spec)
                        .unwrap_or(false);
                    if unchanged {
                        continue;
                    }

                    info!(pool_code = %code, "Pool parameters changed, swapping in replacement");
                    let replacement = self.build_pool(spec);
                    if let Some(old) = self.pools.insert(code.clone(), replacement) {
                        self.retire_pool(old);
                    }
                    report.pools_replaced += 1;
                }
                None => {
                    if let Some((_, old)) = self.pools.remove(&code) {
                        info!(
                            pool_code = %code,
                            queued = old.queue_size(),
                            active = old.active_count(),
                            "Pool removed from config, draining"
                        );
                        self.retire_pool(old);
                        report.pools_removed += 1;
                    }
                }
            }
        }

        // Additions.
        for spec in &topology.pools {
            if !self.pools.contains_key(&spec.code) {
                let pool = self.build_pool(spec);
                self.pools.insert(spec.code.clone(), pool);
                info!(
                    pool_code = %spec.code,
                    concurrency = spec.concurrency,
                    rate_limit = ?spec.rate_limit_per_minute,
                    "Pool created"
                );
                report.pools_created += 1;
            }
        }

        let (created, removed) = self.sync_consumers(topology).await;
        report.consumers_created = created;
        report.consumers_removed = removed;

        self.synced.store(true, Ordering::SeqCst);

        info!(
            pools_created = report.pools_created,
            pools_replaced = report.pools_replaced,
            pools_removed = report.pools_removed,
            consumers_created = report.consumers_created,
            consumers_removed = report.consumers_removed,
            active_pools = self.pools.len(),
            draining_pools = self.draining_pools.len(),
            "Reconciliation complete"
        );

        Ok(report)
    }

    fn build_pool(&self, spec: &PoolSpec) -> Arc<ProcessPool> {
        let mut pool = ProcessPool::with_idle_timeout(
            spec.clone(),
            Arc::clone(&self.mediator),
            Arc::clone(&self.metrics),
            self.config.group_idle_timeout,
        );
        pool.set_warning_service(Arc::clone(&self.warnings));
        pool.start();
        Arc::new(pool)
    }

    fn retire_pool(&self, pool: Arc<ProcessPool>) {
        pool.drain();
        let key = self.drain_seq.fetch_add(1, Ordering::SeqCst);
        self.draining_pools.insert(key, pool);
    }

    /// Mirror the queue set: stop removed consumers, create added ones, and
    /// recreate survivors when the connection count or queue uri changed.
    async fn sync_consumers(self: &Arc<Self>, topology: &Topology) -> (usize, usize) {
        let mut created = 0;
        let mut removed = 0;

        let desired: HashMap<String, QueueSpec> = topology
            .queues
            .iter()
            .map(|q| (q.name.clone(), q.clone()))
            .collect();

        let new_connections = topology.connections.max(1);
        let connections_changed =
            self.connections.swap(new_connections, Ordering::SeqCst) != new_connections;

        let mut consumers = self.consumers.write().await;
        let mut specs = self.queue_specs.write().await;

        let existing: Vec<String> = consumers.keys().cloned().collect();
        for name in existing {
            let keep = match desired.get(&name) {
                Some(spec) => !connections_changed && specs.get(&name) == Some(spec),
                None => false,
            };
            if keep {
                continue;
            }

            if let Some(consumer) = consumers.remove(&name) {
                info!(queue = %name, "Stopping consumer");
                consumer.stop().await;
                specs.remove(&name);
                removed += 1;
            }
        }

        if let Some(ref factory) = self.consumer_factory {
            for (name, queue_spec) in &desired {
                if consumers.contains_key(name) {
                    continue;
                }
                match factory.create_consumer(queue_spec).await {
                    Ok(consumer) => {
                        info!(queue = %name, connections = new_connections, "Starting consumer");
                        consumers.insert(name.clone(), Arc::clone(&consumer));
                        specs.insert(name.clone(), queue_spec.clone());
                        crate::runner::spawn_consumer_loops(
                            Arc::clone(self),
                            consumer,
                            new_connections,
                        );
                        created += 1;
                    }
                    Err(e) => {
                        error!(queue = %name, error = %e, "Failed to create consumer");
                        self.warnings.add_warning(
                            WarningKind::Configuration,
                            WarningSeverity::Critical,
                            format!("Failed to create consumer for queue [{name}]: {e}"),
                            "RouterManager".to_string(),
                        );
                    }
                }
            }
        } else {
            for name in desired.keys() {
                if !consumers.contains_key(name) {
                    warn!(
                        queue = %name,
                        "Queue configured but no consumer factory wired; consumer not created"
                    );
                }
            }
        }

        (created, removed)
    }

    /// Register a pre-built consumer and start its poll loops. Used by tests
    /// and embedded setups that bypass the factory.
    pub async fn attach_consumer(self: &Arc<Self>, consumer: Arc<dyn BrokerConsumer>) {
        let name = consumer.identifier().to_string();
        self.consumers
            .write()
            .await
            .insert(name, Arc::clone(&consumer));
        let connections = self.connections.load(Ordering::SeqCst).max(1);
        crate::runner::spawn_consumer_loops(Arc::clone(self), consumer, connections);
    }

    // ========================================================================
    // Background maintenance
    // ========================================================================

    /// Reap draining pools that have finished their in-flight work.
    pub async fn cleanup_draining_pools(&self) {
        let mut done = Vec::new();
        for entry in self.draining_pools.iter() {
            if entry.value().is_fully_drained() {
                done.push(*entry.key());
            }
        }

        for key in done {
            if let Some((_, pool)) = self.draining_pools.remove(&key) {
                info!(pool_code = %pool.code(), "Drained pool terminated");
                pool.shutdown(self.config.pool_shutdown_grace).await;
            }
        }
    }

    /// Scan for in-flight entries past the leak threshold. Leaked entries
    /// are reported, never force-removed: a forced removal would open the
    /// door to a duplicate delivery.
    pub fn check_for_leaks(&self) {
        metrics::set_in_flight_count(self.in_flight.len());

        let threshold = self.config.leak_threshold.as_secs();
        let mut leaked = 0usize;
        let mut oldest = 0u64;

        for entry in self.in_flight.iter() {
            let age = entry.value().age_seconds();
            if age >= threshold {
                leaked += 1;
                oldest = oldest.max(age);
            }
        }

        if leaked > 0 {
            warn!(
                leaked,
                oldest_seconds = oldest,
                threshold_seconds = threshold,
                "In-flight entries exceed leak threshold"
            );
            self.warnings.add_warning(
                WarningKind::Leak,
                WarningSeverity::Error,
                format!(
                    "{leaked} in-flight entries older than {threshold}s (oldest {oldest}s); entries are kept to avoid duplicate delivery"
                ),
                "RouterManager".to_string(),
            );
        }
    }

    /// Refresh per-pool gauges; also called on a short ticker.
    pub fn publish_gauges(&self) {
        for entry in self.pools.iter() {
            entry.value().publish_gauges();
        }
        metrics::set_in_flight_count(self.in_flight.len());
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop intake, drain pools until empty or the deadline fires, then
    /// terminate.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("Router shutting down");
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        {
            let consumers = self.consumers.read().await;
            for consumer in consumers.values() {
                consumer.stop().await;
            }
        }

        for entry in self.pools.iter() {
            entry.value().drain();
        }

        let cutoff = Instant::now() + deadline;
        while !self.all_pools_drained() && Instant::now() < cutoff {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // snapshot before awaiting; map guards must not live across awaits
        let mut pools: Vec<Arc<ProcessPool>> =
            self.pools.iter().map(|e| e.value().clone()).collect();
        pools.extend(self.draining_pools.iter().map(|e| e.value().clone()));
        for pool in pools {
            pool.shutdown(Duration::ZERO).await;
        }

        let remaining = self.in_flight.len();
        if remaining > 0 {
            warn!(remaining, "Messages still in flight at shutdown; brokers will redeliver");
        }

        info!("Router shutdown complete");
    }

    fn all_pools_drained(&self) -> bool {
        self.pools.iter().all(|e| e.value().is_fully_drained())
            && self
                .draining_pools
                .iter()
                .all(|e| e.value().is_fully_drained())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Ready once the first sync has landed and a consumer is alive.
    pub async fn is_ready(&self) -> bool {
        if !self.synced.load(Ordering::SeqCst) {
            return false;
        }
        let consumers = self.consumers.read().await;
        consumers.values().any(|c| c.is_healthy())
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn pool(&self, code: &str) -> Option<Arc<ProcessPool>> {
        self.pools.get(code).map(|e| e.value().clone())
    }

    pub fn draining_pool_count(&self) -> usize {
        self.draining_pools.len()
    }

    pub fn pool_snapshots(&self) -> Vec<PoolSnapshot> {
        let mut snapshots: Vec<PoolSnapshot> =
            self.pools.iter().map(|e| e.value().snapshot()).collect();
        snapshots.extend(self.draining_pools.iter().map(|e| e.value().snapshot()));
        snapshots
    }

    pub async fn consumer_ids(&self) -> Vec<String> {
        self.consumers.read().await.keys().cloned().collect()
    }
}
