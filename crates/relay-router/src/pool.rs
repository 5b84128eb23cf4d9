//! Process pool: per-group FIFO queues multiplexed onto workers that retire
//! when idle, under a pool-wide concurrency semaphore and an optional
//! non-blocking rate limit.
//!
//! One worker task per live group. The worker owns the group's receive side;
//! creation is atomic with respect to concurrent submitters (the live-worker
//! set plus the closed-channel retry in `try_submit` cover the idle-exit
//! race). Every accepted job produces exactly one disposition, on every
//! path, including mediator panics.

use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use relay_core::{
    Disposition, MediationResult, MessagePointer, PoolSnapshot, PoolSpec, WarningKind,
    WarningSeverity,
};

use crate::mediator::Mediator;
use crate::metrics::PoolMetrics;
use crate::warning::WarningService;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Default idle window after which a group worker retires.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Redelivery delay for cascade nacks; short, the broker preserves order.
const CASCADE_NACK_DELAY: u32 = 1;

/// Composite key for batch+group failure tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchGroupKey {
    batch_id: Arc<str>,
    group_id: Arc<str>,
}

impl BatchGroupKey {
    fn new(batch_id: &str, group_id: &Arc<str>) -> Self {
        Self {
            batch_id: Arc::from(batch_id),
            group_id: Arc::clone(group_id),
        }
    }
}

impl std::fmt::Display for BatchGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.batch_id, self.group_id)
    }
}

/// A unit of work handed to a pool. The sender half of `done` is consumed by
/// exactly one terminal disposition; dropping it unreplied reads as a nack
/// upstream.
#[derive(Debug)]
pub struct DispatchJob {
    pub pointer: MessagePointer,
    /// Resolved batch identity (wire batch id or the poll-generated one).
    pub batch_id: Option<Arc<str>>,
    pub done: oneshot::Sender<Disposition>,
}

/// What actually travels through a group queue.
struct WorkerJob {
    pointer: MessagePointer,
    batch_key: Option<BatchGroupKey>,
    done: oneshot::Sender<Disposition>,
}

impl WorkerJob {
    fn into_dispatch(self) -> DispatchJob {
        DispatchJob {
            batch_id: self.batch_key.as_ref().map(|k| Arc::clone(&k.batch_id)),
            pointer: self.pointer,
            done: self.done,
        }
    }
}

/// State shared between the pool handle and its group workers.
struct PoolShared {
    code: Arc<str>,
    semaphore: Arc<Semaphore>,
    mediator: Arc<dyn Mediator>,
    metrics: Arc<dyn PoolMetrics>,
    warnings: Option<Arc<WarningService>>,

    group_queues: DashMap<Arc<str>, mpsc::Sender<WorkerJob>>,
    /// Groups whose worker task is alive, tagged with the worker's
    /// generation so a retiring worker cannot unregister its replacement.
    live_workers: DashMap<Arc<str>, u64>,
    worker_seq: AtomicU64,

    failed_batch_groups: DashSet<BatchGroupKey>,
    batch_group_remaining: DashMap<BatchGroupKey, AtomicU32>,

    limiter: RwLock<Option<Arc<DirectLimiter>>>,

    queued: AtomicU32,
    active: AtomicU32,
    idle_timeout: Duration,
}

impl PoolShared {
    fn publish_gauges(&self) {
        self.metrics.update_pool_gauges(
            &self.code,
            self.active.load(Ordering::SeqCst),
            self.semaphore.available_permits() as u32,
            self.queued.load(Ordering::SeqCst),
            self.group_queues.len() as u32,
        );
    }

    /// Decrement the batch+group counter; when it hits zero, reclaim both
    /// the counter and any failure marker. The guard ref is dropped before
    /// removal to keep dashmap happy.
    fn settle_batch_group(&self, key: &BatchGroupKey) {
        let emptied = if let Some(counter) = self.batch_group_remaining.get(key) {
            counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1) == 0
        } else {
            false
        };

        if emptied {
            self.batch_group_remaining.remove(key);
            self.failed_batch_groups.remove(key);
            debug!(batch_group = %key, "Batch+group settled, tracking cleared");
        }
    }

    fn try_rate_limit(&self) -> bool {
        match self.limiter.read().as_ref() {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }
}

/// A named execution domain with its own concurrency and rate-limit budget.
pub struct ProcessPool {
    spec: PoolSpec,
    shared: Arc<PoolShared>,
    accepting: AtomicBool,
    draining: AtomicBool,
}

impl ProcessPool {
    pub fn new(
        spec: PoolSpec,
        mediator: Arc<dyn Mediator>,
        metrics: Arc<dyn PoolMetrics>,
    ) -> Self {
        Self::with_idle_timeout(spec, mediator, metrics, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        spec: PoolSpec,
        mediator: Arc<dyn Mediator>,
        metrics: Arc<dyn PoolMetrics>,
        idle_timeout: Duration,
    ) -> Self {
        let limiter = spec
            .rate_limit_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))));

        let shared = PoolShared {
            code: Arc::from(spec.code.as_str()),
            semaphore: Arc::new(Semaphore::new(spec.concurrency.max(1) as usize)),
            mediator,
            metrics,
            warnings: None,
            group_queues: DashMap::new(),
            live_workers: DashMap::new(),
            worker_seq: AtomicU64::new(0),
            failed_batch_groups: DashSet::new(),
            batch_group_remaining: DashMap::new(),
            limiter: RwLock::new(limiter),
            queued: AtomicU32::new(0),
            active: AtomicU32::new(0),
            idle_timeout,
        };

        Self {
            spec,
            shared: Arc::new(shared),
            accepting: AtomicBool::new(true),
            draining: AtomicBool::new(false),
        }
    }

    pub fn set_warning_service(&mut self, warnings: Arc<WarningService>) {
        // only reachable before the pool is shared with workers
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.warnings = Some(warnings);
        }
    }

    pub fn start(&self) {
        info!(
            pool_code = %self.spec.code,
            concurrency = self.spec.concurrency,
            rate_limit = ?self.spec.rate_limit_per_minute,
            "Process pool started"
        );
        self.shared.metrics.initialize_pool(
            &self.spec.code,
            self.spec.concurrency,
            self.spec.queue_capacity_per_group(),
        );
    }

    pub fn spec(&self) -> &PoolSpec {
        &self.spec
    }

    pub fn code(&self) -> &str {
        &self.spec.code
    }

    /// Submit a job without blocking.
    ///
    /// Returns the job on refusal (pool draining or group queue full) so the
    /// caller can nack and clean up its own tracking; nothing of this pool's
    /// state leaks in that case.
    pub fn try_submit(&self, job: DispatchJob) -> Result<(), DispatchJob> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(job);
        }

        let shared = &self.shared;
        let group_id: Arc<str> = Arc::from(job.pointer.group_id());

        let batch_key = job
            .batch_id
            .as_deref()
            .map(|batch| BatchGroupKey::new(batch, &group_id));

        if let Some(ref key) = batch_key {
            shared
                .batch_group_remaining
                .entry(key.clone())
                .or_insert_with(|| AtomicU32::new(0))
                .fetch_add(1, Ordering::SeqCst);
        }

        shared.metrics.message_submitted(&shared.code);

        let mut worker_job = WorkerJob {
            pointer: job.pointer,
            batch_key: batch_key.clone(),
            done: job.done,
        };

        // The first send may race a worker that exited on idle and left a
        // closed sender behind; one retry installs a fresh worker.
        let mut closed_attempts = 0;
        loop {
            let tx = self.group_sender(&group_id);
            match tx.try_send(worker_job) {
                Ok(()) => {
                    shared.queued.fetch_add(1, Ordering::SeqCst);
                    shared.publish_gauges();
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    debug!(
                        pool_code = %shared.code,
                        group_id = %group_id,
                        "Group queue full, refusing submission"
                    );
                    if let Some(ref key) = batch_key {
                        shared.settle_batch_group(key);
                    }
                    return Err(returned.into_dispatch());
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    closed_attempts += 1;
                    if closed_attempts >= 2 {
                        error!(
                            pool_code = %shared.code,
                            group_id = %group_id,
                            "Group queue unavailable after retry"
                        );
                        if let Some(ref key) = batch_key {
                            shared.settle_batch_group(key);
                        }
                        return Err(returned.into_dispatch());
                    }
                    debug!(
                        pool_code = %shared.code,
                        group_id = %group_id,
                        "Group worker retired mid-submit, recreating"
                    );
                    self.shared.group_queues.remove(&group_id);
                    worker_job = returned;
                }
            }
        }
    }

    /// Fetch the group's sender, spawning its worker if the group is new or
    /// its previous worker has exited.
    fn group_sender(&self, group_id: &Arc<str>) -> mpsc::Sender<WorkerJob> {
        if let Some(tx) = self.shared.group_queues.get(group_id) {
            if self.shared.live_workers.contains_key(group_id) {
                return tx.clone();
            }
        }
        self.shared.group_queues.remove(group_id);

        let capacity = self.spec.queue_capacity_per_group() as usize;
        let (tx, rx) = mpsc::channel(capacity);
        let generation = self.shared.worker_seq.fetch_add(1, Ordering::SeqCst);
        self.shared
            .group_queues
            .insert(Arc::clone(group_id), tx.clone());
        self.shared
            .live_workers
            .insert(Arc::clone(group_id), generation);

        let shared = Arc::clone(&self.shared);
        let group = Arc::clone(group_id);
        tokio::spawn(async move {
            run_group_worker(shared, group, generation, rx).await;
        });

        tx
    }

    /// Stop admitting work; running and queued jobs complete normally.
    pub fn drain(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        self.draining.store(true, Ordering::SeqCst);
        info!(pool_code = %self.spec.code, "Pool draining");
    }

    pub fn is_fully_drained(&self) -> bool {
        self.shared.queued.load(Ordering::SeqCst) == 0
            && self.shared.active.load(Ordering::SeqCst) == 0
    }

    /// Drain, wait up to `grace`, then cut the remaining workers loose.
    /// Jobs still queued at the cutoff are nacked via dropped channels.
    pub async fn shutdown(&self, grace: Duration) {
        self.drain();

        let deadline = Instant::now() + grace;
        while !self.is_fully_drained() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.shared.group_queues.clear();
        self.shared.semaphore.close();
        info!(
            pool_code = %self.spec.code,
            drained = self.is_fully_drained(),
            "Pool shut down"
        );
    }

    pub fn queue_size(&self) -> u32 {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> u32 {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn group_count(&self) -> u32 {
        self.shared.group_queues.len() as u32
    }

    pub fn publish_gauges(&self) {
        self.shared.publish_gauges();
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            pool_code: self.spec.code.clone(),
            concurrency: self.spec.concurrency,
            active: self.shared.active.load(Ordering::SeqCst),
            available_permits: self.shared.semaphore.available_permits() as u32,
            queue_size: self.shared.queued.load(Ordering::SeqCst),
            group_count: self.shared.group_queues.len() as u32,
            queue_capacity_per_group: self.spec.queue_capacity_per_group(),
            rate_limit_per_minute: self.spec.rate_limit_per_minute,
            draining: self.draining.load(Ordering::SeqCst),
        }
    }
}

/// Dedicated loop for one message group. FIFO is structural: this is the
/// only consumer of the group's channel.
async fn run_group_worker(
    shared: Arc<PoolShared>,
    group_id: Arc<str>,
    generation: u64,
    mut rx: mpsc::Receiver<WorkerJob>,
) {
    debug!(pool_code = %shared.code, group_id = %group_id, "Group worker started");

    loop {
        let job = match tokio::time::timeout(shared.idle_timeout, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(group_id = %group_id, "Group channel closed, worker exiting");
                break;
            }
            Err(_) => {
                if rx.is_empty() {
                    // Retire. The map entry goes first so late submitters
                    // see a closed channel and recreate the group.
                    shared.group_queues.remove(&group_id);
                    debug!(group_id = %group_id, "Group idle, worker retiring");
                    break;
                }
                continue;
            }
        };

        shared.queued.fetch_sub(1, Ordering::SeqCst);

        // 1. Cascading failure: once a batch+group member failed, the rest
        //    of that key is nacked unseen so the broker can redeliver the
        //    whole run in order.
        if let Some(ref key) = job.batch_key {
            if shared.failed_batch_groups.contains(key) {
                debug!(
                    message_id = %job.pointer.id,
                    batch_group = %key,
                    "Batch+group already failed, cascading nack"
                );
                shared.settle_batch_group(key);
                let _ = job.done.send(Disposition::Nack {
                    delay_seconds: Some(CASCADE_NACK_DELAY),
                });
                shared.publish_gauges();
                continue;
            }
        }

        // 2. Rate limit, try-only, checked before the semaphore so a
        //    rejected message never holds a concurrency slot.
        if !shared.try_rate_limit() {
            shared.metrics.rate_limit_exceeded(&shared.code);
            debug!(
                message_id = %job.pointer.id,
                pool_code = %shared.code,
                "Rate limited, fast-fail nack"
            );
            if let Some(ref key) = job.batch_key {
                shared.settle_batch_group(key);
            }
            let _ = job.done.send(Disposition::FastRetry);
            shared.publish_gauges();
            continue;
        }

        // 3. Concurrency permit; released by RAII on every path below.
        let permit = match shared.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                // semaphore closed: pool is shutting down
                if let Some(ref key) = job.batch_key {
                    shared.settle_batch_group(key);
                }
                let _ = job.done.send(Disposition::Nack {
                    delay_seconds: Some(5),
                });
                break;
            }
        };

        shared.active.fetch_add(1, Ordering::SeqCst);

        // 4. Mediate, guarded against panics so the worker survives and the
        //    broker still hears a verdict.
        let started = Instant::now();
        let mediation = std::panic::AssertUnwindSafe(shared.mediator.process(&job.pointer))
            .catch_unwind()
            .await;
        let duration = started.elapsed();

        // 5. Dispatch on the result.
        let disposition = match mediation {
            Ok(outcome) => match outcome.result {
                MediationResult::Success => {
                    shared.metrics.processing_success(&shared.code, duration);
                    Disposition::Ack
                }
                MediationResult::ErrorConfig => {
                    // permanent: ack so the broker stops redelivering; the
                    // mediator already raised the critical warning
                    shared
                        .metrics
                        .processing_failure(&shared.code, duration, outcome.result.as_str());
                    Disposition::Ack
                }
                MediationResult::ErrorProcess
                | MediationResult::ErrorServer
                | MediationResult::ErrorConnection => {
                    shared
                        .metrics
                        .processing_failure(&shared.code, duration, outcome.result.as_str());
                    mark_batch_group_failed(&shared, &job);
                    Disposition::Nack {
                        delay_seconds: outcome.retry_delay_seconds,
                    }
                }
            },
            Err(_) => {
                error!(
                    message_id = %job.pointer.id,
                    pool_code = %shared.code,
                    "Mediator produced no result, treating as server error"
                );
                if let Some(ref warnings) = shared.warnings {
                    warnings.add_warning(
                        WarningKind::MediatorNullResult,
                        WarningSeverity::Critical,
                        format!(
                            "Mediator returned no result for message [{}] in pool [{}]",
                            job.pointer.id, shared.code
                        ),
                        format!("ProcessPool:{}", shared.code),
                    );
                }
                shared
                    .metrics
                    .processing_failure(&shared.code, duration, "ERROR_SERVER");
                mark_batch_group_failed(&shared, &job);
                Disposition::Nack {
                    delay_seconds: Some(5),
                }
            }
        };

        // cleanup first, then make the verdict observable
        if let Some(ref key) = job.batch_key {
            shared.settle_batch_group(key);
        }
        shared.active.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        let _ = job.done.send(disposition);
        shared.publish_gauges();
    }

    shared
        .live_workers
        .remove_if(&group_id, |_, live_generation| *live_generation == generation);
    shared.publish_gauges();
    debug!(pool_code = %shared.code, group_id = %group_id, "Group worker exited");
}

fn mark_batch_group_failed(shared: &PoolShared, job: &WorkerJob) {
    if let Some(ref key) = job.batch_key {
        if shared.failed_batch_groups.insert(key.clone()) {
            warn!(
                batch_group = %key,
                pool_code = %shared.code,
                "Batch+group marked failed, remaining members will cascade"
            );
        }
    }
}
