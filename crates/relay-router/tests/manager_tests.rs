//! RouterManager behavior: routing outcomes, global dedup, ack/nack parity,
//! leak reporting, shutdown, and the consumer poll loop.

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use common::{make_pointer, make_polled, wait_until, FakeConsumer, RecordingMetrics};
use relay_broker::BrokerConsumer;
use relay_core::{
    MediationOutcome, MessagePointer, PoolSpec, RouteOutcome, Topology, WarningKind,
};
use relay_router::{
    Mediator, RouterManager, RouterManagerConfig, WarningService,
};

struct CountingMediator {
    calls: AtomicU32,
    /// When present, calls block until permits arrive.
    gate: Option<Arc<Semaphore>>,
}

impl CountingMediator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            gate: None,
        })
    }

    fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            gate: Some(gate),
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mediator for CountingMediator {
    async fn process(&self, _pointer: &MessagePointer) -> MediationOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref gate) = self.gate {
            let _ = gate.acquire().await;
        }
        MediationOutcome::success(200)
    }
}

fn topology(pools: Vec<PoolSpec>) -> Topology {
    Topology {
        queues: vec![],
        connections: 1,
        pools,
    }
}

fn pool_spec(code: &str, concurrency: u32) -> PoolSpec {
    PoolSpec {
        code: code.to_string(),
        concurrency,
        rate_limit_per_minute: None,
    }
}

async fn simple_manager(
    mediator: Arc<dyn Mediator>,
    warnings: Arc<WarningService>,
) -> Arc<RouterManager> {
    let manager = Arc::new(RouterManager::new(
        mediator,
        RecordingMetrics::new(),
        warnings,
    ));
    manager
        .reload(&topology(vec![pool_spec("P", 2)]))
        .await
        .unwrap();
    manager
}

#[tokio::test]
async fn happy_path_three_messages_acked() {
    let mediator = CountingMediator::new();
    let warnings = Arc::new(WarningService::default());
    let manager = simple_manager(mediator.clone(), warnings).await;

    let consumer = FakeConsumer::new("q");
    let consumer_dyn: Arc<dyn BrokerConsumer> = consumer.clone();
    let batch = manager.next_poll_batch();

    for id in ["a", "b", "c"] {
        let outcome = manager
            .route(
                make_polled(make_pointer(id, "P", None, None), "q"),
                &consumer_dyn,
                &batch,
            )
            .await;
        assert_eq!(outcome, RouteOutcome::Accepted);
    }

    assert!(wait_until(|| consumer.acked().len() == 3, Duration::from_secs(5)).await);
    assert_eq!(mediator.call_count(), 3);
    assert!(consumer.nacked().is_empty());
    assert_eq!(manager.in_flight_count(), 0);
}

#[tokio::test]
async fn unknown_pool_is_rejected_with_warning() {
    let warnings = Arc::new(WarningService::default());
    let manager = simple_manager(CountingMediator::new(), warnings.clone()).await;

    let consumer = FakeConsumer::new("q");
    let consumer_dyn: Arc<dyn BrokerConsumer> = consumer.clone();
    let batch = manager.next_poll_batch();

    let outcome = manager
        .route(
            make_polled(make_pointer("m", "NOPE", None, None), "q"),
            &consumer_dyn,
            &batch,
        )
        .await;

    assert_eq!(outcome, RouteOutcome::Rejected);
    assert_eq!(consumer.nacked().len(), 1);
    assert_eq!(manager.in_flight_count(), 0);
    assert_eq!(warnings.by_kind(WarningKind::UnknownPool).len(), 1);
}

#[tokio::test]
async fn duplicate_in_flight_is_suppressed() {
    // keep the first copy in flight while the duplicate arrives
    let gate = Arc::new(Semaphore::new(0));
    let mediator = CountingMediator::gated(gate.clone());
    let warnings = Arc::new(WarningService::default());
    let manager = simple_manager(mediator.clone(), warnings).await;

    let q1 = FakeConsumer::new("q1");
    let q2 = FakeConsumer::new("q2");
    let q1_dyn: Arc<dyn BrokerConsumer> = q1.clone();
    let q2_dyn: Arc<dyn BrokerConsumer> = q2.clone();
    let batch = manager.next_poll_batch();

    let first = manager
        .route(
            make_polled(make_pointer("x", "P", None, None), "q1"),
            &q1_dyn,
            &batch,
        )
        .await;
    assert_eq!(first, RouteOutcome::Accepted);

    // same id from a second queue while the original is still processing
    assert!(wait_until(|| manager.in_flight_count() == 1, Duration::from_secs(2)).await);
    let second = manager
        .route(
            make_polled(make_pointer("x", "P", None, None), "q2"),
            &q2_dyn,
            &batch,
        )
        .await;
    assert_eq!(second, RouteOutcome::DuplicateSuppressed);
    assert_eq!(q2.nacked().len(), 1);

    gate.add_permits(10);
    assert!(wait_until(|| q1.acked().len() == 1, Duration::from_secs(5)).await);

    // exactly one mediation, one ack, one nack
    assert_eq!(mediator.call_count(), 1);
    assert_eq!(q1.acked().len(), 1);
    assert_eq!(manager.in_flight_count(), 0);
}

#[tokio::test]
async fn same_id_can_fly_again_after_completion() {
    let mediator = CountingMediator::new();
    let warnings = Arc::new(WarningService::default());
    let manager = simple_manager(mediator.clone(), warnings).await;

    let consumer = FakeConsumer::new("q");
    let consumer_dyn: Arc<dyn BrokerConsumer> = consumer.clone();

    let batch = manager.next_poll_batch();
    manager
        .route(
            make_polled(make_pointer("x", "P", None, None), "q"),
            &consumer_dyn,
            &batch,
        )
        .await;
    assert!(wait_until(|| consumer.acked().len() == 1, Duration::from_secs(5)).await);

    // redelivery after completion is a new lifetime, not a duplicate
    let batch = manager.next_poll_batch();
    let outcome = manager
        .route(
            make_polled(make_pointer("x", "P", None, None), "q"),
            &consumer_dyn,
            &batch,
        )
        .await;
    assert_eq!(outcome, RouteOutcome::Accepted);
    assert!(wait_until(|| consumer.acked().len() == 2, Duration::from_secs(5)).await);
    assert_eq!(mediator.call_count(), 2);
}

#[tokio::test]
async fn conservation_accepted_equals_acked_plus_nacked() {
    let mediator = CountingMediator::new();
    let warnings = Arc::new(WarningService::default());
    let manager = simple_manager(mediator, warnings).await;

    let consumer = FakeConsumer::new("q");
    let consumer_dyn: Arc<dyn BrokerConsumer> = consumer.clone();
    let batch = manager.next_poll_batch();

    let mut accepted = 0;
    for i in 0..20 {
        let pointer = if i % 5 == 0 {
            make_pointer(&format!("m-{i}"), "NOPE", None, None) // rejected
        } else {
            make_pointer(&format!("m-{i}"), "P", Some("g"), None)
        };
        let outcome = manager
            .route(make_polled(pointer, "q"), &consumer_dyn, &batch)
            .await;
        if outcome == RouteOutcome::Accepted {
            accepted += 1;
        }
    }

    assert!(
        wait_until(
            || consumer.finalized_count() == 20 && manager.in_flight_count() == 0,
            Duration::from_secs(10),
        )
        .await,
        "every routed message must be finalized exactly once"
    );
    assert_eq!(consumer.acked().len(), accepted);
    assert_eq!(consumer.nacked().len(), 20 - accepted);
}

#[tokio::test]
async fn leak_scan_reports_but_keeps_entries() {
    let gate = Arc::new(Semaphore::new(0));
    let mediator = CountingMediator::gated(gate.clone());
    let warnings = Arc::new(WarningService::default());

    let manager = Arc::new(RouterManager::with_config(
        mediator,
        RecordingMetrics::new(),
        warnings.clone(),
        RouterManagerConfig {
            leak_threshold: Duration::ZERO,
            ..Default::default()
        },
    ));
    manager
        .reload(&topology(vec![pool_spec("P", 2)]))
        .await
        .unwrap();

    let consumer = FakeConsumer::new("q");
    let consumer_dyn: Arc<dyn BrokerConsumer> = consumer.clone();
    let batch = manager.next_poll_batch();
    manager
        .route(
            make_polled(make_pointer("slow", "P", None, None), "q"),
            &consumer_dyn,
            &batch,
        )
        .await;

    assert!(wait_until(|| manager.in_flight_count() == 1, Duration::from_secs(2)).await);
    manager.check_for_leaks();

    // reported, never force-removed
    assert_eq!(warnings.by_kind(WarningKind::Leak).len(), 1);
    assert_eq!(manager.in_flight_count(), 1);

    gate.add_permits(10);
    assert!(wait_until(|| manager.in_flight_count() == 0, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn shutdown_rejects_new_routes() {
    let warnings = Arc::new(WarningService::default());
    let manager = simple_manager(CountingMediator::new(), warnings).await;

    manager.shutdown(Duration::from_millis(200)).await;

    let consumer = FakeConsumer::new("q");
    let consumer_dyn: Arc<dyn BrokerConsumer> = consumer.clone();
    let batch = manager.next_poll_batch();
    let outcome = manager
        .route(
            make_polled(make_pointer("late", "P", None, None), "q"),
            &consumer_dyn,
            &batch,
        )
        .await;

    assert_eq!(outcome, RouteOutcome::Rejected);
    assert_eq!(consumer.nacked().len(), 1);
}

#[tokio::test]
async fn poll_loop_routes_seeded_messages() {
    let mediator = CountingMediator::new();
    let warnings = Arc::new(WarningService::default());
    let manager = simple_manager(mediator.clone(), warnings).await;

    let consumer = FakeConsumer::new("q");
    for id in ["a", "b", "c"] {
        consumer.seed(make_polled(make_pointer(id, "P", None, None), "q"));
    }

    manager.attach_consumer(consumer.clone()).await;

    assert!(
        wait_until(|| consumer.acked().len() == 3, Duration::from_secs(5)).await,
        "runner should poll, route, and ack all seeded messages"
    );
    assert_eq!(mediator.call_count(), 3);
    assert!(manager.is_ready().await);

    manager.shutdown(Duration::from_secs(1)).await;
}
