//! Batch+group failure cascade: once one member of a `(batch, group)` fails,
//! the rest are nacked unseen, and the tracking key is reclaimed when its
//! counter reaches zero.

mod common;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use common::{make_pointer, RecordingMetrics};
use relay_core::{
    Disposition, MediationOutcome, MessagePointer, PoolSpec, WarningKind,
};
use relay_router::{DispatchJob, Mediator, ProcessPool, WarningService, WarningServiceConfig};

/// Fails the ids it is told to; records everything it sees.
struct ScriptedMediator {
    failing_ids: HashSet<String>,
    seen: Mutex<Vec<String>>,
    panic_on: Option<String>,
}

impl ScriptedMediator {
    fn failing(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing_ids: ids.iter().map(|s| s.to_string()).collect(),
            seen: Mutex::new(Vec::new()),
            panic_on: None,
        })
    }

    fn panicking_on(id: &str) -> Arc<Self> {
        Arc::new(Self {
            failing_ids: HashSet::new(),
            seen: Mutex::new(Vec::new()),
            panic_on: Some(id.to_string()),
        })
    }

    fn seen_ids(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Mediator for ScriptedMediator {
    async fn process(&self, pointer: &MessagePointer) -> MediationOutcome {
        self.seen.lock().push(pointer.id.clone());

        if self.panic_on.as_deref() == Some(pointer.id.as_str()) {
            panic!("scripted mediator blow-up");
        }

        if self.failing_ids.contains(&pointer.id) {
            MediationOutcome::error_process(Some(500), "scripted failure")
        } else {
            MediationOutcome::success(200)
        }
    }
}

fn spec(code: &str, concurrency: u32) -> PoolSpec {
    PoolSpec {
        code: code.to_string(),
        concurrency,
        rate_limit_per_minute: None,
    }
}

fn make_job(
    pointer: MessagePointer,
    batch: Option<&str>,
) -> (DispatchJob, oneshot::Receiver<Disposition>) {
    let (done, rx) = oneshot::channel();
    (
        DispatchJob {
            pointer,
            batch_id: batch.map(Arc::from),
            done,
        },
        rx,
    )
}

async fn verdict(rx: oneshot::Receiver<Disposition>) -> Disposition {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("disposition not delivered in time")
        .expect("disposition channel dropped")
}

#[tokio::test]
async fn failure_cascades_through_batch_group() {
    let mediator = ScriptedMediator::failing(&["a"]);
    let pool = Arc::new(ProcessPool::new(
        spec("P", 2),
        mediator.clone(),
        RecordingMetrics::new(),
    ));
    pool.start();

    let (job_a, rx_a) = make_job(make_pointer("a", "P", Some("g"), Some("B")), Some("B"));
    let (job_b, rx_b) = make_job(make_pointer("b", "P", Some("g"), Some("B")), Some("B"));
    let (job_c, rx_c) = make_job(make_pointer("c", "P", Some("g"), Some("B")), Some("B"));

    pool.try_submit(job_a).unwrap();
    pool.try_submit(job_b).unwrap();
    pool.try_submit(job_c).unwrap();

    assert!(matches!(verdict(rx_a).await, Disposition::Nack { .. }));
    assert!(matches!(verdict(rx_b).await, Disposition::Nack { .. }));
    assert!(matches!(verdict(rx_c).await, Disposition::Nack { .. }));

    // only the first member ever reached the mediator
    assert_eq!(mediator.seen_ids(), vec!["a".to_string()]);
}

#[tokio::test]
async fn cascade_clears_when_counter_reaches_zero() {
    let mediator = ScriptedMediator::failing(&["a"]);
    let pool = Arc::new(ProcessPool::new(
        spec("P", 2),
        mediator.clone(),
        RecordingMetrics::new(),
    ));
    pool.start();

    let (job_a, rx_a) = make_job(make_pointer("a", "P", Some("g"), Some("B")), Some("B"));
    let (job_b, rx_b) = make_job(make_pointer("b", "P", Some("g"), Some("B")), Some("B"));
    pool.try_submit(job_a).unwrap();
    pool.try_submit(job_b).unwrap();

    let _ = verdict(rx_a).await;
    let _ = verdict(rx_b).await;

    // the key's counter hit zero above, so the same (batch, group) is clean
    // again: a redelivered member must be mediated, not auto-nacked
    let (job_d, rx_d) = make_job(make_pointer("d", "P", Some("g"), Some("B")), Some("B"));
    pool.try_submit(job_d).unwrap();

    assert_eq!(verdict(rx_d).await, Disposition::Ack);
    assert_eq!(mediator.seen_ids(), vec!["a".to_string(), "d".to_string()]);
}

#[tokio::test]
async fn failure_in_one_group_leaves_other_groups_alone() {
    let mediator = ScriptedMediator::failing(&["a"]);
    let pool = Arc::new(ProcessPool::new(
        spec("P", 4),
        mediator.clone(),
        RecordingMetrics::new(),
    ));
    pool.start();

    let (job_a, rx_a) = make_job(make_pointer("a", "P", Some("g1"), Some("B")), Some("B"));
    let (job_x, rx_x) = make_job(make_pointer("x", "P", Some("g2"), Some("B")), Some("B"));

    pool.try_submit(job_a).unwrap();
    pool.try_submit(job_x).unwrap();

    assert!(matches!(verdict(rx_a).await, Disposition::Nack { .. }));
    assert_eq!(verdict(rx_x).await, Disposition::Ack);
}

#[tokio::test]
async fn messages_without_batch_do_not_cascade() {
    let mediator = ScriptedMediator::failing(&["a"]);
    let pool = Arc::new(ProcessPool::new(
        spec("P", 2),
        mediator.clone(),
        RecordingMetrics::new(),
    ));
    pool.start();

    let (job_a, rx_a) = make_job(make_pointer("a", "P", Some("g"), None), None);
    let (job_b, rx_b) = make_job(make_pointer("b", "P", Some("g"), None), None);
    pool.try_submit(job_a).unwrap();
    pool.try_submit(job_b).unwrap();

    assert!(matches!(verdict(rx_a).await, Disposition::Nack { .. }));
    // no batch identity, so b is processed on its own merits
    assert_eq!(verdict(rx_b).await, Disposition::Ack);
    assert_eq!(mediator.seen_ids(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn panicking_mediator_nacks_and_raises_critical_warning() {
    let warnings = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let mediator = ScriptedMediator::panicking_on("a");

    let mut pool = ProcessPool::new(spec("P", 2), mediator.clone(), RecordingMetrics::new());
    pool.set_warning_service(warnings.clone());
    let pool = Arc::new(pool);
    pool.start();

    let (job_a, rx_a) = make_job(make_pointer("a", "P", Some("g"), Some("B")), Some("B"));
    let (job_b, rx_b) = make_job(make_pointer("b", "P", Some("g"), Some("B")), Some("B"));
    pool.try_submit(job_a).unwrap();
    pool.try_submit(job_b).unwrap();

    // the panic is absorbed, the message nacked, and the batch cascades
    assert!(matches!(verdict(rx_a).await, Disposition::Nack { .. }));
    assert!(matches!(verdict(rx_b).await, Disposition::Nack { .. }));

    let raised = warnings.by_kind(WarningKind::MediatorNullResult);
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].severity, relay_core::WarningSeverity::Critical);

    // the worker survived: a fresh batch on the same group still processes
    let (job_c, rx_c) = make_job(make_pointer("c", "P", Some("g"), Some("B2")), Some("B2"));
    pool.try_submit(job_c).unwrap();
    assert_eq!(verdict(rx_c).await, Disposition::Ack);
}
