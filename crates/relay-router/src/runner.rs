//! Consumer poll loops.
//!
//! Each queue gets `connections` independent loops against its consumer.
//! A loop long-polls, stamps the batch, and routes every message; it exits
//! on the shutdown signal or when its consumer reports stopped.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use relay_broker::{BrokerConsumer, BrokerError};
use relay_core::{WarningKind, WarningSeverity};

use crate::manager::RouterManager;
use crate::metrics;

const EMPTY_POLL_PAUSE: Duration = Duration::from_millis(100);
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(1);

pub fn spawn_consumer_loops(
    manager: Arc<RouterManager>,
    consumer: Arc<dyn BrokerConsumer>,
    connections: u32,
) {
    for worker in 0..connections.max(1) {
        let manager = Arc::clone(&manager);
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move {
            run_poll_loop(manager, consumer, worker).await;
        });
    }
}

async fn run_poll_loop(
    manager: Arc<RouterManager>,
    consumer: Arc<dyn BrokerConsumer>,
    worker: u32,
) {
    let queue = consumer.identifier().to_string();
    let max_per_poll = manager.max_messages_per_poll();
    let mut shutdown_rx = manager.subscribe_shutdown();

    info!(queue = %queue, worker, "Consumer loop started");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(queue = %queue, worker, "Consumer loop stopping on shutdown signal");
                break;
            }
            polled = consumer.poll(max_per_poll) => {
                match polled {
                    Ok(batch) => {
                        metrics::record_consumer_poll(&queue, batch.messages.len());

                        if batch.malformed > 0 {
                            metrics::record_parse_failures(&queue, batch.malformed);
                            manager.warnings().add_warning(
                                WarningKind::ParseError,
                                WarningSeverity::Warn,
                                format!(
                                    "{} malformed payload(s) nacked on queue [{}]",
                                    batch.malformed, queue
                                ),
                                format!("ConsumerRunner:{queue}"),
                            );
                        }

                        if batch.messages.is_empty() {
                            tokio::time::sleep(EMPTY_POLL_PAUSE).await;
                            continue;
                        }

                        let poll_batch = manager.next_poll_batch();
                        for msg in batch.messages {
                            let outcome = manager.route(msg, &consumer, &poll_batch).await;
                            debug!(queue = %queue, outcome = ?outcome, "Routed message");
                        }
                    }
                    Err(BrokerError::Stopped) => {
                        info!(queue = %queue, worker, "Consumer stopped, loop exiting");
                        break;
                    }
                    Err(e) => {
                        warn!(queue = %queue, worker, error = %e, "Poll failed, backing off");
                        tokio::time::sleep(POLL_ERROR_PAUSE).await;
                    }
                }
            }
        }
    }
}
