//! Sliding-window circuit breakers, one per downstream origin.
//!
//! A breaker watches the last N request outcomes. It opens when the failure
//! share in a full window reaches the threshold, half-opens after a cooldown,
//! and closes again after a run of consecutive successes.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of recent outcomes considered.
    pub window_size: usize,
    /// Failure share in a full window that opens the breaker.
    pub failure_rate_threshold: f64,
    /// Time an open breaker waits before allowing probes.
    pub cooldown: Duration,
    /// Consecutive half-open successes needed to close.
    pub close_after_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_secs(5),
            close_after_successes: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    origin: String,
    config: BreakerConfig,
    state: RwLock<BreakerState>,
    window: Mutex<VecDeque<bool>>,
    half_open_successes: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    total_rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(origin: String, config: BreakerConfig) -> Self {
        Self {
            origin,
            config,
            state: RwLock::new(BreakerState::Closed),
            window: Mutex::new(VecDeque::new()),
            half_open_successes: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Whether a request may proceed. An open breaker transitions to
    /// half-open once the cooldown has elapsed.
    pub fn allow_request(&self) -> bool {
        let state = *self.state.read();

        match state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self.opened_at.read().map(|t| t.elapsed());
                if matches!(elapsed, Some(e) if e >= self.config.cooldown) {
                    *self.state.write() = BreakerState::HalfOpen;
                    self.half_open_successes.store(0, Ordering::SeqCst);
                    debug!(origin = %self.origin, "Circuit breaker half-open");
                    true
                } else {
                    self.total_rejected.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.push_outcome(true);

        let state = *self.state.read();
        if state == BreakerState::HalfOpen {
            let run = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if run >= self.config.close_after_successes {
                *self.state.write() = BreakerState::Closed;
                self.window.lock().clear();
                info!(origin = %self.origin, successes = run, "Circuit breaker closed");
            }
        }
    }

    pub fn record_failure(&self) {
        self.push_outcome(false);

        let state = *self.state.read();
        match state {
            BreakerState::HalfOpen => {
                // a probe failed - straight back to open
                self.trip();
            }
            BreakerState::Closed => {
                let window = self.window.lock();
                if window.len() >= self.config.window_size {
                    let failures = window.iter().filter(|ok| !**ok).count();
                    let rate = failures as f64 / window.len() as f64;
                    if rate >= self.config.failure_rate_threshold {
                        drop(window);
                        self.trip();
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    fn push_outcome(&self, ok: bool) {
        let mut window = self.window.lock();
        if window.len() >= self.config.window_size {
            window.pop_front();
        }
        window.push_back(ok);
    }

    fn trip(&self) {
        *self.state.write() = BreakerState::Open;
        *self.opened_at.write() = Some(Instant::now());
        self.half_open_successes.store(0, Ordering::SeqCst);
        warn!(origin = %self.origin, "Circuit breaker opened");
    }

    pub fn state(&self) -> BreakerState {
        *self.state.read()
    }

    pub fn stats(&self) -> BreakerStats {
        let window = self.window.lock();
        let failures = window.iter().filter(|ok| !**ok).count();
        BreakerStats {
            origin: self.origin.clone(),
            state: self.state(),
            buffered_calls: window.len() as u32,
            buffered_failures: failures as u32,
            rejected_calls: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub origin: String,
    pub state: BreakerState,
    pub buffered_calls: u32,
    pub buffered_failures: u32,
    pub rejected_calls: u64,
}

/// One breaker per downstream origin (scheme + host + port). Targets that do
/// not parse as URLs share a breaker keyed by the raw string.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn for_target(&self, target: &str) -> Arc<CircuitBreaker> {
        let origin = origin_of(target);
        self.breakers
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(origin, self.config.clone())))
            .clone()
    }

    pub fn stats(&self) -> Vec<BreakerStats> {
        self.breakers.iter().map(|e| e.value().stats()).collect()
    }
}

fn origin_of(target: &str) -> String {
    match reqwest::Url::parse(target) {
        Ok(url) => {
            let scheme = url.scheme();
            let host = url.host_str().unwrap_or("");
            match url.port() {
                Some(port) => format!("{scheme}://{host}:{port}"),
                None => format!("{scheme}://{host}"),
            }
        }
        Err(_) => target.to_string(),
    }
}
