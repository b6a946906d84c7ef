//! Circuit Breaker Implementation
//!
//! Tracks failures per target and stops sending traffic to a target once it has
//! failed `failure_threshold` times, until `recovery_timeout` has passed since its
//! last failure.
//!
//! ## States:
//! - **Closed**: Normal operation, requests pass through while failures are counted
//! - **Open**: Threshold reached and the last failure is recent, requests fail fast
//! - **HalfOpen**: Only with `half_open: true`; after the recovery timeout a single
//!   trial request is admitted and its outcome decides between Closed and Open
//!
//! Without half-open mode the breaker closes purely by time: once the recovery
//! timeout has elapsed the target is reported closed, but the failure count is kept,
//! so the very next failure reopens it. A success always closes it immediately.
//!
//! ## Key Rust Concepts:
//! - One `parking_lot::RwLock` guards the whole map: `is_open` takes the read lock,
//!   everything that mutates takes the write lock
//! - `Instant` gives monotonic timestamps that are immune to wall-clock jumps
//! - The breaker is shared as `Arc<CircuitBreaker>`; there is no global registry

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::core::config::CircuitBreakerConfig;
use crate::core::error::GatewayError;

/// Externally visible state of one target's circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one target, for the admin API and tests
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub target: String,
    pub failure_count: u32,
    pub state: CircuitState,
    /// Milliseconds since the last recorded failure
    pub last_failure_ms_ago: Option<u64>,
}

#[derive(Debug, Clone)]
struct TargetState {
    failure_count: u32,
    last_failure_at: Option<Instant>,
    last_activity: Instant,
    /// Set while a half-open trial request is in flight
    trial_started_at: Option<Instant>,
}

impl TargetState {
    fn new(now: Instant) -> Self {
        Self {
            failure_count: 0,
            last_failure_at: None,
            last_activity: now,
            trial_started_at: None,
        }
    }
}

/// Per-target failure tracker shared by every request
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    targets: RwLock<HashMap<String, TargetState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            targets: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn threshold_reached(&self, state: &TargetState) -> bool {
        state.failure_count >= self.config.failure_threshold
    }

    /// Threshold reached and the last failure is within the recovery timeout
    fn tripped(&self, state: &TargetState, now: Instant) -> bool {
        self.threshold_reached(state)
            && state
                .last_failure_at
                .map_or(false, |at| now.duration_since(at) < self.config.recovery_timeout)
    }

    fn trial_in_flight(&self, state: &TargetState, now: Instant) -> bool {
        state
            .trial_started_at
            .map_or(false, |at| now.duration_since(at) < self.config.recovery_timeout)
    }

    fn state_at(&self, state: &TargetState, now: Instant) -> CircuitState {
        if !self.threshold_reached(state) {
            CircuitState::Closed
        } else if self.tripped(state, now) {
            CircuitState::Open
        } else if self.config.half_open {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }

    /// Whether requests to `target` are currently refused.
    ///
    /// Always false when the breaker is disabled. In half-open mode a target whose
    /// trial request is still in flight also reports open.
    pub fn is_open(&self, target: &str) -> bool {
        if !self.config.enabled {
            return false;
        }

        let now = Instant::now();
        let targets = self.targets.read();
        match targets.get(target) {
            Some(state) => {
                self.tripped(state, now)
                    || (self.config.half_open
                        && self.threshold_reached(state)
                        && self.trial_in_flight(state, now))
            }
            None => false,
        }
    }

    /// Admission check used by the dispatch pipeline.
    ///
    /// Same answer as `!is_open` unless half-open mode is on, in which case the first
    /// caller after the recovery timeout becomes the trial request and everybody else
    /// is refused until that trial reports back (or itself times out).
    pub fn allow_request(&self, target: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        if !self.config.half_open {
            return !self.is_open(target);
        }

        let now = Instant::now();
        let mut targets = self.targets.write();
        let Some(state) = targets.get_mut(target) else {
            return true;
        };

        if !self.threshold_reached(state) {
            return true;
        }
        if self.tripped(state, now) || self.trial_in_flight(state, now) {
            return false;
        }

        state.trial_started_at = Some(now);
        state.last_activity = now;
        tracing::info!(target_key = %target, "Circuit half-open, admitting trial request");
        true
    }

    /// A call to `target` succeeded: the circuit closes immediately
    pub fn record_success(&self, target: &str) {
        let mut targets = self.targets.write();
        if let Some(state) = targets.get_mut(target) {
            if self.threshold_reached(state) {
                tracing::info!(target_key = %target, "Circuit closed after successful call");
            }
            state.failure_count = 0;
            state.trial_started_at = None;
            state.last_activity = Instant::now();
        }
    }

    /// A call to `target` failed
    pub fn record_failure(&self, target: &str) {
        let now = Instant::now();
        let mut targets = self.targets.write();
        let state = targets
            .entry(target.to_string())
            .or_insert_with(|| TargetState::new(now));

        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(now);
        state.last_activity = now;
        state.trial_started_at = None;

        if state.failure_count == self.config.failure_threshold {
            tracing::warn!(
                target_key = %target,
                failures = state.failure_count,
                recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                "Circuit opened"
            );
        }
    }

    /// Charge `error` to `target` when it says something about the target's health.
    ///
    /// Returns whether a failure was recorded.
    pub fn record_error(&self, target: &str, error: &GatewayError) -> bool {
        if !error.counts_as_breaker_failure() {
            return false;
        }
        self.record_failure(target);
        true
    }

    /// Administrative override: forget recorded failures for `target`
    pub fn try_reset(&self, target: &str) {
        let mut targets = self.targets.write();
        if let Some(state) = targets.get_mut(target) {
            state.failure_count = 0;
            state.trial_started_at = None;
            state.last_activity = Instant::now();
            tracing::info!(target_key = %target, "Circuit manually reset");
        }
    }

    pub fn failure_count(&self, target: &str) -> u32 {
        self.targets
            .read()
            .get(target)
            .map_or(0, |state| state.failure_count)
    }

    pub fn state(&self, target: &str) -> CircuitState {
        if !self.config.enabled {
            return CircuitState::Closed;
        }
        let now = Instant::now();
        self.targets
            .read()
            .get(target)
            .map_or(CircuitState::Closed, |state| self.state_at(state, now))
    }

    pub fn snapshot(&self, target: &str) -> Option<CircuitBreakerSnapshot> {
        let now = Instant::now();
        let targets = self.targets.read();
        targets
            .get(target)
            .map(|state| self.snapshot_of(target, state, now))
    }

    /// Snapshot every tracked target, sorted by target key
    pub fn snapshot_all(&self) -> Vec<CircuitBreakerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<_> = self
            .targets
            .read()
            .iter()
            .map(|(target, state)| self.snapshot_of(target, state, now))
            .collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }

    fn snapshot_of(&self, target: &str, state: &TargetState, now: Instant) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            target: target.to_string(),
            failure_count: state.failure_count,
            state: if self.config.enabled {
                self.state_at(state, now)
            } else {
                CircuitState::Closed
            },
            last_failure_ms_ago: state
                .last_failure_at
                .map(|at| now.duration_since(at).as_millis() as u64),
        }
    }

    pub fn tracked_targets(&self) -> usize {
        self.targets.read().len()
    }

    /// Drop entries idle for at least `stale_after` that are not currently open.
    ///
    /// Returns how many entries were removed.
    pub fn sweep_stale(&self, stale_after: Duration) -> usize {
        let now = Instant::now();
        let mut targets = self.targets.write();
        let before = targets.len();
        targets.retain(|_, state| {
            now.duration_since(state.last_activity) < stale_after || self.tripped(state, now)
        });
        before - targets.len()
    }

    /// Run [`sweep_stale`](Self::sweep_stale) every `sweep_interval` until the task is aborted
    pub fn start_sweeper(breaker: Arc<Self>) -> JoinHandle<()> {
        let interval = breaker.config.sweep_interval;
        let stale_after = breaker.config.stale_after;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = breaker.sweep_stale(stale_after);
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = breaker.tracked_targets(),
                        "Swept stale circuit breaker entries"
                    );
                }
            }
        })
    }
}
