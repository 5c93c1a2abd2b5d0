//! # Fibonacci Backoff
//!
//! Progressive retry intervals for failing reconciliations.
//!
//! With a 1 minute floor the sequence is 1m, 1m, 2m, 3m, 5m, 8m, ... capped at
//! the configured maximum.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibonacciBackoff {
    max_minutes: u64,
    previous: u64,
    current: u64,
}

impl FibonacciBackoff {
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            max_minutes,
            previous: 0,
            current: min_minutes,
        }
    }

    /// Next interval in seconds; advances the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let minutes = self.current.min(self.max_minutes);
        let next = self.previous.saturating_add(self.current);
        self.previous = self.current;
        self.current = next;
        minutes * 60
    }
}

/// Backoff progress of one object
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            backoff: FibonacciBackoff::new(1, 10),
            error_count: 0,
        }
    }
}

impl BackoffState {
    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }
}

/// Per-object backoff states keyed by `namespace/name`
#[derive(Debug, Default)]
pub struct BackoffTracker {
    states: Mutex<HashMap<String, BackoffState>>,
}

impl BackoffTracker {
    /// Record a failure; returns the requeue delay in seconds and the consecutive error count
    pub fn record_failure(&self, key: &str) -> Option<(u64, u32)> {
        let mut states = self.states.lock().ok()?;
        let state = states.entry(key.to_string()).or_default();
        state.increment_error();
        Some((state.backoff.next_backoff_seconds(), state.error_count))
    }

    /// Forget the failures of an object after it reconciled successfully
    pub fn reset(&self, key: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(key);
        }
    }
}
