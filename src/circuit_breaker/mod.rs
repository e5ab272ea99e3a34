//! Per-access-key circuit breaker (C2, §4.2).
//!
//! Unlike the teacher's `providers::circuit_breaker`, which packs one
//! provider's state into a single atomic counter with adaptive backoff,
//! this breaker is keyed per tenant and tracks a sliding window of failure
//! timestamps rather than a simple count — the spec requires failures to
//! age out after `failure_window_secs`, not just reset on success.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use uuid::Uuid;

use crate::{config::CircuitBreakerConfig, errors::ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    /// A single trial call has been admitted; `half_open_trial_in_flight`
    /// gates any further admission until it resolves.
    HalfOpen,
}

struct KeyState {
    state: State,
    /// Timestamps of failures within the last `failure_window`.
    window: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_trial_in_flight: bool,
}

impl KeyState {
    fn new() -> Self {
        Self {
            state: State::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_trial_in_flight: false,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    keys: DashMap<Uuid, Mutex<KeyState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            keys: DashMap::new(),
        }
    }

    /// §4.2 `is_open`: OPEN transitions to HALF_OPEN once the reset timeout
    /// elapses, admitting exactly one trial call.
    pub fn is_open(&self, access_key_id: Uuid) -> bool {
        let entry = self.keys.entry(access_key_id).or_insert_with(|| Mutex::new(KeyState::new()));
        let mut state = entry.lock().expect("circuit breaker mutex poisoned");

        match state.state {
            State::Closed => false,
            State::Open => {
                let opened_at = state.opened_at.expect("Open state always has opened_at");
                if Instant::now().duration_since(opened_at)
                    >= Duration::from_secs(self.config.reset_timeout_secs)
                {
                    state.state = State::HalfOpen;
                    state.half_open_trial_in_flight = true;
                    false
                } else {
                    true
                }
            }
            State::HalfOpen => {
                // At most one in-flight trial per key.
                if state.half_open_trial_in_flight {
                    true
                } else {
                    state.half_open_trial_in_flight = true;
                    false
                }
            }
        }
    }

    /// §4.2 `record_success`: clears the window, transitions any state to CLOSED.
    pub fn record_success(&self, access_key_id: Uuid) {
        if let Some(entry) = self.keys.get(&access_key_id) {
            let mut state = entry.lock().expect("circuit breaker mutex poisoned");
            state.state = State::Closed;
            state.window.clear();
            state.opened_at = None;
            state.half_open_trial_in_flight = false;
        }
    }

    /// §4.2 `record_failure`: only failure kinds that
    /// `ErrorKind::trips_circuit_breaker` count toward the window.
    pub fn record_failure(&self, access_key_id: Uuid, kind: ErrorKind) {
        if !kind.trips_circuit_breaker() {
            return;
        }

        let entry = self
            .keys
            .entry(access_key_id)
            .or_insert_with(|| Mutex::new(KeyState::new()));
        let mut state = entry.lock().expect("circuit breaker mutex poisoned");

        if state.state == State::HalfOpen {
            // A trial call failed: reopen immediately.
            state.state = State::Open;
            state.opened_at = Some(Instant::now());
            state.half_open_trial_in_flight = false;
            return;
        }

        let now = Instant::now();
        let window = Duration::from_secs(self.config.failure_window_secs);
        state.window.push_back(now);
        while let Some(&front) = state.window.front() {
            if now.duration_since(front) > window {
                state.window.pop_front();
            } else {
                break;
            }
        }

        if state.window.len() as u32 >= self.config.failure_threshold {
            state.state = State::Open;
            state.opened_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window_secs: 60,
            reset_timeout_secs: 1800,
        }
    }

    #[test]
    fn closed_by_default() {
        let cb = CircuitBreaker::new(config());
        assert!(!cb.is_open(Uuid::new_v4()));
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(config());
        let key = Uuid::new_v4();
        for _ in 0..2 {
            cb.record_failure(key, ErrorKind::ServerError);
            assert!(!cb.is_open(key));
        }
        cb.record_failure(key, ErrorKind::ServerError);
        assert!(cb.is_open(key));
    }

    #[test]
    fn non_tripping_kinds_are_ignored() {
        let cb = CircuitBreaker::new(config());
        let key = Uuid::new_v4();
        for _ in 0..10 {
            cb.record_failure(key, ErrorKind::ClientError);
        }
        assert!(!cb.is_open(key));
    }

    #[test]
    fn success_resets_window() {
        let cb = CircuitBreaker::new(config());
        let key = Uuid::new_v4();
        cb.record_failure(key, ErrorKind::ServerError);
        cb.record_failure(key, ErrorKind::ServerError);
        cb.record_success(key);
        cb.record_failure(key, ErrorKind::ServerError);
        assert!(!cb.is_open(key));
    }

    #[test]
    fn independent_per_key() {
        let cb = CircuitBreaker::new(config());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for _ in 0..3 {
            cb.record_failure(a, ErrorKind::ServerError);
        }
        assert!(cb.is_open(a));
        assert!(!cb.is_open(b));
    }
}
