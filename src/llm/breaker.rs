//! Per-key circuit breaker
//!
//! One Closed/Open/HalfOpen state machine per key (the pipeline keys by
//! provider name). Open circuits fail fast without touching the wrapped
//! operation; after the open timeout exactly one half-open probe is admitted,
//! and its outcome decides whether the circuit closes again.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::llm::{LLMError, LLMResult};

/// Breaker phases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Observable state of one circuit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            consecutive_failures: 0,
            total_requests: 0,
            successful_requests: 0,
            opened_at: None,
            open_until: None,
            last_error: None,
        }
    }

    /// Success rate since process start or the last reset.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

struct Circuit {
    state: CircuitState,
    /// Exclusive gate: true while the single half-open probe is in flight.
    probe_in_flight: bool,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Concurrent table of per-key circuits.
#[derive(Clone)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    circuits: Arc<DashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            circuits: Arc::new(DashMap::new()),
        }
    }

    /// Ask to perform a call under `key`.
    ///
    /// Returns a guard the caller must resolve with `record_success` or
    /// `record_failure`; dropping it unresolved releases any probe slot
    /// without counting an outcome (a cancelled call is neither).
    pub fn try_acquire(&self, key: &str) -> LLMResult<CallGuard> {
        let now = Utc::now();
        let mut circuit = self
            .circuits
            .entry(key.to_string())
            .or_insert_with(|| Circuit {
                state: CircuitState::new(),
                probe_in_flight: false,
            });

        match circuit.state.phase {
            CircuitPhase::Closed => Ok(self.guard(key, false)),
            CircuitPhase::Open => {
                let open_until = circuit.state.open_until.unwrap_or(now);
                if now >= open_until {
                    circuit.state.phase = CircuitPhase::HalfOpen;
                    circuit.probe_in_flight = true;
                    Ok(self.guard(key, true))
                } else {
                    Err(LLMError::CircuitOpen {
                        provider: key.to_string(),
                    })
                }
            }
            CircuitPhase::HalfOpen => {
                if circuit.probe_in_flight {
                    // Only one probe at a time; everyone else fails fast.
                    Err(LLMError::CircuitOpen {
                        provider: key.to_string(),
                    })
                } else {
                    circuit.probe_in_flight = true;
                    Ok(self.guard(key, true))
                }
            }
        }
    }

    fn guard(&self, key: &str, probe: bool) -> CallGuard {
        CallGuard {
            breaker: self.clone(),
            key: key.to_string(),
            probe,
            resolved: false,
        }
    }

    fn on_success(&self, key: &str, probe: bool) {
        if let Some(mut circuit) = self.circuits.get_mut(key) {
            circuit.state.total_requests += 1;
            circuit.state.successful_requests += 1;
            circuit.state.consecutive_failures = 0;
            circuit.state.last_error = None;
            if probe {
                circuit.probe_in_flight = false;
            }
            if circuit.state.phase != CircuitPhase::Closed {
                circuit.state.phase = CircuitPhase::Closed;
                circuit.state.opened_at = None;
                circuit.state.open_until = None;
            }
        }
    }

    fn on_failure(&self, key: &str, probe: bool, error: String) {
        let now = Utc::now();
        if let Some(mut circuit) = self.circuits.get_mut(key) {
            circuit.state.total_requests += 1;
            circuit.state.last_error = Some(error);
            if probe {
                circuit.probe_in_flight = false;
                // Failed probe reopens the window from now.
                circuit.state.phase = CircuitPhase::Open;
                circuit.state.opened_at = Some(now);
                circuit.state.open_until = Some(now + self.settings.open_timeout);
                return;
            }
            circuit.state.consecutive_failures += 1;
            if circuit.state.phase == CircuitPhase::Closed
                && circuit.state.consecutive_failures >= self.settings.failure_threshold
            {
                circuit.state.phase = CircuitPhase::Open;
                circuit.state.opened_at = Some(now);
                circuit.state.open_until = Some(now + self.settings.open_timeout);
            }
        }
    }

    fn release_probe(&self, key: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(key) {
            circuit.probe_in_flight = false;
        }
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.circuits
            .get(key)
            .map(|c| c.state.phase == CircuitPhase::Open)
            .unwrap_or(false)
    }

    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.circuits.get(key).map(|c| c.state.clone())
    }

    /// Reset one circuit to closed with zeroed counters.
    pub fn reset(&self, key: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(key) {
            circuit.state = CircuitState::new();
            circuit.probe_in_flight = false;
        }
    }

    /// All circuits, for the health surface.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut entries: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Outcome-recording handle for one admitted call.
pub struct CallGuard {
    breaker: CircuitBreaker,
    key: String,
    probe: bool,
    resolved: bool,
}

impl CallGuard {
    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.on_success(&self.key, self.probe);
    }

    pub fn record_failure(mut self, error: &LLMError) {
        self.resolved = true;
        self.breaker.on_failure(&self.key, self.probe, error.to_string());
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerSettings {
            failure_threshold: 5,
            open_timeout: Duration::from_millis(50),
        })
    }

    fn fail(breaker: &CircuitBreaker, key: &str) {
        let guard = breaker.try_acquire(key).expect("call admitted");
        guard.record_failure(&LLMError::Upstream {
            provider: key.into(),
            status: 500,
            message: "boom".into(),
        });
    }

    #[test]
    fn trips_open_after_threshold() {
        let breaker = fast_breaker();

        for _ in 0..5 {
            assert!(!breaker.is_open("openai"));
            fail(&breaker, "openai");
        }

        assert!(breaker.is_open("openai"));
        let state = breaker.state("openai").unwrap();
        assert_eq!(state.phase, CircuitPhase::Open);
        assert!(state.opened_at.is_some());
        assert!(state.open_until.unwrap() > state.opened_at.unwrap());

        // Fast-fail without touching the wrapped operation.
        match breaker.try_acquire("openai") {
            Err(LLMError::CircuitOpen { provider }) => assert_eq!(provider, "openai"),
            other => panic!("expected circuit_open, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = fast_breaker();

        for _ in 0..4 {
            fail(&breaker, "openai");
        }
        breaker.try_acquire("openai").unwrap().record_success();
        assert_eq!(breaker.state("openai").unwrap().consecutive_failures, 0);

        // Four more failures still do not trip it.
        for _ in 0..4 {
            fail(&breaker, "openai");
        }
        assert!(!breaker.is_open("openai"));
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            fail(&breaker, "openai");
        }
        assert!(breaker.is_open("openai"));

        tokio::time::sleep(Duration::from_millis(70)).await;

        let probe = breaker.try_acquire("openai").expect("probe admitted");
        // While the probe is in flight, everyone else fails fast.
        assert!(matches!(
            breaker.try_acquire("openai"),
            Err(LLMError::CircuitOpen { .. })
        ));

        probe.record_success();
        let state = breaker.state("openai").unwrap();
        assert_eq!(state.phase, CircuitPhase::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert!(breaker.try_acquire("openai").is_ok());
    }

    #[tokio::test]
    async fn failed_probe_reopens_with_fresh_window() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            fail(&breaker, "openai");
        }
        let first_open_until = breaker.state("openai").unwrap().open_until.unwrap();

        tokio::time::sleep(Duration::from_millis(70)).await;
        fail(&breaker, "openai"); // the probe

        let state = breaker.state("openai").unwrap();
        assert_eq!(state.phase, CircuitPhase::Open);
        assert!(state.open_until.unwrap() > first_open_until);
    }

    #[tokio::test]
    async fn dropped_probe_releases_the_gate() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            fail(&breaker, "openai");
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        let probe = breaker.try_acquire("openai").expect("probe admitted");
        drop(probe); // cancelled mid-flight, no outcome

        // The slot is free for the next probe.
        assert!(breaker.try_acquire("openai").is_ok());
    }

    #[test]
    fn keys_are_independent() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            fail(&breaker, "openai");
        }
        assert!(breaker.is_open("openai"));
        assert!(!breaker.is_open("anthropic"));
        assert!(breaker.try_acquire("anthropic").is_ok());
    }

    #[test]
    fn reset_zeroes_counters() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            fail(&breaker, "openai");
        }
        breaker.reset("openai");

        let state = breaker.state("openai").unwrap();
        assert_eq!(state.phase, CircuitPhase::Closed);
        assert_eq!(state.total_requests, 0);
        assert_eq!(state.success_rate(), 1.0);
        assert!(breaker.try_acquire("openai").is_ok());
    }

    #[test]
    fn success_rate_tracks_outcomes() {
        let breaker = fast_breaker();
        breaker.try_acquire("k").unwrap().record_success();
        breaker.try_acquire("k").unwrap().record_success();
        fail(&breaker, "k");

        let state = breaker.state("k").unwrap();
        assert_eq!(state.total_requests, 3);
        assert_eq!(state.successful_requests, 2);
        assert!((state.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}
