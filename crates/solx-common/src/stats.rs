use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Health gate state for a single procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Running execution totals for one procedure. `avg_duration` is the
/// cumulative mean, recomputed on every update so long-tail outliers keep
/// their full weight in lane placement.
#[derive(Debug, Clone, Default)]
pub struct ProcStats {
    pub total_executions: u64,
    pub total_duration: Duration,
    pub failure_count: u64,
    pub last_execution: Option<DateTime<Utc>>,
    pub avg_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_fail_time: Option<DateTime<Utc>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_fail_time: None,
        }
    }
}

/// Breaker thresholds. The defaults are the production constants; tests
/// shrink the reset timeout instead of faking a clock.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Read-only view handed to the classifier.
#[derive(Debug, Clone, Copy)]
pub struct ProcSnapshot {
    pub avg_duration: Duration,
    pub total_executions: u64,
    pub circuit: CircuitState,
}

#[derive(Default)]
struct Registry {
    stats: HashMap<String, ProcStats>,
    breakers: HashMap<String, CircuitBreaker>,
}

/// Shared stats and breaker state for every configured procedure.
///
/// A single reader-writer lock covers both maps; every operation is O(1)
/// inside the critical section.
pub struct StatsRegistry {
    policy: BreakerPolicy,
    inner: RwLock<Registry>,
}

impl StatsRegistry {
    pub fn new<S: AsRef<str>>(procedures: &[S]) -> Self {
        Self::with_policy(procedures, BreakerPolicy::default())
    }

    pub fn with_policy<S: AsRef<str>>(procedures: &[S], policy: BreakerPolicy) -> Self {
        let mut registry = Registry::default();
        for procedure in procedures {
            let name = procedure.as_ref().to_string();
            registry.stats.insert(name.clone(), ProcStats::default());
            registry.breakers.insert(name, CircuitBreaker::default());
        }
        Self {
            policy,
            inner: RwLock::new(registry),
        }
    }

    pub fn policy(&self) -> BreakerPolicy {
        self.policy
    }

    /// Records one completed execution, feeding both the rolling average and
    /// the procedure's breaker. Reaching the failure threshold opens the
    /// circuit immediately; a success while half-open closes it.
    pub fn update(&self, procedure: &str, duration: Duration, success: bool) {
        let mut registry = self.inner.write().expect("stats lock poisoned");
        let stats = registry.stats.entry(procedure.to_string()).or_default();
        stats.total_executions += 1;
        stats.total_duration += duration;
        stats.last_execution = Some(Utc::now());
        stats.avg_duration = Duration::from_nanos(
            (stats.total_duration.as_nanos() / u128::from(stats.total_executions)) as u64,
        );
        if !success {
            stats.failure_count += 1;
        }

        let threshold = self.policy.failure_threshold;
        let breaker = registry.breakers.entry(procedure.to_string()).or_default();
        if success {
            if breaker.state == CircuitState::HalfOpen {
                breaker.state = CircuitState::Closed;
                breaker.failure_count = 0;
                info!(procedure, "circuit breaker closed");
            }
        } else {
            breaker.failure_count += 1;
            breaker.last_fail_time = Some(Utc::now());
            if breaker.failure_count >= threshold && breaker.state != CircuitState::Open {
                breaker.state = CircuitState::Open;
                warn!(
                    procedure,
                    failures = breaker.failure_count,
                    "circuit breaker opened"
                );
            }
        }
    }

    pub fn snapshot(&self, procedure: &str) -> ProcSnapshot {
        let registry = self.inner.read().expect("stats lock poisoned");
        let stats = registry.stats.get(procedure).cloned().unwrap_or_default();
        let circuit = registry
            .breakers
            .get(procedure)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed);
        ProcSnapshot {
            avg_duration: stats.avg_duration,
            total_executions: stats.total_executions,
            circuit,
        }
    }

    /// Returns the breaker state after applying the lazy OPEN → HALF_OPEN
    /// transition: an open circuit whose reset timeout has elapsed becomes
    /// half-open under the write lock before the state is reported.
    pub fn probe_circuit(&self, procedure: &str) -> CircuitState {
        let needs_reset = {
            let registry = self.inner.read().expect("stats lock poisoned");
            match registry.breakers.get(procedure) {
                Some(breaker) => {
                    breaker.state == CircuitState::Open && self.reset_elapsed(breaker)
                }
                None => return CircuitState::Closed,
            }
        };

        if needs_reset {
            let mut registry = self.inner.write().expect("stats lock poisoned");
            if let Some(breaker) = registry.breakers.get_mut(procedure) {
                if breaker.state == CircuitState::Open && self.reset_elapsed(breaker) {
                    breaker.state = CircuitState::HalfOpen;
                    info!(procedure, "circuit breaker half-open");
                }
                return breaker.state;
            }
        }

        self.inner
            .read()
            .expect("stats lock poisoned")
            .breakers
            .get(procedure)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    fn reset_elapsed(&self, breaker: &CircuitBreaker) -> bool {
        match breaker.last_fail_time {
            Some(last_fail) => {
                let elapsed = Utc::now().signed_duration_since(last_fail);
                elapsed.to_std().map_or(false, |e| e > self.policy.reset_timeout)
            }
            None => true,
        }
    }

    /// Logs the end-of-run statistics line for every procedure.
    pub fn log_final(&self) {
        let registry = self.inner.read().expect("stats lock poisoned");
        let mut procedures: Vec<_> = registry.stats.keys().cloned().collect();
        procedures.sort();
        for procedure in procedures {
            let stats = &registry.stats[&procedure];
            let state = registry
                .breakers
                .get(&procedure)
                .map(|b| b.state)
                .unwrap_or(CircuitState::Closed);
            info!(
                procedure = %procedure,
                executions = stats.total_executions,
                avg_ms = stats.avg_duration.as_millis() as u64,
                failures = stats.failure_count,
                circuit = state.as_str(),
                "procedure statistics"
            );
        }
    }
}
