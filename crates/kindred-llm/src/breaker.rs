//! Circuit breaker registry for provider health.
//!
//! One registry instance is constructed at startup and shared by
//! reference wherever provider calls are made; there is no module-level
//! state. Each provider has a closed/open circuit:
//! - closed: calls pass through, failures increment a counter
//! - open: reached after `failure_threshold` consecutive failures;
//!   calls bypass the provider until `cool_down` elapses
//! - a success while closed resets the counter to zero immediately

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker policy shared by all providers in a registry.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit bypasses the provider
    pub cool_down: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Point-in-time view of one provider circuit, for health reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitSnapshot {
    /// Provider name
    pub provider: String,
    /// Whether the circuit is currently open
    pub open: bool,
    /// Current consecutive failure count
    pub consecutive_failures: u32,
}

/// Mutex-guarded map of provider name → circuit state.
pub struct CircuitBreakerRegistry {
    policy: BreakerPolicy,
    circuits: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the default policy (5 failures / 60s).
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(BreakerPolicy::default())
    }

    /// Create a registry with an explicit policy.
    #[must_use]
    pub fn with_policy(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Whether calls to `provider` should be bypassed right now.
    ///
    /// An open circuit whose cool-down has elapsed transitions back to
    /// closed (with the failure counter cleared) as a side effect.
    pub fn is_open(&self, provider: &str) -> bool {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = circuits.get_mut(provider) else {
            return false;
        };
        match state.opened_at {
            Some(opened_at) if opened_at.elapsed() >= self.policy.cool_down => {
                info!(provider = %provider, "Circuit cool-down elapsed, closing");
                state.opened_at = None;
                state.consecutive_failures = 0;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Record a successful call: the failure counter resets immediately.
    pub fn record_success(&self, provider: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let state = circuits.entry(provider.to_string()).or_default();
        if state.consecutive_failures > 0 {
            debug!(provider = %provider, "Provider recovered, resetting failure count");
        }
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    /// Record a failed call (timeouts count). Opens the circuit once the
    /// threshold is reached.
    pub fn record_failure(&self, provider: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let state = circuits.entry(provider.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.opened_at.is_none() && state.consecutive_failures >= self.policy.failure_threshold
        {
            warn!(
                provider = %provider,
                failures = state.consecutive_failures,
                cool_down_secs = self.policy.cool_down.as_secs(),
                "Circuit opened"
            );
            state.opened_at = Some(Instant::now());
        }
    }

    /// Snapshot of every tracked circuit, for the health endpoint.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits
            .iter()
            .map(|(provider, state)| CircuitSnapshot {
                provider: provider.clone(),
                open: state
                    .opened_at
                    .is_some_and(|t| t.elapsed() < self.policy.cool_down),
                consecutive_failures: state.consecutive_failures,
            })
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
