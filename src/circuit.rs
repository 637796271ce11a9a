//! Per-target circuit breaker
//!
//! ```text
//! DOWN           → streak += 1; streak >= threshold → open for `cooldown`
//! UP / DEGRADED  → streak = 0, cooldown cleared (closed)
//! open           → the scheduler skips the check; a skip records nothing
//! ```

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Status;

pub const FAILURE_THRESHOLD: u32 = 3;
pub const COOLDOWN_SECS: i64 = 180;

/// Monitors and devices live in separate namespaces
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum CircuitKey {
    Monitor(String),
    Device(String),
}

impl CircuitKey {
    pub fn monitor(id: impl Into<String>) -> Self {
        CircuitKey::Monitor(id.into())
    }

    pub fn device(id: impl Into<String>) -> Self {
        CircuitKey::Device(id.into())
    }
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitKey::Monitor(id) => write!(f, "monitor:{id}"),
            CircuitKey::Device(id) => write!(f, "device:{id}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    /// Consecutive DOWN outcomes
    pub streak: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// What a recorded outcome did to the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    Opened,
    Closed,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    states: HashMap<CircuitKey, CircuitState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_policy(FAILURE_THRESHOLD, Duration::seconds(COOLDOWN_SECS))
    }

    pub fn with_policy(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: HashMap::new(),
        }
    }

    pub fn is_open(&self, key: &CircuitKey, now: DateTime<Utc>) -> bool {
        self.states
            .get(key)
            .and_then(|state| state.cooldown_until)
            .is_some_and(|until| now < until)
    }

    pub fn state(&self, key: &CircuitKey) -> Option<&CircuitState> {
        self.states.get(key)
    }

    pub fn record(&mut self, key: &CircuitKey, outcome: Status, now: DateTime<Utc>) -> CircuitEvent {
        let state = self.states.entry(key.clone()).or_default();

        if outcome != Status::Down {
            let was_tripped = state.streak >= self.threshold;
            *state = CircuitState::default();
            if was_tripped {
                info!("circuit for {key} closed");
                return CircuitEvent::Closed;
            }
            return CircuitEvent::Unchanged;
        }

        state.streak = state.streak.saturating_add(1);
        if state.streak < self.threshold {
            debug!("{key}: failure streak {}", state.streak);
            return CircuitEvent::Unchanged;
        }

        let until = now + self.cooldown;
        state.cooldown_until = Some(until);
        info!(
            "circuit for {key} open until {until} after {} consecutive failures",
            state.streak
        );
        CircuitEvent::Opened
    }

    /// Forget targets that are no longer scheduled
    pub fn retain(&mut self, mut keep: impl FnMut(&CircuitKey) -> bool) {
        self.states.retain(|key, _| keep(key));
    }

    pub fn snapshot(&self) -> Vec<(CircuitKey, CircuitState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|(key, state)| (key.clone(), state.clone()))
            .collect();
        states.sort_by_key(|(key, _)| key.to_string());
        states
    }
}
