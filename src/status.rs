//! Status hysteresis
//!
//! Raw check outcomes flap; the effective status only moves after a run of
//! consecutive failures (or successes) reaches the monitor's threshold.
//! DEGRADED counts as a success here: the target answered.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::tasks::Thresholds;
use crate::{EffectiveStatus, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentDown,
    Recovered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    pub failure_count: u32,
    pub success_count: u32,
    pub effective_status: EffectiveStatus,
    /// Last raw outcome
    pub surface_status: Option<Status>,
}

impl MonitorState {
    pub fn apply(&mut self, raw: Status, thresholds: Thresholds) -> Option<Transition> {
        self.surface_status = Some(raw);

        if raw.is_down() {
            self.success_count = 0;
            self.failure_count = self.failure_count.saturating_add(1);
            if self.effective_status == EffectiveStatus::Up
                && self.failure_count >= thresholds.failure
            {
                self.effective_status = EffectiveStatus::Down;
                return Some(Transition::WentDown);
            }
        } else {
            self.failure_count = 0;
            self.success_count = self.success_count.saturating_add(1);
            if self.effective_status == EffectiveStatus::Down
                && self.success_count >= thresholds.success
            {
                self.effective_status = EffectiveStatus::Up;
                return Some(Transition::Recovered);
            }
        }

        None
    }
}

/// Hysteresis state for every monitor this agent runs
#[derive(Debug, Default)]
pub struct StatusTracker {
    states: HashMap<String, MonitorState>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, monitor_id: &str) -> Option<&MonitorState> {
        self.states.get(monitor_id)
    }

    pub fn ingest(
        &mut self,
        monitor_id: &str,
        name: &str,
        raw: Status,
        thresholds: Thresholds,
    ) -> Option<Transition> {
        let state = self.states.entry(monitor_id.to_string()).or_default();
        let transition = state.apply(raw, thresholds);

        match transition {
            Some(Transition::WentDown) => warn!(
                "monitor '{name}' is DOWN after {} consecutive failures",
                state.failure_count
            ),
            Some(Transition::Recovered) => info!("monitor '{name}' recovered"),
            None => {}
        }

        transition
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.states.retain(|id, _| keep(id));
    }

    pub fn snapshot(&self) -> Vec<(String, MonitorState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
