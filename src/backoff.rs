//! Rate-limit backoff governor
//!
//! A device that answers with a rate-limit signal is held back for an
//! exponentially growing delay. The interface endpoint has its own flat
//! cooldown, armed only by a rate limit on that endpoint, so interface
//! throttling never blocks status or performance collection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::Endpoint;
use crate::tasks::DeviceTask;
use crate::util::span;

/// Persisted per-device backoff row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffState {
    pub device_id: String,
    #[serde(default)]
    pub backoff_seconds: u64,
    #[serde(default)]
    pub next_allowed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub iface_next_allowed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rate_limit_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl BackoffState {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_backed_off(&self, now: DateTime<Utc>) -> bool {
        self.next_allowed_at.is_some_and(|at| now < at)
    }

    pub fn iface_cooling(&self, now: DateTime<Utc>) -> bool {
        self.iface_next_allowed_at.is_some_and(|at| now < at)
    }
}

/// Backoff parameters for one device, after per-device overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_secs: u64,
    pub cap_secs: u64,
    pub iface_cooldown_secs: u64,
}

impl BackoffPolicy {
    pub fn for_device(defaults: &SchedulerConfig, device: &DeviceTask) -> Self {
        Self {
            base_secs: device.backoff_base_secs.unwrap_or(defaults.backoff_base_secs),
            cap_secs: device.backoff_cap_secs.unwrap_or(defaults.backoff_cap_secs),
            iface_cooldown_secs: device
                .iface_cooldown_secs
                .unwrap_or(defaults.iface_cooldown_secs),
        }
    }

    /// `min(base * 2^(count - 1), cap)` for the `count`-th consecutive rate limit
    pub fn delay_secs(&self, count: u32) -> u64 {
        let exponent = count.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_secs.saturating_mul(factor).min(self.cap_secs)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackoffGovernor {
    states: HashMap<String, BackoffState>,
}

impl BackoffGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, device_id: &str) -> Option<&BackoffState> {
        self.states.get(device_id)
    }

    pub fn is_backed_off(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        self.state(device_id)
            .is_some_and(|state| state.is_backed_off(now))
    }

    pub fn iface_cooling(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        self.state(device_id)
            .is_some_and(|state| state.iface_cooling(now))
    }

    /// Escalate the general backoff after a status or performance rate limit
    pub fn record_rate_limit(
        &mut self,
        device_id: &str,
        endpoint: Endpoint,
        policy: &BackoffPolicy,
        error: &str,
        now: DateTime<Utc>,
    ) -> &BackoffState {
        let state = self
            .states
            .entry(device_id.to_string())
            .or_insert_with(|| BackoffState::new(device_id));

        state.rate_limit_count = state.rate_limit_count.saturating_add(1);
        state.backoff_seconds = policy.delay_secs(state.rate_limit_count);
        state.next_allowed_at = Some(now + span(state.backoff_seconds));
        state.last_error = Some(error.to_string());
        state.reason = Some(format!("{endpoint} endpoint rate limited"));

        warn!(
            "device {device_id} rate limited on {endpoint} ({} in a row), backing off {}s",
            state.rate_limit_count, state.backoff_seconds
        );
        state
    }

    /// Arm the flat interface cooldown after an interface rate limit
    pub fn arm_iface_cooldown(
        &mut self,
        device_id: &str,
        policy: &BackoffPolicy,
        error: &str,
        now: DateTime<Utc>,
    ) -> &BackoffState {
        let state = self
            .states
            .entry(device_id.to_string())
            .or_insert_with(|| BackoffState::new(device_id));

        let until = now + span(policy.iface_cooldown_secs);
        state.iface_next_allowed_at = Some(until);
        state.last_error = Some(error.to_string());
        state.reason = Some(format!("{} endpoint rate limited", Endpoint::Iface));

        info!("device {device_id}: interface collection paused until {until}");
        state
    }

    /// Reset the general backoff after a run without rate limiting.
    ///
    /// The interface cooldown is left alone. Returns whether anything changed.
    pub fn record_clean(&mut self, device_id: &str) -> bool {
        let Some(state) = self.states.get_mut(device_id) else {
            return false;
        };
        if state.rate_limit_count == 0
            && state.backoff_seconds == 0
            && state.next_allowed_at.is_none()
            && state.last_error.is_none()
        {
            return false;
        }

        debug!("device {device_id}: clearing backoff");
        state.rate_limit_count = 0;
        state.backoff_seconds = 0;
        state.next_allowed_at = None;
        state.last_error = None;
        state.reason = None;
        true
    }

    /// Fold rows persisted by the central service into local state.
    ///
    /// A device seen for the first time adopts the persisted row. After that
    /// local state wins, except that a persisted deadline later than the
    /// local one (and still in the future) is adopted.
    pub fn merge_persisted(&mut self, rows: Vec<BackoffState>, now: DateTime<Utc>) {
        for row in rows {
            let Some(local) = self.states.get_mut(&row.device_id) else {
                debug!("adopting persisted backoff for device {}", row.device_id);
                self.states.insert(row.device_id.clone(), row);
                continue;
            };

            if later_and_pending(row.next_allowed_at, local.next_allowed_at, now) {
                local.next_allowed_at = row.next_allowed_at;
                local.backoff_seconds = local.backoff_seconds.max(row.backoff_seconds);
                local.rate_limit_count = local.rate_limit_count.max(row.rate_limit_count);
                if row.last_error.is_some() {
                    local.last_error = row.last_error.clone();
                    local.reason = row.reason.clone();
                }
            }
            if later_and_pending(row.iface_next_allowed_at, local.iface_next_allowed_at, now) {
                local.iface_next_allowed_at = row.iface_next_allowed_at;
            }
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.states.retain(|id, _| keep(id));
    }

    pub fn snapshot(&self) -> Vec<BackoffState> {
        let mut rows: Vec<_> = self.states.values().cloned().collect();
        rows.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        rows
    }
}

fn later_and_pending(
    persisted: Option<DateTime<Utc>>,
    local: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match (persisted, local) {
        (Some(p), Some(l)) => p > l && p > now,
        (Some(p), None) => p > now,
        (None, _) => false,
    }
}
