use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collectors::CollectionMode;
use crate::error::Endpoint;
use crate::util::span;
use crate::{DeviceMetricsSample, MetricFields};

/// Per-device scheduling bookkeeping, owned by the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status_at: Option<DateTime<Utc>>,
    pub last_perf_at: Option<DateTime<Utc>>,
    pub last_iface_at: Option<DateTime<Utc>>,
    /// Last known good field values, refreshed only by non-DOWN runs
    pub last_known_good: Option<MetricFields>,
}

fn elapsed(since: Option<DateTime<Utc>>, interval_secs: u64, now: DateTime<Utc>) -> bool {
    since.is_none_or(|at| now - at >= span(interval_secs))
}

impl ScheduleState {
    pub fn interval_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_none_or(|at| now >= at)
    }

    /// Pick which vendor endpoints this run calls.
    ///
    /// With both endpoint intervals at zero and no interface cooldown every
    /// run is a full interface run.
    pub fn mode(
        &self,
        now: DateTime<Utc>,
        perf_interval_secs: u64,
        iface_interval_secs: u64,
        iface_cooling: bool,
    ) -> CollectionMode {
        if !iface_cooling && elapsed(self.last_iface_at, iface_interval_secs, now) {
            CollectionMode::Interface
        } else if elapsed(self.last_perf_at, perf_interval_secs, now) {
            CollectionMode::Performance
        } else {
            CollectionMode::Status
        }
    }

    pub fn mark_invoked(&mut self, endpoints: &[Endpoint], now: DateTime<Utc>) {
        for endpoint in endpoints {
            let slot = match endpoint {
                Endpoint::Status => &mut self.last_status_at,
                Endpoint::Perf => &mut self.last_perf_at,
                Endpoint::Iface => &mut self.last_iface_at,
            };
            *slot = Some(now);
        }
    }

    pub fn finish_run(&mut self, interval_secs: u64, now: DateTime<Utc>) {
        self.last_run_at = Some(now);
        self.next_run_at = Some(now + span(interval_secs));
    }

    /// Merge a fresh sample into the cache and fill its gaps from it.
    ///
    /// DOWN samples leave the cache untouched and are returned as they are.
    pub fn remember(&mut self, sample: &mut DeviceMetricsSample) {
        if sample.status.is_down() {
            return;
        }
        if let Some(prior) = &self.last_known_good {
            sample.fields.fill_from(prior);
        }
        self.last_known_good = Some(sample.fields.clone());
    }

    /// Fill a degraded sample from the cache without refreshing it
    pub fn fill_from_cache(&self, sample: &mut DeviceMetricsSample) {
        if let Some(prior) = &self.last_known_good {
            sample.fields.fill_from(prior);
        }
    }
}
