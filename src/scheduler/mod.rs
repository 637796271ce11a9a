//! The agent-side scheduler
//!
//! ```text
//! pull ─► apply_bundle ──► monitors ─► run_monitors (bounded pool, every tick)
//!                    └───► devices  ─► run_device_step (one device per step)
//!                                         ├─ manual requests first, oldest first
//!                                         └─ otherwise round robin
//! ```
//!
//! Everything here is owned by a single task. Callers pass `now` explicitly
//! so the gates can be exercised without sleeping.

pub mod rotation;
pub mod state;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, stream};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{BackoffGovernor, BackoffPolicy, BackoffState};
use crate::circuit::{CircuitBreaker, CircuitKey, CircuitState};
use crate::collectors::{DeviceCollection, DeviceCollector};
use crate::config::SchedulerConfig;
use crate::error::Endpoint;
use crate::probes::Prober;
use crate::status::{MonitorState, StatusTracker};
use crate::tasks::{DeviceTask, ManualRunRequest, MonitorTask};
use crate::transport::{DeviceReport, MonitorReport, TaskBundle};
use crate::util::span;
use crate::{CheckResult, DeviceMetricsSample, MetricFields, Status};

pub use rotation::Rotation;
pub use state::ScheduleState;

/// Why a selected device was not checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen,
    BackedOff,
    NotDue,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::CircuitOpen => write!(f, "circuit open"),
            SkipReason::BackedOff => write!(f, "rate-limit backoff active"),
            SkipReason::NotDue => write!(f, "interval not elapsed"),
        }
    }
}

/// Output of one device step
#[derive(Debug, Default)]
pub struct DeviceStep {
    pub report: Option<DeviceReport>,
    pub skipped: Option<(String, SkipReason)>,
    /// Backoff rows changed by this step
    pub backoff: Vec<BackoffState>,
    /// Manual run requests consumed by this step, run or not
    pub acknowledgements: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub monitors: usize,
    pub devices: usize,
    pub pending_manual: Vec<String>,
    pub circuits: Vec<(CircuitKey, CircuitState)>,
    pub backoff: Vec<BackoffState>,
    pub schedules: Vec<(String, ScheduleState)>,
    pub monitor_states: Vec<(String, MonitorState)>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    monitors: Vec<MonitorTask>,
    /// Sorted by rotation key
    devices: Vec<DeviceTask>,
    /// Pending manual requests, oldest first
    manual: Vec<ManualRunRequest>,
    /// Consumed request ids, kept until the service stops offering them
    acknowledged: HashSet<String>,
    monitor_due: HashMap<String, DateTime<Utc>>,
    circuits: CircuitBreaker,
    backoff: BackoffGovernor,
    schedules: HashMap<String, ScheduleState>,
    rotation: Rotation,
    statuses: StatusTracker,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        if config.device_concurrency != 1 {
            warn!(
                "device_concurrency is {}, but devices are always checked one at a time",
                config.device_concurrency
            );
        }

        Self {
            config,
            monitors: Vec::new(),
            devices: Vec::new(),
            manual: Vec::new(),
            acknowledged: HashSet::new(),
            monitor_due: HashMap::new(),
            circuits: CircuitBreaker::new(),
            backoff: BackoffGovernor::new(),
            schedules: HashMap::new(),
            rotation: Rotation::new(),
            statuses: StatusTracker::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn circuits(&self) -> &CircuitBreaker {
        &self.circuits
    }

    pub fn backoff(&self) -> &BackoffGovernor {
        &self.backoff
    }

    pub fn schedule(&self, device_id: &str) -> Option<&ScheduleState> {
        self.schedules.get(device_id)
    }

    pub fn monitor_state(&self, monitor_id: &str) -> Option<&MonitorState> {
        self.statuses.get(monitor_id)
    }

    pub fn pending_manual(&self) -> &[ManualRunRequest] {
        &self.manual
    }

    /// Replace the task set with a freshly pulled bundle
    #[instrument(skip_all)]
    pub fn apply_bundle(&mut self, bundle: TaskBundle, now: DateTime<Utc>) {
        let TaskBundle {
            monitors,
            mut devices,
            backoff,
            manual_requests,
        } = bundle;
        rotation::sort_for_rotation(&mut devices);

        let monitor_ids: HashSet<String> = monitors.iter().map(|m| m.id.clone()).collect();
        let device_ids: HashSet<String> = devices.iter().map(|d| d.id.clone()).collect();

        self.monitor_due.retain(|id, _| monitor_ids.contains(id));
        self.statuses.retain(|id| monitor_ids.contains(id));
        self.schedules.retain(|id, _| device_ids.contains(id));
        self.circuits.retain(|key| match key {
            CircuitKey::Monitor(id) => monitor_ids.contains(id),
            CircuitKey::Device(id) => device_ids.contains(id),
        });
        self.backoff.merge_persisted(backoff, now);
        self.backoff.retain(|id| device_ids.contains(id));

        let offered: HashSet<&str> = manual_requests.iter().map(|r| r.id.as_str()).collect();
        self.acknowledged.retain(|id| offered.contains(id.as_str()));
        let mut manual: Vec<ManualRunRequest> = manual_requests
            .iter()
            .filter(|request| !self.acknowledged.contains(&request.id))
            .cloned()
            .collect();
        manual.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        info!(
            "tasks updated: {} monitors, {} devices, {} pending manual requests",
            monitors.len(),
            devices.len(),
            manual.len()
        );
        self.monitors = monitors;
        self.devices = devices;
        self.manual = manual;
    }

    /// Run every due monitor through `prober` with bounded concurrency
    #[instrument(skip_all)]
    pub async fn run_monitors<P>(&mut self, prober: &P, now: DateTime<Utc>) -> Vec<MonitorReport>
    where
        P: Prober + ?Sized,
    {
        let mut runnable = Vec::new();
        for task in self.monitors.iter().filter(|task| task.active) {
            if self.monitor_due.get(&task.id).is_some_and(|due| now < *due) {
                continue;
            }
            self.monitor_due
                .insert(task.id.clone(), now + span(task.interval_secs.max(1)));

            if self.circuits.is_open(&CircuitKey::monitor(&task.id), now) {
                debug!("skipping monitor '{}': circuit open", task.display_name());
                continue;
            }
            runnable.push(task.clone());
        }

        if runnable.is_empty() {
            return Vec::new();
        }

        let results: Vec<(MonitorTask, CheckResult)> = stream::iter(runnable)
            .map(|task| async move {
                let result = prober.check(&task).await;
                (task, result)
            })
            .buffer_unordered(self.config.monitor_width())
            .collect()
            .await;

        let mut reports = Vec::with_capacity(results.len());
        for (task, result) in results {
            self.circuits
                .record(&CircuitKey::monitor(&task.id), result.status, now);
            self.statuses.ingest(
                &task.id,
                task.display_name(),
                result.status,
                task.thresholds(),
            );
            reports.push(MonitorReport {
                monitor_id: task.id,
                result,
            });
        }
        reports
    }

    /// Select and check at most one device.
    ///
    /// A manual request taken by this step is acknowledged exactly once
    /// whether or not its device ran.
    #[instrument(skip_all)]
    pub async fn run_device_step<C>(&mut self, collector: &C, now: DateTime<Utc>) -> DeviceStep
    where
        C: DeviceCollector + ?Sized,
    {
        let mut step = DeviceStep::default();
        let Some((device, manual)) = self.select_device(now, &mut step) else {
            return step;
        };
        let manual_id = manual.map(|request| request.id);

        match self.gate(&device, manual_id.is_some(), now) {
            Some(reason) => {
                debug!("skipping device {}: {reason}", device.display_name());
                step.skipped = Some((device.id.clone(), reason));
            }
            None => {
                let report = self
                    .execute(collector, &device, manual_id.clone(), now, &mut step.backoff)
                    .await;
                step.report = Some(report);
            }
        }

        if let Some(id) = manual_id {
            self.acknowledge(id, &mut step);
        }
        step
    }

    fn acknowledge(&mut self, request_id: String, step: &mut DeviceStep) {
        self.acknowledged.insert(request_id.clone());
        step.acknowledgements.push(request_id);
    }

    fn safety_gate(&self, device_id: &str, now: DateTime<Utc>) -> Option<SkipReason> {
        if self.circuits.is_open(&CircuitKey::device(device_id), now) {
            Some(SkipReason::CircuitOpen)
        } else if self.backoff.is_backed_off(device_id, now) {
            Some(SkipReason::BackedOff)
        } else {
            None
        }
    }

    fn gate(&self, device: &DeviceTask, manual: bool, now: DateTime<Utc>) -> Option<SkipReason> {
        self.safety_gate(&device.id, now).or_else(|| {
            let due = self
                .schedules
                .get(&device.id)
                .is_none_or(|schedule| schedule.interval_due(now));
            (!manual && !due).then_some(SkipReason::NotDue)
        })
    }

    fn select_device(
        &mut self,
        now: DateTime<Utc>,
        step: &mut DeviceStep,
    ) -> Option<(DeviceTask, Option<ManualRunRequest>)> {
        while !self.manual.is_empty() {
            let request = self.manual.remove(0);
            let Some(device) = self
                .devices
                .iter()
                .find(|device| device.id == request.device_id)
                .cloned()
            else {
                warn!(
                    "manual run request {} targets unknown device {}",
                    request.id, request.device_id
                );
                self.acknowledge(request.id, step);
                continue;
            };

            if let Some(reason) = self.safety_gate(&device.id, now) {
                info!(
                    "manual run request {} for {} consumed without running: {reason}",
                    request.id,
                    device.display_name()
                );
                self.acknowledge(request.id, step);
                continue;
            }

            return Some((device, Some(request)));
        }

        self.rotation
            .advance(&self.devices)
            .cloned()
            .map(|device| (device, None))
    }

    async fn execute<C>(
        &mut self,
        collector: &C,
        device: &DeviceTask,
        manual_request_id: Option<String>,
        now: DateTime<Utc>,
        changed: &mut Vec<BackoffState>,
    ) -> DeviceReport
    where
        C: DeviceCollector + ?Sized,
    {
        let iface_cooling = self.backoff.iface_cooling(&device.id, now);
        let mode = self.schedules.entry(device.id.clone()).or_default().mode(
            now,
            self.config.perf_interval_secs,
            self.config.iface_interval_secs,
            iface_cooling,
        );

        let outcome = AssertUnwindSafe(collector.collect(device, mode))
            .catch_unwind()
            .await;
        let (collection, crashed) = match outcome {
            Ok(Ok(collection)) => (collection, false),
            Ok(Err(e)) => (unexpected_failure(&format!("{e:#}"), now), true),
            Err(panic) => (
                unexpected_failure(&panic_message(panic.as_ref()), now),
                true,
            ),
        };

        let policy = BackoffPolicy::for_device(&self.config, device);
        let limited = collection.rate_limited();
        let DeviceCollection {
            mut sample,
            invoked,
            failures,
        } = collection;
        let schedule = self.schedules.entry(device.id.clone()).or_default();

        if limited.is_empty() {
            // a crashed run says nothing about rate limits; keep any backoff
            if !crashed && self.backoff.record_clean(&device.id) {
                changed.extend(self.backoff.state(&device.id).cloned());
            }
            schedule.mark_invoked(&invoked, now);
            schedule.remember(&mut sample);
        } else {
            let error = failures
                .iter()
                .find(|failure| failure.is_rate_limited())
                .map(ToString::to_string)
                .unwrap_or_default();

            if let Some(&endpoint) = limited.iter().find(|e| **e != Endpoint::Iface) {
                self.backoff
                    .record_rate_limit(&device.id, endpoint, &policy, &error, now);
            }
            if limited.contains(&Endpoint::Iface) {
                self.backoff
                    .arm_iface_cooldown(&device.id, &policy, &error, now);
            }
            changed.extend(self.backoff.state(&device.id).cloned());

            let answered: Vec<Endpoint> = invoked
                .iter()
                .copied()
                .filter(|endpoint| !failures.iter().any(|f| f.endpoint == Some(*endpoint)))
                .collect();
            schedule.mark_invoked(&answered, now);

            sample.status = Status::Degraded;
            sample.reachable = true;
            if sample.error.is_none() {
                sample.error = Some(error);
            }
            if limited.contains(&Endpoint::Status) {
                schedule.fill_from_cache(&mut sample);
            } else {
                schedule.remember(&mut sample);
            }
        }

        let interval = device
            .interval_secs
            .unwrap_or(self.config.device_interval_secs);
        schedule.finish_run(interval, now);

        self.circuits
            .record(&CircuitKey::device(&device.id), sample.status, now);
        info!(
            "device {} checked ({mode:?}): {}{}",
            device.display_name(),
            sample.status,
            sample
                .error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        );

        DeviceReport {
            device_id: device.id.clone(),
            mode,
            sample,
            manual_request_id,
        }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let mut schedules: Vec<_> = self
            .schedules
            .iter()
            .map(|(id, schedule)| (id.clone(), schedule.clone()))
            .collect();
        schedules.sort_by(|a, b| a.0.cmp(&b.0));

        SchedulerSnapshot {
            monitors: self.monitors.len(),
            devices: self.devices.len(),
            pending_manual: self.manual.iter().map(|r| r.id.clone()).collect(),
            circuits: self.circuits.snapshot(),
            backoff: self.backoff.snapshot(),
            schedules,
            monitor_states: self.statuses.snapshot(),
        }
    }
}

/// Turn an error or panic that escaped a collector into a sample.
///
/// Messages that look like configuration or timeout problems become
/// DEGRADED; anything else is DOWN.
fn unexpected_failure(message: &str, now: DateTime<Utc>) -> DeviceCollection {
    let lowered = message.to_lowercase();
    let degraded = ["config", "token", "timeout", "timed out"]
        .iter()
        .any(|needle| lowered.contains(needle));

    warn!("collector failed unexpectedly: {message}");
    DeviceCollection {
        sample: DeviceMetricsSample {
            reachable: false,
            status: if degraded {
                Status::Degraded
            } else {
                Status::Down
            },
            fields: MetricFields::default(),
            timestamp: now,
            error: Some(format!("unexpected collector failure: {message}")),
        },
        invoked: Vec::new(),
        failures: Vec::new(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
