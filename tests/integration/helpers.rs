//! Builders and scripted fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uplink::collectors::{CollectionMode, DeviceCollection, DeviceCollector};
use uplink::error::{CheckError, Endpoint};
use uplink::probes::Prober;
use uplink::tasks::{DeviceTask, Management, ManualRunRequest, MonitorProtocol, MonitorTask};
use uplink::transport::{ControlPlane, ControlPlaneError, ReportBatch, TaskBundle};
use uplink::{CheckResult, DeviceMetricsSample, MetricFields, Protocol, Status};

pub fn icmp_monitor(id: &str) -> MonitorTask {
    MonitorTask {
        id: id.to_string(),
        name: None,
        target: format!("{id}.example.net"),
        protocol: MonitorProtocol::Icmp,
        interval_secs: 60,
        failure_threshold: 2,
        success_threshold: 1,
        active: true,
    }
}

pub fn tcp_device(id: &str, site: &str, hostname: &str) -> DeviceTask {
    DeviceTask {
        id: id.to_string(),
        site: site.to_string(),
        hostname: hostname.to_string(),
        management: Management::TcpOnly {
            host: "10.0.0.1".to_string(),
            ports: vec![443],
        },
        wan_ips: vec![],
        interval_secs: None,
        backoff_base_secs: None,
        backoff_cap_secs: None,
        iface_cooldown_secs: None,
    }
}

pub fn api_device(id: &str, base_url: &str) -> DeviceTask {
    DeviceTask {
        management: Management::Api {
            base_url: Some(base_url.to_string()),
            token: Some("device-token".to_string()),
            token_ref: None,
            token_mode: None,
        },
        wan_ips: vec!["203.0.113.5".to_string()],
        ..tcp_device(id, "branch-a", &format!("fw-{id}"))
    }
}

pub fn manual_request(id: &str, device_id: &str, requested_at: DateTime<Utc>) -> ManualRunRequest {
    ManualRunRequest {
        id: id.to_string(),
        device_id: device_id.to_string(),
        requested_at,
    }
}

pub fn bundle(monitors: Vec<MonitorTask>, devices: Vec<DeviceTask>) -> TaskBundle {
    TaskBundle {
        monitors,
        devices,
        ..Default::default()
    }
}

pub fn up_sample(fields: MetricFields) -> DeviceMetricsSample {
    DeviceMetricsSample {
        reachable: true,
        status: Status::Up,
        fields,
        timestamp: Utc::now(),
        error: None,
    }
}

/// Prober answering from a per-monitor queue; `Up` once the queue is empty
#[derive(Default)]
pub struct ScriptedProber {
    outcomes: Mutex<HashMap<String, VecDeque<Status>>>,
    pub calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub delay: Option<Duration>,
}

impl ScriptedProber {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn script(&self, monitor_id: &str, outcomes: &[Status]) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(monitor_id.to_string(), outcomes.iter().copied().collect());
    }

    pub fn call_count(&self, monitor_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == monitor_id)
            .count()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn check(&self, task: &MonitorTask) -> CheckResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(task.id.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let status = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&task.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Status::Up);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        CheckResult::new(Protocol::Icmp, status).with_latency(3)
    }
}

/// One scripted collector outcome
#[derive(Clone)]
pub enum Script {
    Collected(DeviceCollection),
    RateLimited(Endpoint),
    Fail(String),
    Panic(String),
}

/// Collector answering from a per-device queue; a plain UP sample once the
/// queue is empty
#[derive(Default)]
pub struct ScriptedCollector {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    pub calls: Mutex<Vec<(String, CollectionMode)>>,
}

impl ScriptedCollector {
    pub fn script(&self, device_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(device_id.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn called(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl DeviceCollector for ScriptedCollector {
    async fn collect(
        &self,
        device: &DeviceTask,
        mode: CollectionMode,
    ) -> anyhow::Result<DeviceCollection> {
        self.calls.lock().unwrap().push((device.id.clone(), mode));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&device.id)
            .and_then(VecDeque::pop_front);

        match script {
            None => Ok(DeviceCollection::new(
                up_sample(MetricFields::default()),
                vec![Endpoint::Status],
            )),
            Some(Script::Collected(collection)) => Ok(collection),
            Some(Script::RateLimited(endpoint)) => {
                let mut collection = DeviceCollection::failed(CheckError::rate_limited(endpoint));
                collection.sample.status = Status::Down;
                collection.invoked = vec![endpoint];
                Ok(collection)
            }
            Some(Script::Fail(message)) => Err(anyhow::anyhow!(message)),
            Some(Script::Panic(message)) => panic!("{message}"),
        }
    }
}

/// In-memory central service
#[derive(Default)]
pub struct MemoryControlPlane {
    pub bundle: Mutex<TaskBundle>,
    pub pushed: Mutex<Vec<ReportBatch>>,
    pub reject_pushes: Mutex<bool>,
}

impl MemoryControlPlane {
    pub fn serve(&self, bundle: TaskBundle) {
        *self.bundle.lock().unwrap() = bundle;
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.pushed
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.acknowledgements.clone())
            .collect()
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn pull(&self) -> Result<TaskBundle, ControlPlaneError> {
        Ok(self.bundle.lock().unwrap().clone())
    }

    async fn push(&self, batch: &ReportBatch) -> Result<(), ControlPlaneError> {
        if *self.reject_pushes.lock().unwrap() {
            return Err(ControlPlaneError::Status {
                status: 503,
                body: "maintenance".to_string(),
            });
        }
        self.pushed.lock().unwrap().push(batch.clone());
        Ok(())
    }
}
