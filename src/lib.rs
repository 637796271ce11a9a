pub mod actors;
pub mod backoff;
pub mod circuit;
pub mod collectors;
pub mod config;
pub mod error;
pub mod probes;
pub mod scheduler;
pub mod status;
pub mod tasks;
pub mod transport;
pub mod util;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw outcome of a single check, as recorded on the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
    Degraded,
}

impl Status {
    pub fn is_down(self) -> bool {
        self == Status::Down
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Up => write!(f, "UP"),
            Status::Down => write!(f, "DOWN"),
            Status::Degraded => write!(f, "DEGRADED"),
        }
    }
}

/// Stabilized verdict after hysteresis. Never degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EffectiveStatus {
    #[default]
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Icmp,
    Tcp,
    Http,
}

/// Result of one monitor check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: Status,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,

    /// TCP only: the port the outcome is attributed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// HTTP only: the status code actually received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl CheckResult {
    pub fn new(protocol: Protocol, status: Status) -> Self {
        Self {
            status,
            latency_ms: None,
            error: None,
            timestamp: Utc::now(),
            protocol,
            port: None,
            status_code: None,
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSample {
    pub status: Option<LinkStatus>,
    pub ip: Option<String>,
}

impl InterfaceSample {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.ip.is_none()
    }
}

/// Metric values a vendor call may or may not refresh on a given run.
///
/// `None` always means "not observed this time", never "zero".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricFields {
    pub hostname: Option<String>,
    pub uptime_secs: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub sessions: Option<u64>,
    pub wan1: InterfaceSample,
    pub wan2: InterfaceSample,
    pub lan: InterfaceSample,
}

impl MetricFields {
    /// Fill every field left unobserved on `self` from `prior`.
    pub fn fill_from(&mut self, prior: &MetricFields) {
        fn keep<T: Clone>(slot: &mut Option<T>, prior: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(prior);
            }
        }

        keep(&mut self.hostname, &prior.hostname);
        keep(&mut self.uptime_secs, &prior.uptime_secs);
        keep(&mut self.cpu_percent, &prior.cpu_percent);
        keep(&mut self.mem_percent, &prior.mem_percent);
        keep(&mut self.sessions, &prior.sessions);
        for (slot, prior) in [
            (&mut self.wan1, &prior.wan1),
            (&mut self.wan2, &prior.wan2),
            (&mut self.lan, &prior.lan),
        ] {
            keep(&mut slot.status, &prior.status);
            keep(&mut slot.ip, &prior.ip);
        }
    }
}

/// Health data collected from one managed device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetricsSample {
    pub reachable: bool,
    pub status: Status,
    #[serde(flatten)]
    pub fields: MetricFields,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl DeviceMetricsSample {
    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            reachable: false,
            status: Status::Down,
            fields: MetricFields::default(),
            timestamp: Utc::now(),
            error: Some(error.into()),
        }
    }
}
