//! Device telemetry collectors
//!
//! Collectors are request/response functions: given a device and a
//! [`CollectionMode`] they produce a [`DeviceCollection`] and nothing else.
//! Retry, backoff and caching decisions belong to the scheduler, which reads
//! the typed failures carried on the collection.

pub mod fields;
pub mod snmp;
pub mod vendor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::config::Config;
use crate::error::{CheckError, Endpoint};
use crate::probes::TcpProbe;
use crate::tasks::{DeviceTask, Management};
use crate::util::Secrets;
use crate::{DeviceMetricsSample, MetricFields, Status};

pub use self::snmp::{SnmpCollector, SnmpTransport, SnmpValue};
pub use vendor::VendorApiCollector;

/// Which vendor endpoints a run calls. Status is always called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionMode {
    Status,
    Performance,
    Interface,
}

impl CollectionMode {
    pub fn calls(self, endpoint: Endpoint) -> bool {
        match endpoint {
            Endpoint::Status => true,
            Endpoint::Perf => matches!(self, CollectionMode::Performance | CollectionMode::Interface),
            Endpoint::Iface => self == CollectionMode::Interface,
        }
    }
}

/// Everything one collector run produced
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCollection {
    pub sample: DeviceMetricsSample,
    /// Endpoints that were actually requested this run
    pub invoked: Vec<Endpoint>,
    /// Per-endpoint failures, each tagged with its endpoint
    pub failures: Vec<CheckError>,
}

impl DeviceCollection {
    pub fn new(sample: DeviceMetricsSample, invoked: Vec<Endpoint>) -> Self {
        Self {
            sample,
            invoked,
            failures: Vec::new(),
        }
    }

    /// A run that failed before any endpoint could be called
    pub fn failed(error: CheckError) -> Self {
        let sample = DeviceMetricsSample {
            reachable: false,
            status: error.kind.status(),
            fields: MetricFields::default(),
            timestamp: chrono::Utc::now(),
            error: Some(error.to_string()),
        };
        Self {
            sample,
            invoked: Vec::new(),
            failures: vec![error],
        }
    }

    /// Endpoints that answered with a rate-limit signal
    pub fn rate_limited(&self) -> Vec<Endpoint> {
        self.failures
            .iter()
            .filter(|failure| failure.is_rate_limited())
            .filter_map(|failure| failure.endpoint)
            .collect()
    }
}

/// Collects telemetry from one device
///
/// An `Err` means something unexpected went wrong; the scheduler classifies
/// it at its own boundary. Expected failures are reported inside the
/// returned collection.
#[async_trait]
pub trait DeviceCollector: Send + Sync {
    async fn collect(
        &self,
        device: &DeviceTask,
        mode: CollectionMode,
    ) -> anyhow::Result<DeviceCollection>;
}

/// Dispatches each device to the collector matching its management variant
pub struct Collectors {
    vendor: VendorApiCollector,
    snmp: SnmpCollector,
    tcp: TcpProbe,
    default_ports: Vec<u16>,
}

impl Collectors {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            vendor: VendorApiCollector::new(
                &config.collectors,
                Secrets::new(config.secrets.clone()),
            )?,
            snmp: SnmpCollector::new(
                Arc::new(self::snmp::UdpSnmpTransport),
                Duration::from_millis(config.collectors.snmp_timeout_ms),
            ),
            tcp: TcpProbe::new(Duration::from_millis(config.probes.tcp_timeout_ms)),
            default_ports: config.probes.default_tcp_ports.clone(),
        })
    }

    async fn reachability(&self, host: &str, ports: &[u16]) -> DeviceCollection {
        let ports = if ports.is_empty() {
            &self.default_ports
        } else {
            ports
        };
        let result = self.tcp.check(host, ports).await;
        let sample = DeviceMetricsSample {
            reachable: result.status != Status::Down,
            status: result.status,
            fields: MetricFields::default(),
            timestamp: result.timestamp,
            error: result.error,
        };
        DeviceCollection::new(sample, vec![Endpoint::Status])
    }
}

#[async_trait]
impl DeviceCollector for Collectors {
    #[instrument(skip_all, fields(device = %device.id))]
    async fn collect(
        &self,
        device: &DeviceTask,
        mode: CollectionMode,
    ) -> anyhow::Result<DeviceCollection> {
        Ok(match &device.management {
            Management::Api { .. } => self.vendor.collect(device, mode).await,
            Management::Snmp {
                target,
                port,
                community,
            } => self.snmp.collect(target, *port, community).await,
            Management::TcpOnly { host, ports } => self.reachability(host, ports).await,
        })
    }
}
