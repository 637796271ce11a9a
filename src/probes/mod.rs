//! Protocol probes - stateless reachability checks against one target
//!
//! Every probe returns a typed [`CheckResult`]; nothing here keeps state
//! between calls or lets an error escape. Circuit breaking and scheduling
//! live in the scheduler.

pub mod http;
pub mod icmp;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use crate::CheckResult;
use crate::config::ProbeConfig;
use crate::tasks::{MonitorProtocol, MonitorTask};

pub use http::HttpProbe;
pub use icmp::{IcmpOutcome, IcmpProbe};
pub use tcp::TcpProbe;

/// Executes a single monitor check
///
/// The scheduler only talks to this trait so tests can substitute scripted
/// outcomes for real network I/O.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn check(&self, task: &MonitorTask) -> CheckResult;
}

/// Prober backed by the real ICMP, TCP and HTTP probes
pub struct NetworkProber {
    icmp: IcmpProbe,
    tcp: TcpProbe,
    http: HttpProbe,
    default_ports: Vec<u16>,
}

impl NetworkProber {
    pub fn new(config: &ProbeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            icmp: IcmpProbe::new(Duration::from_millis(config.icmp_timeout_ms)),
            tcp: TcpProbe::new(Duration::from_millis(config.tcp_timeout_ms)),
            http: HttpProbe::new(Duration::from_millis(config.http_timeout_ms))?,
            default_ports: config.default_tcp_ports.clone(),
        })
    }
}

#[async_trait]
impl Prober for NetworkProber {
    #[instrument(skip_all, fields(monitor = %task.id, target = %task.target))]
    async fn check(&self, task: &MonitorTask) -> CheckResult {
        match &task.protocol {
            MonitorProtocol::Icmp => self.icmp.check(&task.target).await,
            MonitorProtocol::Tcp { ports } => {
                let ports = if ports.is_empty() {
                    &self.default_ports
                } else {
                    ports
                };
                self.tcp.check(&task.target, ports).await
            }
            MonitorProtocol::Http {
                url,
                method,
                expected_status,
            } => {
                let url = url
                    .clone()
                    .unwrap_or_else(|| format!("http://{}", task.target));
                self.http.check(&url, *method, *expected_status).await
            }
        }
    }
}
