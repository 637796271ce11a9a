//! SNMP collector: one GET per OID for uptime, CPU and memory
//!
//! The wire session lives entirely inside [`SnmpTransport::get`], so it is
//! opened and closed within one call on every path, including timeouts.
//! Each OID is its own round trip. If the first one fails the agent counts
//! as unreachable; a later failure only leaves that value missing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::{CheckError, Endpoint, ErrorKind};
use crate::util::resolve_indirect;
use crate::{DeviceMetricsSample, MetricFields, Status};

use super::DeviceCollection;

pub const DEFAULT_PORT: u16 = 161;

/// SNMPv2-MIB::sysUpTime.0, in centiseconds
pub const SYS_UPTIME: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 3, 0];
/// FORTINET-FORTIGATE-MIB::fgSysCpuUsage.0
pub const CPU_USAGE: &[u32] = &[1, 3, 6, 1, 4, 1, 12356, 101, 4, 1, 3, 0];
/// FORTINET-FORTIGATE-MIB::fgSysMemUsage.0
pub const MEM_USAGE: &[u32] = &[1, 3, 6, 1, 4, 1, 12356, 101, 4, 1, 4, 0];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnmpValue {
    Integer(i64),
    Unsigned(u64),
    Timeticks(u32),
    Text(String),
    Missing,
}

impl SnmpValue {
    fn as_u64(&self) -> Option<u64> {
        match self {
            SnmpValue::Integer(n) => u64::try_from(*n).ok(),
            SnmpValue::Unsigned(n) => Some(*n),
            SnmpValue::Timeticks(n) => Some(u64::from(*n)),
            SnmpValue::Text(s) => s.trim().parse().ok(),
            SnmpValue::Missing => None,
        }
    }
}

/// Performs one SNMP GET round against an agent
#[async_trait]
pub trait SnmpTransport: Send + Sync {
    /// Returns one value per requested OID, in request order
    async fn get(
        &self,
        target: &str,
        port: u16,
        community: &str,
        oids: &[&'static [u32]],
        timeout: Duration,
    ) -> Result<Vec<SnmpValue>, CheckError>;
}

/// SNMPv2c over UDP
pub struct UdpSnmpTransport;

#[cfg(feature = "snmp")]
fn blocking_get(
    address: String,
    community: String,
    oids: Vec<&'static [u32]>,
    timeout: Duration,
) -> Result<Vec<SnmpValue>, CheckError> {
    use ::snmp::{SnmpError, SyncSession, Value};

    let mut session = SyncSession::new(address.as_str(), community.as_bytes(), Some(timeout), 0)
        .map_err(|e| CheckError::transport(format!("snmp session failed: {e}")))?;

    collect_values(&oids, |oid| {
        let mut response = session.get(oid).map_err(|e| match e {
            SnmpError::ReceiveError | SnmpError::SendError => CheckError::timeout("snmp timeout"),
            other => CheckError::transport(format!("snmp error: {other:?}")),
        })?;

        Ok(match response.varbinds.next() {
            Some((_, Value::Integer(n))) => SnmpValue::Integer(n),
            Some((_, Value::Counter32(n))) | Some((_, Value::Unsigned32(n))) => {
                SnmpValue::Unsigned(u64::from(n))
            }
            Some((_, Value::Counter64(n))) => SnmpValue::Unsigned(n),
            Some((_, Value::Timeticks(n))) => SnmpValue::Timeticks(n),
            Some((_, Value::OctetString(bytes))) => {
                SnmpValue::Text(String::from_utf8_lossy(bytes).into_owned())
            }
            _ => SnmpValue::Missing,
        })
    })
}

/// Issue one GET per OID in order.
///
/// A failure on the first OID fails the round. Later failures become
/// [`SnmpValue::Missing`] so the values already read are kept.
#[cfg_attr(not(feature = "snmp"), allow(dead_code))]
fn collect_values<F>(oids: &[&'static [u32]], mut get: F) -> Result<Vec<SnmpValue>, CheckError>
where
    F: FnMut(&'static [u32]) -> Result<SnmpValue, CheckError>,
{
    let mut values = Vec::with_capacity(oids.len());
    for (index, &oid) in oids.iter().enumerate() {
        match get(oid) {
            Ok(value) => values.push(value),
            Err(e) if index == 0 => return Err(e),
            Err(e) => {
                debug!("snmp get {oid:?} failed, keeping {} earlier values: {e}", values.len());
                values.push(SnmpValue::Missing);
            }
        }
    }
    Ok(values)
}

#[async_trait]
impl SnmpTransport for UdpSnmpTransport {
    #[cfg(feature = "snmp")]
    async fn get(
        &self,
        target: &str,
        port: u16,
        community: &str,
        oids: &[&'static [u32]],
        timeout: Duration,
    ) -> Result<Vec<SnmpValue>, CheckError> {
        let address = format!("{target}:{port}");
        let community = community.to_string();
        let oids = oids.to_vec();
        let budget = timeout * (oids.len() as u32 + 1);

        // the blocking session bounds each receive by `timeout` and is dropped
        // (socket closed) when the closure returns
        let task =
            tokio::task::spawn_blocking(move || blocking_get(address, community, oids, timeout));
        match tokio::time::timeout(budget, task).await {
            Err(_) => Err(CheckError::timeout("snmp timeout")),
            Ok(Err(join)) => Err(CheckError::transport(format!("snmp worker failed: {join}"))),
            Ok(Ok(result)) => result,
        }
    }

    #[cfg(not(feature = "snmp"))]
    async fn get(
        &self,
        _target: &str,
        _port: u16,
        _community: &str,
        _oids: &[&'static [u32]],
        _timeout: Duration,
    ) -> Result<Vec<SnmpValue>, CheckError> {
        Err(CheckError::configuration("built without SNMP support"))
    }
}

pub struct SnmpCollector {
    transport: Arc<dyn SnmpTransport>,
    timeout: Duration,
}

impl SnmpCollector {
    pub fn new(transport: Arc<dyn SnmpTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    #[instrument(skip(self, community))]
    pub async fn collect(
        &self,
        target: &str,
        port: Option<u16>,
        community: &str,
    ) -> DeviceCollection {
        let Some(community) = resolve_indirect(community) else {
            return DeviceCollection::failed(CheckError::configuration(
                "snmp community reference could not be resolved",
            ));
        };

        let oids = [SYS_UPTIME, CPU_USAGE, MEM_USAGE];
        let result = self
            .transport
            .get(target, port.unwrap_or(DEFAULT_PORT), &community, &oids, self.timeout)
            .await;

        match result {
            Ok(values) => DeviceCollection::new(
                sample_from_values(&values),
                vec![Endpoint::Status, Endpoint::Perf],
            ),
            Err(e) if e.kind == ErrorKind::Configuration => DeviceCollection::failed(e),
            Err(e) => {
                debug!("snmp collection from {target} failed: {e}");
                let mut collection = DeviceCollection::failed(e);
                collection.sample.status = Status::Down;
                collection.invoked = vec![Endpoint::Status];
                collection
            }
        }
    }
}

/// Build a sample from `[uptime, cpu, mem]` values
pub fn sample_from_values(values: &[SnmpValue]) -> DeviceMetricsSample {
    let value = |index: usize| values.get(index).and_then(SnmpValue::as_u64);

    DeviceMetricsSample {
        reachable: true,
        status: Status::Up,
        fields: MetricFields {
            uptime_secs: value(0).map(|centiseconds| centiseconds / 100),
            cpu_percent: value(1).map(|n| n as f64),
            mem_percent: value(2).map(|n| n as f64),
            ..Default::default()
        },
        timestamp: chrono::Utc::now(),
        error: None,
    }
}
