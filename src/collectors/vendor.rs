//! Vendor REST API collector
//!
//! One run calls the system status endpoint and, depending on the
//! [`CollectionMode`], the performance and interface endpoints. Status is
//! load-bearing: when it fails the run fails. Performance and interface
//! calls may fail on their own, which degrades the run instead.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::config::CollectorConfig;
use crate::error::{CheckError, Endpoint};
use crate::tasks::{DeviceTask, Management, TokenMode};
use crate::util::Secrets;
use crate::{DeviceMetricsSample, InterfaceSample, MetricFields, Status};

use super::fields::{self, InterfaceRecord};
use super::{CollectionMode, DeviceCollection};

#[derive(Debug, Clone)]
struct EndpointPaths {
    status: String,
    perf: String,
    iface: String,
}

impl EndpointPaths {
    fn for_endpoint(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Status => &self.status,
            Endpoint::Perf => &self.perf,
            Endpoint::Iface => &self.iface,
        }
    }
}

pub struct VendorApiCollector {
    client: reqwest::Client,
    secrets: Secrets,
    paths: EndpointPaths,
    default_token_mode: TokenMode,
}

/// Outcome of an optional endpoint for the composite error message
enum Optional {
    Skipped,
    Ok(Value),
    Failed(CheckError),
}

impl Optional {
    fn describe(&self) -> String {
        match self {
            Optional::Skipped => "skipped".to_string(),
            Optional::Ok(_) => "ok".to_string(),
            Optional::Failed(e) => format!("failed ({e})"),
        }
    }

    fn document(&self) -> Option<&Value> {
        match self {
            Optional::Ok(doc) => Some(doc),
            _ => None,
        }
    }
}

impl VendorApiCollector {
    pub fn new(config: &CollectorConfig, secrets: Secrets) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("failed to build vendor API client")?;

        Ok(Self {
            client,
            secrets,
            paths: EndpointPaths {
                status: config.status_path.clone(),
                perf: config.perf_path.clone(),
                iface: config.iface_path.clone(),
            },
            default_token_mode: config.token_mode,
        })
    }

    fn resolve_token(&self, token: &Option<String>, token_ref: &Option<String>) -> Option<String> {
        token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| token_ref.as_deref().and_then(|r| self.secrets.resolve(r)))
    }

    async fn fetch(
        &self,
        base_url: &str,
        token: &str,
        mode: TokenMode,
        endpoint: Endpoint,
    ) -> Result<Value, CheckError> {
        let url = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            self.paths.for_endpoint(endpoint)
        );
        trace!("requesting {endpoint} from {url}");

        let request = match mode {
            TokenMode::Query => self.client.get(&url).query(&[("access_token", token)]),
            TokenMode::Header => self.client.get(&url).bearer_auth(token),
        };

        // never let the token leak into an error message
        let response = request
            .send()
            .await
            .map_err(|e| CheckError::from_reqwest(&e.without_url()).at(endpoint))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CheckError::rate_limited(endpoint));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(
                CheckError::configuration(format!("{endpoint} rejected token ({status})"))
                    .at(endpoint),
            );
        }
        if !status.is_success() {
            return Err(
                CheckError::transport(format!("{endpoint} returned {status}")).at(endpoint),
            );
        }

        response.json::<Value>().await.map_err(|e| {
            CheckError::transport(format!("invalid {endpoint} payload: {}", e.without_url()))
                .at(endpoint)
        })
    }

    async fn fetch_optional(
        &self,
        base_url: &str,
        token: &str,
        token_mode: TokenMode,
        mode: CollectionMode,
        endpoint: Endpoint,
    ) -> Optional {
        if !mode.calls(endpoint) {
            return Optional::Skipped;
        }
        match self.fetch(base_url, token, token_mode, endpoint).await {
            Ok(doc) => Optional::Ok(doc),
            Err(e) => {
                debug!("optional {endpoint} call failed: {e}");
                Optional::Failed(e)
            }
        }
    }

    pub async fn collect(&self, device: &DeviceTask, mode: CollectionMode) -> DeviceCollection {
        let Management::Api {
            base_url,
            token,
            token_ref,
            token_mode,
        } = &device.management
        else {
            return DeviceCollection::failed(CheckError::configuration(
                "device is not managed through the vendor API",
            ));
        };

        let Some(base_url) = base_url.as_deref().filter(|url| !url.is_empty()) else {
            return DeviceCollection::failed(CheckError::configuration("missing base URL"));
        };

        let Some(token) = self.resolve_token(token, token_ref) else {
            warn!("no API token available for device {}", device.id);
            return DeviceCollection::failed(CheckError::configuration("missing API token"));
        };

        let token_mode = token_mode.unwrap_or(self.default_token_mode);

        let status_doc = match self.fetch(base_url, &token, token_mode, Endpoint::Status).await {
            Ok(doc) => doc,
            Err(e) => {
                let mut collection = DeviceCollection::failed(e);
                collection.sample.status = Status::Down;
                collection.invoked = vec![Endpoint::Status];
                return collection;
            }
        };

        let perf = self
            .fetch_optional(base_url, &token, token_mode, mode, Endpoint::Perf)
            .await;
        let iface = self
            .fetch_optional(base_url, &token, token_mode, mode, Endpoint::Iface)
            .await;

        let mut sample_fields = MetricFields {
            hostname: fields::text(&status_doc, &fields::HOSTNAME).value(),
            uptime_secs: fields::number(&status_doc, &fields::UPTIME)
                .value()
                .map(|secs| secs as u64),
            ..Default::default()
        };

        if let Some(doc) = perf.document() {
            sample_fields.cpu_percent = fields::number(doc, &fields::CPU).value();
            sample_fields.mem_percent = fields::number(doc, &fields::MEMORY).value();
            sample_fields.sessions = fields::number(doc, &fields::SESSIONS)
                .value()
                .map(|n| n as u64);
            if sample_fields.uptime_secs.is_none() {
                sample_fields.uptime_secs = fields::number(doc, &fields::UPTIME)
                    .value()
                    .map(|secs| secs as u64);
            }
        }

        if let Some(doc) = iface.document() {
            let records = fields::interface_records(doc);
            let (wan1, wan2, lan) = assign_interfaces(&records, &device.wan_ips);
            sample_fields.wan1 = wan1;
            sample_fields.wan2 = wan2;
            sample_fields.lan = lan;
        }

        let degraded =
            matches!(perf, Optional::Failed(_)) || matches!(iface, Optional::Failed(_));
        let error =
            degraded.then(|| format!("perf {}; iface {}", perf.describe(), iface.describe()));

        let mut invoked = vec![Endpoint::Status];
        let mut failures = Vec::new();
        for (endpoint, outcome) in [(Endpoint::Perf, perf), (Endpoint::Iface, iface)] {
            match outcome {
                Optional::Skipped => {}
                Optional::Ok(_) => invoked.push(endpoint),
                Optional::Failed(e) => {
                    invoked.push(endpoint);
                    failures.push(e);
                }
            }
        }

        DeviceCollection {
            sample: DeviceMetricsSample {
                reachable: true,
                status: if degraded { Status::Degraded } else { Status::Up },
                fields: sample_fields,
                timestamp: chrono::Utc::now(),
                error,
            },
            invoked,
            failures,
        }
    }
}

fn to_sample(record: &InterfaceRecord) -> InterfaceSample {
    InterfaceSample {
        status: record.link,
        ip: record.ip.clone(),
    }
}

/// Place interface records into the WAN1/WAN2/LAN slots.
///
/// Names are matched first (case-insensitive prefix: `wan2`, then `wan`, then
/// `lan`/`internal`). WAN slots still empty afterwards are filled from
/// records whose address is one of the device's known public WAN IPs, in the
/// order those IPs are listed. This catches PPPoE and other nonstandard names.
pub fn assign_interfaces(
    records: &[InterfaceRecord],
    wan_ips: &[String],
) -> (InterfaceSample, InterfaceSample, InterfaceSample) {
    let mut wan1: Option<usize> = None;
    let mut wan2: Option<usize> = None;
    let mut lan: Option<usize> = None;

    for (index, record) in records.iter().enumerate() {
        let name = record.name.to_ascii_lowercase();
        let slot = if name.starts_with("wan2") {
            &mut wan2
        } else if name.starts_with("wan") {
            &mut wan1
        } else if name.starts_with("lan") || name.starts_with("internal") {
            &mut lan
        } else {
            continue;
        };
        if slot.is_none() {
            *slot = Some(index);
        }
    }

    let mut by_wan_ip: Vec<(usize, usize)> = records
        .iter()
        .enumerate()
        .filter(|(index, _)| ![wan1, wan2, lan].contains(&Some(*index)))
        .filter_map(|(index, record)| {
            let ip = record.ip.as_deref()?;
            let rank = wan_ips.iter().position(|known| known == ip)?;
            Some((rank, index))
        })
        .collect();
    by_wan_ip.sort();

    let mut spare = by_wan_ip.into_iter().map(|(_, index)| index);
    for slot in [&mut wan1, &mut wan2] {
        if slot.is_none() {
            *slot = spare.next();
        }
    }

    let pick = |slot: Option<usize>| slot.map(|i| to_sample(&records[i])).unwrap_or_default();
    (pick(wan1), pick(wan2), pick(lan))
}
