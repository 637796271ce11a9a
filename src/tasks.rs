//! Task definitions pulled from the central service
//!
//! The agent never mutates these; they are replaced wholesale on every pull.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Protocol;

fn default_monitor_interval() -> u64 {
    60
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_success_threshold() -> u32 {
    1
}

fn default_expected_status() -> u16 {
    200
}

fn default_active() -> bool {
    true
}

/// A reachability check against one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorTask {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub target: String,
    #[serde(flatten)]
    pub protocol: MonitorProtocol,
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl MonitorTask {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(self.failure_threshold, self.success_threshold)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum MonitorProtocol {
    Icmp,
    Tcp {
        /// Tried in order; empty means the agent's default ports
        #[serde(default)]
        ports: Vec<u16>,
    },
    Http {
        /// Falls back to `http://<target>` when absent
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default = "default_expected_status")]
        expected_status: u16,
    },
}

impl MonitorProtocol {
    pub fn kind(&self) -> Protocol {
        match self {
            MonitorProtocol::Icmp => Protocol::Icmp,
            MonitorProtocol::Tcp { .. } => Protocol::Tcp,
            MonitorProtocol::Http { .. } => Protocol::Http,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
}

/// Hysteresis thresholds, both floored at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub failure: u32,
    pub success: u32,
}

impl Thresholds {
    pub fn new(failure: u32, success: u32) -> Self {
        Self {
            failure: failure.max(1),
            success: success.max(1),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(default_failure_threshold(), default_success_threshold())
    }
}

/// How an API token is presented to the vendor API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenMode {
    /// `?access_token=<token>`
    #[default]
    Query,
    /// `Authorization: Bearer <token>`
    Header,
}

/// A managed device whose health telemetry the agent collects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTask {
    pub id: String,
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(flatten)]
    pub management: Management,

    /// Known public WAN addresses, used to place oddly named interfaces
    #[serde(default)]
    pub wan_ips: Vec<String>,

    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub backoff_base_secs: Option<u64>,
    #[serde(default)]
    pub backoff_cap_secs: Option<u64>,
    #[serde(default)]
    pub iface_cooldown_secs: Option<u64>,
}

impl DeviceTask {
    /// Stable rotation order: site, then hostname, then id
    pub fn rotation_key(&self) -> (&str, &str, &str) {
        (&self.site, &self.hostname, &self.id)
    }

    pub fn display_name(&self) -> &str {
        if self.hostname.is_empty() {
            &self.id
        } else {
            &self.hostname
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "management", rename_all = "snake_case")]
pub enum Management {
    Api {
        #[serde(default)]
        base_url: Option<String>,
        /// Pre-resolved token
        #[serde(default)]
        token: Option<String>,
        /// Name of a locally known secret (or `env:NAME`)
        #[serde(default)]
        token_ref: Option<String>,
        #[serde(default)]
        token_mode: Option<TokenMode>,
    },
    Snmp {
        target: String,
        #[serde(default)]
        port: Option<u16>,
        /// Literal community or an `env:NAME` reference
        community: String,
    },
    TcpOnly {
        host: String,
        #[serde(default)]
        ports: Vec<u16>,
    },
}

/// User-triggered request to check a device out of cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualRunRequest {
    pub id: String,
    pub device_id: String,
    pub requested_at: DateTime<Utc>,
}
