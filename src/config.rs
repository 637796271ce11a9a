use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use tracing::trace;

use crate::tasks::TokenMode;
use crate::util::{get_agent_id, get_agent_token, get_server_url, resolve_indirect};

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    /// Base URL of the central service
    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default)]
    pub agent_id: Option<String>,

    /// Timeout for pulls and report pushes; 10 seconds when unset
    #[serde(default)]
    pub server_timeout_ms: Option<u64>,

    /// Literal token or `env:NAME` reference
    #[serde(default)]
    pub agent_token: Option<String>,

    /// Token references resolvable by name (see [`crate::util::Secrets`])
    #[serde(default)]
    pub secrets: HashMap<String, String>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub probes: ProbeConfig,

    #[serde(default)]
    pub collectors: CollectorConfig,
}

impl Config {
    /// Environment variables win over the file
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = get_server_url() {
            self.server_url = Some(url);
        }
        if let Some(token) = get_agent_token() {
            self.agent_token = Some(token);
        }
        if let Some(id) = get_agent_id() {
            self.agent_id = Some(id);
        }
        self
    }

    pub fn server_url(&self) -> anyhow::Result<&str> {
        self.server_url
            .as_deref()
            .context("no server_url configured (set it in the config file or UPLINK_SERVER_URL)")
    }

    pub fn agent_token(&self) -> Option<String> {
        self.agent_token.as_deref().and_then(resolve_indirect)
    }

    pub fn agent_id(&self) -> String {
        self.agent_id.clone().unwrap_or_else(|| "agent".to_string())
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms.unwrap_or(10_000).max(1))
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Control loop granularity
    pub tick_ms: u64,
    pub pull_interval_secs: u64,
    /// Width of the monitor worker pool
    pub monitor_concurrency: usize,
    pub device_step_interval_secs: u64,
    /// Accepted for compatibility; device checks always run one at a time
    pub device_concurrency: usize,
    /// Minimum time between two scheduled runs of the same device
    pub device_interval_secs: u64,
    pub perf_interval_secs: u64,
    pub iface_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub iface_cooldown_secs: u64,
    /// Maximum number of unsent report batches kept for retry
    pub outbox_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            pull_interval_secs: 60,
            monitor_concurrency: 2,
            device_step_interval_secs: 15,
            device_concurrency: 1,
            device_interval_secs: 300,
            perf_interval_secs: 0,
            iface_interval_secs: 0,
            backoff_base_secs: 600,
            backoff_cap_secs: 3600,
            iface_cooldown_secs: 1800,
            outbox_capacity: 32,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn monitor_width(&self) -> usize {
        self.monitor_concurrency.max(1)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub icmp_timeout_ms: u64,
    pub tcp_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub default_tcp_ports: Vec<u16>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            icmp_timeout_ms: 2500,
            tcp_timeout_ms: 3000,
            http_timeout_ms: 10_000,
            default_tcp_ports: vec![443, 80],
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub request_timeout_ms: u64,
    pub snmp_timeout_ms: u64,
    pub token_mode: TokenMode,
    /// Management UIs are usually self-signed
    pub verify_tls: bool,
    pub status_path: String,
    pub perf_path: String,
    pub iface_path: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            snmp_timeout_ms: 3000,
            token_mode: TokenMode::Query,
            verify_tls: false,
            status_path: "/api/v2/monitor/system/status".to_string(),
            perf_path: "/api/v2/monitor/system/performance/status".to_string(),
            iface_path: "/api/v2/monitor/system/interface".to_string(),
        }
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read configuration file {path}"))?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
