//! Exchange with the central service
//!
//! The agent pulls a [`TaskBundle`] and pushes [`ReportBatch`]es. Batches
//! that fail to send stay in the [`Outbox`] and are retried in order on the
//! next flush; the central service de-duplicates on `batch_id`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::backoff::BackoffState;
use crate::collectors::CollectionMode;
use crate::tasks::{DeviceTask, ManualRunRequest, MonitorTask};
use crate::{CheckResult, DeviceMetricsSample};

pub const TASKS_PATH: &str = "/api/agent/tasks";
pub const REPORT_PATH: &str = "/api/agent/report";

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("central service rejected the agent token (HTTP {0})")]
    Unauthorized(u16),
    #[error("central service answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request to central service failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not decode central service response: {0}")]
    Decode(String),
}

/// Everything the agent should be doing, replaced wholesale on every pull
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBundle {
    #[serde(default)]
    pub monitors: Vec<MonitorTask>,
    #[serde(default)]
    pub devices: Vec<DeviceTask>,
    /// Backoff rows persisted from earlier runs (possibly by another agent)
    #[serde(default)]
    pub backoff: Vec<BackoffState>,
    #[serde(default)]
    pub manual_requests: Vec<ManualRunRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub monitor_id: String,
    pub result: CheckResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub mode: CollectionMode,
    pub sample: DeviceMetricsSample,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBatch {
    pub batch_id: String,
    pub agent_id: String,
    pub generated_at: DateTime<Utc>,
    pub monitors: Vec<MonitorReport>,
    pub devices: Vec<DeviceReport>,
    /// Backoff rows changed since the last batch
    pub backoff: Vec<BackoffState>,
    /// Manual run request ids consumed by this agent
    pub acknowledgements: Vec<String>,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn pull(&self) -> Result<TaskBundle, ControlPlaneError>;
    async fn push(&self, batch: &ReportBatch) -> Result<(), ControlPlaneError>;
}

pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    agent_id: String,
    token: Option<String>,
}

impl HttpControlPlane {
    pub fn new(
        base_url: &str,
        agent_id: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_id: agent_id.to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ControlPlaneError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    #[instrument(skip(self), fields(agent = %self.agent_id))]
    async fn pull(&self) -> Result<TaskBundle, ControlPlaneError> {
        let request = self
            .client
            .get(format!("{}{TASKS_PATH}", self.base_url))
            .query(&[("agent_id", self.agent_id.as_str())]);
        let response = Self::check(self.authorize(request).send().await?).await?;

        let body = response.text().await?;
        let bundle: TaskBundle =
            serde_json::from_str(&body).map_err(|e| ControlPlaneError::Decode(e.to_string()))?;
        debug!(
            "pulled {} monitors, {} devices, {} manual requests",
            bundle.monitors.len(),
            bundle.devices.len(),
            bundle.manual_requests.len()
        );
        Ok(bundle)
    }

    #[instrument(skip_all, fields(batch = %batch.batch_id))]
    async fn push(&self, batch: &ReportBatch) -> Result<(), ControlPlaneError> {
        let request = self
            .client
            .post(format!("{}{REPORT_PATH}", self.base_url))
            .json(batch);
        Self::check(self.authorize(request).send().await?).await?;
        Ok(())
    }
}

/// Bounded queue of unsent report batches
#[derive(Debug)]
pub struct Outbox {
    agent_id: String,
    capacity: usize,
    sequence: u64,
    pending: VecDeque<ReportBatch>,
}

impl Outbox {
    pub fn new(agent_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            agent_id: agent_id.into(),
            capacity: capacity.max(1),
            sequence: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &ReportBatch> {
        self.pending.iter()
    }

    /// Queue a batch; empty reports are not queued. Returns the batch id.
    ///
    /// When the outbox is full the oldest batch is dropped; its
    /// acknowledgements and backoff rows move into the new batch.
    pub fn enqueue(
        &mut self,
        monitors: Vec<MonitorReport>,
        devices: Vec<DeviceReport>,
        mut backoff: Vec<BackoffState>,
        mut acknowledgements: Vec<String>,
    ) -> Option<String> {
        if monitors.is_empty()
            && devices.is_empty()
            && backoff.is_empty()
            && acknowledgements.is_empty()
        {
            return None;
        }

        let generated_at = Utc::now();
        self.sequence += 1;
        let batch_id = format!(
            "{}-{}-{}",
            self.agent_id,
            generated_at.timestamp_millis(),
            self.sequence
        );

        while self.pending.len() >= self.capacity {
            let Some(dropped) = self.pending.pop_front() else {
                break;
            };
            warn!(
                "outbox full, dropping oldest report batch {} ({} monitor, {} device results)",
                dropped.batch_id,
                dropped.monitors.len(),
                dropped.devices.len()
            );
            carry_forward(dropped, &mut backoff, &mut acknowledgements);
        }

        self.pending.push_back(ReportBatch {
            batch_id: batch_id.clone(),
            agent_id: self.agent_id.clone(),
            generated_at,
            monitors,
            devices,
            backoff,
            acknowledgements,
        });
        Some(batch_id)
    }

    /// Send queued batches oldest first, stopping at the first failure.
    /// Returns how many were delivered.
    pub async fn flush<P>(&mut self, plane: &P) -> usize
    where
        P: ControlPlane + ?Sized,
    {
        let mut delivered = 0;
        while let Some(batch) = self.pending.front() {
            match plane.push(batch).await {
                Ok(()) => {
                    debug!("delivered report batch {}", batch.batch_id);
                    self.pending.pop_front();
                    delivered += 1;
                }
                Err(e) => {
                    warn!(
                        "could not deliver report batch {} ({} queued): {e}",
                        batch.batch_id,
                        self.pending.len()
                    );
                    break;
                }
            }
        }
        delivered
    }
}

/// Fold the bookkeeping of a dropped batch into the batch replacing it.
/// Backoff rows already present in the newer batch win.
fn carry_forward(
    dropped: ReportBatch,
    backoff: &mut Vec<BackoffState>,
    acknowledgements: &mut Vec<String>,
) {
    let mut acks = dropped.acknowledgements;
    acks.retain(|id| !acknowledgements.contains(id));
    if !acks.is_empty() {
        debug!(
            "carrying {} acknowledgements from dropped batch {}",
            acks.len(),
            dropped.batch_id
        );
    }
    acks.append(acknowledgements);
    *acknowledgements = acks;

    let mut rows: Vec<BackoffState> = dropped
        .backoff
        .into_iter()
        .filter(|row| !backoff.iter().any(|newer| newer.device_id == row.device_id))
        .collect();
    rows.append(backoff);
    *backoff = rows;
}
