//! Message types for talking to the agent actor

use serde::Serialize;
use tokio::sync::oneshot;

use crate::scheduler::{SchedulerSnapshot, SkipReason};

/// Commands accepted by the [`AgentActor`](super::agent::AgentActor)
#[derive(Debug)]
pub enum AgentCommand {
    /// Pull tasks right away instead of waiting for the pull interval
    PullNow {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    /// Run one full cycle now: pull, monitors, one device step, report
    RunCycle {
        respond_to: oneshot::Sender<CycleSummary>,
    },

    /// Read-only view of scheduler state
    Snapshot {
        respond_to: oneshot::Sender<SchedulerSnapshot>,
    },

    /// Flush pending reports and stop
    Shutdown,
}

/// What one pass through the control loop did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSummary {
    pub pulled: bool,
    pub monitors_checked: usize,
    pub device_checked: Option<String>,
    pub device_skipped: Option<(String, SkipReason)>,
    pub acknowledged: Vec<String>,
    pub batch_id: Option<String>,
    pub delivered: usize,
    pub queued: usize,
}
