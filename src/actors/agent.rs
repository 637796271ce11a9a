//! AgentActor - runs the control loop
//!
//! ```text
//! tick ─► pull (every pull_interval) ─► monitors ─► device step (every step interval)
//!   ▲                                                     │
//!   └── commands (PullNow, RunCycle, Snapshot, Shutdown)  └─► outbox ─► push
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, instrument, warn};

use crate::collectors::DeviceCollector;
use crate::config::SchedulerConfig;
use crate::probes::Prober;
use crate::scheduler::{Scheduler, SchedulerSnapshot};
use crate::transport::{ControlPlane, ControlPlaneError, Outbox};
use crate::util::span;

use super::messages::{AgentCommand, CycleSummary};

/// The I/O the actor drives
#[derive(Clone)]
pub struct Services {
    pub prober: Arc<dyn Prober>,
    pub collector: Arc<dyn DeviceCollector>,
    pub control_plane: Arc<dyn ControlPlane>,
}

pub struct AgentActor {
    scheduler: Scheduler,
    services: Services,
    outbox: Outbox,
    command_rx: mpsc::Receiver<AgentCommand>,
    last_pull: Option<DateTime<Utc>>,
    last_device_step: Option<DateTime<Utc>>,
}

fn due(last: Option<DateTime<Utc>>, every_secs: u64, now: DateTime<Utc>) -> bool {
    last.is_none_or(|at| now - at >= span(every_secs))
}

impl AgentActor {
    pub fn new(
        config: SchedulerConfig,
        agent_id: &str,
        services: Services,
        command_rx: mpsc::Receiver<AgentCommand>,
    ) -> Self {
        let outbox = Outbox::new(agent_id, config.outbox_capacity);
        Self {
            scheduler: Scheduler::new(config),
            services,
            outbox,
            command_rx,
            last_pull: None,
            last_device_step: None,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting agent actor");

        let tick = self.scheduler.config().tick();
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle(Utc::now(), false).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        AgentCommand::PullNow { respond_to } => {
                            let result = self.pull(Utc::now()).await;
                            let _ = respond_to.send(result.map_err(anyhow::Error::from));
                        }

                        AgentCommand::RunCycle { respond_to } => {
                            let summary = self.cycle(Utc::now(), true).await;
                            let _ = respond_to.send(summary);
                        }

                        AgentCommand::Snapshot { respond_to } => {
                            let _ = respond_to.send(self.scheduler.snapshot());
                        }

                        AgentCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        if !self.outbox.is_empty() {
            self.outbox.flush(self.services.control_plane.as_ref()).await;
        }
        if !self.outbox.is_empty() {
            warn!("{} report batches undelivered at shutdown", self.outbox.len());
        }
        debug!("agent actor stopped");
    }

    async fn pull(&mut self, now: DateTime<Utc>) -> Result<(), ControlPlaneError> {
        self.last_pull = Some(now);
        match self.services.control_plane.pull().await {
            Ok(bundle) => {
                self.scheduler.apply_bundle(bundle, now);
                Ok(())
            }
            Err(e) => {
                match &e {
                    ControlPlaneError::Unauthorized(_) => {
                        error!("task pull rejected, check the agent token: {e}")
                    }
                    _ => warn!("task pull failed, keeping previous tasks: {e}"),
                }
                Err(e)
            }
        }
    }

    /// One pass through the loop. `force` ignores the pull and device-step
    /// timers; monitor and device gates still apply.
    async fn cycle(&mut self, now: DateTime<Utc>, force: bool) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let config = self.scheduler.config().clone();

        if force || due(self.last_pull, config.pull_interval_secs, now) {
            summary.pulled = self.pull(now).await.is_ok();
        }

        let monitors = self
            .scheduler
            .run_monitors(self.services.prober.as_ref(), now)
            .await;
        summary.monitors_checked = monitors.len();

        let mut devices = Vec::new();
        let mut backoff = Vec::new();
        if force || due(self.last_device_step, config.device_step_interval_secs, now) {
            self.last_device_step = Some(now);
            let step = self
                .scheduler
                .run_device_step(self.services.collector.as_ref(), now)
                .await;
            summary.device_checked = step.report.as_ref().map(|r| r.device_id.clone());
            summary.device_skipped = step.skipped;
            summary.acknowledged = step.acknowledgements.clone();
            devices.extend(step.report);
            backoff = step.backoff;
        }

        summary.batch_id =
            self.outbox
                .enqueue(monitors, devices, backoff, summary.acknowledged.clone());
        if !self.outbox.is_empty() {
            summary.delivered = self
                .outbox
                .flush(self.services.control_plane.as_ref())
                .await;
        }
        summary.queued = self.outbox.len();

        if summary.batch_id.is_some() {
            info!(
                "cycle: {} monitors, device {}, {} acknowledged, {} delivered, {} queued",
                summary.monitors_checked,
                summary.device_checked.as_deref().unwrap_or("-"),
                summary.acknowledged.len(),
                summary.delivered,
                summary.queued
            );
        }
        summary
    }
}

/// Handle for controlling an [`AgentActor`]
#[derive(Clone)]
pub struct AgentHandle {
    sender: mpsc::Sender<AgentCommand>,
    pub agent_id: String,
}

impl AgentHandle {
    /// Spawn the actor on the current runtime
    pub fn spawn(
        config: SchedulerConfig,
        agent_id: &str,
        services: Services,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = AgentActor::new(config, agent_id, services, cmd_rx);
        let task = tokio::spawn(actor.run());

        (
            Self {
                sender: cmd_tx,
                agent_id: agent_id.to_string(),
            },
            task,
        )
    }

    pub async fn pull_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AgentCommand::PullNow { respond_to: tx })
            .await
            .context("failed to send PullNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AgentCommand::RunCycle { respond_to: tx })
            .await
            .context("failed to send RunCycle command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AgentCommand::Snapshot { respond_to: tx })
            .await
            .context("failed to send Snapshot command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(AgentCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
