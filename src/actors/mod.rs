//! The agent as an actor
//!
//! ```text
//!               ┌────────────── AgentHandle (clone anywhere)
//!               │ mpsc: PullNow / RunCycle / Snapshot / Shutdown
//!               ▼
//!   ticker ─► AgentActor ── owns ──► Scheduler
//!               │                      ├─ Prober          (monitors)
//!               │                      └─ DeviceCollector (devices)
//!               └─► Outbox ─► ControlPlane (pull tasks, push reports)
//! ```
//!
//! The actor is the single owner of all scheduling state, so nothing in the
//! scheduler needs a lock. Replies travel back over oneshot channels.

pub mod agent;
pub mod messages;

pub use agent::{AgentActor, AgentHandle, Services};
pub use messages::{AgentCommand, CycleSummary};
