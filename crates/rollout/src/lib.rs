//! Portico rollout: composes the stages into one pipeline and reports on it.
//!
//! Only a blocking structural finding, a missing prerequisite, a fatal apply
//! failure or cancellation halts a rollout. Everything else is collected as a
//! warning on the [`RolloutReport`].

#![forbid(unsafe_code)]

mod notify;
mod pipeline;
mod report;

pub use notify::{Notifier, TracingNotifier};
pub use pipeline::Orchestrator;
pub use report::{Outcome, RolloutReport, Stage, StagePayloads, StageStatus, StageSummary};
