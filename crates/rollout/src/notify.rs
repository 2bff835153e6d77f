use anyhow::Result;
use tracing::{info, warn};

use crate::{Outcome, RolloutReport};

/// Receives the finished report. Delivery channels (chat, mail, CI status)
/// live behind this trait.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &RolloutReport) -> Result<()>;
}

/// Emits one structured log event per rollout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait::async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, report: &RolloutReport) -> Result<()> {
        let took_ms = (report.finished_at - report.started_at).num_milliseconds();
        match report.outcome {
            Outcome::Succeeded | Outcome::SucceededWithWarnings => info!(
                rollout = %report.id,
                environment = %report.environment,
                outcome = report.outcome.as_str(),
                warnings = report.warnings.len(),
                took_ms,
                "rollout finished"
            ),
            Outcome::Failed | Outcome::Cancelled => warn!(
                rollout = %report.id,
                environment = %report.environment,
                outcome = report.outcome.as_str(),
                fatal = ?report.fatal.as_ref().map(|e| e.to_string()),
                took_ms,
                "rollout finished"
            ),
        }
        Ok(())
    }
}
