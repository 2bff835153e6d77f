use serde::{Deserialize, Serialize};

/// Rollout error taxonomy. Only some variants halt a rollout; see [`RolloutError::is_fatal`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RolloutError {
    #[error("structural validation failed: {}", .findings.join("; "))]
    StructuralValidation { findings: Vec<String> },
    #[error("prerequisite missing: {capability} ({action})")]
    PrerequisiteMissing { capability: String, action: String },
    #[error("apply failed for {record}: {reason}")]
    ApplyFailure { record: String, reason: String, required: bool },
    #[error("{resource} not ready after {waited_secs}s")]
    ReadinessTimeout { resource: String, waited_secs: u64 },
    #[error("probe {target} failed: {detail}")]
    ProbeFailure { target: String, detail: String },
    #[error("posture: {message}")]
    PostureFinding { message: String },
    #[error("rollout cancelled during {stage}")]
    Cancelled { stage: String },
    #[error("cluster: {message}")]
    Cluster { message: String },
}

impl RolloutError {
    pub fn is_fatal(&self) -> bool {
        match self {
            RolloutError::StructuralValidation { .. }
            | RolloutError::PrerequisiteMissing { .. }
            | RolloutError::Cancelled { .. } => true,
            RolloutError::ApplyFailure { required, .. } => *required,
            RolloutError::ReadinessTimeout { .. }
            | RolloutError::ProbeFailure { .. }
            | RolloutError::PostureFinding { .. }
            | RolloutError::Cluster { .. } => false,
        }
    }
}
