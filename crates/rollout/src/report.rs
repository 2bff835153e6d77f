use std::fmt;

use chrono::{DateTime, Utc};
use portico_apply::ApplyReport;
use portico_core::{RolloutError, ValidationReport};
use portico_ops::{ProbeResult, ReadinessOutcome, SmokeReport, VerificationReport};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Render,
    Validate,
    Posture,
    Prerequisites,
    Apply,
    Readiness,
    Verify,
    Probe,
    Smoke,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Render,
        Stage::Validate,
        Stage::Posture,
        Stage::Prerequisites,
        Stage::Apply,
        Stage::Readiness,
        Stage::Verify,
        Stage::Probe,
        Stage::Smoke,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Render => "render",
            Stage::Validate => "validate",
            Stage::Posture => "posture",
            Stage::Prerequisites => "prerequisites",
            Stage::Apply => "apply",
            Stage::Readiness => "readiness",
            Stage::Verify => "verify",
            Stage::Probe => "probe",
            Stage::Smoke => "smoke",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Completed, but produced warnings.
    Warned,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub status: StageStatus,
    pub took_ms: u64,
    pub detail: String,
}

/// Typed output of each stage that ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePayloads {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posture: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probes: Option<Vec<ProbeResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoke: Option<SmokeReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    SucceededWithWarnings,
    Failed,
    Cancelled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::SucceededWithWarnings => "succeeded_with_warnings",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// The only artifact that leaves a rollout. Complete even on a fatal halt:
/// stages after the halt are listed as skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutReport {
    pub id: Uuid,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageSummary>,
    pub payloads: StagePayloads,
    pub warnings: Vec<RolloutError>,
    pub fatal: Option<RolloutError>,
    pub outcome: Outcome,
}

impl RolloutReport {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Succeeded | Outcome::SucceededWithWarnings => 0,
            Outcome::Failed | Outcome::Cancelled => 1,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn ran(&self, stage: Stage) -> bool {
        self.stage(stage).map(|s| s.status != StageStatus::Skipped).unwrap_or(false)
    }
}

/// Accumulates stage summaries while the pipeline runs.
pub(crate) struct ReportBuilder {
    id: Uuid,
    environment: String,
    started_at: DateTime<Utc>,
    stages: Vec<StageSummary>,
    pub(crate) payloads: StagePayloads,
    warnings: Vec<RolloutError>,
    fatal: Option<RolloutError>,
}

impl ReportBuilder {
    pub(crate) fn new(environment: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            environment: environment.to_string(),
            started_at: Utc::now(),
            stages: Vec::with_capacity(Stage::ALL.len()),
            payloads: StagePayloads::default(),
            warnings: Vec::new(),
            fatal: None,
        }
    }

    pub(crate) fn id(&self) -> Uuid { self.id }

    pub(crate) fn record(&mut self, stage: Stage, status: StageStatus, took_ms: u64, detail: impl Into<String>) {
        self.stages.push(StageSummary { stage, status, took_ms, detail: detail.into() });
    }

    pub(crate) fn warn(&mut self, w: RolloutError) { self.warnings.push(w); }

    pub(crate) fn warn_all(&mut self, ws: impl IntoIterator<Item = RolloutError>) { self.warnings.extend(ws); }

    pub(crate) fn fail(&mut self, stage: Stage, took_ms: u64, err: RolloutError) {
        self.record(stage, StageStatus::Failed, took_ms, err.to_string());
        self.fatal = Some(err);
    }

    pub(crate) fn finish(mut self) -> RolloutReport {
        for stage in Stage::ALL {
            if !self.stages.iter().any(|s| s.stage == stage) {
                self.stages.push(StageSummary { stage, status: StageStatus::Skipped, took_ms: 0, detail: String::new() });
            }
        }
        self.stages.sort_by_key(|s| s.stage);
        let outcome = match &self.fatal {
            Some(RolloutError::Cancelled { .. }) => Outcome::Cancelled,
            Some(_) => Outcome::Failed,
            None if !self.warnings.is_empty() || self.stages.iter().any(|s| s.status == StageStatus::Warned) => {
                Outcome::SucceededWithWarnings
            }
            None => Outcome::Succeeded,
        };
        RolloutReport {
            id: self.id,
            environment: self.environment,
            started_at: self.started_at,
            finished_at: Utc::now(),
            stages: self.stages,
            payloads: self.payloads,
            warnings: self.warnings,
            fatal: self.fatal,
            outcome,
        }
    }
}
