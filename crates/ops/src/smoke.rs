use metrics::counter;
use portico_core::{normalize_path, EnvironmentTarget, RecordClass, ResourceDocument, RolloutError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::VerificationReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCheck {
    pub path: String,
    pub passed: bool,
    /// Route that serves the path, when one does.
    pub route: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokeReport {
    pub paths: Vec<PathCheck>,
    pub deployed_routes: usize,
    pub expected_routes: usize,
    pub advisories: Vec<String>,
}

impl SmokeReport {
    pub fn passed(&self) -> usize { self.paths.iter().filter(|p| p.passed).count() }

    pub fn warnings(&self) -> Vec<RolloutError> {
        let mut out: Vec<RolloutError> = self
            .paths
            .iter()
            .filter(|p| !p.passed)
            .map(|p| RolloutError::ProbeFailure { target: format!("smoke {}", p.path), detail: p.detail.clone() })
            .collect();
        out.extend(self.advisories.iter().map(|a| RolloutError::ProbeFailure { target: "smoke".to_string(), detail: a.clone() }));
        out
    }
}

fn check_path(required: &str, verification: &VerificationReport) -> PathCheck {
    let want = normalize_path(required);
    let declaring: Vec<_> = verification.routes.iter().filter(|r| r.paths.contains(&want)).collect();
    let serving = declaring.iter().find(|r| r.accepted && !r.backends.is_empty());
    match (serving, declaring.first()) {
        (Some(r), _) => PathCheck {
            path: required.to_string(),
            passed: true,
            route: Some(r.name.clone()),
            detail: format!("served by {} -> {}", r.name, r.backends.join(",")),
        },
        (None, Some(r)) if !r.accepted => PathCheck {
            path: required.to_string(),
            passed: false,
            route: Some(r.name.clone()),
            detail: format!("route {} is not accepted by the gateway", r.name),
        },
        (None, Some(r)) => PathCheck {
            path: required.to_string(),
            passed: false,
            route: Some(r.name.clone()),
            detail: format!("route {} has no backend", r.name),
        },
        (None, None) => PathCheck {
            path: required.to_string(),
            passed: false,
            route: None,
            detail: "no deployed route declares this path".to_string(),
        },
    }
}

/// Check that every required path is actually served by the deployed routes.
pub fn smoke_audit(verification: &VerificationReport, doc: &ResourceDocument, target: &EnvironmentTarget) -> SmokeReport {
    let paths: Vec<PathCheck> = target.required_paths.iter().map(|p| check_path(p, verification)).collect();
    let expected_routes = doc.of_class(RecordClass::Route).count();
    let deployed_routes = verification.route_count();
    let mut advisories = Vec::new();
    if deployed_routes != expected_routes {
        advisories.push(format!("{} routes bound to {}, {} in the rendered document", deployed_routes, target.gateway, expected_routes));
    }

    let report = SmokeReport { paths, deployed_routes, expected_routes, advisories };
    counter!("smoke_paths_failed_total", (report.paths.len() - report.passed()) as u64);
    for p in report.paths.iter().filter(|p| !p.passed) {
        warn!(path = %p.path, detail = %p.detail, "smoke check failed");
    }
    info!(passed = report.passed(), total = report.paths.len(), deployed_routes, expected_routes, "smoke audit finished");
    report
}
