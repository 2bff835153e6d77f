use std::collections::BTreeSet;

use metrics::counter;
use portico_core::{EnvironmentTarget, ResourceDocument, RolloutError};
use portico_kubehub::CapabilityQuery;
use tracing::{debug, info, warn};

/// API groups served by every cluster without a CRD.
pub const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "autoscaling",
    "policy",
    "rbac.authorization.k8s.io",
    "networking.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "storage.k8s.io",
];

/// Lower-case plural resource name for a kind, following Kubernetes conventions.
pub fn plural(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if let Some(stem) = lower.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            return format!("{}ies", stem);
        }
    }
    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with('z') || lower.ends_with("ch") || lower.ends_with("sh") {
        return format!("{}es", lower);
    }
    format!("{}s", lower)
}

/// CRD names (`<plural>.<group>`) the document's kinds need, sorted.
pub fn required_capabilities(doc: &ResourceDocument) -> BTreeSet<String> {
    doc.iter()
        .filter(|r| !BUILTIN_GROUPS.iter().any(|g| *g == r.group()))
        .map(|r| format!("{}.{}", plural(&r.kind), r.group()))
        .collect()
}

fn remediation(capability: &str, target: &EnvironmentTarget) -> String {
    let cluster = target.cluster.as_deref().unwrap_or("the current context");
    if capability.ends_with(".gateway.networking.k8s.io") {
        format!("install the Gateway API CRDs (standard channel) on {} before rolling out {}", cluster, target.name)
    } else {
        format!("ask the cluster administrator to install CRD {} on {}", capability, cluster)
    }
}

/// Confirm every required capability is declared. Returns the checked list.
///
/// Never installs anything: a missing CRD is a cluster-wide change outside a
/// rollout's ownership.
pub async fn check_prerequisites(
    doc: &ResourceDocument,
    target: &EnvironmentTarget,
    caps: &dyn CapabilityQuery,
) -> Result<Vec<String>, RolloutError> {
    let required = required_capabilities(doc);
    debug!(count = required.len(), "checking capabilities");
    for cap in &required {
        match caps.is_declared(cap).await {
            Ok(true) => {}
            Ok(false) => {
                counter!("prerequisite_missing_total", 1u64);
                warn!(capability = %cap, "required capability not declared");
                return Err(RolloutError::PrerequisiteMissing { capability: cap.clone(), action: remediation(cap, target) });
            }
            Err(e) => {
                warn!(capability = %cap, error = %e, "capability query failed");
                return Err(RolloutError::PrerequisiteMissing {
                    capability: cap.clone(),
                    action: format!("could not verify capability: {}", e),
                });
            }
        }
    }
    info!(checked = required.len(), "prerequisites satisfied");
    Ok(required.into_iter().collect())
}
