use std::collections::BTreeSet;

use metrics::counter;
use portico_core::{
    condition_is_true, conditions_of, Condition, EnvironmentTarget, RecordClass, RecordKey, ResourceDocument, ResourceRecord,
};
use portico_kubehub::ClusterApi;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};

use crate::GATEWAY_API_VERSION;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteObservation {
    pub name: String,
    pub kind: String,
    /// `Accepted` on the route's status entry for our gateway.
    pub accepted: bool,
    pub resolved_refs: bool,
    pub paths: Vec<String>,
    pub backends: Vec<String>,
}

/// Observed state of the deployed gateway and its routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub gateway_found: bool,
    pub ready: bool,
    pub conditions: Vec<Condition>,
    pub address: Option<String>,
    pub routes: Vec<RouteObservation>,
    pub observation_errors: Vec<String>,
}

impl VerificationReport {
    pub fn route_count(&self) -> usize { self.routes.len() }

    pub fn accepted_routes(&self) -> impl Iterator<Item = &RouteObservation> {
        self.routes.iter().filter(|r| r.accepted)
    }
}

fn route_kinds(doc: &ResourceDocument) -> BTreeSet<(String, String)> {
    let mut kinds: BTreeSet<(String, String)> =
        doc.of_class(RecordClass::Route).map(|r| (r.api_version.clone(), r.kind.clone())).collect();
    if kinds.is_empty() {
        kinds.insert((GATEWAY_API_VERSION.to_string(), "HTTPRoute".to_string()));
    }
    kinds
}

/// The status entry a route keeps for `gateway` in `status.parents`.
fn parent_status<'a>(route: &'a Json, gateway: &str) -> Option<&'a Json> {
    route
        .get("status")
        .and_then(|s| s.get("parents"))
        .and_then(|p| p.as_array())?
        .iter()
        .find(|p| p.get("parentRef").and_then(|r| r.get("name")).and_then(|n| n.as_str()) == Some(gateway))
}

fn observe_route(obj: Json, gateway: &str) -> Result<Option<RouteObservation>, String> {
    let parent = parent_status(&obj, gateway).cloned();
    let rec = ResourceRecord::from_manifest(obj).map_err(|e| e.to_string())?;
    if !rec.parent_refs().iter().any(|p| p == gateway) {
        return Ok(None);
    }
    let conditions = conditions_of(parent.as_ref());
    Ok(Some(RouteObservation {
        accepted: condition_is_true(&conditions, "Accepted"),
        resolved_refs: condition_is_true(&conditions, "ResolvedRefs"),
        paths: rec.route_paths(),
        backends: rec.backend_refs(),
        name: rec.name,
        kind: rec.kind,
    }))
}

/// Read back the gateway and every route bound to it. Never fails: read
/// errors land in `observation_errors`.
pub async fn verify_deployment(
    cluster: &dyn ClusterApi,
    doc: &ResourceDocument,
    target: &EnvironmentTarget,
) -> VerificationReport {
    let mut report = VerificationReport::default();
    let key = RecordKey::new("Gateway", target.namespace.as_str(), target.gateway.as_str());
    let api_version = doc.get(&key).map(|r| r.api_version.as_str()).unwrap_or(GATEWAY_API_VERSION);

    match cluster.get(api_version, &key).await {
        Ok(Some(gw)) => {
            report.gateway_found = true;
            let status = gw.get("status");
            report.conditions = conditions_of(status);
            report.ready = condition_is_true(&report.conditions, &target.readiness.condition);
            report.address = status
                .and_then(|s| s.get("addresses"))
                .and_then(|a| a.as_array())
                .and_then(|a| a.first())
                .and_then(|a| a.get("value"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }
        Ok(None) => report.observation_errors.push(format!("{} not found", key)),
        Err(e) => report.observation_errors.push(format!("reading {}: {}", key, e)),
    }

    for (api_version, kind) in route_kinds(doc) {
        match cluster.list(&api_version, &kind, &target.namespace).await {
            Ok(items) => {
                for obj in items {
                    match observe_route(obj, &target.gateway) {
                        Ok(Some(r)) => report.routes.push(r),
                        Ok(None) => {}
                        Err(e) => report.observation_errors.push(format!("unreadable {}: {}", kind, e)),
                    }
                }
            }
            Err(e) => report.observation_errors.push(format!("listing {}: {}", kind, e)),
        }
    }

    counter!("verify_observation_errors_total", report.observation_errors.len() as u64);
    for e in &report.observation_errors {
        warn!(error = %e, "verification observation failed");
    }
    info!(
        gateway_found = report.gateway_found,
        ready = report.ready,
        address = ?report.address,
        routes = report.routes.len(),
        accepted = report.accepted_routes().count(),
        "deployment verified"
    );
    report
}
