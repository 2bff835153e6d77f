#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portico_apply::ApplyStatus;
use portico_core::{EnvironmentTarget, RecordKey, ResourceRecord, RolloutError};
use portico_kubehub::{CapabilityQuery, ClusterApi, MemoryCluster};
use portico_ops::{ProbeStatus, ProbeTarget, ProbeTransport, ReadinessOutcome};
use portico_render::{ManifestSource, Overlay, OverlayPatch, PatchTarget};
use portico_rollout::{Notifier, Orchestrator, Outcome, RolloutReport, Stage, StageStatus};
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;

const GATEWAY_CRDS: [&str; 2] = ["gateways.gateway.networking.k8s.io", "httproutes.gateway.networking.k8s.io"];

/// Every probe answers with the same status code.
struct FixedStatus(u16);

#[async_trait::async_trait]
impl ProbeTransport for FixedStatus {
    async fn get(&self, _target: &ProbeTarget, _timeout: Duration) -> anyhow::Result<u16> {
        Ok(self.0)
    }
}

#[derive(Default)]
struct Recording(Mutex<Vec<Outcome>>);

#[async_trait::async_trait]
impl Notifier for Recording {
    async fn notify(&self, report: &RolloutReport) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(report.outcome);
        Ok(())
    }
}

fn target() -> EnvironmentTarget {
    serde_json::from_value(json!({
        "name": "staging",
        "namespace": "shop",
        "domain": "shop.example.com",
        "gateway": "edge",
        "overlays": ["staging"],
        "required_paths": ["/api/v1/customers", "/api/v1/products", "/api/v1/orders"],
        "allowed_backends": ["customer-service", "product-service", "order-service"],
        "readiness": { "timeout_secs": 30, "poll_secs": 5 },
        "probes": { "external_paths": ["/"], "internal": [{ "service": "order-service", "port": 8080, "path": "/ready" }] }
    }))
    .unwrap()
}

fn record(v: Json) -> ResourceRecord {
    ResourceRecord::from_manifest(v).unwrap()
}

fn route(name: &str, path: &str, backend: &str) -> ResourceRecord {
    record(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "HTTPRoute",
        "metadata": { "name": name },
        "spec": {
            "parentRefs": [{ "name": "edge" }],
            "rules": [{
                "matches": [{ "path": { "type": "PathPrefix", "value": path } }],
                "backendRefs": [{ "name": backend, "port": 8080 }]
            }]
        }
    }))
}

/// One gateway (class patched by the `staging` overlay) plus the given routes.
fn source(with_routes: bool) -> ManifestSource {
    let mut base = vec![record(json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "Gateway",
        "metadata": { "name": "edge" },
        "spec": { "gatewayClassName": "placeholder", "listeners": [{ "name": "http", "protocol": "HTTP", "port": 80 }] }
    }))];
    if with_routes {
        base.push(route("customers", "/api/v1/customers", "customer-service"));
        base.push(route("products", "/api/v1/products", "product-service"));
        base.push(route("orders", "/api/v1/orders", "order-service"));
    }
    let staging = Overlay {
        patches: vec![OverlayPatch {
            target: PatchTarget { kind: "Gateway".into(), namespace: None, name: "edge".into() },
            patch: json!({ "spec": { "gatewayClassName": "gke-l7-global-external-managed" } }),
        }],
        resources: Vec::new(),
    };
    ManifestSource { base, overlays: BTreeMap::from([("staging".to_string(), staging)]) }
}

fn programmed(ready: bool) -> Json {
    let mut status = json!({ "conditions": [{ "type": "Programmed", "status": if ready { "True" } else { "False" }, "reason": "Pending" }] });
    if ready {
        status["addresses"] = json!([{ "type": "IPAddress", "value": "34.120.1.2" }]);
    }
    status
}

fn accepted_by_edge() -> Json {
    json!({ "parents": [{
        "parentRef": { "name": "edge" },
        "conditions": [{ "type": "Accepted", "status": "True" }, { "type": "ResolvedRefs", "status": "True" }]
    }] })
}

/// Gateway API CRDs declared; gateways and routes get their status on first apply.
fn controller(gateway_ready: bool) -> MemoryCluster {
    GATEWAY_CRDS
        .into_iter()
        .fold(MemoryCluster::new(), |c, cap| c.declare(cap))
        .auto_status("Gateway", programmed(gateway_ready))
        .auto_status("HTTPRoute", accepted_by_edge())
}

fn cluster(gateway_ready: bool) -> Arc<MemoryCluster> {
    Arc::new(controller(gateway_ready))
}

fn orchestrator(cluster: &Arc<MemoryCluster>) -> Orchestrator {
    let api: Arc<dyn ClusterApi> = cluster.clone();
    let caps: Arc<dyn CapabilityQuery> = cluster.clone();
    Orchestrator::new(api, caps, Arc::new(FixedStatus(200)))
}

#[tokio::test]
async fn healthy_rollout_creates_everything_and_serves_all_paths() {
    let c = cluster(true);
    let notifier = Arc::new(Recording::default());
    let report = orchestrator(&c).with_notifier(notifier.clone()).rollout(&target(), &source(true), &CancellationToken::new()).await;

    let apply = report.payloads.apply.as_ref().unwrap();
    assert_eq!(apply.namespace, ApplyStatus::Created);
    assert_eq!(apply.count(&ApplyStatus::Created), 4);
    assert!(report.payloads.readiness.as_ref().unwrap().is_ready());
    let verification = report.payloads.verification.as_ref().unwrap();
    assert_eq!(verification.address.as_deref(), Some("34.120.1.2"));
    assert_eq!(verification.route_count(), 3);
    let smoke = report.payloads.smoke.as_ref().unwrap();
    assert_eq!(smoke.passed(), 3);
    assert!(smoke.advisories.is_empty());
    let probes = report.payloads.probes.as_ref().unwrap();
    assert_eq!(probes.len(), 2);
    assert!(probes.iter().all(|p| p.succeeded()));

    // Posture gaps (no TLS, policy or identity binding) are warnings only.
    assert!(report.fatal.is_none());
    assert!(report.warnings.iter().all(|w| matches!(w, RolloutError::PostureFinding { .. })));
    assert_eq!(report.warnings.len(), 3);
    assert_eq!(report.outcome, Outcome::SucceededWithWarnings);
    assert_eq!(report.exit_code(), 0);
    assert!(report.stages.iter().all(|s| s.status != StageStatus::Skipped && s.status != StageStatus::Failed));

    let gw = c.object(&RecordKey::new("Gateway", "shop", "edge")).unwrap();
    assert_eq!(gw["spec"]["gatewayClassName"], "gke-l7-global-external-managed");
    assert_eq!(*notifier.0.lock().unwrap(), vec![Outcome::SucceededWithWarnings]);
}

#[tokio::test]
async fn missing_routes_halt_before_any_cluster_write() {
    let c = cluster(true);
    let report = orchestrator(&c).rollout(&target(), &source(false), &CancellationToken::new()).await;

    match report.fatal.as_ref() {
        Some(RolloutError::StructuralValidation { findings }) => {
            assert!(findings.iter().any(|f| f == "route record required"), "findings={:?}", findings);
        }
        other => panic!("expected structural failure, got {:?}", other),
    }
    assert!(c.writes().is_empty());
    assert!(!report.ran(Stage::Apply));
    assert_eq!(report.stage(Stage::Validate).unwrap().status, StageStatus::Failed);
    assert_eq!(report.outcome, Outcome::Failed);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn missing_capability_names_it_and_writes_nothing() {
    let c = Arc::new(MemoryCluster::new().declare(GATEWAY_CRDS[0]));
    let report = orchestrator(&c).rollout(&target(), &source(true), &CancellationToken::new()).await;

    match report.fatal.as_ref() {
        Some(RolloutError::PrerequisiteMissing { capability, .. }) => {
            assert_eq!(capability, "httproutes.gateway.networking.k8s.io");
        }
        other => panic!("expected missing prerequisite, got {:?}", other),
    }
    assert!(c.writes().is_empty());
    assert!(c.namespaces().is_empty());
    assert_eq!(report.outcome, Outcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn gateway_never_ready_still_verifies_and_probes() {
    let c = cluster(false);
    c.add_event(RecordKey::new("Gateway", "shop", "edge"), "Warning SyncFailed: no healthy upstream");
    let report = orchestrator(&c).rollout(&target(), &source(true), &CancellationToken::new()).await;

    match report.payloads.readiness.as_ref().unwrap() {
        ReadinessOutcome::TimedOut(d) => {
            assert_eq!(d.waited_secs, 30);
            assert_eq!(d.conditions[0].status, "False");
            assert_eq!(d.events, vec!["Warning SyncFailed: no healthy upstream"]);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(report.warnings.iter().any(|w| matches!(w, RolloutError::ReadinessTimeout { waited_secs: 30, .. })));
    assert!(report.ran(Stage::Verify) && report.ran(Stage::Probe) && report.ran(Stage::Smoke));
    assert_eq!(report.payloads.verification.as_ref().unwrap().address, None);
    let probes = report.payloads.probes.as_ref().unwrap();
    assert_eq!(probes[0].status, ProbeStatus::Skipped);
    assert_eq!(probes[1].status, ProbeStatus::Passed);
    assert_eq!(report.outcome, Outcome::SucceededWithWarnings);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn second_rollout_is_a_no_op() {
    let c = cluster(true);
    let o = orchestrator(&c);
    o.rollout(&target(), &source(true), &CancellationToken::new()).await;
    let objects = c.objects();
    let writes = c.writes().len();

    let again = o.rollout(&target(), &source(true), &CancellationToken::new()).await;
    let apply = again.payloads.apply.as_ref().unwrap();
    assert_eq!(apply.namespace, ApplyStatus::Unchanged);
    assert_eq!(apply.count(&ApplyStatus::Unchanged), 4);
    assert_eq!(c.objects(), objects);
    assert_eq!(c.writes().len(), writes);
    assert_eq!(again.outcome, Outcome::SucceededWithWarnings);
}

#[tokio::test]
async fn rejected_gateway_fails_the_rollout() {
    let c = Arc::new(controller(true).reject(RecordKey::new("Gateway", "shop", "edge"), "listener port 80 forbidden"));
    let report = orchestrator(&c).rollout(&target(), &source(true), &CancellationToken::new()).await;

    match report.fatal.as_ref() {
        Some(RolloutError::ApplyFailure { record, reason, required: true }) => {
            assert_eq!(record, "Gateway/shop/edge");
            assert!(reason.contains("listener port 80 forbidden"));
        }
        other => panic!("expected fatal apply failure, got {:?}", other),
    }
    assert!(!report.ran(Stage::Readiness));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_readiness_stops_the_rollout() {
    let c = cluster(false);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        trigger.cancel();
    });
    let report = orchestrator(&c).rollout(&target(), &source(true), &cancel).await;

    assert_eq!(report.payloads.readiness, Some(ReadinessOutcome::Cancelled));
    assert!(matches!(report.fatal, Some(RolloutError::Cancelled { ref stage }) if stage == "readiness"));
    assert!(!report.ran(Stage::Verify));
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn verify_reads_live_state_without_writing() {
    let c = cluster(true);
    let o = orchestrator(&c);
    o.rollout(&target(), &source(true), &CancellationToken::new()).await;
    let writes = c.writes().len();

    let report = o.verify(&target(), &source(true), &CancellationToken::new()).await;
    assert_eq!(c.writes().len(), writes);
    assert!(!report.ran(Stage::Apply));
    assert_eq!(report.payloads.smoke.as_ref().unwrap().passed(), 3);
    assert_eq!(report.outcome, Outcome::Succeeded);
}

/// Routes get their `Accepted` status only while the probes are running.
struct SettlesRoutes(Arc<MemoryCluster>);

#[async_trait::async_trait]
impl ProbeTransport for SettlesRoutes {
    async fn get(&self, _target: &ProbeTarget, _timeout: Duration) -> anyhow::Result<u16> {
        for name in ["customers", "products", "orders"] {
            self.0.set_status(&RecordKey::new("HTTPRoute", "shop", name), accepted_by_edge());
        }
        Ok(200)
    }
}

#[tokio::test]
async fn smoke_audit_sees_routes_accepted_after_verification() {
    let c = Arc::new(GATEWAY_CRDS.into_iter().fold(MemoryCluster::new(), |c, cap| c.declare(cap)).auto_status("Gateway", programmed(true)));
    let api: Arc<dyn ClusterApi> = c.clone();
    let caps: Arc<dyn CapabilityQuery> = c.clone();
    let report = Orchestrator::new(api, caps, Arc::new(SettlesRoutes(c.clone())))
        .rollout(&target(), &source(true), &CancellationToken::new())
        .await;

    let verification = report.payloads.verification.as_ref().unwrap();
    assert_eq!(verification.route_count(), 3);
    assert_eq!(verification.accepted_routes().count(), 0);
    let smoke = report.payloads.smoke.as_ref().unwrap();
    assert_eq!(smoke.passed(), 3, "paths={:?}", smoke.paths);
    assert_eq!(report.stage(Stage::Smoke).unwrap().status, StageStatus::Completed);
}

#[tokio::test]
async fn unreachable_cluster_still_reports_offline_stages() {
    let o = Orchestrator::unreachable("connection refused", Arc::new(FixedStatus(200)));
    let report = o.rollout(&target(), &source(true), &CancellationToken::new()).await;

    assert!(report.ran(Stage::Render) && report.ran(Stage::Validate) && report.ran(Stage::Posture));
    assert!(report.payloads.posture.is_some());
    assert_eq!(report.stage(Stage::Prerequisites).unwrap().status, StageStatus::Failed);
    match report.fatal.as_ref() {
        Some(RolloutError::Cluster { message }) => assert!(message.contains("connection refused"), "message={}", message),
        other => panic!("expected cluster failure, got {:?}", other),
    }
    assert!(!report.ran(Stage::Apply));
    assert_eq!(report.stages.len(), Stage::ALL.len());
    assert_eq!(report.outcome, Outcome::Failed);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn structural_failure_wins_over_an_unreachable_cluster() {
    let o = Orchestrator::unreachable("connection refused", Arc::new(FixedStatus(200)));
    let report = o.rollout(&target(), &source(false), &CancellationToken::new()).await;

    assert!(matches!(report.fatal, Some(RolloutError::StructuralValidation { .. })));
    assert!(!report.ran(Stage::Prerequisites));

    let verify = o.verify(&target(), &source(true), &CancellationToken::new()).await;
    assert_eq!(verify.stage(Stage::Verify).unwrap().status, StageStatus::Failed);
    assert!(!verify.ran(Stage::Probe));
    assert_eq!(verify.exit_code(), 1);
}
