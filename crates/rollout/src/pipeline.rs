use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use portico_apply::apply_document;
use portico_core::{EnvironmentTarget, RecordClass, RecordKey, ResourceDocument, RolloutError};
use portico_kubehub::{CapabilityQuery, ClusterApi, UnreachableCluster};
use portico_ops::{run_probes, smoke_audit, verify_deployment, wait_ready, ProbeTransport, ReadinessOutcome, ReadinessQuery};
use portico_render::{render, ManifestSource};
use portico_schema::{audit_posture, check_prerequisites, validate};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::report::{ReportBuilder, Stage, StageStatus};
use crate::{Notifier, RolloutReport, TracingNotifier};

fn ms(t0: Instant) -> u64 { t0.elapsed().as_millis() as u64 }

fn status_for(warned: bool) -> StageStatus {
    if warned { StageStatus::Warned } else { StageStatus::Completed }
}

/// Fails `stage` with `Cancelled` if the token has fired.
fn halted_by_cancel(cancel: &CancellationToken, b: &mut ReportBuilder, stage: Stage) -> bool {
    if cancel.is_cancelled() {
        b.fail(stage, 0, RolloutError::Cancelled { stage: stage.to_string() });
        return true;
    }
    false
}

/// Fails `stage` with a cluster error if the orchestrator has no connection.
fn halted_offline(offline: Option<&str>, b: &mut ReportBuilder, stage: Stage) -> bool {
    if let Some(reason) = offline {
        warn!(stage = %stage, reason = %reason, "cluster unreachable");
        b.fail(stage, 0, RolloutError::Cluster { message: format!("cluster unreachable: {}", reason) });
        return true;
    }
    false
}

/// Runs the rollout stages in order against one cluster.
pub struct Orchestrator {
    cluster: Arc<dyn ClusterApi>,
    capabilities: Arc<dyn CapabilityQuery>,
    transport: Arc<dyn ProbeTransport>,
    notifier: Arc<dyn Notifier>,
    /// Set when no connection could be made; cluster stages fail on it.
    offline: Option<String>,
}

impl Orchestrator {
    pub fn new(cluster: Arc<dyn ClusterApi>, capabilities: Arc<dyn CapabilityQuery>, transport: Arc<dyn ProbeTransport>) -> Self {
        Self { cluster, capabilities, transport, notifier: Arc::new(TracingNotifier), offline: None }
    }

    /// Orchestrator for a cluster that could not be reached. Offline stages
    /// still run; the first stage that needs the cluster fails with `reason`.
    pub fn unreachable(reason: impl Into<String>, transport: Arc<dyn ProbeTransport>) -> Self {
        let down = Arc::new(UnreachableCluster::new(reason));
        let offline = Some(down.reason().to_string());
        let cluster: Arc<dyn ClusterApi> = down.clone();
        Self { cluster, capabilities: down, transport, notifier: Arc::new(TracingNotifier), offline }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Full pipeline: render, validate, posture, prerequisites, apply,
    /// readiness, verify, probe, smoke.
    pub async fn rollout(&self, target: &EnvironmentTarget, source: &ManifestSource, cancel: &CancellationToken) -> RolloutReport {
        let mut b = ReportBuilder::new(&target.name);
        info!(rollout = %b.id(), environment = %target.name, namespace = %target.namespace, "rollout starting");
        if let Some(doc) = self.render_stage(target, source, &mut b) {
            self.deploy(&doc, target, cancel, &mut b).await;
        }
        self.conclude(b, "rollout").await
    }

    /// Render, then only the read-side stages against what is already deployed.
    pub async fn verify(&self, target: &EnvironmentTarget, source: &ManifestSource, cancel: &CancellationToken) -> RolloutReport {
        let mut b = ReportBuilder::new(&target.name);
        info!(rollout = %b.id(), environment = %target.name, "verification starting");
        if let Some(doc) = self.render_stage(target, source, &mut b) {
            self.post_deploy(&doc, target, cancel, &mut b).await;
        }
        self.conclude(b, "verify").await
    }

    async fn conclude(&self, b: ReportBuilder, mode: &'static str) -> RolloutReport {
        let report = b.finish();
        counter!("rollout_total", 1u64, "mode" => mode, "outcome" => report.outcome.as_str());
        histogram!("rollout_duration_ms", (report.finished_at - report.started_at).num_milliseconds() as f64);
        if let Err(e) = self.notifier.notify(&report).await {
            warn!(rollout = %report.id, error = %e, "notifier failed");
        }
        report
    }

    fn render_stage(&self, target: &EnvironmentTarget, source: &ManifestSource, b: &mut ReportBuilder) -> Option<ResourceDocument> {
        let t0 = Instant::now();
        match render(target, source) {
            Ok(doc) => {
                b.payloads.records = Some(doc.iter().map(|r| r.key().to_string()).collect());
                b.record(Stage::Render, StageStatus::Completed, ms(t0), format!("{} records", doc.len()));
                Some(doc)
            }
            Err(e) => {
                b.fail(Stage::Render, ms(t0), RolloutError::StructuralValidation { findings: vec![e.to_string()] });
                None
            }
        }
    }

    async fn deploy(&self, doc: &ResourceDocument, target: &EnvironmentTarget, cancel: &CancellationToken, b: &mut ReportBuilder) {
        // Validate
        let t0 = Instant::now();
        let validation = validate(doc, target);
        b.payloads.validation = Some(validation.clone());
        if validation.is_blocking() {
            let findings = validation.blocking().map(|f| f.message.clone()).collect();
            b.fail(Stage::Validate, ms(t0), RolloutError::StructuralValidation { findings });
            return;
        }
        let advisories = validation.advisories().count();
        b.record(Stage::Validate, status_for(advisories > 0), ms(t0), format!("{} advisories", advisories));

        // Posture: surfaced, never gated on
        let t0 = Instant::now();
        let posture = audit_posture(doc, target);
        b.warn_all(posture.findings.iter().map(|f| RolloutError::PostureFinding { message: f.message.clone() }));
        b.record(Stage::Posture, status_for(!posture.is_empty()), ms(t0), format!("{} findings", posture.findings.len()));
        b.payloads.posture = Some(posture);

        // Prerequisites
        if halted_by_cancel(cancel, b, Stage::Prerequisites) || halted_offline(self.offline.as_deref(), b, Stage::Prerequisites) {
            return;
        }
        let t0 = Instant::now();
        match check_prerequisites(doc, target, self.capabilities.as_ref()).await {
            Ok(caps) => {
                b.record(Stage::Prerequisites, StageStatus::Completed, ms(t0), format!("{} capabilities declared", caps.len()));
                b.payloads.capabilities = Some(caps);
            }
            Err(e) => {
                b.fail(Stage::Prerequisites, ms(t0), e);
                return;
            }
        }

        // Apply
        if halted_by_cancel(cancel, b, Stage::Apply) {
            return;
        }
        let t0 = Instant::now();
        let applied = apply_document(doc, target, self.cluster.as_ref(), cancel).await;
        let fatal = if applied.cancelled {
            Some(RolloutError::Cancelled { stage: Stage::Apply.to_string() })
        } else {
            applied.fatal_failure(&target.namespace)
        };
        let warnings = applied.warnings();
        let detail = format!(
            "{} created, {} updated, {} unchanged, {} failed",
            applied.count(&portico_apply::ApplyStatus::Created),
            applied.count(&portico_apply::ApplyStatus::Updated),
            applied.count(&portico_apply::ApplyStatus::Unchanged),
            applied.failures().count()
        );
        b.payloads.apply = Some(applied);
        if let Some(err) = fatal {
            b.fail(Stage::Apply, ms(t0), err);
            return;
        }
        b.record(Stage::Apply, status_for(!warnings.is_empty()), ms(t0), detail);
        b.warn_all(warnings);

        // Readiness
        if halted_by_cancel(cancel, b, Stage::Readiness) {
            return;
        }
        let t0 = Instant::now();
        let named = RecordKey::new("Gateway", target.namespace.as_str(), target.gateway.as_str());
        let gateway = doc.get(&named).or_else(|| doc.of_class(RecordClass::Gateway).next());
        match gateway {
            Some(gw) => {
                let query = ReadinessQuery::for_record(gw, &target.readiness);
                let outcome = wait_ready(self.cluster.as_ref(), &query, cancel).await;
                let cancelled = matches!(outcome, ReadinessOutcome::Cancelled);
                match &outcome {
                    ReadinessOutcome::Ready { waited_ms } => {
                        b.record(Stage::Readiness, StageStatus::Completed, ms(t0), format!("{} ready after {}ms", query.key, waited_ms))
                    }
                    ReadinessOutcome::TimedOut(d) => {
                        b.record(Stage::Readiness, StageStatus::Warned, ms(t0), format!("{} not ready after {}s", d.resource, d.waited_secs));
                        if let Some(w) = outcome.warning() {
                            b.warn(w);
                        }
                    }
                    ReadinessOutcome::Cancelled => {
                        b.fail(Stage::Readiness, ms(t0), RolloutError::Cancelled { stage: Stage::Readiness.to_string() })
                    }
                }
                b.payloads.readiness = Some(outcome);
                if cancelled {
                    return;
                }
            }
            None => b.record(Stage::Readiness, StageStatus::Skipped, 0, "no gateway record to wait for"),
        }

        self.post_deploy(doc, target, cancel, b).await;
    }

    async fn post_deploy(&self, doc: &ResourceDocument, target: &EnvironmentTarget, cancel: &CancellationToken, b: &mut ReportBuilder) {
        // Verify
        if halted_by_cancel(cancel, b, Stage::Verify) || halted_offline(self.offline.as_deref(), b, Stage::Verify) {
            return;
        }
        let t0 = Instant::now();
        let verification = verify_deployment(self.cluster.as_ref(), doc, target).await;
        b.warn_all(verification.observation_errors.iter().map(|e| RolloutError::Cluster { message: e.clone() }));
        let detail = format!(
            "address {}, {} routes bound",
            verification.address.as_deref().unwrap_or("none"),
            verification.route_count()
        );
        b.record(Stage::Verify, status_for(!verification.observation_errors.is_empty()), ms(t0), detail);

        // Probe
        if halted_by_cancel(cancel, b, Stage::Probe) {
            b.payloads.verification = Some(verification);
            return;
        }
        let t0 = Instant::now();
        let probes = run_probes(self.transport.as_ref(), target, verification.address.as_deref(), cancel).await;
        if cancel.is_cancelled() {
            b.payloads.verification = Some(verification);
            b.payloads.probes = Some(probes);
            b.fail(Stage::Probe, ms(t0), RolloutError::Cancelled { stage: Stage::Probe.to_string() });
            return;
        }
        let failed: Vec<RolloutError> = probes.iter().filter_map(|p| p.warning()).collect();
        let passed = probes.iter().filter(|p| p.succeeded()).count();
        b.record(Stage::Probe, status_for(!failed.is_empty()), ms(t0), format!("{}/{} passed", passed, probes.len()));
        b.warn_all(failed);
        b.payloads.probes = Some(probes);

        // Smoke, against the state left after probing
        let t0 = Instant::now();
        let settled = verify_deployment(self.cluster.as_ref(), doc, target).await;
        let smoke = smoke_audit(&settled, doc, target);
        let mut warnings: Vec<RolloutError> = settled
            .observation_errors
            .iter()
            .filter(|e| !verification.observation_errors.contains(e))
            .map(|e| RolloutError::Cluster { message: e.clone() })
            .collect();
        warnings.extend(smoke.warnings());
        b.record(
            Stage::Smoke,
            status_for(!warnings.is_empty()),
            ms(t0),
            format!("{}/{} required paths served", smoke.passed(), smoke.paths.len()),
        );
        b.warn_all(warnings);
        b.payloads.smoke = Some(smoke);
        b.payloads.verification = Some(verification);
    }
}
