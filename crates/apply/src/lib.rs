//! Portico apply: idempotent reconciliation of a rendered document onto the cluster.

#![forbid(unsafe_code)]

use metrics::{counter, histogram};
use portico_core::{EnvironmentTarget, RecordClass, RecordKey, ResourceDocument, RolloutError};
use portico_kubehub::ClusterApi;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyStatus {
    Created,
    Updated,
    Unchanged,
    /// Never sent: the rollout was cancelled first.
    Skipped,
    Failed { reason: String },
}

impl ApplyStatus {
    pub fn is_failed(&self) -> bool { matches!(self, ApplyStatus::Failed { .. }) }

    fn label(&self) -> &'static str {
        match self {
            ApplyStatus::Created => "created",
            ApplyStatus::Updated => "updated",
            ApplyStatus::Unchanged => "unchanged",
            ApplyStatus::Skipped => "skipped",
            ApplyStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordApply {
    pub record: RecordKey,
    pub class: RecordClass,
    #[serde(flatten)]
    pub status: ApplyStatus,
    pub summary: DiffSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Target namespace: Created, Unchanged (already present) or Failed.
    pub namespace: ApplyStatus,
    pub records: Vec<RecordApply>,
    pub cancelled: bool,
}

/// Records whose failure leaves the gateway unusable.
pub fn is_required(class: RecordClass) -> bool {
    matches!(class, RecordClass::Namespace | RecordClass::Gateway | RecordClass::Route)
}

impl ApplyReport {
    pub fn count(&self, status: &ApplyStatus) -> usize {
        self.records.iter().filter(|r| &r.status == status).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RecordApply> {
        self.records.iter().filter(|r| r.status.is_failed())
    }

    fn failure_error(key: &RecordKey, status: &ApplyStatus, required: bool) -> Option<RolloutError> {
        match status {
            ApplyStatus::Failed { reason } => {
                Some(RolloutError::ApplyFailure { record: key.to_string(), reason: reason.clone(), required })
            }
            _ => None,
        }
    }

    /// First failure that halts the rollout, if any.
    pub fn fatal_failure(&self, target_namespace: &str) -> Option<RolloutError> {
        let ns_key = RecordKey::new("Namespace", "", target_namespace);
        Self::failure_error(&ns_key, &self.namespace, true).or_else(|| {
            self.failures()
                .filter(|r| is_required(r.class))
                .find_map(|r| Self::failure_error(&r.record, &r.status, true))
        })
    }

    /// Failures on optional records, reported as warnings.
    pub fn warnings(&self) -> Vec<RolloutError> {
        self.failures()
            .filter(|r| !is_required(r.class))
            .filter_map(|r| Self::failure_error(&r.record, &r.status, false))
            .collect()
    }
}

/// Ensure the target namespace, then apply every record in document order.
///
/// A failed record does not stop the others; each outcome is reported
/// separately. Cancellation is honoured between records.
pub async fn apply_document(
    doc: &ResourceDocument,
    target: &EnvironmentTarget,
    cluster: &dyn ClusterApi,
    cancel: &CancellationToken,
) -> ApplyReport {
    let t0 = std::time::Instant::now();
    counter!("apply_attempts", 1u64);
    let namespace = ensure_namespace(&target.namespace, cluster).await;
    if namespace.is_failed() {
        counter!("apply_err", 1u64);
        return ApplyReport { namespace, records: Vec::new(), cancelled: false };
    }

    let mut records = Vec::with_capacity(doc.len());
    let mut cancelled = false;
    for rec in doc {
        let key = rec.key();
        if cancel.is_cancelled() {
            cancelled = true;
            records.push(RecordApply {
                record: key,
                class: rec.class(),
                status: ApplyStatus::Skipped,
                summary: DiffSummary::default(),
            });
            continue;
        }
        let (status, summary) = apply_one(rec, cluster).await;
        match &status {
            ApplyStatus::Failed { reason } => warn!(record = %key, reason = %reason, "apply failed"),
            s => info!(record = %key, status = s.label(), adds = summary.adds, updates = summary.updates, "record applied"),
        }
        counter!("apply_records_total", 1u64, "status" => status.label());
        records.push(RecordApply { record: key, class: rec.class(), status, summary });
    }
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    ApplyReport { namespace, records, cancelled }
}

async fn ensure_namespace(name: &str, cluster: &dyn ClusterApi) -> ApplyStatus {
    match cluster.namespace_exists(name).await {
        Ok(true) => ApplyStatus::Unchanged,
        Ok(false) => match cluster.create_namespace(name).await {
            Ok(()) => {
                info!(namespace = %name, "namespace created");
                ApplyStatus::Created
            }
            Err(e) => ApplyStatus::Failed { reason: format!("creating namespace: {}", e) },
        },
        Err(e) => ApplyStatus::Failed { reason: format!("checking namespace: {}", e) },
    }
}

async fn apply_one(rec: &portico_core::ResourceRecord, cluster: &dyn ClusterApi) -> (ApplyStatus, DiffSummary) {
    let key = rec.key();
    let live = match cluster.get(&rec.api_version, &key).await {
        Ok(v) => v.map(strip_noisy),
        Err(e) => return (ApplyStatus::Failed { reason: format!("reading live state: {}", e) }, DiffSummary::default()),
    };
    let tgt = strip_noisy(rec.to_manifest());
    let (status, summary) = match &live {
        Some(l) if contained_in(&tgt, l) => return (ApplyStatus::Unchanged, DiffSummary::default()),
        Some(l) => (ApplyStatus::Updated, diff_summary(&tgt, l)),
        None => (ApplyStatus::Created, diff_summary(&tgt, &Json::Object(Default::default()))),
    };
    match cluster.apply(rec).await {
        Ok(_) => (status, summary),
        Err(e) => (ApplyStatus::Failed { reason: e.to_string() }, summary),
    }
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// True when every field of `target` is present with the same value in `live`.
/// Server-defaulted extras in `live` do not count as drift.
pub fn contained_in(target: &Json, live: &Json) -> bool {
    match (target, live) {
        (Json::Object(t), Json::Object(l)) => t.iter().all(|(k, tv)| l.get(k).map(|lv| contained_in(tv, lv)).unwrap_or(false)),
        (Json::Array(t), Json::Array(l)) => t.len() == l.len() && t.iter().zip(l.iter()).all(|(a, b)| contained_in(a, b)),
        (a, b) => a == b,
    }
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            // Scalars differ or type differs
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}
