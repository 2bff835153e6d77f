use metrics::counter;
use portico_core::{is_cluster_scoped, EnvironmentTarget, Finding, RecordClass, ResourceDocument, ValidationReport};
use tracing::info;

/// Security posture of the rendered document. Every finding is advisory: the
/// posture is surfaced for review, never gated on.
pub fn audit_posture(doc: &ResourceDocument, target: &EnvironmentTarget) -> ValidationReport {
    let mut report = ValidationReport::default();

    if !doc.of_class(RecordClass::Gateway).any(|g| g.has_tls_listener()) {
        report.push(Finding::security(format!("no listener configures TLS; traffic to {} is unencrypted", target.domain)));
    }
    if doc.of_class(RecordClass::Policy).next().is_none() {
        report.push(Finding::security("no access-control or security policy record"));
    }
    if doc.of_class(RecordClass::IdentityBinding).next().is_none() {
        report.push(Finding::security("no identity-binding record (service account or role binding)"));
    }
    for r in doc {
        if !is_cluster_scoped(&r.kind) && r.namespace != target.namespace {
            report.push(
                Finding::security(format!("record lives in namespace {:?}, outside target namespace {}", r.namespace, target.namespace))
                    .with_record(r.key()),
            );
        }
    }

    counter!("posture_findings_total", report.findings.len() as u64);
    for f in &report.findings {
        info!(finding = %f.message, record = ?f.record, "posture advisory");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{document, target};
    use portico_core::{FindingCategory, ResourceRecord, Severity};
    use serde_json::json;

    #[test]
    fn bare_document_gets_three_advisories() {
        let r = audit_posture(&document(), &target());
        assert_eq!(r.findings.len(), 3);
        assert!(!r.is_blocking());
        assert!(r.findings.iter().all(|f| f.category == FindingCategory::Security && f.severity == Severity::Advisory));
    }

    #[test]
    fn hardened_document_is_clean() {
        let mut doc = document();
        let key = portico_core::RecordKey::new("Gateway", "shop", "edge");
        doc.get_mut(&key).unwrap().body["spec"]["listeners"] =
            json!([{ "name": "https", "protocol": "HTTPS", "port": 443, "tls": { "mode": "Terminate" } }]);
        doc.push(
            ResourceRecord::from_manifest(json!({
                "apiVersion": "networking.gke.io/v1", "kind": "GCPBackendPolicy",
                "metadata": { "name": "armor", "namespace": "shop" }
            }))
            .unwrap(),
        )
        .unwrap();
        doc.push(
            ResourceRecord::from_manifest(json!({
                "apiVersion": "v1", "kind": "ServiceAccount",
                "metadata": { "name": "gateway-sa", "namespace": "shop" }
            }))
            .unwrap(),
        )
        .unwrap();
        let r = audit_posture(&doc, &target());
        assert!(r.is_empty(), "findings: {:?}", r.findings);
    }

    #[test]
    fn foreign_namespace_is_reported_but_cluster_scoped_is_exempt() {
        let mut doc = document();
        doc.push(
            ResourceRecord::from_manifest(json!({
                "apiVersion": "v1", "kind": "ServiceAccount",
                "metadata": { "name": "sa", "namespace": "kube-system" }
            }))
            .unwrap(),
        )
        .unwrap();
        doc.push(
            ResourceRecord::from_manifest(json!({
                "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRoleBinding",
                "metadata": { "name": "gateway-reader" }
            }))
            .unwrap(),
        )
        .unwrap();
        let r = audit_posture(&doc, &target());
        let outside: Vec<_> = r.findings.iter().filter(|f| f.message.contains("outside target namespace")).collect();
        assert_eq!(outside.len(), 1);
        assert_eq!(outside[0].record.as_ref().map(|k| k.namespace.as_str()), Some("kube-system"));
        assert!(!r.is_blocking());
    }
}
