use std::collections::BTreeSet;

use metrics::counter;
use once_cell::sync::Lazy;
use portico_core::{normalize_path, EnvironmentTarget, Finding, RecordClass, ResourceDocument, ValidationReport};
use regex::Regex;
use tracing::{debug, warn};

static DNS1123: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("DNS-1123 pattern compiles")
});

pub fn is_dns1123_subdomain(s: &str) -> bool {
    !s.is_empty() && s.len() <= 253 && DNS1123.is_match(s)
}

/// Structural checks on the rendered document. Never contacts the cluster.
pub fn validate(doc: &ResourceDocument, target: &EnvironmentTarget) -> ValidationReport {
    let mut report = ValidationReport::default();

    let gateways: Vec<_> = doc.of_class(RecordClass::Gateway).collect();
    let routes: Vec<_> = doc.of_class(RecordClass::Route).collect();
    if gateways.is_empty() {
        report.push(Finding::blocking("gateway record required"));
    }
    if routes.is_empty() {
        report.push(Finding::blocking("route record required"));
    }

    for r in doc {
        if !is_dns1123_subdomain(&r.name) {
            report.push(Finding::blocking(format!("name {:?} is not a DNS-1123 subdomain", r.name)).with_record(r.key()));
        }
        if !r.namespace.is_empty() && !is_dns1123_subdomain(&r.namespace) {
            report.push(Finding::blocking(format!("namespace {:?} is not a DNS-1123 subdomain", r.namespace)).with_record(r.key()));
        }
    }

    for gw in &gateways {
        let class = gw.field(&["spec", "gatewayClassName"]).and_then(|v| v.as_str()).unwrap_or("");
        if class.is_empty() {
            report.push(Finding::blocking("gateway has no spec.gatewayClassName").with_record(gw.key()));
        }
        if gw.listeners().is_empty() {
            report.push(Finding::blocking("gateway has no listeners").with_record(gw.key()));
        }
    }

    let gateway_names: BTreeSet<&str> = gateways.iter().map(|g| g.name.as_str()).collect();
    for route in &routes {
        if route.route_rules().is_empty() {
            report.push(Finding::blocking("route has no rules").with_record(route.key()));
        }
        let backends = route.backend_refs();
        if backends.is_empty() {
            report.push(Finding::blocking("route references no backend").with_record(route.key()));
        }
        for b in backends {
            if !target.allowed_backends.contains(&b) {
                report.push(
                    Finding::blocking(format!("backend {} is not in the allow-list for {}", b, target.name))
                        .with_record(route.key()),
                );
            }
        }
        for parent in route.parent_refs() {
            if !gateway_names.contains(parent.as_str()) {
                report.push(
                    Finding::structural_advisory(format!("parentRef {} names no gateway in this document", parent))
                        .with_record(route.key()),
                );
            }
        }
    }

    if !routes.is_empty() {
        let declared: BTreeSet<String> = routes.iter().flat_map(|r| r.route_paths()).collect();
        for required in &target.required_paths {
            if !declared.contains(&normalize_path(required)) {
                report.push(Finding::blocking(format!("required path {} is not covered by any route", required)));
            }
        }
    }

    let blocking = report.blocking().count();
    counter!("validation_findings_total", report.findings.len() as u64);
    if blocking > 0 {
        warn!(blocking, total = report.findings.len(), "structural validation failed");
    } else {
        debug!(total = report.findings.len(), "structural validation passed");
    }
    report
}
