//! Portico schema: pre-flight checks on a rendered document.
//!
//! - [`validate`]: structural rules; blocking findings halt the rollout before
//!   any cluster contact.
//! - [`audit_posture`]: security posture, advisory only.
//! - [`check_prerequisites`]: required CRDs must already be declared.

#![forbid(unsafe_code)]

mod posture;
mod prereq;
mod validate;

pub use posture::audit_posture;
pub use prereq::{check_prerequisites, plural, required_capabilities, BUILTIN_GROUPS};
pub use validate::{is_dns1123_subdomain, validate};

#[cfg(test)]
pub(crate) mod fixtures {
    use portico_core::{EnvironmentTarget, ResourceDocument, ResourceRecord};
    use serde_json::json;

    pub fn target() -> EnvironmentTarget {
        serde_json::from_value(json!({
            "name": "staging",
            "namespace": "shop",
            "domain": "shop.example.com",
            "gateway": "edge",
            "required_paths": ["/api/v1/customers", "/api/v1/products", "/api/v1/orders"],
            "allowed_backends": ["customer-service", "product-service", "order-service"]
        }))
        .unwrap()
    }

    pub fn gateway() -> ResourceRecord {
        ResourceRecord::from_manifest(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": { "name": "edge", "namespace": "shop" },
            "spec": {
                "gatewayClassName": "gke-l7-global-external-managed",
                "listeners": [{ "name": "http", "protocol": "HTTP", "port": 80 }]
            }
        }))
        .unwrap()
    }

    pub fn route(name: &str, path: &str, backend: &str) -> ResourceRecord {
        ResourceRecord::from_manifest(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": { "name": name, "namespace": "shop" },
            "spec": {
                "parentRefs": [{ "name": "edge" }],
                "rules": [{
                    "matches": [{ "path": { "type": "PathPrefix", "value": path } }],
                    "backendRefs": [{ "name": backend, "port": 8080 }]
                }]
            }
        }))
        .unwrap()
    }

    pub fn document() -> ResourceDocument {
        let mut doc = ResourceDocument::new();
        doc.push(gateway()).unwrap();
        doc.push(route("customers", "/api/v1/customers", "customer-service")).unwrap();
        doc.push(route("products", "/api/v1/products", "product-service")).unwrap();
        doc.push(route("orders", "/api/v1/orders", "order-service")).unwrap();
        doc
    }
}
