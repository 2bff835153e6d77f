//! Typed views over Gateway API bodies (listeners, route rules, status conditions).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::record::ResourceRecord;

/// A `metav1.Condition` as reported in `status.conditions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn is_true(&self) -> bool { self.status == "True" }
}

/// Conditions from an object's (or a route parent's) `conditions` array.
/// Entries without `type`/`status` are skipped.
pub fn conditions_of(status: Option<&Json>) -> Vec<Condition> {
    status
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .map(|arr| arr.iter().filter_map(|c| serde_json::from_value::<Condition>(c.clone()).ok()).collect())
        .unwrap_or_default()
}

pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    conditions.iter().any(|c| c.type_ == type_ && c.is_true())
}

/// Trailing slashes are not significant for prefix matching, except for `/` itself.
pub fn normalize_path(p: &str) -> String {
    let t = p.trim_end_matches('/');
    if t.is_empty() { "/".to_string() } else { t.to_string() }
}

fn array<'a>(v: Option<&'a Json>) -> &'a [Json] {
    v.and_then(|v| v.as_array()).map(|a| a.as_slice()).unwrap_or(&[])
}

impl ResourceRecord {
    /// `spec.listeners` of a Gateway.
    pub fn listeners(&self) -> &[Json] {
        array(self.field(&["spec", "listeners"]))
    }

    pub fn has_tls_listener(&self) -> bool {
        self.listeners().iter().any(|l| {
            let proto = l.get("protocol").and_then(|p| p.as_str()).unwrap_or("");
            l.get("tls").is_some() || proto.eq_ignore_ascii_case("HTTPS") || proto.eq_ignore_ascii_case("TLS")
        })
    }

    /// `spec.rules` of a route.
    pub fn route_rules(&self) -> &[Json] {
        array(self.field(&["spec", "rules"]))
    }

    /// Declared path prefixes, normalized. A rule without matches matches `/`.
    pub fn route_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for rule in self.route_rules() {
            let matches = array(rule.get("matches"));
            if matches.is_empty() {
                out.push("/".to_string());
                continue;
            }
            for m in matches {
                let p = m.get("path").and_then(|p| p.get("value")).and_then(|v| v.as_str()).unwrap_or("/");
                out.push(normalize_path(p));
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Names of `backendRefs` across all rules.
    pub fn backend_refs(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .route_rules()
            .iter()
            .flat_map(|r| array(r.get("backendRefs")).iter())
            .filter_map(|b| b.get("name").and_then(|n| n.as_str()).map(|s| s.to_string()))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Names of `spec.parentRefs`.
    pub fn parent_refs(&self) -> Vec<String> {
        array(self.field(&["spec", "parentRefs"]))
            .iter()
            .filter_map(|p| p.get("name").and_then(|n| n.as_str()).map(|s| s.to_string()))
            .collect()
    }

    pub fn status(&self) -> Option<&Json> {
        self.body.get("status")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> ResourceRecord {
        ResourceRecord::from_manifest(serde_json::json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": { "name": "customers", "namespace": "shop" },
            "spec": {
                "parentRefs": [{ "name": "edge" }],
                "rules": [
                    { "matches": [{ "path": { "type": "PathPrefix", "value": "/api/v1/customers/" } }],
                      "backendRefs": [{ "name": "customer-service", "port": 8080 }] },
                    { "backendRefs": [{ "name": "customer-service", "port": 8080 }] }
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn route_views_extract_paths_backends_parents() {
        let r = route();
        assert_eq!(r.route_paths(), vec!["/", "/api/v1/customers"]);
        assert_eq!(r.backend_refs(), vec!["customer-service"]);
        assert_eq!(r.parent_refs(), vec!["edge"]);
    }

    #[test]
    fn tls_listener_detection() {
        let gw = ResourceRecord::from_manifest(serde_json::json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": { "name": "edge" },
            "spec": { "listeners": [{ "name": "http", "protocol": "HTTP", "port": 80 }] }
        }))
        .unwrap();
        assert!(!gw.has_tls_listener());
        let mut gw2 = gw.clone();
        gw2.body["spec"]["listeners"][0]["protocol"] = Json::String("HTTPS".into());
        assert!(gw2.has_tls_listener());
    }

    #[test]
    fn conditions_parse_and_skip_garbage() {
        let status = serde_json::json!({ "conditions": [
            { "type": "Accepted", "status": "True", "reason": "Accepted" },
            { "bogus": 1 },
            { "type": "Programmed", "status": "False" }
        ]});
        let c = conditions_of(Some(&status));
        assert_eq!(c.len(), 2);
        assert!(condition_is_true(&c, "Accepted"));
        assert!(!condition_is_true(&c, "Programmed"));
        assert!(!condition_is_true(&c, "Ready"));
    }

    #[test]
    fn normalize_path_trims_trailing_slash() {
        assert_eq!(normalize_path("/api/"), "/api");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }
}
