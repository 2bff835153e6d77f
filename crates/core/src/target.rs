use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deployment target of one rollout. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentTarget {
    pub name: String,
    /// Kube context; `None` uses the current context.
    #[serde(default)]
    pub cluster: Option<String>,
    pub namespace: String,
    pub domain: String,
    /// Overlay names, applied in order.
    #[serde(default)]
    pub overlays: Vec<String>,
    /// Name of the gateway record to wait for and verify.
    pub gateway: String,
    /// Path prefixes the routes must cover, one per backend service.
    #[serde(default)]
    pub required_paths: Vec<String>,
    #[serde(default)]
    pub allowed_backends: BTreeSet<String>,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    #[serde(default)]
    pub probes: ProbeSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSettings {
    #[serde(default = "default_condition")]
    pub condition: String,
    #[serde(default = "default_ready_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll")]
    pub poll_secs: u64,
    /// Upper bound on a single status read.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_condition() -> String { "Programmed".to_string() }
fn default_ready_timeout() -> u64 { 300 }
fn default_poll() -> u64 { 5 }
fn default_request_timeout() -> u64 { 10 }

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            condition: default_condition(),
            timeout_secs: default_ready_timeout(),
            poll_secs: default_poll(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ReadinessSettings {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
    pub fn interval(&self) -> Duration { Duration::from_secs(self.poll_secs.max(1)) }
    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs.max(1)) }
}

/// In-cluster probe target reached through the API server's service proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalProbe {
    pub service: String,
    pub port: u16,
    #[serde(default = "default_probe_path")]
    pub path: String,
}

fn default_probe_path() -> String { "/".to_string() }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Paths probed through the gateway's assigned address.
    #[serde(default = "default_external_paths")]
    pub external_paths: Vec<String>,
    #[serde(default)]
    pub internal: Vec<InternalProbe>,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

fn default_external_paths() -> Vec<String> { vec![default_probe_path()] }
fn default_probe_timeout() -> u64 { 10 }

impl Default for ProbeSettings {
    fn default() -> Self {
        Self { external_paths: default_external_paths(), internal: Vec::new(), timeout_secs: default_probe_timeout() }
    }
}

impl ProbeSettings {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs.max(1)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let t: EnvironmentTarget = serde_json::from_value(serde_json::json!({
            "name": "staging",
            "namespace": "shop",
            "domain": "shop.example.com",
            "gateway": "edge"
        }))
        .unwrap();
        assert_eq!(t.readiness.condition, "Programmed");
        assert_eq!(t.readiness.timeout(), Duration::from_secs(300));
        assert_eq!(t.probes.external_paths, vec!["/"]);
        assert!(t.overlays.is_empty());
        assert!(t.cluster.is_none());
    }
}
