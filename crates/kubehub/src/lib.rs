//! Portico kubehub: the control-plane seam and its implementations.
//!
//! Every stage that touches the cluster does so through [`ClusterApi`] and
//! [`CapabilityQuery`]. [`KubeCluster`] talks to a real API server via kube-rs;
//! [`MemoryCluster`] keeps state in memory and records every write.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use anyhow::Result;
use portico_core::{RecordKey, ResourceRecord};
use serde_json::Value as Json;

mod kube_cluster;
mod memory;

pub use kube_cluster::{client_for_context, KubeCluster};
pub use memory::MemoryCluster;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "portico";

/// Cluster control-plane operations consumed by the rollout stages.
///
/// Writes are not assumed to be visible to subsequent reads immediately.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    async fn create_namespace(&self, name: &str) -> Result<()>;

    /// Live object (including status) by identity, or `None` when absent.
    async fn get(&self, api_version: &str, key: &RecordKey) -> Result<Option<Json>>;

    /// Create or update `record` in place, returning the live object.
    async fn apply(&self, record: &ResourceRecord) -> Result<Json>;

    /// All objects of `kind` in `namespace`.
    async fn list(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Vec<Json>>;

    /// Recent events about the object, oldest first, rendered as one line each.
    async fn events_for(&self, _key: &RecordKey) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Answers whether the cluster declares a capability (a CRD name such as
/// `gateways.gateway.networking.k8s.io`).
#[async_trait::async_trait]
pub trait CapabilityQuery: Send + Sync {
    async fn is_declared(&self, capability: &str) -> Result<bool>;
}

/// Fixed allow-list of capabilities, for targets whose CRDs are managed elsewhere.
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilities(pub BTreeSet<String>);

impl<S: Into<String>> FromIterator<S> for StaticCapabilities {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[async_trait::async_trait]
impl CapabilityQuery for StaticCapabilities {
    async fn is_declared(&self, capability: &str) -> Result<bool> {
        Ok(self.0.contains(capability))
    }
}

/// Stands in for a cluster that could not be reached. Every call fails with
/// the connection error.
#[derive(Debug, Clone)]
pub struct UnreachableCluster {
    reason: String,
}

impl UnreachableCluster {
    pub fn new(reason: impl Into<String>) -> Self { Self { reason: reason.into() } }

    pub fn reason(&self) -> &str { &self.reason }

    fn refuse<T>(&self) -> Result<T> {
        Err(anyhow::anyhow!("cluster unreachable: {}", self.reason))
    }
}

#[async_trait::async_trait]
impl ClusterApi for UnreachableCluster {
    async fn namespace_exists(&self, _name: &str) -> Result<bool> { self.refuse() }
    async fn create_namespace(&self, _name: &str) -> Result<()> { self.refuse() }
    async fn get(&self, _api_version: &str, _key: &RecordKey) -> Result<Option<Json>> { self.refuse() }
    async fn apply(&self, _record: &ResourceRecord) -> Result<Json> { self.refuse() }
    async fn list(&self, _api_version: &str, _kind: &str, _namespace: &str) -> Result<Vec<Json>> { self.refuse() }
    async fn events_for(&self, _key: &RecordKey) -> Result<Vec<String>> { self.refuse() }
}

#[async_trait::async_trait]
impl CapabilityQuery for UnreachableCluster {
    async fn is_declared(&self, _capability: &str) -> Result<bool> { self.refuse() }
}

/// Drop server bookkeeping that makes live objects noisy to log and compare.
pub fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}
