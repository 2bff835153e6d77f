use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use portico_core::{is_cluster_scoped, RecordKey, ResourceRecord};
use serde_json::Value as Json;
use tokio::time::Instant;

use crate::{CapabilityQuery, ClusterApi};

/// In-memory [`ClusterApi`] with scripted controller behaviour.
///
/// Applies replace everything but `status`; statuses come from
/// [`MemoryCluster::auto_status`] (set on first apply of a kind) or
/// [`MemoryCluster::set_status`]/[`MemoryCluster::set_status_after`].
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    objects: BTreeMap<RecordKey, Json>,
    capabilities: BTreeSet<String>,
    rejections: BTreeMap<RecordKey, String>,
    auto_status: BTreeMap<String, Json>,
    scheduled: Vec<(Instant, RecordKey, Json)>,
    events: BTreeMap<RecordKey, Vec<String>>,
    writes: Vec<String>,
    reads: usize,
}

impl State {
    /// Promote scheduled statuses whose time has come.
    fn settle(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled).into_iter().partition(|(at, _, _)| *at <= now);
        self.scheduled = pending;
        for (_, key, status) in due {
            if let Some(obj) = self.objects.get_mut(&key) {
                obj["status"] = status;
            }
        }
    }
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn declare(self, capability: impl Into<String>) -> Self {
        self.lock().capabilities.insert(capability.into());
        self
    }

    pub fn with_namespace(self, name: impl Into<String>) -> Self {
        self.lock().namespaces.insert(name.into());
        self
    }

    /// Status attached to every object of `kind` when it is first created.
    pub fn auto_status(self, kind: impl Into<String>, status: Json) -> Self {
        self.lock().auto_status.insert(kind.into(), status);
        self
    }

    /// Make applies of `key` fail with `reason`, as an admission webhook would.
    pub fn reject(self, key: RecordKey, reason: impl Into<String>) -> Self {
        self.lock().rejections.insert(key, reason.into());
        self
    }

    pub fn set_status(&self, key: &RecordKey, status: Json) {
        if let Some(obj) = self.lock().objects.get_mut(key) {
            obj["status"] = status;
        }
    }

    /// Replace the status of `key` once `after` has elapsed (tokio clock).
    pub fn set_status_after(&self, key: RecordKey, status: Json, after: Duration) {
        self.lock().scheduled.push((Instant::now() + after, key, status));
    }

    pub fn add_event(&self, key: RecordKey, line: impl Into<String>) {
        self.lock().events.entry(key).or_default().push(line.into());
    }

    /// Every mutating call, in order.
    pub fn writes(&self) -> Vec<String> { self.lock().writes.clone() }

    pub fn reads(&self) -> usize { self.lock().reads }

    pub fn object(&self, key: &RecordKey) -> Option<Json> { self.lock().objects.get(key).cloned() }

    pub fn objects(&self) -> BTreeMap<RecordKey, Json> { self.lock().objects.clone() }

    pub fn namespaces(&self) -> BTreeSet<String> { self.lock().namespaces.clone() }
}

#[async_trait::async_trait]
impl ClusterApi for MemoryCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let mut st = self.lock();
        st.reads += 1;
        Ok(st.namespaces.contains(name))
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let mut st = self.lock();
        if !st.namespaces.insert(name.to_string()) {
            return Err(anyhow!("namespaces \"{}\" already exists", name));
        }
        st.writes.push(format!("create Namespace/{}", name));
        Ok(())
    }

    async fn get(&self, _api_version: &str, key: &RecordKey) -> Result<Option<Json>> {
        let mut st = self.lock();
        st.reads += 1;
        st.settle();
        Ok(st.objects.get(key).cloned())
    }

    async fn apply(&self, record: &ResourceRecord) -> Result<Json> {
        let mut st = self.lock();
        let key = record.key();
        if let Some(reason) = st.rejections.get(&key) {
            return Err(anyhow!("admission denied for {}: {}", key, reason));
        }
        if !is_cluster_scoped(&record.kind) && !st.namespaces.contains(&record.namespace) {
            return Err(anyhow!("namespaces \"{}\" not found", record.namespace));
        }
        let mut obj = record.to_manifest();
        match st.objects.get(&key).and_then(|live| live.get("status")).cloned() {
            Some(status) => obj["status"] = status,
            None => {
                if let Some(status) = st.auto_status.get(&record.kind).cloned() {
                    obj["status"] = status;
                }
            }
        }
        if record.kind == "Namespace" {
            st.namespaces.insert(record.name.clone());
        }
        st.writes.push(format!("apply {}", key));
        st.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn list(&self, _api_version: &str, kind: &str, namespace: &str) -> Result<Vec<Json>> {
        let mut st = self.lock();
        st.reads += 1;
        st.settle();
        Ok(st
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind && k.namespace == namespace)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn events_for(&self, key: &RecordKey) -> Result<Vec<String>> {
        Ok(self.lock().events.get(key).cloned().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl CapabilityQuery for MemoryCluster {
    async fn is_declared(&self, capability: &str) -> Result<bool> {
        Ok(self.lock().capabilities.contains(capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> ResourceRecord {
        ResourceRecord::from_manifest(serde_json::json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": { "name": "edge", "namespace": "shop" },
            "spec": { "gatewayClassName": "eg" }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn apply_requires_namespace_and_keeps_status() {
        let c = MemoryCluster::new().auto_status("Gateway", serde_json::json!({"conditions": []}));
        assert!(c.apply(&gateway()).await.is_err());
        c.create_namespace("shop").await.unwrap();
        c.apply(&gateway()).await.unwrap();
        let key = gateway().key();
        c.set_status(&key, serde_json::json!({"addresses": [{"value": "10.0.0.1"}]}));
        c.apply(&gateway()).await.unwrap();
        let live = c.object(&key).unwrap();
        assert_eq!(live["status"]["addresses"][0]["value"], "10.0.0.1");
        assert_eq!(c.writes(), vec!["create Namespace/shop", "apply Gateway/shop/edge", "apply Gateway/shop/edge"]);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_status_lands_on_time() {
        let c = MemoryCluster::new().with_namespace("shop");
        c.apply(&gateway()).await.unwrap();
        let key = gateway().key();
        c.set_status_after(key.clone(), serde_json::json!({"ok": true}), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(c.get("gateway.networking.k8s.io/v1", &key).await.unwrap().unwrap().get("status").is_none());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(c.get("gateway.networking.k8s.io/v1", &key).await.unwrap().unwrap()["status"]["ok"], true);
    }

    #[tokio::test]
    async fn rejected_records_fail_apply() {
        let c = MemoryCluster::new().with_namespace("shop").reject(gateway().key(), "listener port forbidden");
        let err = c.apply(&gateway()).await.unwrap_err().to_string();
        assert!(err.contains("listener port forbidden"), "err={}", err);
        assert!(c.writes().is_empty());
    }
}
