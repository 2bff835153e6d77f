use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Identity of a record within a document and on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: String,
    /// Empty for cluster-scoped kinds.
    pub namespace: String,
    pub name: String,
}

impl RecordKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Coarse role of a record in a gateway rollout, derived from its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordClass {
    Namespace,
    IdentityBinding,
    Other,
    Gateway,
    Route,
    Policy,
}

impl RecordClass {
    pub fn of(kind: &str) -> Self {
        match kind {
            "Gateway" => RecordClass::Gateway,
            "HTTPRoute" | "GRPCRoute" | "TLSRoute" | "TCPRoute" => RecordClass::Route,
            "Namespace" => RecordClass::Namespace,
            "ServiceAccount" | "Role" | "RoleBinding" | "ClusterRole" | "ClusterRoleBinding" => {
                RecordClass::IdentityBinding
            }
            k if k.ends_with("Policy") => RecordClass::Policy,
            _ => RecordClass::Other,
        }
    }

    /// Lower applies first. Namespaces and identities must exist before the
    /// gateway; policies attach to routes that already exist.
    pub fn apply_priority(self) -> u8 {
        match self {
            RecordClass::Namespace => 0,
            RecordClass::IdentityBinding => 1,
            RecordClass::Other => 2,
            RecordClass::Gateway => 3,
            RecordClass::Route => 4,
            RecordClass::Policy => 5,
        }
    }
}

/// Kinds that never carry a namespace.
pub fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace" | "ClusterRole" | "ClusterRoleBinding" | "CustomResourceDefinition" | "GatewayClass"
    )
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("manifest missing {0}")]
    MissingField(&'static str),
    #[error("manifest is not an object")]
    NotAnObject,
    #[error("duplicate record {0}")]
    Duplicate(RecordKey),
}

/// A single declarative unit of cluster configuration.
///
/// `body` holds everything except `apiVersion`, `kind`, `metadata.name` and
/// `metadata.namespace`; other metadata (labels, annotations) stays in
/// `body.metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub body: Map<String, Json>,
}

impl ResourceRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind.clone(), self.namespace.clone(), self.name.clone())
    }

    pub fn class(&self) -> RecordClass {
        RecordClass::of(&self.kind)
    }

    /// API group, empty for the core group (`v1`).
    pub fn group(&self) -> &str {
        self.api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.api_version.rsplit_once('/').map(|(_, v)| v).unwrap_or(&self.api_version)
    }

    /// Walk `body` along `path`; `None` on any missing segment.
    pub fn field(&self, path: &[&str]) -> Option<&Json> {
        let (first, rest) = path.split_first()?;
        let mut cur = self.body.get(*first)?;
        for seg in rest {
            cur = cur.get(*seg)?;
        }
        Some(cur)
    }

    /// Build a record from a full manifest object.
    pub fn from_manifest(manifest: Json) -> Result<Self, RecordError> {
        let Json::Object(mut obj) = manifest else { return Err(RecordError::NotAnObject) };
        let api_version = take_str(&mut obj, "apiVersion").ok_or(RecordError::MissingField("apiVersion"))?;
        let kind = take_str(&mut obj, "kind").ok_or(RecordError::MissingField("kind"))?;
        let meta = obj.get_mut("metadata").and_then(|m| m.as_object_mut()).ok_or(RecordError::MissingField("metadata.name"))?;
        let name = take_str(meta, "name").ok_or(RecordError::MissingField("metadata.name"))?;
        let namespace = take_str(meta, "namespace").unwrap_or_default();
        if meta.is_empty() {
            obj.remove("metadata");
        }
        Ok(Self { api_version, kind, name, namespace, body: obj })
    }

    /// Full manifest suitable for server-side apply.
    pub fn to_manifest(&self) -> Json {
        let mut obj = Map::new();
        obj.insert("apiVersion".into(), Json::String(self.api_version.clone()));
        obj.insert("kind".into(), Json::String(self.kind.clone()));
        let mut meta = self
            .body
            .get("metadata")
            .and_then(|m| m.as_object())
            .cloned()
            .unwrap_or_default();
        meta.insert("name".into(), Json::String(self.name.clone()));
        if !self.namespace.is_empty() {
            meta.insert("namespace".into(), Json::String(self.namespace.clone()));
        }
        obj.insert("metadata".into(), Json::Object(meta));
        for (k, v) in self.body.iter() {
            if k != "metadata" {
                obj.insert(k.clone(), v.clone());
            }
        }
        Json::Object(obj)
    }
}

fn take_str(obj: &mut Map<String, Json>, key: &str) -> Option<String> {
    match obj.remove(key) {
        Some(Json::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// Ordered set of records, unique by `(kind, namespace, name)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    records: Vec<ResourceRecord>,
}

impl ResourceDocument {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, record: ResourceRecord) -> Result<(), RecordError> {
        let key = record.key();
        if self.get(&key).is_some() {
            return Err(RecordError::Duplicate(key));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn get(&self, key: &RecordKey) -> Option<&ResourceRecord> {
        self.records.iter().find(|r| r.kind == key.kind && r.namespace == key.namespace && r.name == key.name)
    }

    pub fn get_mut(&mut self, key: &RecordKey) -> Option<&mut ResourceRecord> {
        self.records.iter_mut().find(|r| r.kind == key.kind && r.namespace == key.namespace && r.name == key.name)
    }

    pub fn records(&self) -> &[ResourceRecord] { &self.records }
    pub fn iter(&self) -> std::slice::Iter<'_, ResourceRecord> { self.records.iter() }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    pub fn of_class(&self, class: RecordClass) -> impl Iterator<Item = &ResourceRecord> {
        self.records.iter().filter(move |r| r.class() == class)
    }

    /// Stable sort into apply order; records of the same class keep source order.
    pub fn sort_for_apply(&mut self) {
        self.records.sort_by_key(|r| r.class().apply_priority());
    }
}

impl<'a> IntoIterator for &'a ResourceDocument {
    type Item = &'a ResourceRecord;
    type IntoIter = std::slice::Iter<'a, ResourceRecord>;
    fn into_iter(self) -> Self::IntoIter { self.records.iter() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str) -> ResourceRecord {
        ResourceRecord {
            api_version: "gateway.networking.k8s.io/v1".into(),
            kind: "HTTPRoute".into(),
            name: name.into(),
            namespace: "shop".into(),
            body: Map::new(),
        }
    }

    #[test]
    fn manifest_round_trip_keeps_labels() {
        let m = serde_json::json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": { "name": "edge", "namespace": "shop", "labels": { "app": "edge" } },
            "spec": { "gatewayClassName": "gke-l7-global-external-managed" }
        });
        let r = ResourceRecord::from_manifest(m.clone()).expect("parse");
        assert_eq!(r.group(), "gateway.networking.k8s.io");
        assert_eq!(r.version(), "v1");
        assert_eq!(r.class(), RecordClass::Gateway);
        assert_eq!(r.field(&["metadata", "labels", "app"]).and_then(|v| v.as_str()), Some("edge"));
        assert_eq!(r.to_manifest(), m);
    }

    #[test]
    fn from_manifest_errors_are_friendly() {
        let e = ResourceRecord::from_manifest(serde_json::json!({"kind": "Foo", "metadata": {"name": "x"}})).unwrap_err();
        assert!(e.to_string().contains("missing apiVersion"), "e={}", e);
        let e = ResourceRecord::from_manifest(serde_json::json!({"apiVersion": "v1", "metadata": {"name": "x"}})).unwrap_err();
        assert!(e.to_string().contains("missing kind"), "e={}", e);
        let e = ResourceRecord::from_manifest(serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}})).unwrap_err();
        assert!(e.to_string().contains("missing metadata.name"), "e={}", e);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut doc = ResourceDocument::new();
        doc.push(route("a")).unwrap();
        let err = doc.push(route("a")).unwrap_err();
        assert_eq!(err, RecordError::Duplicate(RecordKey::new("HTTPRoute", "shop", "a")));
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn classes_cover_common_kinds() {
        assert_eq!(RecordClass::of("GCPBackendPolicy"), RecordClass::Policy);
        assert_eq!(RecordClass::of("ServiceAccount"), RecordClass::IdentityBinding);
        assert_eq!(RecordClass::of("GRPCRoute"), RecordClass::Route);
        assert_eq!(RecordClass::of("ConfigMap"), RecordClass::Other);
    }

    #[test]
    fn sort_for_apply_is_stable() {
        let mut doc = ResourceDocument::new();
        doc.push(route("b")).unwrap();
        let gw = ResourceRecord { kind: "Gateway".into(), name: "edge".into(), ..route("x") };
        doc.push(gw).unwrap();
        doc.push(route("a")).unwrap();
        let ns = ResourceRecord { api_version: "v1".into(), kind: "Namespace".into(), name: "shop".into(), namespace: String::new(), body: Map::new() };
        doc.push(ns).unwrap();
        doc.sort_for_apply();
        let names: Vec<_> = doc.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["shop", "edge", "b", "a"]);
    }
}
