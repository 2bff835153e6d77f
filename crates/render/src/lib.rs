//! Portico render: compose a target's resource set from base records and overlays.
//!
//! Rendering is a pure function of `(EnvironmentTarget, ManifestSource)`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use portico_core::{is_cluster_scoped, EnvironmentTarget, RecordError, RecordKey, ResourceDocument, ResourceRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::debug;

fn max_yaml_bytes() -> usize {
    std::env::var("PORTICO_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("PORTICO_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Selects the record a patch applies to. `namespace` defaults to the target namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchTarget {
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
}

/// Field-level override, applied as a JSON merge patch (RFC 7386) to a record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayPatch {
    pub target: PatchTarget,
    pub patch: Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    #[serde(default)]
    pub patches: Vec<OverlayPatch>,
    /// Records the overlay adds on top of the base.
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
}

/// Base records plus named overlays, as authored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestSource {
    pub base: Vec<ResourceRecord>,
    pub overlays: BTreeMap<String, Overlay>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("overlay {0} selected by target but not defined")]
    UnknownOverlay(String),
    #[error("overlay {overlay} patches {key}, which is absent from the document")]
    PatchTargetMissing { overlay: String, key: RecordKey },
    #[error("overlay {overlay} patch for {key} is not an object")]
    PatchNotAnObject { overlay: String, key: RecordKey },
    #[error("{origin}: {source}")]
    Record { origin: String, source: RecordError },
}

/// Merge `patch` into `target` following RFC 7386: objects merge recursively,
/// `null` deletes, everything else replaces.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Json::Object(t) = target {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

fn localize(mut record: ResourceRecord, target: &EnvironmentTarget) -> ResourceRecord {
    if record.namespace.is_empty() && !is_cluster_scoped(&record.kind) {
        record.namespace = target.namespace.clone();
    }
    record
}

fn apply_patch(record: &mut ResourceRecord, patch: &Json, overlay: &str) -> Result<(), RenderError> {
    if !patch.is_object() {
        return Err(RenderError::PatchNotAnObject { overlay: overlay.to_string(), key: record.key() });
    }
    let mut patch = patch.clone();
    // Identity is fixed by the patch target; a patch cannot rename or move a record.
    if let Some(meta) = patch.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("name");
        meta.remove("namespace");
    }
    let mut body = Json::Object(std::mem::take(&mut record.body));
    merge_patch(&mut body, &patch);
    record.body = match body {
        Json::Object(m) => m,
        _ => Map::new(),
    };
    Ok(())
}

/// Render the target's document: base records, then each selected overlay's
/// added resources and patches, in the order the target lists overlays.
pub fn render(target: &EnvironmentTarget, source: &ManifestSource) -> Result<ResourceDocument, RenderError> {
    let mut doc = ResourceDocument::new();
    for record in &source.base {
        doc.push(localize(record.clone(), target))
            .map_err(|e| RenderError::Record { origin: "base".to_string(), source: e })?;
    }
    for name in &target.overlays {
        let overlay = source.overlays.get(name).ok_or_else(|| RenderError::UnknownOverlay(name.clone()))?;
        for record in &overlay.resources {
            doc.push(localize(record.clone(), target))
                .map_err(|e| RenderError::Record { origin: format!("overlay {}", name), source: e })?;
        }
        for p in &overlay.patches {
            let ns = match &p.target.namespace {
                Some(ns) => ns.clone(),
                None if is_cluster_scoped(&p.target.kind) => String::new(),
                None => target.namespace.clone(),
            };
            let key = RecordKey::new(p.target.kind.clone(), ns, p.target.name.clone());
            let record = doc
                .get_mut(&key)
                .ok_or_else(|| RenderError::PatchTargetMissing { overlay: name.clone(), key: key.clone() })?;
            apply_patch(record, &p.patch, name)?;
        }
        debug!(overlay = %name, patches = overlay.patches.len(), added = overlay.resources.len(), "overlay applied");
    }
    doc.sort_for_apply();
    Ok(doc)
}

/// Serialize a document as multi-document YAML, one manifest per record.
pub fn to_yaml(doc: &ResourceDocument) -> Result<String> {
    let mut parts = Vec::with_capacity(doc.len());
    for r in doc {
        parts.push(serde_yaml::to_string(&r.to_manifest()).with_context(|| format!("serializing {}", r.key()))?);
    }
    Ok(parts.join("---\n"))
}

/// Parse a multi-document YAML text into JSON values, skipping empty documents.
pub fn parse_documents(text: &str, origin: &str) -> Result<Vec<Json>> {
    if text.len() > max_yaml_bytes() {
        return Err(anyhow!("{}: YAML payload too large (>{} bytes)", origin, max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let val = serde_yaml::Value::deserialize(de).with_context(|| format!("parsing YAML in {}", origin))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).with_context(|| format!("converting YAML to JSON in {}", origin))?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("{}: YAML document too complex (>{} nodes)", origin, max_yaml_nodes()));
        }
        out.push(json);
    }
    Ok(out)
}

#[derive(Deserialize)]
struct OverlayDoc {
    #[serde(default)]
    patches: Vec<OverlayPatch>,
}

fn yaml_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let is_yaml = path.extension().and_then(|e| e.to_str()).map(|e| e == "yaml" || e == "yml").unwrap_or(false);
        if path.is_file() && is_yaml {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

impl ManifestSource {
    /// Load `<dir>/base/*.yaml` and `<dir>/overlays/<name>/*.yaml`, in sorted
    /// file order. In overlays, `kind: Overlay` documents carry patches and all
    /// other documents are added resources.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut source = ManifestSource::default();
        for file in yaml_files(&dir.join("base"))? {
            let origin = file.display().to_string();
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", origin))?;
            for json in parse_documents(&text, &origin)? {
                source.base.push(ResourceRecord::from_manifest(json).with_context(|| origin.clone())?);
            }
        }
        let overlays_dir = dir.join("overlays");
        if overlays_dir.is_dir() {
            let mut dirs: Vec<_> = std::fs::read_dir(&overlays_dir)
                .with_context(|| format!("reading {}", overlays_dir.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_dir())
                .collect();
            dirs.sort();
            for odir in dirs {
                let name = odir.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
                let mut overlay = Overlay::default();
                for file in yaml_files(&odir)? {
                    let origin = file.display().to_string();
                    let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", origin))?;
                    for json in parse_documents(&text, &origin)? {
                        overlay.add_document(json).with_context(|| origin.clone())?;
                    }
                }
                source.overlays.insert(name, overlay);
            }
        }
        debug!(dir = %dir.display(), base = source.base.len(), overlays = source.overlays.len(), "manifest source loaded");
        Ok(source)
    }
}

impl Overlay {
    pub fn add_document(&mut self, json: Json) -> Result<()> {
        if json.get("kind").and_then(|k| k.as_str()) == Some("Overlay") {
            let doc: OverlayDoc = serde_json::from_value(json).context("parsing Overlay document")?;
            self.patches.extend(doc.patches);
        } else {
            self.resources.push(ResourceRecord::from_manifest(json)?);
        }
        Ok(())
    }
}
