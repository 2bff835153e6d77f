use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::{Event, Namespace};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, GetParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    config::KubeConfigOptions,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use portico_core::{RecordKey, ResourceRecord};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{strip_managed_fields, CapabilityQuery, ClusterApi, FIELD_MANAGER};

/// Build a client for a named kube context, or the current one when `None`.
pub async fn client_for_context(context: Option<&str>) -> Result<Client> {
    match context {
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            let cfg = kube::Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kubeconfig context {}", ctx))?;
            Ok(Client::try_from(cfg)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// [`ClusterApi`] backed by a live API server.
///
/// Discovery runs once at connect time; kinds whose CRDs appear later are not
/// resolvable by this instance.
pub struct KubeCluster {
    client: Client,
    discovery: Discovery,
}

impl KubeCluster {
    pub async fn connect(context: Option<&str>) -> Result<Self> {
        let client = client_for_context(context).await?;
        let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
        info!(context = ?context, groups = discovery.groups().count(), "connected to cluster");
        Ok(Self { client, discovery })
    }

    pub fn client(&self) -> Client { self.client.clone() }

    fn api_for(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Api<DynamicObject>> {
        let (group, version) = api_version.rsplit_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (ar, caps) = self
            .discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))?;
        if matches!(caps.scope, Scope::Namespaced) {
            if namespace.is_empty() {
                return Err(anyhow!("namespace required for namespaced kind {}", kind));
            }
            Ok(Api::namespaced_with(self.client.clone(), namespace, &ar))
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }

    /// GET `path` on `service:port` through the API server's service proxy.
    /// Returns the HTTP status; non-2xx answers are statuses, not errors.
    pub async fn service_proxy_get(&self, namespace: &str, service: &str, port: u16, path: &str) -> Result<u16> {
        let base = format!("/api/v1/namespaces/{}/services", namespace);
        let target = format!("{}:{}/proxy/{}", service, port, path.trim_start_matches('/'));
        let req = kube::core::Request::new(base).get(&target, &GetParams::default())?;
        match self.client.request_text(req).await {
            Ok(_) => Ok(200),
            Err(kube::Error::Api(ae)) => Ok(ae.code),
            Err(e) => Err(anyhow!("service proxy request failed: {}", e)),
        }
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json> {
    let mut v = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut v);
    Ok(v)
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some([("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            // Lost a race with another writer; the namespace exists, which is all we need.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(namespace = %name, "namespace already exists");
                Ok(())
            }
            Err(e) => Err(anyhow!("creating namespace {}: {}", name, e)),
        }
    }

    async fn get(&self, api_version: &str, key: &RecordKey) -> Result<Option<Json>> {
        let api = self.api_for(api_version, &key.kind, &key.namespace)?;
        match api.get_opt(&key.name).await? {
            Some(obj) => Ok(Some(to_json(&obj)?)),
            None => Ok(None),
        }
    }

    async fn apply(&self, record: &ResourceRecord) -> Result<Json> {
        let api = self.api_for(&record.api_version, &record.kind, &record.namespace)?;
        let manifest = record.to_manifest();
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        counter!("cluster_apply_requests", 1u64);
        let obj = api
            .patch(&record.name, &pp, &Patch::Apply(&manifest))
            .await
            .map_err(|e| anyhow!("server-side apply failed: {}", e))?;
        to_json(&obj)
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Vec<Json>> {
        let api = self.api_for(api_version, kind, namespace)?;
        let list = api.list(&ListParams::default()).await.with_context(|| format!("listing {}", kind))?;
        list.items.iter().map(to_json).collect()
    }

    async fn events_for(&self, key: &RecordKey) -> Result<Vec<String>> {
        if key.namespace.is_empty() {
            return Ok(Vec::new());
        }
        let api: Api<Event> = Api::namespaced(self.client.clone(), &key.namespace);
        let lp = ListParams::default().fields(&format!("involvedObject.kind={},involvedObject.name={}", key.kind, key.name));
        let mut items = api.list(&lp).await.context("listing events")?.items;
        items.sort_by_key(|e| e.last_timestamp.as_ref().map(|t| t.0.timestamp()).unwrap_or(0));
        Ok(items
            .into_iter()
            .map(|e| {
                format!(
                    "{} {}: {}",
                    e.type_.unwrap_or_default(),
                    e.reason.unwrap_or_default(),
                    e.message.unwrap_or_default()
                )
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl CapabilityQuery for KubeCluster {
    async fn is_declared(&self, capability: &str) -> Result<bool> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let found = api.get_opt(capability).await.with_context(|| format!("looking up CRD {}", capability))?;
        Ok(found.is_some())
    }
}
