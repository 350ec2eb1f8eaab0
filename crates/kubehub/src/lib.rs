//! Stencil kubehub: `ObjectStore` backed by the Kubernetes API, with kind
//! scope resolved through discovery.

#![forbid(unsafe_code)]

use anyhow::Result;
use async_trait::async_trait;
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use stencil_core::{describe, gvk_key, gvk_of, ObjectStore, StoreError};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Map a kube client error onto the store taxonomy.
pub fn map_kube_err(e: kube::Error, what: &str) -> StoreError {
    match e {
        kube::Error::Api(ae) => match (ae.code, ae.reason.as_str()) {
            (404, _) => StoreError::NotFound(what.to_string()),
            (409, "AlreadyExists") => StoreError::AlreadyExists(what.to_string()),
            (409, _) => StoreError::Conflict(format!("{}: {}", what, ae.message)),
            (400, _) | (422, _) => StoreError::Invalid(format!("{}: {}", what, ae.message)),
            _ => StoreError::Transport(format!("{}: {} ({})", what, ae.message, ae.code)),
        },
        other => StoreError::Transport(format!("{}: {}", what, other)),
    }
}

/// `ObjectStore` over a live cluster.
pub struct KubeStore {
    client: Client,
    resources: RwLock<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resources: RwLock::new(FxHashMap::default()) }
    }

    /// Client from the current kubeconfig context or in-cluster config.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Re-run discovery and replace the cached resource table.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| StoreError::Transport(format!("discovery: {}", e)))?;
        let mut table = FxHashMap::default();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    let key = gvk_key(&GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind));
                    table.insert(key, (ar, namespaced));
                }
            }
        }
        let count = table.len();
        *self.resources.write().await = table;
        info!(count, "discovery refreshed");
        Ok(count)
    }

    async fn cached(&self, key: &str) -> Option<(ApiResource, bool)> {
        self.resources.read().await.get(key).cloned()
    }

    /// Resource for a GVK; refreshes discovery once on a miss (CRDs may have
    /// been installed since the last run).
    async fn find_api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), StoreError> {
        let key = gvk_key(gvk);
        if let Some(hit) = self.cached(&key).await {
            return Ok(hit);
        }
        self.refresh().await?;
        self.cached(&key).await.ok_or(StoreError::UnknownKind(key))
    }

    async fn api_for(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.find_api_resource(gvk).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    async fn api_for_object(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, String), StoreError> {
        let gvk = gvk_of(obj).ok_or_else(|| StoreError::Invalid("object missing apiVersion/kind".into()))?;
        let name = obj.metadata.name.clone().ok_or_else(|| StoreError::Invalid(format!("{}: missing metadata.name", gvk_key(&gvk))))?;
        let (_, namespaced) = self.find_api_resource(&gvk).await?;
        if namespaced && obj.metadata.namespace.is_none() {
            return Err(StoreError::Invalid(format!("{}: namespace required for namespaced kind", describe(obj))));
        }
        Ok((self.api_for(&gvk, obj.metadata.namespace.as_deref()).await?, name))
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        let api = self.api_for(gvk, namespace).await?;
        let what = format!("{} {}", gvk_key(gvk), stencil_core::ObjectKey::new(namespace, name));
        api.get(name).await.map_err(|e| map_kube_err(e, &what))
    }

    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let api = self.api_for(gvk, namespace).await?;
        let list = api.list(&ListParams::default()).await.map_err(|e| map_kube_err(e, &gvk_key(gvk)))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (api, _) = self.api_for_object(obj).await?;
        debug!(object = %describe(obj), "kube: create");
        api.create(&PostParams::default(), obj).await.map_err(|e| map_kube_err(e, &describe(obj)))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (api, name) = self.api_for_object(obj).await?;
        debug!(object = %describe(obj), "kube: replace");
        api.replace(&name, &PostParams::default(), obj).await.map_err(|e| map_kube_err(e, &describe(obj)))
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (api, name) = self.api_for_object(obj).await?;
        let body = serde_json::to_vec(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
        debug!(object = %describe(obj), "kube: replace status");
        api.replace_status(&name, &PostParams::default(), body).await.map_err(|e| map_kube_err(e, &describe(obj)))
    }

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, StoreError> {
        Ok(self.find_api_resource(gvk).await?.1)
    }
}
