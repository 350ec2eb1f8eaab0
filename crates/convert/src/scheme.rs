//! Kind registry: maps a GVK to a decoder for its typed shape and its scope.

use std::any::{Any, TypeId};
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::core::GroupVersionKind;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use stencil_core::{gvk_key, ConvertError, Template, TemplateInstance};

use crate::gvk_for;

/// A decoded object of a registered kind.
pub trait TypedObject: Any + Debug + Send + Sync {
    fn gvk(&self) -> GroupVersionKind;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<K> TypedObject for K
where
    K: kube::Resource<DynamicType = ()> + Any + Debug + Send + Sync,
{
    fn gvk(&self) -> GroupVersionKind {
        gvk_for::<K>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

type Decoder = fn(&[u8]) -> Result<Box<dyn TypedObject>, serde_json::Error>;

fn decode_as<K>(bytes: &[u8]) -> Result<Box<dyn TypedObject>, serde_json::Error>
where
    K: kube::Resource<DynamicType = ()> + DeserializeOwned + Debug + Send + Sync + 'static,
{
    Ok(Box::new(serde_json::from_slice::<K>(bytes)?))
}

#[derive(Clone, Copy)]
struct Registration {
    decode: Decoder,
    namespaced: bool,
}

/// Registry of typed kinds.
#[derive(Clone, Default)]
pub struct Scheme {
    kinds: FxHashMap<String, Registration>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<K>(&mut self) -> &mut Self
    where
        K: kube::Resource<DynamicType = ()> + DeserializeOwned + Debug + Send + Sync + 'static,
        K::Scope: 'static,
    {
        let namespaced = TypeId::of::<K::Scope>() == TypeId::of::<NamespaceResourceScope>();
        self.kinds.insert(gvk_key(&gvk_for::<K>()), Registration { decode: decode_as::<K>, namespaced });
        self
    }

    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains_key(&gvk_key(gvk))
    }

    /// Scope of a registered kind; `None` when the kind is unknown.
    pub fn is_namespaced(&self, gvk: &GroupVersionKind) -> Option<bool> {
        self.kinds.get(&gvk_key(gvk)).map(|r| r.namespaced)
    }

    pub fn decode(&self, gvk: &GroupVersionKind, bytes: &[u8]) -> Result<Box<dyn TypedObject>, ConvertError> {
        let key = gvk_key(gvk);
        let reg = self.kinds.get(&key).ok_or_else(|| ConvertError::UnknownKind(key.clone()))?;
        (reg.decode)(bytes).map_err(|e| ConvertError::Decode { kind: key, message: e.to_string() })
    }

    /// Empty object of a registered kind (apiVersion, kind and blank metadata).
    /// Kinds with required fields fail to decode.
    pub fn new_object(&self, gvk: &GroupVersionKind) -> Result<Box<dyn TypedObject>, ConvertError> {
        let api_version = if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) };
        let skeleton = serde_json::json!({ "apiVersion": api_version, "kind": gvk.kind, "metadata": {} });
        self.decode(gvk, skeleton.to_string().as_bytes())
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl Debug for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.kinds.keys().collect();
        keys.sort();
        f.debug_struct("Scheme").field("kinds", &keys).finish()
    }
}

/// Scheme with the stencil kinds and the common built-in kinds.
pub fn default_scheme() -> Scheme {
    let mut s = Scheme::new();
    s.register::<Template>()
        .register::<TemplateInstance>()
        .register::<Pod>()
        .register::<ConfigMap>()
        .register::<Secret>()
        .register::<Service>()
        .register::<ServiceAccount>()
        .register::<PersistentVolumeClaim>()
        .register::<Namespace>()
        .register::<Deployment>()
        .register::<StatefulSet>()
        .register::<DaemonSet>()
        .register::<Job>()
        .register::<CronJob>()
        .register::<Ingress>()
        .register::<Role>()
        .register::<RoleBinding>()
        .register::<ClusterRole>()
        .register::<ClusterRoleBinding>();
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_follows_resource_type() {
        let s = default_scheme();
        assert_eq!(s.is_namespaced(&gvk_for::<Pod>()), Some(true));
        assert_eq!(s.is_namespaced(&gvk_for::<Namespace>()), Some(false));
        assert_eq!(s.is_namespaced(&gvk_for::<ClusterRole>()), Some(false));
        assert_eq!(s.is_namespaced(&gvk_for::<Template>()), Some(false));
        assert_eq!(s.is_namespaced(&gvk_for::<TemplateInstance>()), Some(true));
        assert_eq!(s.is_namespaced(&GroupVersionKind::gvk("example.com", "v1", "Widget")), None);
    }

    #[test]
    fn new_object_builds_empty_builtin() {
        let s = default_scheme();
        let obj = s.new_object(&gvk_for::<ConfigMap>()).unwrap();
        let cm = obj.as_any().downcast_ref::<ConfigMap>().unwrap();
        assert!(cm.metadata.name.is_none());
        assert_eq!(obj.gvk(), gvk_for::<ConfigMap>());
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let s = Scheme::new();
        let err = s.decode(&gvk_for::<Pod>(), b"{}").unwrap_err();
        assert_eq!(err, ConvertError::UnknownKind("v1/Pod".into()));
    }
}
