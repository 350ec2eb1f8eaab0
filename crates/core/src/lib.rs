//! Stencil core types: the Template/TemplateInstance resources, the error
//! taxonomy, GVK helpers and the `ObjectStore` seam every other crate talks to.

#![forbid(unsafe_code)]

pub mod error;
pub mod resources;
pub mod store;

pub use error::{ConvertError, Error, StoreError};
pub use resources::{
    AppliedObjectRef, DeploymentStatus, HelmChart, HelmChartRepository, HelmConfig, Parameter,
    Template, TemplateInstance, TemplateInstanceSpec, TemplateInstanceStatus, TemplateParameter,
    TemplateResources, TemplateSpec, API_GROUP, API_VERSION,
};
pub use store::ObjectStore;

use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

pub mod prelude {
    pub use super::{
        gvk_key, gvk_of, AppliedObjectRef, DeploymentStatus, Error, ObjectKey, ObjectStore,
        StoreError, Template, TemplateInstance,
    };
}

/// Identity of a namespaced or cluster-scoped object (`ns/name` or `name`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Split an `apiVersion` into `(group, version)`; the core group is empty.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Stable string key for a GVK: `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Parse a key produced by [`gvk_key`].
pub fn parse_gvk_key(key: &str) -> Option<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Some(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Some(GroupVersionKind::gvk(group, version, kind)),
        _ => None,
    }
}

/// GVK carried by a generic object's TypeMeta, if it has one.
pub fn gvk_of(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    if types.api_version.is_empty() || types.kind.is_empty() {
        return None;
    }
    let (group, version) = parse_api_version(&types.api_version);
    Some(GroupVersionKind { group, version, kind: types.kind.clone() })
}

/// Human label used in logs and error messages, e.g. `v1/Pod test/web`.
pub fn describe(obj: &DynamicObject) -> String {
    let kind = gvk_of(obj).map(|g| gvk_key(&g)).unwrap_or_else(|| "<untyped>".to_string());
    let key = ObjectKey::new(obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref().unwrap_or(""));
    format!("{} {}", kind, key)
}
