use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};

use crate::StoreError;

/// Generic object store keyed by (kind, namespace, name).
///
/// Objects travel as [`DynamicObject`]s carrying their own TypeMeta; `create`,
/// `update` and `update_status` derive the kind from it. `update` and
/// `update_status` honour `metadata.resourceVersion` when set and fail with
/// [`StoreError::Conflict`] on a stale one.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError>;

    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Replace the object. The stored `status` is kept as is.
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Replace only the `status` of the object.
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Whether objects of this kind live in a namespace.
    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, StoreError>;
}
