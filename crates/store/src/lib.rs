//! Stencil store: in-memory `ObjectStore` with API-server-like semantics
//! (resource versions, conflict detection, status subresource). Used by tests
//! and offline rendering.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{DynamicObject, GroupVersionKind};
use rustc_hash::FxHashMap;
use stencil_convert::Scheme;
use stencil_core::{describe, gvk_key, gvk_of, ObjectStore, StoreError};
use tracing::debug;

#[derive(Default)]
struct Inner {
    objects: FxHashMap<String, DynamicObject>,
    next_rv: u64,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv = self.next_rv.saturating_add(1);
        self.next_rv.to_string()
    }
}

/// In-memory object store. Kind scope comes from the [`Scheme`]; kinds the
/// scheme does not know are rejected with [`StoreError::UnknownKind`].
pub struct MemoryStore {
    scheme: Arc<Scheme>,
    inner: Mutex<Inner>,
}

fn object_key(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> String {
    format!("{}|{}|{}", gvk_key(gvk), namespace.unwrap_or(""), name)
}

fn status_of(obj: &DynamicObject) -> Option<serde_json::Value> {
    obj.data.get("status").cloned()
}

fn set_status(obj: &mut DynamicObject, status: Option<serde_json::Value>) {
    if let Some(map) = obj.data.as_object_mut() {
        match status {
            Some(s) => { map.insert("status".into(), s); }
            None => { map.remove("status"); }
        }
    }
}

fn without_status(data: &serde_json::Value) -> serde_json::Value {
    let mut d = data.clone();
    if let Some(map) = d.as_object_mut() { map.remove("status"); }
    d
}

impl MemoryStore {
    pub fn new(scheme: Arc<Scheme>) -> Self {
        Self { scheme, inner: Mutex::new(Inner::default()) }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|g| g.objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Transport("memory store lock poisoned".into()))
    }

    fn scope(&self, gvk: &GroupVersionKind) -> Result<bool, StoreError> {
        self.scheme.is_namespaced(gvk).ok_or_else(|| StoreError::UnknownKind(gvk_key(gvk)))
    }

    /// Resolve the storage key of an incoming object, normalising its namespace
    /// to the kind's scope.
    fn locate(&self, obj: &mut DynamicObject) -> Result<(GroupVersionKind, String), StoreError> {
        let gvk = gvk_of(obj).ok_or_else(|| StoreError::Invalid("object missing apiVersion/kind".into()))?;
        let name = obj.metadata.name.clone().filter(|n| !n.is_empty()).ok_or_else(|| StoreError::Invalid(format!("{}: missing metadata.name", gvk_key(&gvk))))?;
        if self.scope(&gvk)? {
            if obj.metadata.namespace.as_deref().map_or(true, str::is_empty) {
                return Err(StoreError::Invalid(format!("{}: namespace required for namespaced kind", describe(obj))));
            }
        } else {
            obj.metadata.namespace = None;
        }
        let key = object_key(&gvk, obj.metadata.namespace.as_deref(), &name);
        Ok((gvk, key))
    }

    fn check_rv(incoming: &DynamicObject, stored: &DynamicObject) -> Result<(), StoreError> {
        if let Some(rv) = incoming.metadata.resource_version.as_deref() {
            let cur = stored.metadata.resource_version.as_deref().unwrap_or("");
            if rv != cur {
                return Err(StoreError::Conflict(format!("{}: resourceVersion {} is stale (current {})", describe(incoming), rv, cur)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        let namespace = if self.scope(gvk)? { namespace } else { None };
        let key = object_key(gvk, namespace, name);
        self.lock()?
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", gvk_key(gvk), stencil_core::ObjectKey::new(namespace, name))))
    }

    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let namespaced = self.scope(gvk)?;
        let prefix = format!("{}|", gvk_key(gvk));
        let guard = self.lock()?;
        let mut out: Vec<DynamicObject> = guard
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, o)| o)
            .filter(|o| !namespaced || namespace.map_or(true, |ns| o.metadata.namespace.as_deref() == Some(ns)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.metadata.namespace.cmp(&b.metadata.namespace).then(a.metadata.name.cmp(&b.metadata.name)));
        Ok(out)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut obj = obj.clone();
        let (_, key) = self.locate(&mut obj)?;
        let mut guard = self.lock()?;
        if guard.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(describe(&obj)));
        }
        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        obj.metadata.resource_version = Some(guard.bump_rv());
        obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        obj.metadata.generation = Some(1);
        debug!(object = %describe(&obj), "memory store: create");
        guard.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut obj = obj.clone();
        let (_, key) = self.locate(&mut obj)?;
        let mut guard = self.lock()?;
        let stored = guard.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(describe(&obj)))?;
        Self::check_rv(&obj, &stored)?;
        let changed = without_status(&obj.data) != without_status(&stored.data) || obj.metadata.labels != stored.metadata.labels || obj.metadata.annotations != stored.metadata.annotations;
        set_status(&mut obj, status_of(&stored));
        obj.metadata.uid = stored.metadata.uid.clone();
        obj.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        let generation = stored.metadata.generation.unwrap_or(1);
        obj.metadata.generation = Some(if changed { generation + 1 } else { generation });
        obj.metadata.resource_version = Some(guard.bump_rv());
        debug!(object = %describe(&obj), changed, "memory store: update");
        guard.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut target = obj.clone();
        let (_, key) = self.locate(&mut target)?;
        let mut guard = self.lock()?;
        let mut stored = guard.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(describe(obj)))?;
        Self::check_rv(obj, &stored)?;
        set_status(&mut stored, status_of(obj));
        stored.metadata.resource_version = Some(guard.bump_rv());
        debug!(object = %describe(&stored), "memory store: update status");
        guard.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, StoreError> {
        self.scope(gvk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stencil_convert::{default_scheme, parse_fragment};

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(default_scheme()))
    }

    fn cm(ns: Option<&str>, data: &str) -> DynamicObject {
        let ns_line = ns.map(|n| format!("  namespace: {n}\n")).unwrap_or_default();
        parse_fragment(format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n{ns_line}data:\n  k: {data}\n").as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn create_stamps_server_fields_and_rejects_duplicates() {
        let s = store();
        let created = s.create(&cm(Some("a"), "1")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        let err = s.create(&cm(Some("a"), "2")).await.unwrap_err();
        assert!(err.is_already_exists(), "err={}", err);
        // same name in another namespace is a different object
        s.create(&cm(Some("b"), "2")).await.unwrap();
        assert_eq!(s.len(), 2);
    }

    #[tokio::test]
    async fn namespaced_kinds_need_a_namespace() {
        let s = store();
        let err = s.create(&cm(None, "1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(ref m) if m.contains("namespace required")), "err={}", err);
    }

    #[tokio::test]
    async fn update_detects_stale_resource_versions() {
        let s = store();
        let created = s.create(&cm(Some("a"), "1")).await.unwrap();
        let mut next = cm(Some("a"), "2");
        next.metadata.resource_version = created.metadata.resource_version.clone();
        let updated = s.update(&next).await.unwrap();
        assert_eq!(updated.metadata.uid, created.metadata.uid);
        assert_eq!(updated.metadata.generation, Some(2));
        // reuse of the old version now conflicts
        let err = s.update(&next).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "err={}", err);
    }

    #[tokio::test]
    async fn status_is_a_subresource() {
        let s = store();
        let created = s.create(&cm(Some("a"), "1")).await.unwrap();
        let mut with_status = created.clone();
        with_status.data["status"] = serde_json::json!({ "phase": "Ready" });
        let st = s.update_status(&with_status).await.unwrap();
        assert_eq!(st.data["status"]["phase"], "Ready");

        // a plain update does not touch status
        let mut plain = cm(Some("a"), "9");
        plain.data["status"] = serde_json::json!({ "phase": "Ignored" });
        let up = s.update(&plain).await.unwrap();
        assert_eq!(up.data["status"]["phase"], "Ready");
        assert_eq!(up.data["data"]["k"], 9);
    }

    #[tokio::test]
    async fn cluster_scoped_objects_drop_namespace() {
        let s = store();
        let ns = parse_fragment(b"apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team\n  namespace: ignored\n").unwrap();
        let created = s.create(&ns).await.unwrap();
        assert!(created.metadata.namespace.is_none());
        let gvk = GroupVersionKind::gvk("", "v1", "Namespace");
        assert!(s.get(&gvk, Some("whatever"), "team").await.is_ok());
        assert_eq!(s.list(&gvk, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_kinds_and_missing_objects() {
        let s = store();
        let widget = GroupVersionKind::gvk("example.com", "v1", "Widget");
        assert!(matches!(s.is_namespaced(&widget).await, Err(StoreError::UnknownKind(_))));
        let pod = GroupVersionKind::gvk("", "v1", "Pod");
        assert!(s.get(&pod, Some("a"), "missing").await.unwrap_err().is_not_found());
    }
}
