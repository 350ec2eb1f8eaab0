use std::sync::Arc;

use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use stencil_apply::{apply, ApplyOutcome};
use stencil_convert::{default_scheme, parse_fragment};
use stencil_core::{Error, ObjectStore, StoreError};
use stencil_store::MemoryStore;

fn store() -> MemoryStore {
    MemoryStore::new(Arc::new(default_scheme()))
}

fn obj(yaml: &str) -> DynamicObject {
    parse_fragment(yaml.as_bytes()).unwrap()
}

fn cm(value: &str) -> DynamicObject {
    obj(&format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  k: {}\n", value))
}

#[tokio::test]
async fn namespaced_objects_default_into_instance_namespace() {
    let s = store();
    let res = apply(&s, "team", cm("a")).await.unwrap();
    assert_eq!(res.outcome, ApplyOutcome::Created);
    assert_eq!(res.reference.namespace.as_deref(), Some("team"));
    assert_eq!(res.reference.to_string(), "v1/ConfigMap team/cfg");

    let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
    assert!(s.get(&gvk, Some("team"), "cfg").await.is_ok());
}

#[tokio::test]
async fn explicit_namespace_is_kept() {
    let s = store();
    let o = obj("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n  namespace: other\n");
    let res = apply(&s, "team", o).await.unwrap();
    assert_eq!(res.reference.namespace.as_deref(), Some("other"));
}

#[tokio::test]
async fn cluster_scoped_objects_stay_unnamespaced() {
    let s = store();
    let o = obj("apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: reader\nrules: []\n");
    let res = apply(&s, "team", o).await.unwrap();
    assert_eq!(res.reference.namespace, None);
    let gvk = GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole");
    assert!(s.get(&gvk, None, "reader").await.is_ok());
}

#[tokio::test]
async fn reapply_is_unchanged_then_updates_on_drift() {
    let s = store();
    assert_eq!(apply(&s, "team", cm("a")).await.unwrap().outcome, ApplyOutcome::Created);
    let again = apply(&s, "team", cm("a")).await.unwrap();
    assert_eq!(again.outcome, ApplyOutcome::Unchanged);
    assert!(again.summary.is_empty());

    let changed = apply(&s, "team", cm("b")).await.unwrap();
    assert_eq!(changed.outcome, ApplyOutcome::Updated);
    assert_eq!(changed.summary.updates, 1);

    let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
    let live = s.get(&gvk, Some("team"), "cfg").await.unwrap();
    assert_eq!(live.data["data"]["k"], "b");
    assert_eq!(live.metadata.generation, Some(2));
    assert_eq!(s.len(), 1);
}

#[tokio::test]
async fn unknown_kinds_fail_with_the_object_label() {
    let s = store();
    let o = obj("apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n");
    match apply(&s, "team", o).await {
        Err(Error::Apply { object, source: StoreError::UnknownKind(_) }) => assert_eq!(object, "example.com/v1/Widget w"),
        other => panic!("unexpected {:?}", other.map(|r| r.outcome)),
    }
}

/// Rejects every create.
struct ReadOnly(MemoryStore);

#[async_trait]
impl ObjectStore for ReadOnly {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        self.0.get(gvk, namespace, name).await
    }
    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        self.0.list(gvk, namespace).await
    }
    async fn create(&self, _obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        Err(StoreError::Invalid("admission webhook denied the request".into()))
    }
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        self.0.update(obj).await
    }
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        self.0.update_status(obj).await
    }
    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, StoreError> {
        self.0.is_namespaced(gvk).await
    }
}

#[tokio::test]
async fn store_rejections_are_apply_errors() {
    let s = ReadOnly(store());
    let err = apply(&s, "team", cm("a")).await.unwrap_err();
    assert!(!err.is_transport());
    assert_eq!(err.to_string(), "apply v1/ConfigMap team/cfg: invalid: admission webhook denied the request");
}
