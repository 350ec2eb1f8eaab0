//! Stencil apply: upsert rendered objects into an `ObjectStore`, defaulting
//! namespaced objects into the instance namespace.

#![forbid(unsafe_code)]

use std::time::Instant;

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use stencil_core::{describe, gvk_of, AppliedObjectRef, Error, ObjectStore, StoreError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Size of the change between a desired and a live object, counted in leaf
/// fields and array slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn between(desired: &Json, live: &Json) -> Self {
        let mut summary = Self::default();
        summary.tally(desired, live);
        summary
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn tally(&mut self, desired: &Json, live: &Json) {
        match (desired, live) {
            (Json::Object(want), Json::Object(have)) => {
                for (key, w) in want {
                    match have.get(key) {
                        Some(h) => self.tally(w, h),
                        None => self.adds += 1,
                    }
                }
                self.removes += have.keys().filter(|k| !want.contains_key(*k)).count();
            }
            (Json::Array(want), Json::Array(have)) => {
                self.updates += want.iter().zip(have).filter(|(w, h)| w != h).count();
                self.adds += want.len().saturating_sub(have.len());
                self.removes += have.len().saturating_sub(want.len());
            }
            (w, h) if w != h => self.updates += 1,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub reference: AppliedObjectRef,
    pub outcome: ApplyOutcome,
    /// Desired vs live before the write; empty for creates.
    pub summary: DiffSummary,
}

/// Carry server-managed metadata from the live object onto the desired one.
fn preserve_server_fields(desired: &mut DynamicObject, live: &DynamicObject) {
    desired.metadata.resource_version = live.metadata.resource_version.clone();
    desired.metadata.uid = live.metadata.uid.clone();
    desired.metadata.creation_timestamp = live.metadata.creation_timestamp.clone();
    desired.metadata.generation = live.metadata.generation;
    desired.metadata.managed_fields = live.metadata.managed_fields.clone();
}

fn reference_of(obj: &DynamicObject) -> AppliedObjectRef {
    let (api_version, kind) = obj.types.as_ref().map(|t| (t.api_version.clone(), t.kind.clone())).unwrap_or_default();
    AppliedObjectRef {
        api_version,
        kind,
        name: obj.metadata.name.clone().unwrap_or_default(),
        namespace: obj.metadata.namespace.clone(),
    }
}

/// Metadata the server owns; never part of a comparison.
const SERVER_METADATA: [&str; 5] = ["uid", "resourceVersion", "generation", "creationTimestamp", "managedFields"];

/// JSON form of `obj` with server-owned metadata and `status` removed.
fn comparable(obj: &DynamicObject) -> Result<Json, StoreError> {
    let mut v = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
    if let Some(root) = v.as_object_mut() {
        root.remove("status");
        if let Some(meta) = root.get_mut("metadata").and_then(Json::as_object_mut) {
            for field in SERVER_METADATA {
                meta.remove(field);
            }
        }
    }
    Ok(v)
}

/// Put a namespaced object without a namespace into `namespace`; strip the
/// namespace from cluster-scoped ones.
pub fn place(obj: &mut DynamicObject, namespaced: bool, namespace: &str) {
    if !namespaced {
        obj.metadata.namespace = None;
    } else if obj.metadata.namespace.as_deref().map_or(true, str::is_empty) {
        obj.metadata.namespace = Some(namespace.to_string());
    }
}

/// Create `obj`, or update it in place when it already exists.
///
/// Namespaced kinds without a namespace land in `namespace`. Store errors are
/// returned as [`Error::Apply`] without retrying.
pub async fn apply(store: &dyn ObjectStore, namespace: &str, mut obj: DynamicObject) -> Result<ApplyResult, Error> {
    let t0 = Instant::now();
    let res = upsert(store, namespace, &mut obj).await;
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match res {
        Ok((outcome, summary)) => {
            match outcome {
                ApplyOutcome::Created => counter!("apply_created", 1u64),
                ApplyOutcome::Updated => counter!("apply_updated", 1u64),
                ApplyOutcome::Unchanged => counter!("apply_unchanged", 1u64),
            }
            debug!(object = %describe(&obj), ?outcome, adds = summary.adds, updates = summary.updates, removes = summary.removes, "apply: ok");
            Ok(ApplyResult { reference: reference_of(&obj), outcome, summary })
        }
        Err(source) => {
            counter!("apply_err", 1u64);
            Err(Error::Apply { object: describe(&obj), source })
        }
    }
}

async fn upsert(store: &dyn ObjectStore, namespace: &str, obj: &mut DynamicObject) -> Result<(ApplyOutcome, DiffSummary), StoreError> {
    let gvk = gvk_of(obj).ok_or_else(|| StoreError::Invalid("object missing apiVersion/kind".into()))?;
    let name = obj
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| StoreError::Invalid("object missing metadata.name".into()))?;
    place(obj, store.is_namespaced(&gvk).await?, namespace);

    let err = match store.create(obj).await {
        Ok(_) => return Ok((ApplyOutcome::Created, DiffSummary::default())),
        Err(e) => e,
    };
    if !err.is_already_exists() {
        return Err(err);
    }

    let live = store.get(&gvk, obj.metadata.namespace.as_deref(), &name).await?;
    let summary = DiffSummary::between(&comparable(obj)?, &comparable(&live)?);
    if summary.is_empty() {
        return Ok((ApplyOutcome::Unchanged, summary));
    }
    preserve_server_fields(obj, &live);
    store.update(obj).await?;
    Ok((ApplyOutcome::Updated, summary))
}
