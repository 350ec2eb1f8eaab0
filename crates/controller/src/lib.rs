//! Stencil controller: one reconcile pass per `TemplateInstance`, plus the
//! kube-runtime dispatch loop that drives it.

#![forbid(unsafe_code)]

pub mod dispatch;

use std::sync::Arc;
use std::time::Instant;

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use stencil_apply::apply;
use stencil_convert::{coerce_to, gvk_for, Scheme};
use stencil_core::{
    AppliedObjectRef, DeploymentStatus, Error, ObjectKey, ObjectStore, StoreError, Template, TemplateInstance,
    TemplateInstanceStatus,
};
use stencil_render::Renderer;
use tracing::{debug, info, warn};

pub use dispatch::{run, Settings};

/// What a reconcile pass did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The instance no longer exists.
    Gone,
    /// The status computed by this pass; `written` is false when it matched
    /// the stored one.
    Recorded { status: TemplateInstanceStatus, written: bool },
}

/// Objects to record and the business failure, if any.
struct Pass {
    objects: Vec<AppliedObjectRef>,
    failure: Option<Error>,
}

impl Pass {
    fn failed(objects: Vec<AppliedObjectRef>, failure: Error) -> Self {
        Self { objects, failure: Some(failure) }
    }
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    renderer: Renderer,
    scheme: Arc<Scheme>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, renderer: Renderer, scheme: Arc<Scheme>) -> Self {
        Self { store, renderer, scheme }
    }

    /// Bring one instance in line with its template and record the result on
    /// its status. Only transport failures are returned as errors.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, Error> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.reconcile_once(key).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(Outcome::Recorded { status, .. }) => match status.status {
                DeploymentStatus::Deployed => counter!("reconcile_deployed", 1u64),
                DeploymentStatus::Failed => counter!("reconcile_failed", 1u64),
                DeploymentStatus::Pending => {}
            },
            Ok(Outcome::Gone) => {}
            Err(_) => counter!("reconcile_transport_err", 1u64),
        }
        res
    }

    async fn reconcile_once(&self, key: &ObjectKey) -> Result<Outcome, Error> {
        let raw = match self.store.get(&gvk_for::<TemplateInstance>(), key.namespace.as_deref(), &key.name).await {
            Ok(o) => o,
            Err(e) if e.is_not_found() => {
                debug!(instance = %key, "reconcile: instance gone");
                return Ok(Outcome::Gone);
            }
            Err(e) => return Err(Error::Transport(e)),
        };
        let previous = stored_status(&raw);

        let pass = match coerce_to::<TemplateInstance>(&raw, &self.scheme) {
            Ok(instance) => self.instantiate(&instance, &previous).await?,
            Err(e) => Pass::failed(previous.objects.clone(), Error::Configuration(format!("decoding instance: {}", e))),
        };

        let status = match pass.failure {
            None => {
                info!(instance = %key, objects = pass.objects.len(), "reconcile: deployed");
                TemplateInstanceStatus {
                    status: DeploymentStatus::Deployed,
                    reason: None,
                    objects: pass.objects,
                    observed_generation: raw.metadata.generation,
                }
            }
            Some(failure) => {
                warn!(instance = %key, error = %failure, "reconcile: failed");
                TemplateInstanceStatus {
                    status: DeploymentStatus::Failed,
                    reason: Some(failure.reason()),
                    objects: pass.objects,
                    observed_generation: raw.metadata.generation,
                }
            }
        };

        if status == previous {
            debug!(instance = %key, "reconcile: status unchanged");
            return Ok(Outcome::Recorded { status, written: false });
        }
        match self.write_status(raw, &status).await {
            Ok(()) => Ok(Outcome::Recorded { status, written: true }),
            Err(e) if e.is_not_found() => {
                debug!(instance = %key, "reconcile: instance deleted mid-pass");
                Ok(Outcome::Gone)
            }
            Err(e) => Err(Error::Transport(e)),
        }
    }

    /// Load the template, render and apply. `Err` is reserved for transport
    /// failures; everything else ends up in the returned pass.
    async fn instantiate(&self, instance: &TemplateInstance, previous: &TemplateInstanceStatus) -> Result<Pass, Error> {
        let namespace = instance.metadata.namespace.clone().unwrap_or_default();
        let template_name = instance.spec.template.as_str();
        if template_name.is_empty() {
            return Ok(Pass::failed(previous.objects.clone(), Error::Configuration("instance names no template".into())));
        }
        let raw_template = match self.store.get(&gvk_for::<Template>(), None, template_name).await {
            Ok(t) => t,
            Err(e) if e.is_not_found() => {
                return Ok(Pass::failed(previous.objects.clone(), Error::TemplateNotFound(template_name.to_string())))
            }
            Err(e) => return Err(Error::Transport(e)),
        };
        let template = match coerce_to::<Template>(&raw_template, &self.scheme) {
            Ok(t) => t,
            Err(e) => {
                let err = Error::Configuration(format!("decoding template {}: {}", template_name, e));
                return Ok(Pass::failed(previous.objects.clone(), err));
            }
        };

        let objects = match self.renderer.render(self.store.as_ref(), &template, instance).await {
            Ok(objs) => objs,
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => return Ok(Pass::failed(previous.objects.clone(), e)),
        };

        let mut applied = Vec::with_capacity(objects.len());
        for obj in objects {
            match apply(self.store.as_ref(), &namespace, obj).await {
                Ok(res) => applied.push(res.reference),
                Err(e) => {
                    // a pass that applied nothing leaves the recorded objects alone
                    let objects = if applied.is_empty() { previous.objects.clone() } else { applied };
                    return Ok(Pass::failed(objects, e));
                }
            }
        }
        Ok(Pass { objects: applied, failure: None })
    }

    async fn write_status(&self, mut raw: DynamicObject, status: &TemplateInstanceStatus) -> Result<(), StoreError> {
        let value = serde_json::to_value(status).map_err(|e| StoreError::Invalid(e.to_string()))?;
        match raw.data.as_object_mut() {
            Some(map) => {
                map.insert("status".to_string(), value);
            }
            None => raw.data = serde_json::json!({ "status": value }),
        }
        self.store.update_status(&raw).await.map(|_| ())
    }
}

/// Status as currently stored. Unreadable status reads as the default.
fn stored_status(raw: &DynamicObject) -> TemplateInstanceStatus {
    raw.data
        .get("status")
        .and_then(|s| serde_json::from_value(s.clone()).ok())
        .unwrap_or_default()
}
