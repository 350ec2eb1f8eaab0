//! Dispatch loop: a `kube::runtime::Controller` over every TemplateInstance.
//!
//! The runtime guarantees at most one in-flight reconcile per object while
//! different instances reconcile concurrently.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    runtime::{controller::Action, watcher, Controller},
    Api, Client,
};
use stencil_core::{Error, ObjectKey, TemplateInstance};
use tracing::{debug, error, info, warn};

use crate::Reconciler;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Delay before retrying a pass that hit a transport failure.
    pub requeue_after: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self { requeue_after: Duration::from_secs(30) }
    }
}

struct Context {
    reconciler: Arc<Reconciler>,
    settings: Settings,
}

fn key_of(ti: &TemplateInstance) -> ObjectKey {
    ObjectKey::new(ti.metadata.namespace.as_deref(), ti.metadata.name.as_deref().unwrap_or_default())
}

async fn reconcile(ti: Arc<TemplateInstance>, ctx: Arc<Context>) -> Result<Action, Error> {
    ctx.reconciler.reconcile(&key_of(&ti)).await?;
    Ok(Action::await_change())
}

fn error_policy(ti: Arc<TemplateInstance>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(instance = %key_of(&ti), error = %err, requeue_secs = ctx.settings.requeue_after.as_secs(), "reconcile: transport failure");
    Action::requeue(ctx.settings.requeue_after)
}

/// Run until SIGINT/SIGTERM.
pub async fn run(client: Client, reconciler: Arc<Reconciler>, settings: Settings) {
    let api = Api::<TemplateInstance>::all(client);
    info!(requeue_secs = settings.requeue_after.as_secs(), "controller starting");
    let ctx = Arc::new(Context { reconciler, settings });
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(instance = %obj.name, ns = ?obj.namespace, "reconciled"),
                Err(e) => warn!(error = %e, "dispatch error"),
            }
        })
        .await;
    info!("controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use stencil_core::TemplateInstanceSpec;

    #[test]
    fn keys_follow_instance_identity() {
        let mut ti = TemplateInstance::new("web", TemplateInstanceSpec { template: "t".into(), parameters: vec![] });
        ti.metadata.namespace = Some("team".into());
        assert_eq!(key_of(&ti), ObjectKey::namespaced("team", "web"));
    }

    #[test]
    fn default_requeue_is_thirty_seconds() {
        assert_eq!(Settings::default().requeue_after, Duration::from_secs(30));
    }
}
