//! Stencil render: turns a `Template` plus a `TemplateInstance` into the
//! ordered list of objects to apply.

#![forbid(unsafe_code)]

pub mod helm;
pub mod params;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::core::DynamicObject;
use metrics::counter;
use serde_json::Value as Json;
use stencil_convert::{objects_to_generic, parse_fragment_with, parse_many_with, to_bytes, Limits};
use stencil_core::{Error, HelmConfig, ObjectStore, Template, TemplateInstance, TemplateResources};
use tracing::debug;

pub use helm::HelmEngine;
pub use params::{resolve, substitute, Escape, Values};

/// External chart templating engine (e.g. helm).
///
/// Returns the rendered objects in apply order, in any serializable shape;
/// the renderer normalizes them.
#[async_trait]
pub trait ChartEngine: Send + Sync {
    async fn template(&self, store: &dyn ObjectStore, release_name: &str, namespace: &str, config: &HelmConfig) -> anyhow::Result<Vec<Json>>;
}

/// The populated half of a template's resources.
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    Manifests(&'a [RawExtension]),
    Helm(&'a HelmConfig),
}

/// Exactly one of manifests and helm must be set.
pub fn select_source(resources: &TemplateResources) -> Result<Source<'_>, Error> {
    match (resources.manifests.is_empty(), resources.helm.as_ref()) {
        (false, None) => Ok(Source::Manifests(&resources.manifests)),
        (true, Some(helm)) => Ok(Source::Helm(helm)),
        (false, Some(_)) => Err(Error::Configuration("template sets both manifests and helm".into())),
        (true, None) => Err(Error::Configuration("template sets neither manifests nor helm".into())),
    }
}

/// Normalize a manifest list in order. String entries are YAML streams.
pub fn render_manifests(manifests: &[RawExtension], values: &Values) -> Result<Vec<DynamicObject>, Error> {
    let limits = Limits::from_env();
    let mut out = Vec::with_capacity(manifests.len());
    for (idx, raw) in manifests.iter().enumerate() {
        match &raw.0 {
            Json::String(text) => {
                let text = substitute(text, values, Escape::Raw);
                let (objs, first_err) = parse_many_with(&text, &limits);
                if let Some(e) = first_err {
                    return Err(Error::Render(format!("manifest {}: {}", idx, e)));
                }
                out.extend(objs);
            }
            other => {
                let bytes = to_bytes(other)?;
                let text = String::from_utf8_lossy(&bytes);
                let text = substitute(&text, values, Escape::JsonString);
                let obj = parse_fragment_with(text.as_bytes(), &limits).map_err(|e| Error::Render(format!("manifest {}: {}", idx, e)))?;
                out.push(obj);
            }
        }
    }
    Ok(out)
}

pub struct Renderer {
    engine: Arc<dyn ChartEngine>,
}

impl Renderer {
    pub fn new(engine: Arc<dyn ChartEngine>) -> Self {
        Self { engine }
    }

    pub async fn render(&self, store: &dyn ObjectStore, template: &Template, instance: &TemplateInstance) -> Result<Vec<DynamicObject>, Error> {
        let source = select_source(&template.spec.resources)?;
        let values = resolve(&template.spec.parameters, &instance.spec.parameters)?;
        let name = instance.metadata.name.as_deref().unwrap_or_default();
        let namespace = instance
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::Configuration(format!("instance {} has no namespace", name)))?;
        let objs = match source {
            Source::Manifests(manifests) => render_manifests(manifests, &values)?,
            Source::Helm(config) => {
                let release = if config.release_name.is_empty() { name } else { config.release_name.as_str() };
                let mut config = config.clone();
                config.values = config.values.take().map(|v| substitute(&v, &values, Escape::Raw).into_owned());
                let rendered = self
                    .engine
                    .template(store, release, namespace, &config)
                    .await
                    .map_err(|e| Error::Render(format!("{:#}", e)))?;
                objects_to_generic(&rendered)?
            }
        };
        counter!("render_objects", objs.len() as u64);
        debug!(template = %template.metadata.name.as_deref().unwrap_or_default(), objects = objs.len(), "render: done");
        Ok(objs)
    }
}
