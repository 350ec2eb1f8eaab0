use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::core::DynamicObject;
use kube::CustomResourceExt;
use stencil_controller::{Reconciler, Settings};
use stencil_convert::{coerce_to, default_scheme, parse_fragment, Scheme};
use stencil_core::{gvk_of, Template, TemplateInstance, TemplateInstanceSpec};
use stencil_render::{HelmEngine, Renderer};
use stencil_store::MemoryStore;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stencilctl", version, about = "Stencil template instantiation controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run {
        /// helm binary used for chart templates
        #[arg(long = "helm-bin", env = "STENCIL_HELM_BIN", default_value = "helm")]
        helm_bin: String,
        /// Requeue delay after a transport failure
        #[arg(long = "requeue-secs", env = "STENCIL_REQUEUE_SECS", default_value_t = 30)]
        requeue_secs: u64,
    },
    /// Render a template offline and print the resulting objects
    Render {
        /// Template manifest (YAML or JSON)
        #[arg(long = "template")]
        template: PathBuf,
        /// TemplateInstance manifest; defaults to an instance without parameters
        #[arg(long = "instance")]
        instance: Option<PathBuf>,
        /// Target namespace (overrides the instance's)
        #[arg(long = "namespace")]
        namespace: Option<String>,
        #[arg(long = "helm-bin", env = "STENCIL_HELM_BIN", default_value = "helm")]
        helm_bin: String,
    },
    /// Print the CustomResourceDefinitions
    Crds,
}

fn init_tracing() {
    let env = std::env::var("STENCIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STENCIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STENCIL_METRICS_ADDR; expected host:port");
        }
    }
}

fn load<K>(path: &Path, scheme: &Scheme) -> Result<K>
where
    K: kube::Resource<DynamicType = ()> + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let obj = parse_fragment(&raw).with_context(|| format!("parsing {}", path.display()))?;
    coerce_to::<K>(&obj, scheme).with_context(|| format!("decoding {}", path.display()))
}

async fn render(template: &Path, instance: Option<&Path>, namespace: Option<String>, helm_bin: String) -> Result<Vec<DynamicObject>> {
    let scheme = Arc::new(default_scheme());
    let template: Template = load(template, &scheme)?;
    let template_name = template.metadata.name.clone().ok_or_else(|| anyhow!("template has no metadata.name"))?;
    let mut instance = match instance {
        Some(path) => load::<TemplateInstance>(path, &scheme)?,
        None => TemplateInstance::new(&template_name, TemplateInstanceSpec { template: template_name.clone(), parameters: vec![] }),
    };
    if let Some(ns) = namespace {
        instance.metadata.namespace = Some(ns);
    }
    let namespace = instance.metadata.namespace.get_or_insert_with(|| "default".to_string()).clone();

    render_objects(scheme, &template, &instance, &namespace, HelmEngine::new(helm_bin)).await
}

/// Render without touching a cluster. Namespaced kinds land in `namespace`;
/// kinds the scheme does not know are taken as namespaced.
async fn render_objects(
    scheme: Arc<Scheme>,
    template: &Template,
    instance: &TemplateInstance,
    namespace: &str,
    engine: HelmEngine,
) -> Result<Vec<DynamicObject>> {
    // the helm engine reads release state through the store; offline it is empty
    let store = MemoryStore::new(scheme.clone());
    let renderer = Renderer::new(Arc::new(engine));
    let mut objects = renderer.render(&store, template, instance).await?;
    for obj in &mut objects {
        let namespaced = gvk_of(obj).and_then(|gvk| scheme.is_namespaced(&gvk)).unwrap_or(true);
        stencil_apply::place(obj, namespaced, namespace);
    }
    Ok(objects)
}

fn print_yaml_stream<T: serde::Serialize>(items: &[T]) -> Result<()> {
    let docs = items.iter().map(serde_yaml::to_string).collect::<Result<Vec<_>, _>>()?;
    print!("{}", docs.join("---\n"));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { helm_bin, requeue_secs } => {
            let store = stencil_kubehub::KubeStore::try_default().await?;
            let client = store.client();
            let n = store.refresh().await?;
            info!(resources = n, helm = %helm_bin, "discovery complete");
            let reconciler = Reconciler::new(Arc::new(store), Renderer::new(Arc::new(HelmEngine::new(helm_bin))), Arc::new(default_scheme()));
            stencil_controller::run(client, Arc::new(reconciler), Settings { requeue_after: Duration::from_secs(requeue_secs) }).await;
        }
        Commands::Render { template, instance, namespace, helm_bin } => {
            let objects: Vec<DynamicObject> = render(&template, instance.as_deref(), namespace, helm_bin).await?;
            info!(objects = objects.len(), "render complete");
            match cli.output {
                Output::Human => print_yaml_stream(&objects)?,
                Output::Json => println!("{}", serde_json::to_string_pretty(&objects)?),
            }
        }
        Commands::Crds => {
            let crds = vec![Template::crd(), TemplateInstance::crd()];
            match cli.output {
                Output::Human => print_yaml_stream(&crds)?,
                Output::Json => println!("{}", serde_json::to_string_pretty(&crds)?),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(manifests: serde_json::Value) -> Template {
        serde_json::from_value(json!({
            "apiVersion": "config.stencil.dev/v1alpha1",
            "kind": "Template",
            "metadata": { "name": "web" },
            "spec": { "resources": { "manifests": manifests } }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn render_defaults_namespaces_for_kinds_outside_the_scheme() {
        let template = template(json!([
            { "apiVersion": "policy/v1", "kind": "PodDisruptionBudget", "metadata": { "name": "pdb" }, "spec": { "maxUnavailable": 1 } },
            { "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": { "name": "reader", "namespace": "stray" } },
            { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "cfg", "namespace": "other" }, "data": { "k": "v" } }
        ]));
        let instance = TemplateInstance::new("web", TemplateInstanceSpec { template: "web".into(), parameters: vec![] });

        let objects = render_objects(Arc::new(default_scheme()), &template, &instance, "team", HelmEngine::new("helm")).await.unwrap();
        let placed: Vec<_> = objects.iter().map(|o| (o.metadata.name.as_deref().unwrap(), o.metadata.namespace.as_deref())).collect();
        assert_eq!(placed, vec![("pdb", Some("team")), ("reader", None), ("cfg", Some("other"))]);
        assert!(objects.iter().all(|o| o.metadata.uid.is_none() && o.metadata.resource_version.is_none()));
    }
}
