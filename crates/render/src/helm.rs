//! Chart engine backed by the `helm template` command.

use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value as Json;
use stencil_core::{HelmConfig, ObjectStore};
use tracing::debug;

use crate::ChartEngine;

pub struct HelmEngine {
    bin: String,
}

impl HelmEngine {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Binary from `STENCIL_HELM_BIN`, `helm` otherwise.
    pub fn from_env() -> Self {
        Self::new(std::env::var("STENCIL_HELM_BIN").unwrap_or_else(|_| "helm".to_string()))
    }
}

fn helm_args(release_name: &str, namespace: &str, config: &HelmConfig, values_file: Option<&Path>) -> Result<Vec<String>> {
    let mut args = vec!["template".to_string(), release_name.to_string()];
    match (&config.chart.repository, &config.chart.path) {
        (Some(repo), _) => {
            args.push(repo.name.clone());
            if let Some(url) = &repo.repo_url {
                args.push("--repo".into());
                args.push(url.clone());
            }
            if let Some(version) = &repo.version {
                args.push("--version".into());
                args.push(version.clone());
            }
            if repo.insecure_skip_tls_verify {
                args.push("--insecure-skip-tls-verify".into());
            }
        }
        (None, Some(path)) => args.push(path.clone()),
        (None, None) => bail!("helm chart needs a repository or a path"),
    }
    args.push("--namespace".into());
    args.push(namespace.to_string());
    if let Some(p) = values_file {
        args.push("--values".into());
        args.push(p.display().to_string());
    }
    Ok(args)
}

#[async_trait]
impl ChartEngine for HelmEngine {
    async fn template(&self, _store: &dyn ObjectStore, release_name: &str, namespace: &str, config: &HelmConfig) -> Result<Vec<Json>> {
        let values_file = match config.values.as_deref() {
            Some(v) if !v.trim().is_empty() => {
                let mut f = tempfile::NamedTempFile::new().context("creating values file")?;
                f.write_all(v.as_bytes()).context("writing values file")?;
                Some(f)
            }
            _ => None,
        };
        let args = helm_args(release_name, namespace, config, values_file.as_ref().map(|f| f.path()))?;
        debug!(bin = %self.bin, ?args, "helm: template");
        let out = tokio::process::Command::new(&self.bin)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("running {}", self.bin))?;
        if !out.status.success() {
            bail!("helm template failed ({}): {}", out.status, String::from_utf8_lossy(&out.stderr).trim());
        }
        let stdout = String::from_utf8(out.stdout).context("helm output is not UTF-8")?;
        let (objs, first_err) = stencil_convert::parse_many(&stdout);
        if let Some(e) = first_err {
            return Err(anyhow!(e).context("parsing helm output"));
        }
        objs.iter().map(|o| serde_json::to_value(o).context("encoding helm object")).collect()
    }
}
