//! `Template` and `TemplateInstance` custom resources.

use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, ObjectValidation, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::parse_api_version;

pub const API_GROUP: &str = "config.stencil.dev";
pub const API_VERSION: &str = "config.stencil.dev/v1alpha1";

/// A reusable set of resources: literal manifests or a helm chart.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(group = "config.stencil.dev", version = "v1alpha1", kind = "Template", schema = "manual")]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    #[serde(default)]
    pub resources: TemplateResources,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TemplateParameter>,
}

/// Exactly one of `manifests` and `helm` must be populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateResources {
    /// Objects applied in list order. A string entry holds a YAML stream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<RawExtension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmConfig {
    /// Defaults to the instance name when empty.
    #[serde(default)]
    pub release_name: String,
    #[serde(default)]
    pub chart: HelmChart,
    /// Values file content (YAML); `${NAME}` placeholders are substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<HelmChartRepository>,
    /// Local chart directory or archive; used when no repository is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartRepository {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub required: bool,
    /// Regex the final value has to match in full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
}

/// A request to materialize a template into the instance's namespace.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "config.stencil.dev",
    version = "v1alpha1",
    kind = "TemplateInstance",
    namespaced,
    status = "TemplateInstanceStatus",
    shortname = "tmpli",
    schema = "manual"
)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInstanceSpec {
    /// Name of the (cluster-scoped) template.
    pub template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeploymentStatus {
    #[default]
    Pending,
    Deployed,
    Failed,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeploymentStatus::Pending => "Pending",
            DeploymentStatus::Deployed => "Deployed",
            DeploymentStatus::Failed => "Failed",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInstanceStatus {
    #[serde(default)]
    pub status: DeploymentStatus,
    /// Present iff `status` is Failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub objects: Vec<AppliedObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Identity of one object applied for an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedObjectRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl AppliedObjectRef {
    pub fn group(&self) -> String {
        parse_api_version(&self.api_version).0
    }

    pub fn version(&self) -> String {
        parse_api_version(&self.api_version).1
    }
}

impl std::fmt::Display for AppliedObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// Object whose fields the API server keeps as written.
fn preserved_object() -> Schema {
    let mut obj = SchemaObject { instance_type: Some(InstanceType::Object.into()), ..Default::default() };
    obj.extensions.insert("x-kubernetes-preserve-unknown-fields".to_string(), serde_json::Value::Bool(true));
    Schema::Object(obj)
}

/// CRD root schema. `spec` and `status` stay open; the renderer and the
/// reconciler validate their contents.
fn root_schema(with_status: bool) -> Schema {
    let mut object = ObjectValidation::default();
    object.properties.insert("spec".to_string(), preserved_object());
    object.required.insert("spec".to_string());
    if with_status {
        object.properties.insert("status".to_string(), preserved_object());
    }
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        object: Some(Box::new(object)),
        ..Default::default()
    })
}

impl JsonSchema for Template {
    fn schema_name() -> String {
        "Template".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        root_schema(false)
    }
}

impl JsonSchema for TemplateInstance {
    fn schema_name() -> String {
        "TemplateInstance".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        root_schema(true)
    }
}
