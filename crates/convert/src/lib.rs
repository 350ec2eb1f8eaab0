//! Stencil convert: turns YAML streams, JSON bytes and typed API objects into
//! `DynamicObject`s, and back into typed objects through a [`Scheme`].

#![forbid(unsafe_code)]

mod scheme;

pub use scheme::{default_scheme, Scheme, TypedObject};

use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use stencil_core::{gvk_key, gvk_of, ConvertError};
use tracing::debug;

static DOC_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n---").expect("static regex"));

fn env_limit(var: &str, default: usize) -> usize {
    std::env::var(var).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Per-document guards applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Limits {
    pub fn from_env() -> Self {
        Self {
            max_bytes: env_limit("STENCIL_MAX_YAML_BYTES", 1_000_000),
            max_nodes: env_limit("STENCIL_MAX_YAML_NODES", 100_000),
        }
    }
}

/// Whether `v` holds more than `max` values (containers included). Stops
/// counting as soon as the limit is passed.
fn exceeds_node_limit(v: &Json, max: usize) -> bool {
    let mut pending = vec![v];
    let mut seen = 0usize;
    while let Some(next) = pending.pop() {
        seen += 1;
        if seen > max {
            return true;
        }
        match next {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items),
            _ => {}
        }
    }
    false
}

/// Split a YAML stream on `\n---`. Blank fragments are dropped.
pub fn split_documents(text: &str) -> Vec<&str> {
    DOC_SEPARATOR.split(text).filter(|part| !part.trim().is_empty()).collect()
}

/// Parse one document into a JSON value. `None` for documents without content
/// (null or an empty mapping, e.g. only comments).
fn parse_value(raw: &[u8], limits: &Limits) -> Result<Option<Json>, ConvertError> {
    if raw.len() > limits.max_bytes {
        return Err(ConvertError::Parse(format!("document too large (>{} bytes)", limits.max_bytes)));
    }
    let val: serde_yaml::Value = serde_yaml::from_slice(raw).map_err(|e| ConvertError::Parse(e.to_string()))?;
    let json = serde_json::to_value(val).map_err(|e| ConvertError::Parse(e.to_string()))?;
    match &json {
        Json::Null => return Ok(None),
        Json::Object(map) if map.is_empty() => return Ok(None),
        _ => {}
    }
    if exceeds_node_limit(&json, limits.max_nodes) {
        return Err(ConvertError::Parse(format!("document too complex (>{} nodes)", limits.max_nodes)));
    }
    Ok(Some(json))
}

fn value_to_object(json: Json) -> Result<DynamicObject, ConvertError> {
    if !json.is_object() {
        return Err(ConvertError::Parse("expected a mapping at the document root".into()));
    }
    if json.get("apiVersion").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
        return Err(ConvertError::Parse("object missing apiVersion".into()));
    }
    if json.get("kind").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
        return Err(ConvertError::Parse("object missing kind".into()));
    }
    if json.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).map_or(true, str::is_empty) {
        return Err(ConvertError::Parse("object missing metadata.name".into()));
    }
    serde_json::from_value(json).map_err(|e| ConvertError::Parse(e.to_string()))
}

/// Parse a single YAML or JSON document into a generic object.
pub fn parse_fragment(raw: &[u8]) -> Result<DynamicObject, ConvertError> {
    parse_fragment_with(raw, &Limits::from_env())
}

pub fn parse_fragment_with(raw: &[u8], limits: &Limits) -> Result<DynamicObject, ConvertError> {
    match parse_value(raw, limits)? {
        Some(json) => value_to_object(json),
        None => Err(ConvertError::Parse("empty document".into())),
    }
}

/// Parse every document of a YAML stream.
///
/// Keeps going past broken documents: returns all objects that parsed plus the
/// first error seen, if any.
pub fn parse_many(text: &str) -> (Vec<DynamicObject>, Option<ConvertError>) {
    parse_many_with(text, &Limits::from_env())
}

pub fn parse_many_with(text: &str, limits: &Limits) -> (Vec<DynamicObject>, Option<ConvertError>) {
    let mut objs = Vec::new();
    let mut first_err: Option<ConvertError> = None;
    for (idx, part) in split_documents(text).into_iter().enumerate() {
        let parsed = parse_value(part.as_bytes(), limits).and_then(|v| v.map(value_to_object).transpose());
        match parsed {
            Ok(Some(obj)) => objs.push(obj),
            Ok(None) => debug!(doc = idx, "skipping empty document"),
            Err(e) => {
                debug!(doc = idx, error = %e, "document failed to parse");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    (objs, first_err)
}

/// Deterministic JSON encoding (object keys are sorted).
pub fn to_bytes<T: Serialize + ?Sized>(obj: &T) -> Result<Vec<u8>, ConvertError> {
    serde_json::to_vec(obj).map_err(|e| ConvertError::Encode(e.to_string()))
}

/// Normalize already-structured objects (typed API objects, JSON values) by
/// passing each one through bytes and [`parse_fragment`].
pub fn objects_to_generic<T: Serialize>(items: &[T]) -> Result<Vec<DynamicObject>, ConvertError> {
    let limits = Limits::from_env();
    items.iter().map(|item| parse_fragment_with(&to_bytes(item)?, &limits)).collect()
}

/// GVK of a statically known kind.
pub fn gvk_for<K: kube::Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// Generic form of a typed object, with TypeMeta stamped from `K`.
pub fn from_typed<K>(obj: &K) -> Result<DynamicObject, ConvertError>
where
    K: kube::Resource<DynamicType = ()> + Serialize,
{
    let bytes = to_bytes(obj)?;
    let mut out: DynamicObject = serde_json::from_slice(&bytes).map_err(|e| ConvertError::Parse(e.to_string()))?;
    out.types = Some(TypeMeta { api_version: K::api_version(&()).into_owned(), kind: K::kind(&()).into_owned() });
    Ok(out)
}

/// Decode a generic object into the typed shape registered for `target`.
pub fn coerce(obj: &DynamicObject, target: &GroupVersionKind, scheme: &Scheme) -> Result<Box<dyn TypedObject>, ConvertError> {
    if !scheme.recognizes(target) {
        return Err(ConvertError::UnknownKind(gvk_key(target)));
    }
    if let Some(own) = gvk_of(obj) {
        if own != *target {
            return Err(ConvertError::Decode {
                kind: gvk_key(target),
                message: format!("object is a {}", gvk_key(&own)),
            });
        }
    }
    scheme.decode(target, &to_bytes(obj)?)
}

/// [`coerce`] into a concrete type.
pub fn coerce_to<K>(obj: &DynamicObject, scheme: &Scheme) -> Result<K, ConvertError>
where
    K: kube::Resource<DynamicType = ()> + DeserializeOwned + Send + Sync + 'static,
{
    let target = gvk_for::<K>();
    let typed = coerce(obj, &target, scheme)?;
    typed.into_any().downcast::<K>().map(|b| *b).map_err(|_| ConvertError::Decode {
        kind: gvk_key(&target),
        message: "scheme registered a different type for this kind".into(),
    })
}
