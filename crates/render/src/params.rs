//! Template parameters: resolution against instance values and `${NAME}`
//! substitution.

use std::borrow::Cow;
use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use stencil_core::{Error, Parameter, TemplateParameter};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_-]*)\}").expect("static regex"));

/// Resolved parameter values by name.
pub type Values = BTreeMap<String, String>;

/// How a value is written into the surrounding text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escape {
    /// As is (YAML text, values files).
    Raw,
    /// Escaped for the inside of a JSON string literal.
    JsonString,
}

/// Resolve declared parameters: instance value, then template default.
pub fn resolve(declared: &[TemplateParameter], provided: &[Parameter]) -> Result<Values, Error> {
    if let Some(p) = provided.iter().find(|p| !declared.iter().any(|d| d.name == p.name)) {
        return Err(Error::Configuration(format!("parameter {} is not declared by the template", p.name)));
    }
    let mut out = Values::new();
    for d in declared {
        // last occurrence wins when an instance repeats a name
        let value = provided
            .iter()
            .rev()
            .find(|p| p.name == d.name)
            .map(|p| p.value.clone())
            .or_else(|| d.value.clone())
            .unwrap_or_default();
        if d.required && value.is_empty() {
            return Err(Error::Configuration(format!("required parameter {} has no value", d.name)));
        }
        if let Some(pattern) = d.validation.as_deref() {
            let re = Regex::new(&format!("^(?:{})$", pattern))
                .map_err(|e| Error::Configuration(format!("parameter {}: invalid validation pattern: {}", d.name, e)))?;
            if !re.is_match(&value) {
                return Err(Error::Configuration(format!("parameter {}: value {:?} does not match {}", d.name, value, pattern)));
            }
        }
        out.insert(d.name.clone(), value);
    }
    Ok(out)
}

fn escape(value: &str, mode: Escape) -> String {
    match mode {
        Escape::Raw => value.to_string(),
        Escape::JsonString => {
            let quoted = serde_json::Value::String(value.to_string()).to_string();
            quoted[1..quoted.len() - 1].to_string()
        }
    }
}

/// Replace `${NAME}` with resolved values. Unknown names are left untouched.
pub fn substitute<'a>(text: &'a str, values: &Values, mode: Escape) -> Cow<'a, str> {
    if values.is_empty() {
        return Cow::Borrowed(text);
    }
    PLACEHOLDER.replace_all(text, |caps: &Captures| match values.get(&caps[1]) {
        Some(v) => escape(v, mode),
        None => caps[0].to_string(),
    })
}
