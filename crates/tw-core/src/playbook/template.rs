//! `{{ path }}` placeholder substitution for step parameters.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::context::ExecutionContext;

fn placeholder_regex() -> &'static Regex {
    static INSTANCE: OnceLock<Regex> = OnceLock::new();
    INSTANCE.get_or_init(|| Regex::new(r"\{\{(.*?)\}\}").expect("valid placeholder regex"))
}

fn path_regex() -> &'static Regex {
    static INSTANCE: OnceLock<Regex> = OnceLock::new();
    INSTANCE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_-]+(?:\.[A-Za-z0-9_-]+)*$").expect("valid path regex")
    })
}

/// Resolves placeholders against an [`ExecutionContext`].
///
/// Resolution never fails: unknown paths and malformed placeholders become
/// the empty string.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResolver;

impl TemplateResolver {
    pub fn new() -> Self {
        Self
    }

    /// Substitutes every placeholder in `template`.
    pub fn resolve_str(&self, template: &str, context: &ExecutionContext) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }

        let resolved = placeholder_regex()
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let path = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
                if !path_regex().is_match(path) {
                    return String::new();
                }
                context
                    .get(path)
                    .map(|value| defuse(&render_value(value)))
                    .unwrap_or_default()
            })
            .into_owned();
        seal(resolved)
    }

    /// Resolves every string inside `value`, recursing into objects and
    /// arrays. Other values are returned unchanged.
    pub fn resolve_value(&self, value: &Value, context: &ExecutionContext) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_str(s, context)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, context))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, context)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolves a parameter map.
    pub fn resolve_params(
        &self,
        params: &serde_json::Map<String, Value>,
        context: &ExecutionContext,
    ) -> serde_json::Map<String, Value> {
        params
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v, context)))
            .collect()
    }
}

/// String form of a context value.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Breaks up brace pairs so substituted data cannot form a new placeholder.
fn defuse(rendered: &str) -> String {
    if !rendered.contains("{{") && !rendered.contains("}}") {
        return rendered.to_string();
    }
    let mut out = rendered.to_string();
    while out.contains("{{") {
        out = out.replace("{{", "{ {");
    }
    while out.contains("}}") {
        out = out.replace("}}", "} }");
    }
    out
}

/// Splits any placeholder that formed across a splice point, such as a
/// value ending in `{` followed by literal `{ path }}`. The template's own
/// placeholders are all gone by now, so every match is an artifact.
fn seal(mut out: String) -> String {
    while let Some(found) = placeholder_regex().find(&out) {
        out.insert(found.start() + 1, ' ');
    }
    out
}
