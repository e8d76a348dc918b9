//! Prompt template interpolation
//!
//! Templates use Handlebars syntax: path lookups (`{{steps.a.output.title}}`),
//! `{{#if}}` and `{{#each}}`. HTML escaping is disabled and missing keys
//! render as an empty string. `{{json value}}` renders a value as JSON.

use handlebars::{handlebars_helper, Handlebars};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template error: {0}")]
    Render(String),
}

handlebars_helper!(json: |value: Json| serde_json::to_string(value).unwrap_or_default());

static ENGINE: LazyLock<Handlebars<'static>> = LazyLock::new(|| {
    let mut engine = Handlebars::new();
    engine.register_escape_fn(handlebars::no_escape);
    engine.set_strict_mode(false);
    engine.register_helper("json", Box::new(json));
    engine
});

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{[^}]*?\benv\.([A-Za-z_][A-Za-z0-9_]*)").expect("valid env reference regex")
});

static STEP_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{[^}]*?\bsteps\.([A-Za-z0-9_-]+)").expect("valid step reference regex")
});

/// Render a template against a context value
pub fn interpolate(template: &str, context: &Value) -> Result<String, TemplateError> {
    ENGINE
        .render_template(template, context)
        .map_err(|e| TemplateError::Render(e.to_string()))
}

/// Secret names referenced as `{{env.NAME}}`
pub fn referenced_env_names(template: &str) -> BTreeSet<String> {
    ENV_REFERENCE
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Step ids referenced as `{{steps.<id>...}}`
pub fn referenced_steps(template: &str) -> BTreeSet<String> {
    STEP_REFERENCE
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_lookup() {
        let ctx = json!({"input": {"topic": "rust"}, "steps": {"a": {"output": {"title": "Hi"}}}});
        let out = interpolate("{{input.topic}} / {{steps.a.output.title}}", &ctx).unwrap();
        assert_eq!(out, "rust / Hi");
    }

    #[test]
    fn test_missing_keys_render_empty() {
        let out = interpolate("[{{input.nope}}][{{steps.x.output}}]", &json!({})).unwrap();
        assert_eq!(out, "[][]");
    }

    #[test]
    fn test_no_html_escaping() {
        let ctx = json!({"input": {"html": "<b>\"a\" & b</b>"}});
        let out = interpolate("{{input.html}}", &ctx).unwrap();
        assert_eq!(out, "<b>\"a\" & b</b>");
    }

    #[test]
    fn test_conditionals_and_iteration() {
        let ctx = json!({"vars": {"loud": true, "items": ["a", "b"]}});
        let out = interpolate(
            "{{#if vars.loud}}LOUD{{else}}quiet{{/if}}:{{#each vars.items}}{{this}},{{/each}}",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, "LOUD:a,b,");
    }

    #[test]
    fn test_json_helper() {
        let ctx = json!({"steps": {"a": {"output": {"k": [1, 2]}}}});
        let out = interpolate("{{json steps.a.output}}", &ctx).unwrap();
        assert_eq!(out, r#"{"k":[1,2]}"#);
    }

    #[test]
    fn test_malformed_template_is_an_error() {
        assert!(interpolate("{{#if x}}unclosed", &json!({})).is_err());
    }

    #[test]
    fn test_reference_scanning() {
        let template = "Use {{env.OPENAI_API_KEY}} and {{ env.OTHER }} with {{steps.draft.output}} and {{#each steps.list-1.output}}{{/each}}";
        let envs: Vec<_> = referenced_env_names(template).into_iter().collect();
        assert_eq!(envs, vec!["OPENAI_API_KEY", "OTHER"]);
        let steps: Vec<_> = referenced_steps(template).into_iter().collect();
        assert_eq!(steps, vec!["draft", "list-1"]);
        assert!(referenced_steps("plain steps.text outside braces").is_empty());
    }
}
