//! Secret redaction for anything that is logged or persisted

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Replacement text for redacted content
pub const REDACTED: &str = "[REDACTED]";

/// Literal values shorter than this are left alone to avoid collateral
/// redaction of short incidental substrings
pub const MIN_REDACT_LEN: usize = 4;

static ENV_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*env\.[A-Za-z_][A-Za-z0-9_]*\s*\}\}").expect("env marker regex is valid")
});

/// Redact `{{env.NAME}}` markers and every known secret value of at least
/// [`MIN_REDACT_LEN`] characters from `text`.
pub fn redact_secrets<S: AsRef<str>>(text: &str, known_values: &[S]) -> String {
    let mut values: Vec<&str> = known_values
        .iter()
        .map(|v| v.as_ref())
        .filter(|v| v.chars().count() >= MIN_REDACT_LEN)
        .collect();
    // Longest first so a value that contains another is replaced whole
    values.sort_by_key(|v| std::cmp::Reverse(v.len()));
    values.dedup();

    let mut redacted = ENV_MARKER.replace_all(text, REDACTED).into_owned();
    for value in values {
        if redacted.contains(value) {
            redacted = replace_outside_markers(&redacted, value);
        }
    }
    redacted
}

/// Replace `value` only in the text between existing [`REDACTED`] markers,
/// so a value that is itself part of the marker never rewrites it.
fn replace_outside_markers(text: &str, value: &str) -> String {
    text.split(REDACTED)
        .map(|segment| segment.replace(value, REDACTED))
        .collect::<Vec<_>>()
        .join(REDACTED)
}

/// The set of plaintext values a run must never leak
#[derive(Debug, Clone, Default)]
pub struct RedactionSet {
    values: Vec<String>,
}

impl RedactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a decrypted value to the set
    pub fn insert(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !self.values.contains(&value) {
            self.values.push(value);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Redact a string against this set
    pub fn redact(&self, text: &str) -> String {
        redact_secrets(text, &self.values)
    }

    /// Redact every string inside a JSON value
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_markers_and_values() {
        let text = "key={{env.OPENAI_API_KEY}} raw=sk-live-abcdef and {{ env.OTHER }}";
        let out = redact_secrets(text, &["sk-live-abcdef"]);
        assert_eq!(out, "key=[REDACTED] raw=[REDACTED] and [REDACTED]");
    }

    #[test]
    fn test_short_values_are_not_redacted() {
        let out = redact_secrets("the abc value and a123", &["abc", "a1"]);
        assert_eq!(out, "the abc value and a123");
    }

    #[test]
    fn test_unrelated_text_untouched() {
        let text = "nothing to see {{input.topic}} {{vars.x}}";
        assert_eq!(redact_secrets(text, &["secret-value"]), text);
    }

    #[test]
    fn test_idempotent() {
        let values = ["hunter22", "sk-123456"];
        let once = redact_secrets("p=hunter22 k=sk-123456 {{env.K}}", &values);
        let twice = redact_secrets(&once, &values);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_values_inside_the_marker_are_still_redacted() {
        let values = ["REDACTED", "DACT"];
        let once = redact_secrets("user key is REDACTED here, DACT too {{env.K}}", &values);
        assert_eq!(once, "user key is [REDACTED] here, [REDACTED] too [REDACTED]");
        assert_eq!(redact_secrets(&once, &values), once);
    }

    #[test]
    fn test_overlapping_values_prefer_longest() {
        let out = redact_secrets("token=abcd1234efgh", &["abcd", "abcd1234efgh"]);
        assert_eq!(out, "token=[REDACTED]");
    }

    #[test]
    fn test_redaction_set() {
        let mut set = RedactionSet::new();
        set.insert("secret-one");
        set.insert("secret-one");
        assert_eq!(set.len(), 1);
        assert_eq!(set.redact("x secret-one y"), "x [REDACTED] y");
    }

    #[test]
    fn test_redact_json_value() {
        let mut set = RedactionSet::new();
        set.insert("sk-abcdef");
        let value = serde_json::json!({"a": "key sk-abcdef", "b": [1, "sk-abcdef"], "c": true});
        assert_eq!(
            set.redact_value(&value),
            serde_json::json!({"a": "key [REDACTED]", "b": [1, "[REDACTED]"], "c": true})
        );
    }
}
