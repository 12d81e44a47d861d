use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::domain::GenomicUnit;
use crate::error::AnnotatorError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").unwrap());

/// Substitutes every `{name}` in `template` from the genomic unit.
pub fn render(template: &str, unit: &GenomicUnit) -> Result<String, AnnotatorError> {
    let mut missing = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        match unit.lookup(name) {
            Some(value) => value_text(&value),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(placeholder) => Err(AnnotatorError::TemplatePlaceholder {
            template: template.to_string(),
            placeholder,
        }),
        None => Ok(rendered.into_owned()),
    }
}

/// Placeholder names referenced by a template, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
