// Plugin argument templating
// Replaces {{ name }} placeholders with JSON-encoded run variables

use crate::errors::SubstitutionError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::instrument;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Shared key/value bag of run variables
pub type Variables = HashMap<String, Value>;

/// Variable names are identifiers: a letter or underscore, then alphanumerics
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// A placeholder found in a template
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

/// Scan a template for placeholders, rejecting unclosed or invalid ones
fn scan(template: &str) -> Result<Vec<Placeholder<'_>>, SubstitutionError> {
    let mut placeholders = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = template[cursor..].find(OPEN) {
        let start = cursor + offset;
        let inner_start = start + OPEN.len();
        let inner_len = template[inner_start..]
            .find(CLOSE)
            .ok_or_else(|| SubstitutionError::Malformed {
                position: start,
                reason: "unclosed placeholder".to_string(),
            })?;
        let inner = &template[inner_start..inner_start + inner_len];
        if inner.contains(OPEN) {
            return Err(SubstitutionError::Malformed {
                position: start,
                reason: "nested placeholder".to_string(),
            });
        }
        let name = inner.trim();
        if !is_valid_name(name) {
            return Err(SubstitutionError::Malformed {
                position: start,
                reason: format!("invalid variable name '{}'", name),
            });
        }
        let end = inner_start + inner_len + CLOSE.len();
        placeholders.push(Placeholder { start, end, name });
        cursor = end;
    }

    Ok(placeholders)
}

/// Render an argument template against the run variables
///
/// Each `{{ name }}` is replaced with the JSON encoding of the variable, so
/// strings arrive quoted and lists arrive as JSON arrays.
///
/// # Errors
/// - `Malformed` for unclosed, nested or invalid placeholders
/// - `UndefinedVariable` listing every referenced name missing from `variables`
#[instrument(skip(template, variables), fields(template_len = template.len(), var_count = variables.len()))]
pub fn render(template: &str, variables: &Variables) -> Result<String, SubstitutionError> {
    let placeholders = scan(template)?;
    if placeholders.is_empty() {
        return Ok(template.to_string());
    }

    let mut undefined = Vec::new();
    for placeholder in &placeholders {
        if !variables.contains_key(placeholder.name)
            && !undefined.iter().any(|n: &String| n == placeholder.name)
        {
            undefined.push(placeholder.name.to_string());
        }
    }
    if !undefined.is_empty() {
        tracing::error!(undefined_variables = ?undefined, "Undefined variables in template");
        return Err(SubstitutionError::UndefinedVariable {
            variables: undefined,
        });
    }

    let mut rendered = String::with_capacity(template.len());
    let mut cursor = 0;
    for placeholder in &placeholders {
        rendered.push_str(&template[cursor..placeholder.start]);
        let value = &variables[placeholder.name];
        let encoded =
            serde_json::to_string(value).map_err(|e| SubstitutionError::Encoding {
                name: placeholder.name.to_string(),
                reason: e.to_string(),
            })?;
        rendered.push_str(&encoded);
        cursor = placeholder.end;
    }
    rendered.push_str(&template[cursor..]);

    tracing::debug!(
        original_len = template.len(),
        result_len = rendered.len(),
        "Template rendered"
    );

    Ok(rendered)
}

/// Extract the unique variable names referenced by a template, in order of first use
pub fn extract_variables(template: &str) -> Result<Vec<String>, SubstitutionError> {
    let mut seen = HashSet::new();
    Ok(scan(template)?
        .into_iter()
        .filter(|p| seen.insert(p.name))
        .map(|p| p.name.to_string())
        .collect())
}
