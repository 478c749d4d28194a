//! Template Expressions
//!
//! Inputs reference context values with `${name}` placeholders. Names may
//! be dotted (`${service.name}`). A literal `$` not followed by `{` is
//! kept as is.

use serde_json::Value;

use crate::error::{EngineError, Result};

/// Checks if a string contains any placeholder.
pub fn has_placeholders(text: &str) -> bool {
    text.contains("${")
}

/// Extracts placeholder names in order of appearance.
///
/// # Example
/// ```
/// use deployflow::context::expression::referenced_names;
///
/// let names = referenced_names("helm upgrade ${release} --namespace ${ infra.namespace }");
/// assert_eq!(names, vec!["release", "infra.namespace"]);
/// ```
pub fn referenced_names(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = template.chars().peekable();
    let mut in_placeholder = false;
    let mut current_name = String::new();

    while let Some(ch) = chars.next() {
        if in_placeholder {
            if ch == '}' {
                let name = current_name.trim();
                if !name.is_empty() {
                    names.push(name.to_string());
                }
                current_name.clear();
                in_placeholder = false;
            } else {
                current_name.push(ch);
            }
        } else if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            in_placeholder = true;
        }
    }

    names
}

/// Renders a template, looking each placeholder up with `lookup`.
///
/// Fails with a resolution error on an unterminated or empty placeholder,
/// or when `lookup` fails.
pub fn render<F>(template: &str, mut lookup: F) -> Result<String>
where
    F: FnMut(&str) -> Result<Value>,
{
    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            rendered.push(ch);
            continue;
        }
        chars.next();

        let mut name = String::new();
        let mut closed = false;
        for inner in chars.by_ref() {
            if inner == '}' {
                closed = true;
                break;
            }
            name.push(inner);
        }

        if !closed {
            return Err(EngineError::Resolution(format!(
                "unterminated placeholder in '{}'",
                template
            )));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Resolution(format!(
                "empty placeholder in '{}'",
                template
            )));
        }

        rendered.push_str(&value_to_string(&lookup(name)?));
    }

    Ok(rendered)
}

/// Renders a JSON value as template text; strings are not quoted.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup_in(map: &BTreeMap<String, Value>) -> impl FnMut(&str) -> Result<Value> + '_ {
        move |name| {
            map.get(name)
                .cloned()
                .ok_or_else(|| EngineError::Resolution(format!("'{}' is not bound", name)))
        }
    }

    #[test]
    fn test_render_substitutes_values() {
        let mut map = BTreeMap::new();
        map.insert("env".to_string(), Value::from("prod"));
        map.insert("replicas".to_string(), Value::from(3));
        let out = render("deploy to ${env} with ${ replicas } pods", lookup_in(&map)).unwrap();
        assert_eq!(out, "deploy to prod with 3 pods");
    }

    #[test]
    fn test_plain_dollar_is_kept() {
        let map = BTreeMap::new();
        let out = render("cost: $5", lookup_in(&map)).unwrap();
        assert_eq!(out, "cost: $5");
    }

    #[test]
    fn test_missing_binding_is_resolution_error() {
        let map = BTreeMap::new();
        let err = render("${missing}", lookup_in(&map)).unwrap_err();
        assert!(matches!(err, EngineError::Resolution(_)));
    }

    #[test]
    fn test_unterminated_placeholder() {
        let map = BTreeMap::new();
        assert!(matches!(
            render("echo ${env", lookup_in(&map)),
            Err(EngineError::Resolution(_))
        ));
        assert!(matches!(
            render("echo ${ }", lookup_in(&map)),
            Err(EngineError::Resolution(_))
        ));
    }

    #[test]
    fn test_has_placeholders() {
        assert!(has_placeholders("${a}"));
        assert!(!has_placeholders("{a}"));
    }
}
