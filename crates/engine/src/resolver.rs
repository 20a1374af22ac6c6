//! Expression resolver: substitutes `{{ $path.to.value }}` placeholders in a
//! node's config with values from the execution scope.
//!
//! Resolution walks the JSON structure and never re-serialises it, so every
//! byte outside a placeholder comes out exactly as it went in.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use thiserror::Error;

/// A placeholder referenced a path that does not exist in the scope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot resolve `{path}`: no such value in context")]
pub struct ResolutionError {
    pub path: String,
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{\s*(\$[^\s{}]+)\s*\}\}").expect("valid regex"))
}

/// Resolve every placeholder in `template` against `scope`.
///
/// Object keys are left alone; string values anywhere in the tree are
/// resolved.
pub fn resolve(template: &Value, scope: &Value) -> Result<Value, ResolutionError> {
    match template {
        Value::String(s) => resolve_str(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, value)| Ok((key.clone(), resolve(value, scope)?)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve one string.
///
/// A string that is nothing but a single placeholder becomes the referenced
/// value with its type intact. Otherwise each placeholder is rendered into
/// the surrounding text.
pub fn resolve_str(text: &str, scope: &Value) -> Result<Value, ResolutionError> {
    let re = placeholder();

    if let Some(caps) = re.captures(text) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
            return lookup_caps(&caps, scope).cloned();
        }
    } else {
        return Ok(Value::String(text.to_owned()));
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&text[last..whole.start()]);
        render_into(&mut out, lookup_caps(&caps, scope)?);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(Value::String(out))
}

fn lookup_caps<'a>(caps: &Captures<'_>, scope: &'a Value) -> Result<&'a Value, ResolutionError> {
    let path = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    lookup(scope, path).ok_or_else(|| ResolutionError { path: path.to_owned() })
}

/// Follow a dotted path. Numeric segments index arrays.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(scope, |value, segment| match value {
        Value::Object(fields) => fields.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn render_into(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Null => {}
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "$context": {
                "data": { "title": "t1\n\nline 2", "count": 3, "tags": ["a", "b"], "note": null }
            },
            "$jobsMapByNodeId": { "fetch": { "status": 400 } },
            "$system": { "executionId": "e-1" },
        })
    }

    #[test]
    fn whole_placeholder_keeps_the_json_type() {
        assert_eq!(resolve_str("{{$context.data.count}}", &scope()).unwrap(), json!(3));
        assert_eq!(resolve_str("{{ $context.data.tags }}", &scope()).unwrap(), json!(["a", "b"]));
        assert_eq!(resolve_str("{{$context.data.note}}", &scope()).unwrap(), Value::Null);
    }

    #[test]
    fn line_breaks_survive_exactly() {
        assert_eq!(
            resolve(&json!({ "title": "{{$context.data.title}}" }), &scope()).unwrap(),
            json!({ "title": "t1\n\nline 2" })
        );
        assert_eq!(
            resolve_str("before\r\n{{$context.data.title}}\tafter", &scope()).unwrap(),
            json!("before\r\nt1\n\nline 2\tafter")
        );
    }

    #[test]
    fn embedded_placeholders_render_into_text() {
        let resolved = resolve_str(
            "/items/{{$context.data.count}}?tag={{$context.data.tags.1}}&n={{$context.data.note}}&s={{$jobsMapByNodeId.fetch}}",
            &scope(),
        )
        .unwrap();
        assert_eq!(resolved, json!("/items/3?tag=b&n=&s={\"status\":400}"));
    }

    #[test]
    fn nested_structures_resolve_and_keys_are_untouched() {
        let template = json!({
            "{{$context.data.count}}": ["{{$system.executionId}}", 1, true, null],
            "inner": { "status": "{{$jobsMapByNodeId.fetch.status}}" },
        });
        assert_eq!(
            resolve(&template, &scope()).unwrap(),
            json!({
                "{{$context.data.count}}": ["e-1", 1, true, null],
                "inner": { "status": 400 },
            })
        );
    }

    #[test]
    fn text_without_dollar_placeholders_passes_through() {
        for text in ["plain", "{{ not.a.path }}", "{}", "{{$}", "  {{x}}  "] {
            assert_eq!(resolve_str(text, &scope()).unwrap(), json!(text));
        }
    }

    #[test]
    fn missing_paths_fail_with_the_path() {
        assert_eq!(
            resolve(&json!({ "a": ["{{$context.data.missing}}"] }), &scope()).unwrap_err(),
            ResolutionError { path: "$context.data.missing".into() }
        );
        assert_eq!(
            resolve_str("x {{$context.data.tags.9}}", &scope()).unwrap_err().path,
            "$context.data.tags.9"
        );
        assert!(resolve_str("{{$nope}}", &scope()).is_err());
    }
}
