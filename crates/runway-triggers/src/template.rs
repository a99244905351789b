// Recursive `{{path}}` template resolution. A string that is exactly one
// variable reference keeps the referenced value's native type; anything else
// interpolates, rendering null as empty.

use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};

pub struct TemplateContext<'a> {
    pub payload: &'a Value,
    pub headers: &'a HashMap<String, String>,
    pub trigger_id: &'a str,
    pub trigger_name: &'a str,
    pub timestamp: &'a str,
}

pub fn resolve_template(template: &Value, ctx: &TemplateContext<'_>) -> Value {
    match template {
        Value::String(text) => resolve_string(text, ctx),
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, value) in map {
                resolved.insert(key.clone(), resolve_template(value, ctx));
            }
            Value::Object(resolved)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| resolve_template(item, ctx)).collect())
        }
        other => other.clone(),
    }
}

fn variable_regex() -> Regex {
    Regex::new(r"\{\{(.+?)\}\}").expect("static regex")
}

fn resolve_string(text: &str, ctx: &TemplateContext<'_>) -> Value {
    let trimmed = text.trim();
    let regex = variable_regex();

    // Whole-string reference: substitute with native type preserved.
    if let Some(captures) = regex.captures(trimmed) {
        if let Some(whole) = captures.get(0) {
            if whole.start() == 0 && whole.end() == trimmed.len() {
                let path = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                return lookup(path, ctx).unwrap_or(Value::Null);
            }
        }
    }

    // Mixed content: string interpolation, None renders empty.
    let interpolated = regex.replace_all(text, |captures: &regex::Captures<'_>| {
        let path = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        match lookup(path, ctx) {
            Some(value) => render(&value),
            None => String::new(),
        }
    });
    Value::String(interpolated.into_owned())
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn lookup(path: &str, ctx: &TemplateContext<'_>) -> Option<Value> {
    let mut parts = path.split('.');
    let root = parts.next()?;

    let mut current: Value = match root {
        "payload" => ctx.payload.clone(),
        "headers" => {
            let mut map = Map::new();
            for (key, value) in ctx.headers {
                map.insert(key.clone(), Value::String(value.clone()));
            }
            Value::Object(map)
        }
        "meta" => serde_json::json!({
            "trigger_id": ctx.trigger_id,
            "trigger_name": ctx.trigger_name,
            "timestamp": ctx.timestamp,
        }),
        _ => return None,
    };

    for part in parts {
        current = match &current {
            Value::Object(map) => map.get(part)?.clone(),
            Value::Array(items) => {
                let index: usize = part.parse().ok()?;
                items.get(index)?.clone()
            }
            _ => return None,
        };
        if current.is_null() {
            return None;
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(payload: &'a Value, headers: &'a HashMap<String, String>) -> TemplateContext<'a> {
        TemplateContext {
            payload,
            headers,
            trigger_id: "trig-1",
            trigger_name: "deploy-hook",
            timestamp: "2024-01-01T00:00:00.000Z",
        }
    }

    #[test]
    fn whole_string_reference_preserves_native_types() {
        let payload = json!({"count": 3, "flag": true, "nested": {"items": [10, 20]}});
        let headers = HashMap::new();
        let template = json!({
            "count": "{{payload.count}}",
            "flag": "{{payload.flag}}",
            "second": "{{payload.nested.items.1}}",
        });
        let resolved = resolve_template(&template, &ctx(&payload, &headers));
        assert_eq!(resolved["count"], json!(3));
        assert_eq!(resolved["flag"], json!(true));
        assert_eq!(resolved["second"], json!(20));
    }

    #[test]
    fn mixed_content_interpolates_and_none_renders_empty() {
        let payload = json!({"name": "Ada", "missing": null});
        let headers = HashMap::new();
        let template = json!({
            "greeting": "Hello {{payload.name}}!",
            "gap": "[{{payload.missing}}]",
            "unknown": "[{{payload.nope}}]",
        });
        let resolved = resolve_template(&template, &ctx(&payload, &headers));
        assert_eq!(resolved["greeting"], json!("Hello Ada!"));
        assert_eq!(resolved["gap"], json!("[]"));
        assert_eq!(resolved["unknown"], json!("[]"));
    }

    #[test]
    fn headers_and_meta_paths_resolve() {
        let payload = json!({});
        let headers: HashMap<String, String> =
            [("x-github-event".to_string(), "push".to_string())].into();
        let template = json!({
            "event": "{{headers.x-github-event}}",
            "trigger": "{{meta.trigger_name}}",
            "at": "{{meta.timestamp}}",
        });
        let resolved = resolve_template(&template, &ctx(&payload, &headers));
        assert_eq!(resolved["event"], json!("push"));
        assert_eq!(resolved["trigger"], json!("deploy-hook"));
        assert_eq!(resolved["at"], json!("2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn arrays_resolve_recursively() {
        let payload = json!({"a": 1, "b": 2});
        let headers = HashMap::new();
        let template = json!(["{{payload.a}}", {"b": "{{payload.b}}"}, 7]);
        let resolved = resolve_template(&template, &ctx(&payload, &headers));
        assert_eq!(resolved, json!([1, {"b": 2}, 7]));
    }

    #[test]
    fn unresolvable_whole_reference_becomes_null() {
        let payload = json!({});
        let headers = HashMap::new();
        let template = json!({"v": "{{payload.deep.path}}"});
        let resolved = resolve_template(&template, &ctx(&payload, &headers));
        assert_eq!(resolved["v"], Value::Null);
    }
}
