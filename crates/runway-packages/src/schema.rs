// Annotation -> JSON Schema mapping, following pydantic's rules for the
// primitive types the action decorators accept.

use serde_json::{json, Map, Value};

use crate::pysource::{EntryPoint, PyParam};

/// Managed parameter kinds: injected by the server, never part of the
/// caller-facing input schema.
pub fn managed_param_kind(annotation: &str) -> Option<&'static str> {
    let base = annotation
        .trim()
        .trim_end_matches(']')
        .split('[')
        .next()
        .unwrap_or("")
        .rsplit('.')
        .next()
        .unwrap_or("")
        .trim();
    match base {
        "Secret" => Some("secret"),
        "OAuth2Secret" => Some("oauth2_secret"),
        "DataSource" => Some("data_source"),
        "Request" => Some("request"),
        _ => None,
    }
}

/// Schema for one annotation. Unknown class types map to plain objects the
/// way pydantic serializes them.
pub fn annotation_schema(annotation: Option<&str>) -> Value {
    let Some(annotation) = annotation else {
        return json!({"type": "string"});
    };
    let ann = annotation.trim();

    // Optional[X] and `X | None` reduce to X.
    if let Some(inner) = ann.strip_prefix("Optional[").and_then(|s| s.strip_suffix(']')) {
        return annotation_schema(Some(inner));
    }
    if let Some((left, right)) = ann.split_once('|') {
        if right.trim() == "None" {
            return annotation_schema(Some(left.trim()));
        }
    }

    let (head, inner) = match ann.split_once('[') {
        Some((head, rest)) => (head.trim(), rest.strip_suffix(']')),
        None => (ann, None),
    };

    match head {
        "str" => json!({"type": "string"}),
        "int" => json!({"type": "integer"}),
        "float" => json!({"type": "number"}),
        "bool" => json!({"type": "boolean"}),
        "None" | "NoneType" => json!({"type": "null"}),
        "list" | "List" | "tuple" | "Tuple" | "set" | "Set" => {
            let items = inner
                .map(|i| annotation_schema(Some(i.split(',').next().unwrap_or(i))))
                .unwrap_or_else(|| json!({}));
            json!({"type": "array", "items": items})
        }
        "dict" | "Dict" => json!({"type": "object"}),
        _ => json!({"type": "object"}),
    }
}

/// Input schema for an entry point: an object schema over the non-managed
/// parameters, required unless a default exists.
pub fn build_input_schema(entry: &EntryPoint) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in &entry.params {
        if param
            .annotation
            .as_deref()
            .and_then(managed_param_kind)
            .is_some()
        {
            continue;
        }
        let mut schema = annotation_schema(param.annotation.as_deref());
        if let Some(obj) = schema.as_object_mut() {
            obj.insert("title".to_string(), json!(title_case(&param.name)));
        }
        properties.insert(param.name.clone(), schema);
        if !param.has_default {
            required.push(Value::String(param.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

pub fn build_output_schema(entry: &EntryPoint) -> Value {
    annotation_schema(entry.return_annotation.as_deref())
}

/// Managed params as stored on the action row: name -> kind.
pub fn managed_params_map(params: &[PyParam]) -> Map<String, Value> {
    let mut map = Map::new();
    for param in params {
        if let Some(kind) = param.annotation.as_deref().and_then(managed_param_kind) {
            map.insert(param.name.clone(), Value::String(kind.to_string()));
        }
    }
    map
}

fn title_case(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(params: Vec<PyParam>, ret: Option<&str>) -> EntryPoint {
        EntryPoint {
            kind: runway_types::ActionKind::Action,
            name: "sample".to_string(),
            file: PathBuf::from("actions.py"),
            lineno: 1,
            docstring: String::new(),
            params,
            return_annotation: ret.map(|r| r.to_string()),
            options: Default::default(),
        }
    }

    fn param(name: &str, annotation: Option<&str>, has_default: bool) -> PyParam {
        PyParam {
            name: name.to_string(),
            annotation: annotation.map(|a| a.to_string()),
            has_default,
        }
    }

    #[test]
    fn primitives_map_to_standard_types() {
        assert_eq!(annotation_schema(Some("str"))["type"], "string");
        assert_eq!(annotation_schema(Some("int"))["type"], "integer");
        assert_eq!(annotation_schema(Some("float"))["type"], "number");
        assert_eq!(annotation_schema(Some("bool"))["type"], "boolean");
        assert_eq!(annotation_schema(Some("list[int]"))["items"]["type"], "integer");
        assert_eq!(annotation_schema(Some("Optional[str]"))["type"], "string");
        assert_eq!(annotation_schema(Some("str | None"))["type"], "string");
    }

    #[test]
    fn managed_params_are_excluded_from_input_schema() {
        let entry = entry(
            vec![
                param("message", Some("str"), false),
                param("api_key", Some("Secret"), false),
                param("oauth", Some("OAuth2Secret[Literal['github']]"), false),
                param("request", Some("Request"), false),
            ],
            Some("str"),
        );
        let schema = build_input_schema(&entry);
        let properties = schema["properties"].as_object().unwrap();
        assert_eq!(properties.len(), 1);
        assert!(properties.contains_key("message"));
        assert_eq!(schema["required"], serde_json::json!(["message"]));

        let managed = managed_params_map(&entry.params);
        assert_eq!(managed.get("api_key").unwrap(), "secret");
        assert_eq!(managed.get("oauth").unwrap(), "oauth2_secret");
        assert_eq!(managed.get("request").unwrap(), "request");
    }

    #[test]
    fn defaults_drop_out_of_required() {
        let entry = entry(
            vec![
                param("to", Some("str"), false),
                param("body", Some("str"), true),
            ],
            Some("str"),
        );
        let schema = build_input_schema(&entry);
        assert_eq!(schema["required"], serde_json::json!(["to"]));
    }

    #[test]
    fn output_schema_comes_from_return_annotation() {
        let entry = entry(vec![], Some("float"));
        assert_eq!(build_output_schema(&entry)["type"], "number");
    }
}
