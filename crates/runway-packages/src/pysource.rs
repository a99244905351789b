// Static analysis of package sources. The server never imports user Python:
// entry points are read off the decorated `def` statements directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use serde_json::Value;

use runway_types::{ActionKind, Result, ServerError};

#[derive(Debug, Clone)]
pub struct PyParam {
    pub name: String,
    pub annotation: Option<String>,
    pub has_default: bool,
}

/// One decorated function discovered in a package source file.
#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub kind: ActionKind,
    pub name: String,
    /// Relative to the package directory.
    pub file: PathBuf,
    pub lineno: i64,
    pub docstring: String,
    pub params: Vec<PyParam>,
    pub return_annotation: Option<String>,
    /// Decorator keyword arguments (`is_consequential`, `uri`, ...).
    pub options: HashMap<String, Value>,
}

/// Scan every tracked `.py` file under the package directory.
pub fn scan_package_sources(package_dir: &Path) -> Result<Vec<EntryPoint>> {
    let mut entry_points = Vec::new();
    let walker = WalkBuilder::new(package_dir)
        .hidden(false)
        .follow_links(false)
        .build();
    for entry in walker.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }
        let source = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Validation(format!("cannot read {}: {e}", path.display())))?;
        let relative = path
            .strip_prefix(package_dir)
            .unwrap_or(path)
            .to_path_buf();
        entry_points.extend(scan_source(&source, &relative));
    }
    entry_points.sort_by(|a, b| (a.file.clone(), a.lineno).cmp(&(b.file.clone(), b.lineno)));
    Ok(entry_points)
}

/// Scan one source text. Exposed for tests.
pub fn scan_source(source: &str, relative_file: &Path) -> Vec<EntryPoint> {
    let lines: Vec<&str> = source.lines().collect();
    let mut found = Vec::new();
    let mut pending: Option<(ActionKind, HashMap<String, Value>)> = None;

    let mut index = 0usize;
    while index < lines.len() {
        let line = lines[index];
        let trimmed = line.trim_start();

        if let Some(decorator) = trimmed.strip_prefix('@') {
            let (consumed, full_decorator) = collect_balanced(&lines, index, decorator);
            if let Some((kind, options)) = parse_decorator(&full_decorator) {
                pending = Some((kind, options));
            }
            index = consumed + 1;
            continue;
        }

        if trimmed.starts_with("def ") || trimmed.starts_with("async def ") {
            let (consumed, signature) = collect_balanced(&lines, index, trimmed);
            if let Some((kind, options)) = pending.take() {
                if let Some(mut entry) = parse_signature(&signature) {
                    entry.kind = kind;
                    entry.options = options;
                    entry.file = relative_file.to_path_buf();
                    entry.lineno = (index + 1) as i64;
                    entry.docstring = extract_docstring(&lines, consumed + 1);
                    found.push(entry);
                }
            }
            index = consumed + 1;
            continue;
        }

        // Anything other than stacked decorators or blank lines breaks the
        // decorator -> def pairing.
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            pending = None;
        }
        index += 1;
    }
    found
}

/// Accumulate lines until parentheses/brackets balance out, returning the
/// index of the last consumed line and the joined text.
fn collect_balanced(lines: &[&str], start: usize, first: &str) -> (usize, String) {
    let mut text = first.to_string();
    let mut index = start;
    while bracket_depth(&text) > 0 && index + 1 < lines.len() {
        index += 1;
        text.push(' ');
        text.push_str(lines[index].trim());
    }
    (index, text)
}

fn bracket_depth(text: &str) -> i32 {
    let mut depth = 0i32;
    let mut chars = text.chars();
    let mut in_string: Option<char> = None;
    while let Some(c) = chars.next() {
        match in_string {
            Some(quote) => {
                if c == '\\' {
                    let _ = chars.next();
                } else if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                '\'' | '"' => in_string = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                '#' => break,
                _ => {}
            },
        }
    }
    depth
}

/// `action`, `query(...)`, `actions.tool` ... -> kind + kwargs.
fn parse_decorator(decorator: &str) -> Option<(ActionKind, HashMap<String, Value>)> {
    let head = decorator.split('(').next()?.trim();
    let last_segment = head.rsplit('.').next()?.trim();
    let kind = ActionKind::parse(last_segment)?;

    let mut options = HashMap::new();
    if let Some(open) = decorator.find('(') {
        let args = decorator[open + 1..]
            .rsplit_once(')')
            .map(|(inner, _)| inner)
            .unwrap_or(&decorator[open + 1..]);
        for piece in split_top_level(args) {
            let Some((key, value)) = piece.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
                continue;
            }
            options.insert(key.to_string(), parse_literal(value.trim()));
        }
    }
    Some((kind, options))
}

fn parse_literal(raw: &str) -> Value {
    match raw {
        "True" => return Value::Bool(true),
        "False" => return Value::Bool(false),
        "None" => return Value::Null,
        _ => {}
    }
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    if let Ok(number) = raw.parse::<i64>() {
        return Value::Number(number.into());
    }
    if let Ok(number) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(number) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

fn parse_signature(signature: &str) -> Option<EntryPoint> {
    let after_def = signature
        .trim_start()
        .strip_prefix("async def ")
        .or_else(|| signature.trim_start().strip_prefix("def "))?;
    let open = after_def.find('(')?;
    let name = after_def[..open].trim().to_string();
    if name.is_empty() {
        return None;
    }

    let rest = &after_def[open + 1..];
    let close = matching_close(rest)?;
    let params_text = &rest[..close];
    let tail = &rest[close + 1..];

    let return_annotation = tail.split_once("->").map(|(_, ann)| {
        ann.trim_end_matches(':')
            .trim()
            .to_string()
    });

    let mut params = Vec::new();
    for piece in split_top_level(params_text) {
        let piece = piece.trim();
        if piece.is_empty()
            || piece == "*"
            || piece == "/"
            || piece.starts_with('*')
            || piece == "self"
            || piece == "cls"
        {
            continue;
        }
        let (head, has_default) = match split_once_top_level(piece, '=') {
            Some((head, _)) => (head, true),
            None => (piece, false),
        };
        let (param_name, annotation) = match split_once_top_level(head, ':') {
            Some((name, ann)) => (name.trim(), Some(ann.trim().to_string())),
            None => (head.trim(), None),
        };
        if param_name.is_empty() {
            continue;
        }
        params.push(PyParam {
            name: param_name.to_string(),
            annotation: annotation.filter(|a| !a.is_empty()),
            has_default,
        });
    }

    Some(EntryPoint {
        kind: ActionKind::Action,
        name,
        file: PathBuf::new(),
        lineno: 0,
        docstring: String::new(),
        params,
        return_annotation: return_annotation.filter(|a| !a.is_empty()),
        options: HashMap::new(),
    })
}

fn matching_close(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut chars = text.char_indices();
    while let Some((idx, c)) = chars.next() {
        match in_string {
            Some(quote) => {
                if c == '\\' {
                    let _ = chars.next();
                } else if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                '\'' | '"' => in_string = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' if depth == 0 => return Some(idx),
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            },
        }
    }
    None
}

fn split_top_level(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut start = 0usize;
    let mut chars = text.char_indices();
    while let Some((idx, c)) = chars.next() {
        match in_string {
            Some(quote) => {
                if c == '\\' {
                    let _ = chars.next();
                } else if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                '\'' | '"' => in_string = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                ',' if depth == 0 => {
                    pieces.push(&text[start..idx]);
                    start = idx + 1;
                }
                _ => {}
            },
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn split_once_top_level(text: &str, separator: char) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut chars = text.char_indices();
    while let Some((idx, c)) = chars.next() {
        match in_string {
            Some(quote) => {
                if c == '\\' {
                    let _ = chars.next();
                } else if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                '\'' | '"' => in_string = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                c if c == separator && depth == 0 => {
                    return Some((&text[..idx], &text[idx + c.len_utf8()..]));
                }
                _ => {}
            },
        }
    }
    None
}

fn extract_docstring(lines: &[&str], from: usize) -> String {
    let mut index = from;
    while index < lines.len() && lines[index].trim().is_empty() {
        index += 1;
    }
    if index >= lines.len() {
        return String::new();
    }
    let trimmed = lines[index].trim();
    let quote = if trimmed.starts_with("\"\"\"") {
        "\"\"\""
    } else if trimmed.starts_with("'''") {
        "'''"
    } else {
        return String::new();
    };

    let after = &trimmed[3..];
    if let Some(end) = after.find(quote) {
        return after[..end].trim().to_string();
    }

    let mut collected = vec![after.to_string()];
    index += 1;
    while index < lines.len() {
        let line = lines[index];
        if let Some(end) = line.find(quote) {
            collected.push(line[..end].to_string());
            break;
        }
        collected.push(line.to_string());
        index += 1;
    }
    dedent(&collected)
}

fn dedent(lines: &[String]) -> String {
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| {
            if l.len() >= indent {
                l[indent..].trim_end().to_string()
            } else {
                l.trim_end().to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
from runway.actions import action, Secret


def helper(x):
    return x


@action
def calculator_sum(v1: float, v2: float) -> float:
    """Sums two numbers.

    More detail here.
    """
    return v1 + v2


@action(is_consequential=False)
def send_email(
    to: str,
    subject: str,
    api_key: Secret,
    body: str = "",
) -> str:
    '''Sends an email.'''
    return "ok"


@resource(uri="custom://my/resource/{name}")
def my_resource(name: str) -> str:
    """Reads a resource."""
    return name
"#;

    #[test]
    fn finds_only_decorated_functions() {
        let found = scan_source(SOURCE, Path::new("actions.py"));
        let names: Vec<&str> = found.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["calculator_sum", "send_email", "my_resource"]);
    }

    #[test]
    fn extracts_signature_details() {
        let found = scan_source(SOURCE, Path::new("actions.py"));
        let sum = &found[0];
        assert_eq!(sum.kind, ActionKind::Action);
        assert_eq!(sum.params.len(), 2);
        assert_eq!(sum.params[0].name, "v1");
        assert_eq!(sum.params[0].annotation.as_deref(), Some("float"));
        assert!(!sum.params[0].has_default);
        assert_eq!(sum.return_annotation.as_deref(), Some("float"));
        assert!(sum.docstring.starts_with("Sums two numbers."));
        assert!(sum.docstring.contains("More detail here."));
    }

    #[test]
    fn multiline_signatures_and_defaults_parse() {
        let found = scan_source(SOURCE, Path::new("actions.py"));
        let email = &found[1];
        assert_eq!(email.params.len(), 4);
        assert_eq!(email.params[2].annotation.as_deref(), Some("Secret"));
        assert!(email.params[3].has_default);
        assert_eq!(email.options.get("is_consequential"), Some(&Value::Bool(false)));
        assert_eq!(email.docstring, "Sends an email.");
    }

    #[test]
    fn resource_uri_is_captured() {
        let found = scan_source(SOURCE, Path::new("actions.py"));
        let resource = &found[2];
        assert_eq!(resource.kind, ActionKind::Resource);
        assert_eq!(
            resource.options.get("uri").and_then(|v| v.as_str()),
            Some("custom://my/resource/{name}")
        );
    }

    #[test]
    fn undecorated_def_after_code_is_skipped() {
        let source = "@action\nx = 1\ndef not_an_action():\n    pass\n";
        let found = scan_source(source, Path::new("a.py"));
        assert!(found.is_empty());
    }
}
