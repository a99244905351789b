use crate::pysource::EntryPoint;

/// A single lint warning for an entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintFinding {
    pub action_name: String,
    pub file: String,
    pub lineno: i64,
    pub message: String,
}

/// Surface the problems the original linter cares about: actions without
/// docstrings and parameters or returns without type annotations.
pub fn lint_entry_point(entry: &EntryPoint) -> Vec<LintFinding> {
    let mut findings = Vec::new();
    let mut push = |message: String| {
        findings.push(LintFinding {
            action_name: entry.name.clone(),
            file: entry.file.display().to_string(),
            lineno: entry.lineno,
            message,
        });
    };

    if entry.docstring.trim().is_empty() {
        push(format!("action '{}' has no docstring", entry.name));
    }
    for param in &entry.params {
        if param.annotation.is_none() {
            push(format!(
                "parameter '{}' of action '{}' has no type annotation",
                param.name, entry.name
            ));
        }
    }
    if entry.return_annotation.is_none() {
        push(format!(
            "action '{}' has no return type annotation",
            entry.name
        ));
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pysource::scan_source;
    use std::path::Path;

    #[test]
    fn clean_action_has_no_findings() {
        let source = "@action\ndef ok(v: int) -> int:\n    \"\"\"Doc.\"\"\"\n    return v\n";
        let entries = scan_source(source, Path::new("a.py"));
        assert!(lint_entry_point(&entries[0]).is_empty());
    }

    #[test]
    fn missing_docstring_and_annotations_are_flagged() {
        let source = "@action\ndef sloppy(v):\n    return v\n";
        let entries = scan_source(source, Path::new("a.py"));
        let findings = lint_entry_point(&entries[0]);
        let messages: Vec<&str> = findings.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages.len(), 3);
        assert!(messages[0].contains("no docstring"));
        assert!(messages[1].contains("no type annotation"));
        assert!(messages[2].contains("no return type annotation"));
    }
}
