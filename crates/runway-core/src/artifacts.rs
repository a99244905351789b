use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;

use runway_types::{Result, Run, ServerError};

/// All artifact names under the run's directory, relative paths with forward
/// slashes, sorted.
pub fn list_artifacts(artifacts_root: &Path, run: &Run) -> Result<Vec<String>> {
    let dir = artifacts_root.join(&run.relative_artifacts_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    collect_files(&dir, &dir, &mut names)?;
    names.sort();
    Ok(names)
}

fn collect_files(base: &Path, dir: &Path, names: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(base, &path, names)?;
        } else {
            let relative = path.strip_prefix(base).unwrap_or(&path);
            names.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Text contents for artifacts selected by explicit names and/or a name
/// regex. Unknown explicit names fail with NotFound; the regex may match
/// nothing.
pub fn read_text_artifacts(
    artifacts_root: &Path,
    run: &Run,
    names: &[String],
    name_regex: Option<&str>,
) -> Result<BTreeMap<String, String>> {
    let available = list_artifacts(artifacts_root, run)?;
    let mut selected: Vec<String> = Vec::new();

    for name in names {
        if !available.contains(name) {
            return Err(ServerError::NotFound(format!(
                "artifact not found: {name}"
            )));
        }
        selected.push(name.clone());
    }
    if let Some(pattern) = name_regex {
        let regex = Regex::new(pattern)
            .map_err(|e| ServerError::Validation(format!("bad artifact regexp: {e}")))?;
        for name in &available {
            if regex.is_match(name) && !selected.contains(name) {
                selected.push(name.clone());
            }
        }
    }

    let dir = artifacts_root.join(&run.relative_artifacts_dir);
    let mut contents = BTreeMap::new();
    for name in selected {
        let path = safe_join(&dir, &name)?;
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ServerError::Infrastructure(format!("cannot read {name}: {e}")))?;
        contents.insert(name, text);
    }
    Ok(contents)
}

pub fn read_binary_artifact(
    artifacts_root: &Path,
    run: &Run,
    name: &str,
) -> Result<Vec<u8>> {
    let available = list_artifacts(artifacts_root, run)?;
    if !available.iter().any(|a| a == name) {
        return Err(ServerError::NotFound(format!("artifact not found: {name}")));
    }
    let dir = artifacts_root.join(&run.relative_artifacts_dir);
    let path = safe_join(&dir, name)?;
    std::fs::read(&path).map_err(|e| ServerError::Infrastructure(format!("cannot read {name}: {e}")))
}

/// Join a client-supplied artifact name under the run directory, refusing
/// traversal outside it.
fn safe_join(dir: &Path, name: &str) -> Result<PathBuf> {
    let candidate = dir.join(name);
    let has_traversal = candidate
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir));
    if has_traversal {
        return Err(ServerError::Validation(format!(
            "artifact name escapes the run directory: {name}"
        )));
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_types::{gen_id, now_iso, RunStatus, RunType};

    fn run_with_dir(relative: &str) -> Run {
        Run {
            id: gen_id("run"),
            numbered_id: 1,
            status: RunStatus::Passed,
            action_id: "act-1".to_string(),
            start_time: now_iso(),
            run_time: Some(0.1),
            inputs: "{}".to_string(),
            result: None,
            error_message: None,
            relative_artifacts_dir: relative.to_string(),
            request_id: None,
            run_type: RunType::Action,
        }
    }

    #[test]
    fn lists_reads_and_filters_artifacts() {
        let root = tempfile::tempdir().expect("tempdir");
        let run = run_with_dir("runs/run-1");
        let dir = root.path().join("runs/run-1");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("__action_server_output.txt"), "hello").expect("write");
        std::fs::write(dir.join("log.html"), "<html/>").expect("write");

        let names = list_artifacts(root.path(), &run).expect("list");
        assert_eq!(names, vec!["__action_server_output.txt", "log.html"]);

        let by_regex =
            read_text_artifacts(root.path(), &run, &[], Some("__action_server.*")).expect("regex");
        assert_eq!(by_regex.len(), 1);
        assert_eq!(by_regex["__action_server_output.txt"], "hello");

        let binary = read_binary_artifact(root.path(), &run, "log.html").expect("binary");
        assert_eq!(binary, b"<html/>");
    }

    #[test]
    fn missing_named_artifact_is_not_found() {
        let root = tempfile::tempdir().expect("tempdir");
        let run = run_with_dir("runs/run-2");
        std::fs::create_dir_all(root.path().join("runs/run-2")).expect("mkdir");
        let err = read_text_artifacts(root.path(), &run, &["nope.txt".to_string()], None)
            .expect_err("missing");
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[test]
    fn traversal_is_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        let run = run_with_dir("runs/run-3");
        std::fs::create_dir_all(root.path().join("runs/run-3")).expect("mkdir");
        let err =
            read_binary_artifact(root.path(), &run, "../../../etc/passwd").expect_err("escape");
        assert!(matches!(
            err,
            ServerError::NotFound(_) | ServerError::Validation(_)
        ));
    }
}
