use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use serde::Deserialize;

use runway_types::{Result, ServerError};

/// The subset of `package.yaml` the server cares about. Unknown keys are
/// user metadata and pass through untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageManifest {
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(skip)]
    pub path: PathBuf,
}

impl PackageManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Validation(format!("cannot read {}: {e}", path.display())))?;
        let mut manifest: PackageManifest = serde_yaml::from_str(&raw)
            .map_err(|e| ServerError::Validation(format!("bad manifest {}: {e}", path.display())))?;
        manifest.path = path.to_path_buf();
        Ok(manifest)
    }

    /// Package name: explicit `name:` key, else the directory name.
    pub fn package_name(&self) -> String {
        if let Some(name) = &self.name {
            let trimmed = name.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        self.directory()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "package".to_string())
    }

    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Walk `root` for package manifests: `package.yaml`, or the legacy
/// `robot.yaml` when no modern manifest sits beside it.
pub fn find_manifests(root: &Path) -> Vec<PathBuf> {
    let mut manifests = Vec::new();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .follow_links(false)
        .max_depth(Some(6))
        .build();
    for entry in walker.flatten() {
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some("package.yaml") {
            manifests.push(path.to_path_buf());
        }
    }
    // Legacy robots only count in directories without a package.yaml.
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .follow_links(false)
        .max_depth(Some(6))
        .build();
    for entry in walker.flatten() {
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some("robot.yaml")
            && !path.with_file_name("package.yaml").exists()
        {
            manifests.push(path.to_path_buf());
        }
    }
    manifests.sort();
    manifests.dedup();
    manifests
}
