use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::process::Command;

use runway_types::{Result, ServerError};

/// A materialized package environment: the content hash of its dependency
/// declaration and the variables its subprocesses run with. `PYTHON_EXE`
/// is always present.
#[derive(Debug, Clone)]
pub struct BuiltEnvironment {
    pub hash: String,
    pub env: HashMap<String, String>,
}

/// Materializes isolated Python environments for packages. The heavy lifting
/// is delegated to `rcc`; successful builds are cached by dependency hash so
/// re-imports are cheap. Devmode bypasses rcc and reuses the ambient
/// interpreter.
#[derive(Clone)]
pub struct EnvironmentManager {
    envs_dir: PathBuf,
    devmode: bool,
    rcc_exe: String,
}

impl EnvironmentManager {
    pub fn new(datadir: &Path, devmode: bool) -> Self {
        Self {
            envs_dir: datadir.join("envs"),
            devmode,
            rcc_exe: std::env::var("RCC_EXE").unwrap_or_else(|_| "rcc".to_string()),
        }
    }

    pub async fn materialize(&self, manifest_path: &Path) -> Result<BuiltEnvironment> {
        let manifest = tokio::fs::read_to_string(manifest_path).await.map_err(|e| {
            ServerError::EnvironmentBuild(format!(
                "cannot read manifest {}: {e}",
                manifest_path.display()
            ))
        })?;
        let hash = dependencies_hash(&manifest);

        if self.devmode {
            return Ok(BuiltEnvironment {
                hash,
                env: ambient_environment().await?,
            });
        }

        if let Some(env) = self.load_cached(&hash).await {
            tracing::debug!("reusing cached environment {hash}");
            return Ok(BuiltEnvironment { hash, env });
        }

        let env = self.build_with_rcc(manifest_path, &hash).await?;
        self.store_cached(&hash, &env).await?;
        Ok(BuiltEnvironment { hash, env })
    }

    async fn load_cached(&self, hash: &str) -> Option<HashMap<String, String>> {
        let path = self.envs_dir.join(format!("{hash}.json"));
        let raw = tokio::fs::read_to_string(&path).await.ok()?;
        let env: HashMap<String, String> = serde_json::from_str(&raw).ok()?;
        // A stale cache pointing at a deleted interpreter forces a rebuild.
        let python = env.get("PYTHON_EXE")?;
        if !Path::new(python).exists() {
            return None;
        }
        Some(env)
    }

    async fn store_cached(&self, hash: &str, env: &HashMap<String, String>) -> Result<()> {
        tokio::fs::create_dir_all(&self.envs_dir).await?;
        let path = self.envs_dir.join(format!("{hash}.json"));
        tokio::fs::write(&path, serde_json::to_string_pretty(env)?).await?;
        Ok(())
    }

    async fn build_with_rcc(
        &self,
        manifest_path: &Path,
        hash: &str,
    ) -> Result<HashMap<String, String>> {
        let space = format!("runway-{}", &hash[..hash.len().min(12)]);
        tracing::info!(
            "building environment for {} (space {space})",
            manifest_path.display()
        );
        let mut command = Command::new(&self.rcc_exe);
        command
            .arg("holotree")
            .arg("variables")
            .arg("--space")
            .arg(&space)
            .arg("--json")
            .arg(manifest_path);
        if let Ok(skip) = std::env::var("ACTION_SERVER_SKIP_DOWNLOAD_IN_BUILD") {
            command.env("ACTION_SERVER_SKIP_DOWNLOAD_IN_BUILD", skip);
        }
        let output = command.output().await.map_err(|e| {
            ServerError::EnvironmentBuild(format!("failed to launch {}: {e}", self.rcc_exe))
        })?;
        if !output.status.success() {
            return Err(ServerError::EnvironmentBuild(format!(
                "rcc exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let entries: Vec<RccVariable> =
            serde_json::from_slice(&output.stdout).map_err(|e| {
                ServerError::EnvironmentBuild(format!("cannot parse rcc output: {e}"))
            })?;
        let env: HashMap<String, String> = entries
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();
        if !env.contains_key("PYTHON_EXE") {
            return Err(ServerError::EnvironmentBuild(
                "rcc output is missing PYTHON_EXE".to_string(),
            ));
        }
        Ok(env)
    }
}

#[derive(serde::Deserialize)]
struct RccVariable {
    key: String,
    value: String,
}

/// Devmode environment: the interpreter found on PATH, nothing else.
async fn ambient_environment() -> Result<HashMap<String, String>> {
    if let Ok(explicit) = std::env::var("PYTHON_EXE") {
        if !explicit.trim().is_empty() {
            let mut env = HashMap::new();
            env.insert("PYTHON_EXE".to_string(), explicit);
            return Ok(env);
        }
    }
    for candidate in ["python3", "python"] {
        if let Some(found) = find_on_path(candidate) {
            let mut env = HashMap::new();
            env.insert("PYTHON_EXE".to_string(), found.display().to_string());
            return Ok(env);
        }
    }
    Err(ServerError::EnvironmentBuild(
        "no python interpreter found on PATH for devmode".to_string(),
    ))
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

/// Content hash of the manifest's `dependencies:` section. Falls back to the
/// whole file when the section cannot be isolated, so any edit still
/// invalidates the cache.
pub fn dependencies_hash(manifest: &str) -> String {
    let section = dependencies_section(manifest).unwrap_or(manifest);
    let mut hasher = Sha256::new();
    hasher.update(section.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn dependencies_section(manifest: &str) -> Option<&str> {
    let start = manifest.find("dependencies:")?;
    let rest = &manifest[start..];
    // The section ends at the next top-level key.
    let mut end = rest.len();
    for (offset, line) in rest.match_indices('\n') {
        let _ = line;
        let following = &rest[offset + 1..];
        let Some(first) = following.lines().next() else {
            break;
        };
        if !first.is_empty()
            && !first.starts_with(' ')
            && !first.starts_with('\t')
            && !first.starts_with('-')
            && !first.starts_with("dependencies:")
        {
            end = offset + 1;
            break;
        }
    }
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "name: demo\n\
        dependencies:\n\
          conda-forge:\n\
          - python=3.11\n\
          pypi:\n\
          - requests=2.32\n\
        post-install:\n\
        - echo done\n";

    #[test]
    fn hash_tracks_only_the_dependency_section() {
        let base = dependencies_hash(MANIFEST);
        let renamed = dependencies_hash(&MANIFEST.replace("name: demo", "name: other"));
        assert_eq!(base, renamed);

        let bumped = dependencies_hash(&MANIFEST.replace("2.32", "2.33"));
        assert_ne!(base, bumped);
    }

    #[test]
    fn hash_handles_manifest_without_dependencies() {
        let hash = dependencies_hash("name: empty\n");
        assert_eq!(hash.len(), 64);
    }

    #[tokio::test]
    async fn cached_environment_is_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = EnvironmentManager::new(dir.path(), false);

        let mut env = HashMap::new();
        // Point at a file guaranteed to exist so the cache validates.
        let python = dir.path().join("python");
        std::fs::write(&python, b"").expect("write");
        env.insert("PYTHON_EXE".to_string(), python.display().to_string());

        let hash = dependencies_hash(MANIFEST);
        manager.store_cached(&hash, &env).await.expect("store");

        let loaded = manager.load_cached(&hash).await.expect("cache hit");
        assert_eq!(loaded.get("PYTHON_EXE"), env.get("PYTHON_EXE"));
    }

    #[tokio::test]
    async fn stale_cache_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = EnvironmentManager::new(dir.path(), false);

        let mut env = HashMap::new();
        env.insert(
            "PYTHON_EXE".to_string(),
            dir.path().join("gone").display().to_string(),
        );
        manager.store_cached("deadbeef", &env).await.expect("store");
        assert!(manager.load_cached("deadbeef").await.is_none());
    }
}
