use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;

use runway_runtime::EnvironmentManager;
use runway_store::Db;
use runway_types::{gen_id, Action, ActionPackage, Result, ServerError};

use crate::lint::lint_entry_point;
use crate::manifest::{find_manifests, PackageManifest};
use crate::pysource::scan_package_sources;
use crate::schema::{build_input_schema, build_output_schema, managed_params_map};

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    pub skip_lint: bool,
}

#[derive(Debug, Clone)]
pub struct ImportedPackage {
    pub package: ActionPackage,
    pub actions: Vec<Action>,
    pub disabled: usize,
}

/// Import every package found under `root`: build its environment, extract
/// entry points, persist the package and diff its actions against prior
/// imports. Previously-known actions that vanished are disabled, never
/// deleted, so runs keep valid foreign keys.
pub async fn import_packages(
    db: &Db,
    envs: &EnvironmentManager,
    root: &Path,
    options: ImportOptions,
) -> Result<Vec<ImportedPackage>> {
    let manifests = find_manifests(root);
    if manifests.is_empty() {
        return Err(ServerError::NotFound(format!(
            "no package.yaml or robot.yaml under {}",
            root.display()
        )));
    }

    let mut imported = Vec::new();
    for manifest_path in manifests {
        let manifest = PackageManifest::load(&manifest_path)?;
        imported.push(import_one(db, envs, &manifest, options).await?);
    }
    Ok(imported)
}

async fn import_one(
    db: &Db,
    envs: &EnvironmentManager,
    manifest: &PackageManifest,
    options: ImportOptions,
) -> Result<ImportedPackage> {
    let package_name = manifest.package_name();
    let directory = manifest.directory();
    tracing::info!("importing package '{package_name}' from {}", directory.display());

    let environment = envs.materialize(&manifest.path).await?;
    let entry_points = scan_package_sources(directory)?;
    if entry_points.is_empty() {
        return Err(ServerError::Validation(format!(
            "package '{package_name}' declares no actions"
        )));
    }

    if !options.skip_lint {
        let mut failed = false;
        for entry in &entry_points {
            for finding in lint_entry_point(entry) {
                failed = true;
                tracing::warn!(
                    "{}:{}: {}",
                    finding.file,
                    finding.lineno,
                    finding.message
                );
            }
        }
        if failed {
            return Err(ServerError::Validation(format!(
                "lint failed for package '{package_name}' (use --skip-lint to import anyway)"
            )));
        }
    }

    let package = db
        .upsert_action_package(&ActionPackage {
            id: gen_id("ap"),
            name: package_name.clone(),
            directory: directory.display().to_string(),
            environment_hash: environment.hash.clone(),
            env_json: serde_json::to_string(&environment.env)?,
        })
        .await?;

    let known = db.list_actions(&package.id).await?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut actions = Vec::new();

    for entry in &entry_points {
        seen.insert(entry.name.clone());
        let managed = managed_params_map(&entry.params);
        let action = Action {
            id: known
                .iter()
                .find(|a| a.name == entry.name)
                .map(|a| a.id.clone())
                .unwrap_or_else(|| gen_id("act")),
            action_package_id: package.id.clone(),
            name: entry.name.clone(),
            docs: entry.docstring.clone(),
            file: entry.file.display().to_string(),
            lineno: entry.lineno,
            input_schema: build_input_schema(entry).to_string(),
            output_schema: build_output_schema(entry).to_string(),
            managed_params_json: if managed.is_empty() {
                None
            } else {
                Some(Value::Object(managed).to_string())
            },
            options_json: if entry.options.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&entry.options)?)
            },
            is_consequential: entry
                .options
                .get("is_consequential")
                .and_then(|v| v.as_bool()),
            enabled: true,
            kind: entry.kind,
        };
        if known.iter().any(|a| a.name == entry.name) {
            db.update_action(&action).await?;
        } else {
            db.insert_action(&action).await?;
        }
        actions.push(action);
    }

    let mut disabled = 0usize;
    for stale in known.iter().filter(|a| !seen.contains(&a.name)) {
        if stale.enabled {
            tracing::info!(
                "action '{}' no longer present in '{package_name}'; disabling",
                stale.name
            );
            db.set_action_enabled(&stale.id, false).await?;
            disabled += 1;
        }
    }

    Ok(ImportedPackage {
        package,
        actions,
        disabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_runtime::EnvironmentManager;

    fn write_package(dir: &Path, body: &str) {
        std::fs::create_dir_all(dir).expect("mkdir");
        std::fs::write(dir.join("package.yaml"), "name: calculator\n").expect("manifest");
        std::fs::write(dir.join("actions.py"), body).expect("source");
    }

    const GOOD: &str = "@action\ndef calculator_sum(v1: float, v2: float) -> float:\n    \"\"\"Sums.\"\"\"\n    return v1 + v2\n";

    async fn devmode_envs(datadir: &Path) -> EnvironmentManager {
        // Devmode needs some python on PATH in CI; fall back to a fake one.
        if std::env::var("PYTHON_EXE").is_err() {
            let fake = datadir.join("python3");
            std::fs::write(&fake, b"").expect("fake python");
            std::env::set_var("PYTHON_EXE", fake.display().to_string());
        }
        EnvironmentManager::new(datadir, true)
    }

    #[tokio::test]
    async fn import_then_reimport_disables_missing_actions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pkg_dir = dir.path().join("calculator");
        write_package(
            &pkg_dir,
            &format!("{GOOD}\n@action\ndef calculator_sub(v1: float, v2: float) -> float:\n    \"\"\"Subtracts.\"\"\"\n    return v1 - v2\n"),
        );

        let db = Db::open_in_memory().await.expect("db");
        let envs = devmode_envs(dir.path()).await;

        let imported = import_packages(&db, &envs, dir.path(), ImportOptions::default())
            .await
            .expect("import");
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].actions.len(), 2);

        // Second import with one action gone.
        write_package(&pkg_dir, GOOD);
        let reimported = import_packages(&db, &envs, dir.path(), ImportOptions::default())
            .await
            .expect("reimport");
        assert_eq!(reimported[0].actions.len(), 1);
        assert_eq!(reimported[0].disabled, 1);

        let all = db.list_actions(&reimported[0].package.id).await.expect("list");
        let sub = all.iter().find(|a| a.name == "calculator_sub").expect("kept");
        assert!(!sub.enabled);
        let sum = all.iter().find(|a| a.name == "calculator_sum").expect("kept");
        assert!(sum.enabled);
    }

    #[tokio::test]
    async fn lint_failure_blocks_import_unless_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_package(
            &dir.path().join("sloppy"),
            "@action\ndef no_docs(v):\n    return v\n",
        );

        let db = Db::open_in_memory().await.expect("db");
        let envs = devmode_envs(dir.path()).await;

        let err = import_packages(&db, &envs, dir.path(), ImportOptions::default())
            .await
            .expect_err("lint should fail");
        assert!(matches!(err, ServerError::Validation(_)));

        let imported = import_packages(&db, &envs, dir.path(), ImportOptions { skip_lint: true })
            .await
            .expect("skip-lint import");
        assert_eq!(imported[0].actions.len(), 1);
    }
}
