use rusqlite::params;

use runway_types::{Action, ActionPackage, Result, ServerError};

use crate::rows::{action_from_row, package_from_row, ACTION_COLS, PACKAGE_COLS};
use crate::{db_err, Db};

impl Db {
    /// Insert or replace the package row keyed by name, keeping the id of a
    /// prior import so actions and runs retain valid foreign keys.
    pub async fn upsert_action_package(&self, package: &ActionPackage) -> Result<ActionPackage> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM action_package WHERE name = ?1",
                params![package.name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })?;

        let mut stored = package.clone();
        if let Some(id) = existing {
            conn.execute(
                "UPDATE action_package
                 SET directory = ?2, environment_hash = ?3, env_json = ?4
                 WHERE id = ?1",
                params![
                    id,
                    package.directory,
                    package.environment_hash,
                    package.env_json
                ],
            )
            .map_err(db_err)?;
            stored.id = id;
        } else {
            conn.execute(
                "INSERT INTO action_package (id, name, directory, environment_hash, env_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    package.id,
                    package.name,
                    package.directory,
                    package.environment_hash,
                    package.env_json
                ],
            )
            .map_err(db_err)?;
        }
        Ok(stored)
    }

    pub async fn get_action_package(&self, id: &str) -> Result<ActionPackage> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {PACKAGE_COLS} FROM action_package WHERE id = ?1"),
            params![id],
            package_from_row,
        )
        .map_err(|e| not_found_or(e, format!("action package not found: {id}")))
    }

    pub async fn get_action_package_by_name(&self, name: &str) -> Result<ActionPackage> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {PACKAGE_COLS} FROM action_package WHERE name = ?1"),
            params![name],
            package_from_row,
        )
        .map_err(|e| not_found_or(e, format!("action package not found: {name}")))
    }

    pub async fn list_action_packages(&self) -> Result<Vec<ActionPackage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PACKAGE_COLS} FROM action_package ORDER BY name"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], package_from_row).map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    pub async fn insert_action(&self, action: &Action) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO action (id, action_package_id, name, docs, file, lineno,
                 input_schema, output_schema, managed_params_json, options_json,
                 is_consequential, enabled, kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                action.id,
                action.action_package_id,
                action.name,
                action.docs,
                action.file,
                action.lineno,
                action.input_schema,
                action.output_schema,
                action.managed_params_json,
                action.options_json,
                action.is_consequential.map(|v| v as i64),
                action.enabled as i64,
                action.kind.as_str(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Refresh everything a re-import may change on an existing action row.
    pub async fn update_action(&self, action: &Action) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE action
                 SET docs = ?2, file = ?3, lineno = ?4, input_schema = ?5,
                     output_schema = ?6, managed_params_json = ?7, options_json = ?8,
                     is_consequential = ?9, enabled = ?10, kind = ?11
                 WHERE id = ?1",
                params![
                    action.id,
                    action.docs,
                    action.file,
                    action.lineno,
                    action.input_schema,
                    action.output_schema,
                    action.managed_params_json,
                    action.options_json,
                    action.is_consequential.map(|v| v as i64),
                    action.enabled as i64,
                    action.kind.as_str(),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ServerError::NotFound(format!(
                "action not found: {}",
                action.id
            )));
        }
        Ok(())
    }

    pub async fn set_action_enabled(&self, action_id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE action SET enabled = ?2 WHERE id = ?1",
            params![action_id, enabled as i64],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_action(&self, id: &str) -> Result<Action> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {ACTION_COLS} FROM action WHERE id = ?1"),
            params![id],
            action_from_row,
        )
        .map_err(|e| not_found_or(e, format!("action not found: {id}")))
    }

    pub async fn list_actions(&self, package_id: &str) -> Result<Vec<Action>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ACTION_COLS} FROM action WHERE action_package_id = ?1 ORDER BY name"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![package_id], action_from_row)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    pub async fn list_all_actions(&self) -> Result<Vec<Action>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ACTION_COLS} FROM action ORDER BY action_package_id, name"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], action_from_row).map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }
}

fn not_found_or(err: rusqlite::Error, message: String) -> ServerError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound(message),
        other => db_err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_types::{gen_id, ActionKind};

    pub(crate) fn sample_package() -> ActionPackage {
        ActionPackage {
            id: gen_id("ap"),
            name: "calculator".to_string(),
            directory: "/tmp/calculator".to_string(),
            environment_hash: "abc123".to_string(),
            env_json: "{}".to_string(),
        }
    }

    pub(crate) fn sample_action(package_id: &str, name: &str) -> Action {
        Action {
            id: gen_id("act"),
            action_package_id: package_id.to_string(),
            name: name.to_string(),
            docs: "Sums two numbers.".to_string(),
            file: "actions.py".to_string(),
            lineno: 10,
            input_schema: r#"{"type":"object","properties":{}}"#.to_string(),
            output_schema: r#"{"type":"number"}"#.to_string(),
            managed_params_json: None,
            options_json: None,
            is_consequential: None,
            enabled: true,
            kind: ActionKind::Action,
        }
    }

    #[tokio::test]
    async fn reimport_keeps_package_id_stable() {
        let db = crate::Db::open_in_memory().await.expect("open");
        let first = db
            .upsert_action_package(&sample_package())
            .await
            .expect("insert");

        let mut second = sample_package();
        second.environment_hash = "def456".to_string();
        let stored = db.upsert_action_package(&second).await.expect("upsert");

        assert_eq!(stored.id, first.id);
        let fetched = db.get_action_package(&first.id).await.expect("get");
        assert_eq!(fetched.environment_hash, "def456");
    }

    #[tokio::test]
    async fn disabled_actions_are_kept() {
        let db = crate::Db::open_in_memory().await.expect("open");
        let package = db
            .upsert_action_package(&sample_package())
            .await
            .expect("insert");
        let action = sample_action(&package.id, "calculator_sum");
        db.insert_action(&action).await.expect("insert action");

        db.set_action_enabled(&action.id, false).await.expect("disable");
        let fetched = db.get_action(&action.id).await.expect("still there");
        assert!(!fetched.enabled);
    }
}
