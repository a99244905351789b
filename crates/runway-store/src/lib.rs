// SQLite store for the action server.
//
// Single writer, WAL journaling. All multi-statement operations run inside a
// transaction held under the connection lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Mutex;

use runway_types::{Result, ServerError};

mod actions;
mod migrations;
mod rows;
mod runs;
mod schedules;
mod triggers;
mod work_items;

pub use migrations::MIGRATIONS;

/// Database handle shared across the server. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl Db {
    /// Open (or create) the store at `db_path` and bring the schema up to
    /// date. Refuses to open databases written by a newer binary.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path).map_err(db_err)?;
        Self::bootstrap(conn, db_path.to_path_buf()).await
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::bootstrap(conn, PathBuf::from(":memory:")).await
    }

    async fn bootstrap(conn: Connection, db_path: PathBuf) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(10)).map_err(db_err)?;
        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(db_err)?;
        conn.execute("PRAGMA synchronous = NORMAL", [])
            .map_err(db_err)?;
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(db_err)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "CREATE TABLE IF NOT EXISTS migration (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            )",
            [],
        )
        .map_err(db_err)?;

        let applied: Vec<i64> = {
            let mut stmt = tx
                .prepare("SELECT id FROM migration ORDER BY id")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, i64>(0))
                .map_err(db_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?
        };

        let newest_known = MIGRATIONS.last().map(|(id, _, _)| *id).unwrap_or(0);
        if let Some(unknown) = applied.iter().find(|id| **id > newest_known) {
            return Err(ServerError::Infrastructure(format!(
                "database at {} holds migration {} which this build does not know; \
                 refusing to start",
                self.db_path.display(),
                unknown
            )));
        }

        for (id, name, sql) in MIGRATIONS {
            if applied.contains(id) {
                continue;
            }
            tracing::info!("applying migration {id}: {name}");
            tx.execute_batch(sql).map_err(db_err)?;
            tx.execute(
                "INSERT INTO migration (id, name) VALUES (?1, ?2)",
                rusqlite::params![id, name],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub async fn applied_migrations(&self) -> Result<Vec<runway_types::Migration>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, name FROM migration ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(runway_types::Migration {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    /// Increment the named counter and return the new value. The row is
    /// created lazily; the whole operation runs in one transaction so the
    /// sequence is dense even under concurrent callers.
    pub async fn next_counter_value(&self, counter_id: &str) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        let value = bump_counter(&tx, counter_id)?;
        tx.commit().map_err(db_err)?;
        Ok(value)
    }
}

pub(crate) fn bump_counter(tx: &rusqlite::Transaction<'_>, counter_id: &str) -> Result<i64> {
    tx.execute(
        "INSERT OR IGNORE INTO counter (id, value) VALUES (?1, 0)",
        rusqlite::params![counter_id],
    )
    .map_err(db_err)?;
    tx.execute(
        "UPDATE counter SET value = value + 1 WHERE id = ?1",
        rusqlite::params![counter_id],
    )
    .map_err(db_err)?;
    tx.query_row(
        "SELECT value FROM counter WHERE id = ?1",
        rusqlite::params![counter_id],
        |row| row.get(0),
    )
    .map_err(db_err)
}

pub(crate) fn db_err(err: rusqlite::Error) -> ServerError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound("row not found".to_string()),
        other => ServerError::Infrastructure(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_once_and_are_recorded() {
        let db = Db::open_in_memory().await.expect("open");
        let applied = db.applied_migrations().await.expect("list");
        assert_eq!(applied.len(), MIGRATIONS.len());
        assert_eq!(applied[0].name, "initial");
    }

    #[tokio::test]
    async fn reopening_a_datadir_applies_nothing_new() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("server.db");
        {
            let _db = Db::open(&path).await.expect("first open");
        }
        let db = Db::open(&path).await.expect("second open");
        let applied = db.applied_migrations().await.expect("list");
        assert_eq!(applied.len(), MIGRATIONS.len());
    }

    #[tokio::test]
    async fn newer_database_refuses_to_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("server.db");
        {
            let db = Db::open(&path).await.expect("open");
            let conn = db.conn.lock().await;
            conn.execute(
                "INSERT INTO migration (id, name) VALUES (999, 'from-the-future')",
                [],
            )
            .expect("insert");
        }
        let err = Db::open(&path).await.expect_err("must refuse");
        assert!(err.to_string().contains("999"));
    }

    #[tokio::test]
    async fn counter_values_are_dense() {
        let db = Db::open_in_memory().await.expect("open");
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(db.next_counter_value("run_id").await.expect("bump"));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }
}
