use rusqlite::params;

use runway_types::{Result, Run, RunStatus, ServerError};

use crate::rows::{run_from_row, RUN_COLS};
use crate::{bump_counter, db_err, Db};

impl Db {
    /// Insert the run, allocating its dense `numbered_id` from the `run_id`
    /// counter in the same transaction.
    pub async fn create_run(&self, run: &mut Run) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        run.numbered_id = bump_counter(&tx, "run_id")?;
        tx.execute(
            "INSERT INTO run (id, numbered_id, status, action_id, start_time, run_time,
                 inputs, result, error_message, relative_artifacts_dir, request_id, run_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.id,
                run.numbered_id,
                run.status.code(),
                run.action_id,
                run.start_time,
                run.run_time,
                run.inputs,
                run.result,
                run.error_message,
                run.relative_artifacts_dir,
                run.request_id,
                run.run_type.as_str(),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> Result<Run> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {RUN_COLS} FROM run WHERE id = ?1"),
            params![id],
            run_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                ServerError::NotFound(format!("run not found: {id}"))
            }
            other => db_err(other),
        })
    }

    pub async fn list_runs(&self, limit: Option<i64>) -> Result<Vec<Run>> {
        let conn = self.conn.lock().await;
        let limit = limit.unwrap_or(500).clamp(1, 5000);
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLS} FROM run ORDER BY numbered_id DESC LIMIT ?1"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![limit], run_from_row).map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    /// Move a run to RUNNING. Terminal states are never transitioned out of,
    /// so the update is guarded on the current status.
    pub async fn mark_run_running(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE run SET status = ?2 WHERE id = ?1 AND status = ?3",
                params![id, RunStatus::Running.code(), RunStatus::NotRun.code()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ServerError::Infrastructure(format!(
                "run {id} is not in NOT_RUN state"
            )));
        }
        Ok(())
    }

    /// Finalize a run. Only RUNNING (or NOT_RUN, when the worker was never
    /// reached) rows can be finalized.
    pub async fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        run_time: f64,
        result: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE run
                 SET status = ?2, run_time = ?3, result = ?4, error_message = ?5
                 WHERE id = ?1 AND status IN (?6, ?7)",
                params![
                    id,
                    status.code(),
                    run_time,
                    result,
                    error_message,
                    RunStatus::NotRun.code(),
                    RunStatus::Running.code(),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ServerError::Infrastructure(format!(
                "run {id} already terminal"
            )));
        }
        Ok(())
    }
}
