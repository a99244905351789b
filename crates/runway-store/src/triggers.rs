use rusqlite::params;

use runway_types::{Result, ServerError, Trigger, TriggerInvocation};

use crate::rows::{invocation_from_row, trigger_from_row, INVOCATION_COLS, TRIGGER_COLS};
use crate::{db_err, Db};

impl Db {
    pub async fn insert_trigger(&self, trigger: &Trigger) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trigger (id, name, enabled, action_id, execution_mode,
                 work_item_queue, inputs_template_json, webhook_secret,
                 rate_limit_enabled, rate_limit_max_per_minute, last_triggered_at,
                 trigger_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                trigger.id,
                trigger.name,
                trigger.enabled as i64,
                trigger.action_id,
                trigger.execution_mode.as_str(),
                trigger.work_item_queue,
                trigger.inputs_template_json,
                trigger.webhook_secret,
                trigger.rate_limit_enabled as i64,
                trigger.rate_limit_max_per_minute,
                trigger.last_triggered_at,
                trigger.trigger_count,
                trigger.created_at,
                trigger.updated_at,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn update_trigger(&self, trigger: &Trigger) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE trigger SET name = ?2, enabled = ?3, action_id = ?4,
                     execution_mode = ?5, work_item_queue = ?6, inputs_template_json = ?7,
                     webhook_secret = ?8, rate_limit_enabled = ?9,
                     rate_limit_max_per_minute = ?10, updated_at = ?11
                 WHERE id = ?1",
                params![
                    trigger.id,
                    trigger.name,
                    trigger.enabled as i64,
                    trigger.action_id,
                    trigger.execution_mode.as_str(),
                    trigger.work_item_queue,
                    trigger.inputs_template_json,
                    trigger.webhook_secret,
                    trigger.rate_limit_enabled as i64,
                    trigger.rate_limit_max_per_minute,
                    trigger.updated_at,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ServerError::NotFound(format!(
                "trigger not found: {}",
                trigger.id
            )));
        }
        Ok(())
    }

    pub async fn delete_trigger(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "DELETE FROM trigger_invocation WHERE trigger_id = ?1",
            params![id],
        )
        .map_err(db_err)?;
        let changed = tx
            .execute("DELETE FROM trigger WHERE id = ?1", params![id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        if changed == 0 {
            return Err(ServerError::NotFound(format!("trigger not found: {id}")));
        }
        Ok(())
    }

    pub async fn get_trigger(&self, id: &str) -> Result<Trigger> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {TRIGGER_COLS} FROM trigger WHERE id = ?1"),
            params![id],
            trigger_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                ServerError::NotFound(format!("trigger not found: {id}"))
            }
            other => db_err(other),
        })
    }

    pub async fn list_triggers(&self) -> Result<Vec<Trigger>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {TRIGGER_COLS} FROM trigger ORDER BY name"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], trigger_from_row).map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    pub async fn record_trigger_invocation(&self, invocation: &TriggerInvocation) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trigger_invocation (id, trigger_id, invoked_at, source_ip,
                 payload_json, headers_json, status, run_id, work_item_id, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                invocation.id,
                invocation.trigger_id,
                invocation.invoked_at,
                invocation.source_ip,
                invocation.payload_json,
                invocation.headers_json,
                invocation.status.as_str(),
                invocation.run_id,
                invocation.work_item_id,
                invocation.error_message,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn bump_trigger_stats(&self, id: &str, last_triggered_at: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trigger
             SET last_triggered_at = ?2, trigger_count = trigger_count + 1, updated_at = ?2
             WHERE id = ?1",
            params![id, last_triggered_at],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn list_trigger_invocations(
        &self,
        trigger_id: &str,
        limit: i64,
    ) -> Result<Vec<TriggerInvocation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INVOCATION_COLS} FROM trigger_invocation
                 WHERE trigger_id = ?1
                 ORDER BY invoked_at DESC LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![trigger_id, limit.clamp(1, 1000)], invocation_from_row)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }
}
