use std::collections::HashMap;

use rusqlite::params;

use runway_types::{Result, ServerError, WorkItem, WorkItemState};

use crate::rows::{work_item_from_row, WORK_ITEM_COLS};
use crate::{db_err, Db};

impl Db {
    pub async fn insert_work_item(&self, item: &WorkItem) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO work_item (id, queue_name, state, payload_json, created_at,
                 started_at, finished_at, lease_owner, attempts, exception_type,
                 exception_code, exception_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                item.id,
                item.queue_name,
                item.state.as_str(),
                item.payload_json,
                item.created_at,
                item.started_at,
                item.finished_at,
                item.lease_owner,
                item.attempts,
                item.exception_type,
                item.exception_code,
                item.exception_message,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Atomically lease the oldest PENDING item in the queue. An owner that
    /// already holds an IN_PROGRESS item in this queue gets that same item
    /// back, which keeps the one-lease-per-(queue, owner) invariant under
    /// consumer retries.
    pub async fn reserve_work_item(
        &self,
        queue_name: &str,
        lease_owner: &str,
        started_at: &str,
    ) -> Result<Option<WorkItem>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;

        let held = tx.query_row(
            &format!(
                "SELECT {WORK_ITEM_COLS} FROM work_item
                 WHERE queue_name = ?1 AND state = 'IN_PROGRESS' AND lease_owner = ?2
                 LIMIT 1"
            ),
            params![queue_name, lease_owner],
            work_item_from_row,
        );
        match held {
            Ok(item) => {
                tx.commit().map_err(db_err)?;
                return Ok(Some(item));
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {}
            Err(other) => return Err(db_err(other)),
        }

        let candidate = tx.query_row(
            &format!(
                "SELECT {WORK_ITEM_COLS} FROM work_item
                 WHERE queue_name = ?1 AND state = 'PENDING'
                 ORDER BY created_at ASC LIMIT 1"
            ),
            params![queue_name],
            work_item_from_row,
        );
        let mut item = match candidate {
            Ok(item) => item,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                tx.commit().map_err(db_err)?;
                return Ok(None);
            }
            Err(other) => return Err(db_err(other)),
        };

        tx.execute(
            "UPDATE work_item
             SET state = 'IN_PROGRESS', lease_owner = ?2, started_at = ?3,
                 attempts = attempts + 1
             WHERE id = ?1 AND state = 'PENDING'",
            params![item.id, lease_owner, started_at],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        item.state = WorkItemState::InProgress;
        item.lease_owner = Some(lease_owner.to_string());
        item.started_at = Some(started_at.to_string());
        item.attempts += 1;
        Ok(Some(item))
    }

    /// Release a leased item into DONE or FAILED. Only IN_PROGRESS rows can
    /// be released, so state transitions stay monotonic.
    pub async fn release_work_item(
        &self,
        id: &str,
        state: WorkItemState,
        finished_at: &str,
        exception_type: Option<&str>,
        exception_code: Option<&str>,
        exception_message: Option<&str>,
    ) -> Result<()> {
        if !matches!(state, WorkItemState::Done | WorkItemState::Failed) {
            return Err(ServerError::Validation(format!(
                "cannot release into state {}",
                state.as_str()
            )));
        }
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE work_item
                 SET state = ?2, finished_at = ?3, lease_owner = NULL,
                     exception_type = ?4, exception_code = ?5, exception_message = ?6
                 WHERE id = ?1 AND state = 'IN_PROGRESS'",
                params![
                    id,
                    state.as_str(),
                    finished_at,
                    exception_type,
                    exception_code,
                    exception_message,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ServerError::NotFound(format!(
                "work item not leased: {id}"
            )));
        }
        Ok(())
    }

    /// Admin action: put a FAILED item back into PENDING for another pass.
    pub async fn requeue_work_item(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE work_item
                 SET state = 'PENDING', started_at = NULL, finished_at = NULL,
                     lease_owner = NULL, exception_type = NULL, exception_code = NULL,
                     exception_message = NULL
                 WHERE id = ?1 AND state = 'FAILED'",
                params![id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ServerError::NotFound(format!(
                "work item not in FAILED state: {id}"
            )));
        }
        Ok(())
    }

    pub async fn get_work_item(&self, id: &str) -> Result<WorkItem> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {WORK_ITEM_COLS} FROM work_item WHERE id = ?1"),
            params![id],
            work_item_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                ServerError::NotFound(format!("work item not found: {id}"))
            }
            other => db_err(other),
        })
    }

    pub async fn list_work_items(
        &self,
        queue_name: &str,
        state: Option<WorkItemState>,
        limit: i64,
    ) -> Result<Vec<WorkItem>> {
        let conn = self.conn.lock().await;
        let limit = limit.clamp(1, 1000);
        let items = if let Some(state) = state {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {WORK_ITEM_COLS} FROM work_item
                     WHERE queue_name = ?1 AND state = ?2
                     ORDER BY created_at ASC LIMIT ?3"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![queue_name, state.as_str(), limit], work_item_from_row)
                .map_err(db_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?
        } else {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {WORK_ITEM_COLS} FROM work_item
                     WHERE queue_name = ?1
                     ORDER BY created_at ASC LIMIT ?2"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![queue_name, limit], work_item_from_row)
                .map_err(db_err)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?
        };
        Ok(items)
    }

    /// Item counts per state for one queue.
    pub async fn work_item_stats(&self, queue_name: &str) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT state, COUNT(*) FROM work_item WHERE queue_name = ?1 GROUP BY state",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![queue_name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?;
        let mut stats = HashMap::new();
        for row in rows {
            let (state, count) = row.map_err(db_err)?;
            stats.insert(state, count);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_types::{gen_id, now_iso};

    fn pending_item(queue: &str) -> WorkItem {
        WorkItem {
            id: gen_id("wi"),
            queue_name: queue.to_string(),
            state: WorkItemState::Pending,
            payload_json: r#"{"k":1}"#.to_string(),
            created_at: now_iso(),
            started_at: None,
            finished_at: None,
            lease_owner: None,
            attempts: 0,
            exception_type: None,
            exception_code: None,
            exception_message: None,
        }
    }

    #[tokio::test]
    async fn reserve_is_fifo_and_exclusive() {
        let db = crate::Db::open_in_memory().await.expect("open");
        let first = pending_item("q");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = pending_item("q");
        db.insert_work_item(&first).await.expect("insert");
        db.insert_work_item(&second).await.expect("insert");

        let leased = db
            .reserve_work_item("q", "consumer-a", &now_iso())
            .await
            .expect("reserve")
            .expect("item");
        assert_eq!(leased.id, first.id);
        assert_eq!(leased.state, WorkItemState::InProgress);

        // Re-reserving by the same owner returns the held item, not the next.
        let again = db
            .reserve_work_item("q", "consumer-a", &now_iso())
            .await
            .expect("reserve")
            .expect("item");
        assert_eq!(again.id, first.id);

        // A different consumer gets the second item.
        let other = db
            .reserve_work_item("q", "consumer-b", &now_iso())
            .await
            .expect("reserve")
            .expect("item");
        assert_eq!(other.id, second.id);
    }

    #[tokio::test]
    async fn empty_queue_reserves_nothing() {
        let db = crate::Db::open_in_memory().await.expect("open");
        let leased = db
            .reserve_work_item("empty", "consumer", &now_iso())
            .await
            .expect("reserve");
        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn release_and_requeue_follow_the_state_machine() {
        let db = crate::Db::open_in_memory().await.expect("open");
        let item = pending_item("q");
        db.insert_work_item(&item).await.expect("insert");

        // Releasing an unleased item fails.
        let err = db
            .release_work_item(&item.id, WorkItemState::Done, &now_iso(), None, None, None)
            .await
            .expect_err("not leased");
        assert!(matches!(err, ServerError::NotFound(_)));

        db.reserve_work_item("q", "c", &now_iso())
            .await
            .expect("reserve");
        db.release_work_item(
            &item.id,
            WorkItemState::Failed,
            &now_iso(),
            Some("APPLICATION"),
            Some("E42"),
            Some("boom"),
        )
        .await
        .expect("release");

        let stored = db.get_work_item(&item.id).await.expect("get");
        assert_eq!(stored.state, WorkItemState::Failed);
        assert_eq!(stored.exception_code.as_deref(), Some("E42"));
        assert!(stored.lease_owner.is_none());

        db.requeue_work_item(&item.id).await.expect("requeue");
        let stored = db.get_work_item(&item.id).await.expect("get");
        assert_eq!(stored.state, WorkItemState::Pending);
        assert!(stored.exception_message.is_none());
    }

    #[tokio::test]
    async fn stats_count_by_state() {
        let db = crate::Db::open_in_memory().await.expect("open");
        for _ in 0..3 {
            db.insert_work_item(&pending_item("q")).await.expect("insert");
        }
        db.reserve_work_item("q", "c", &now_iso()).await.expect("reserve");
        let stats = db.work_item_stats("q").await.expect("stats");
        assert_eq!(stats.get("PENDING"), Some(&2));
        assert_eq!(stats.get("IN_PROGRESS"), Some(&1));
    }
}
