// Producer/consumer work-items queue over the store. Items move
// PENDING -> IN_PROGRESS -> {DONE, FAILED}; reservation is atomic and a
// consumer crash leaves the row IN_PROGRESS for an admin to requeue.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use runway_store::Db;
use runway_types::{
    gen_id, now_iso, EventBus, Result, ServerEvent, WorkItem, WorkItemState,
};

/// Variables consumer subprocesses read to reach this queue over REST.
pub fn adapter_env(server_url: &str, api_key: Option<&str>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("RC_WORKITEM_ADAPTER".to_string(), "RequestsAdapter".to_string());
    env.insert("RC_WORKITEM_SERVER_URL".to_string(), server_url.to_string());
    if let Some(key) = api_key {
        env.insert("RC_WORKITEM_API_KEY".to_string(), key.to_string());
    }
    env
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: i64,
    pub in_progress: i64,
    pub done: i64,
    pub failed: i64,
    pub total: i64,
}

#[derive(Clone)]
pub struct WorkItemQueue {
    db: Db,
    event_bus: EventBus,
}

impl WorkItemQueue {
    pub fn new(db: Db, event_bus: EventBus) -> Self {
        Self { db, event_bus }
    }

    /// Producer side: append one PENDING item.
    pub async fn seed_input(&self, payload: Value, queue_name: &str) -> Result<WorkItem> {
        let item = WorkItem {
            id: gen_id("wi"),
            queue_name: queue_name.to_string(),
            state: WorkItemState::Pending,
            payload_json: payload.to_string(),
            created_at: now_iso(),
            started_at: None,
            finished_at: None,
            lease_owner: None,
            attempts: 0,
            exception_type: None,
            exception_code: None,
            exception_message: None,
        };
        self.db.insert_work_item(&item).await?;
        tracing::debug!("seeded work item {} onto queue '{queue_name}'", item.id);
        self.event_bus.publish(ServerEvent::new(
            "work_item.seeded",
            serde_json::json!({"work_item_id": item.id, "queue_name": queue_name}),
        ));
        Ok(item)
    }

    /// Consumer side: lease the oldest pending item, or None when the queue
    /// is empty.
    pub async fn reserve(&self, queue_name: &str, lease_owner: &str) -> Result<Option<WorkItem>> {
        self.db
            .reserve_work_item(queue_name, lease_owner, &now_iso())
            .await
    }

    /// At-least-once release: DONE or FAILED with an optional exception
    /// triple.
    pub async fn release(
        &self,
        item_id: &str,
        state: WorkItemState,
        exception: Option<(String, String, String)>,
    ) -> Result<()> {
        let (exc_type, exc_code, exc_message) = match &exception {
            Some((t, c, m)) => (Some(t.as_str()), Some(c.as_str()), Some(m.as_str())),
            None => (None, None, None),
        };
        self.db
            .release_work_item(item_id, state, &now_iso(), exc_type, exc_code, exc_message)
            .await?;
        self.event_bus.publish(ServerEvent::new(
            "work_item.released",
            serde_json::json!({"work_item_id": item_id, "state": state}),
        ));
        Ok(())
    }

    /// Admin action: FAILED back to PENDING.
    pub async fn requeue(&self, item_id: &str) -> Result<()> {
        self.db.requeue_work_item(item_id).await
    }

    pub async fn get(&self, item_id: &str) -> Result<WorkItem> {
        self.db.get_work_item(item_id).await
    }

    pub async fn list(
        &self,
        queue_name: &str,
        state: Option<WorkItemState>,
        limit: i64,
    ) -> Result<Vec<WorkItem>> {
        self.db.list_work_items(queue_name, state, limit).await
    }

    pub async fn stats(&self, queue_name: &str) -> Result<QueueStats> {
        let counts = self.db.work_item_stats(queue_name).await?;
        let get = |state: WorkItemState| counts.get(state.as_str()).copied().unwrap_or(0);
        let stats = QueueStats {
            queue_name: queue_name.to_string(),
            pending: get(WorkItemState::Pending),
            in_progress: get(WorkItemState::InProgress),
            done: get(WorkItemState::Done),
            failed: get(WorkItemState::Failed),
            total: counts.values().sum(),
        };
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn queue() -> WorkItemQueue {
        let db = Db::open_in_memory().await.expect("db");
        WorkItemQueue::new(db, EventBus::new())
    }

    #[tokio::test]
    async fn produce_consume_cycle() {
        let queue = queue().await;
        let seeded = queue
            .seed_input(json!({"order": 17}), "orders")
            .await
            .expect("seed");
        assert_eq!(seeded.state, WorkItemState::Pending);

        let leased = queue
            .reserve("orders", "consumer-1")
            .await
            .expect("reserve")
            .expect("item");
        assert_eq!(leased.id, seeded.id);
        assert_eq!(leased.state, WorkItemState::InProgress);
        assert_eq!(leased.attempts, 1);

        queue
            .release(&leased.id, WorkItemState::Done, None)
            .await
            .expect("release");

        let stats = queue.stats("orders").await.expect("stats");
        assert_eq!(stats.done, 1);
        assert_eq!(stats.total, 1);
        assert!(queue.reserve("orders", "consumer-1").await.expect("empty").is_none());
    }

    #[tokio::test]
    async fn failed_release_keeps_exception_and_requeue_resets() {
        let queue = queue().await;
        let seeded = queue.seed_input(json!({}), "q").await.expect("seed");
        queue.reserve("q", "c").await.expect("reserve");

        queue
            .release(
                &seeded.id,
                WorkItemState::Failed,
                Some((
                    "BUSINESS".to_string(),
                    "INVALID_ORDER".to_string(),
                    "order id missing".to_string(),
                )),
            )
            .await
            .expect("release");

        let stored = queue.get(&seeded.id).await.expect("get");
        assert_eq!(stored.state, WorkItemState::Failed);
        assert_eq!(stored.exception_code.as_deref(), Some("INVALID_ORDER"));

        queue.requeue(&seeded.id).await.expect("requeue");
        let again = queue
            .reserve("q", "c")
            .await
            .expect("reserve")
            .expect("item");
        assert_eq!(again.id, seeded.id);
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn adapter_env_carries_the_wiring() {
        let env = adapter_env("http://127.0.0.1:8080", Some("Foo"));
        assert_eq!(env["RC_WORKITEM_ADAPTER"], "RequestsAdapter");
        assert_eq!(env["RC_WORKITEM_SERVER_URL"], "http://127.0.0.1:8080");
        assert_eq!(env["RC_WORKITEM_API_KEY"], "Foo");
        assert!(adapter_env("http://x", None).get("RC_WORKITEM_API_KEY").is_none());
    }
}
