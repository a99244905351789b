// Trigger engine: webhook intake with signature verification, rate limiting
// and payload templating, fanning out to the run engine or the work-items
// queue. Signature and rate checks happen before any side effect.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use runway_store::Db;
use runway_types::{
    datetime_to_iso, gen_id, EventBus, ExecutionMode, Result, ServerError, ServerEvent, Trigger,
    TriggerInvocation, TriggerInvocationStatus,
};

mod signature;
mod template;

pub use signature::{verify_signature, SIGNATURE_HEADERS};
pub use template::{resolve_template, TemplateContext};

/// Where accepted webhooks send their work; wired by the server.
#[async_trait]
pub trait TriggerDispatcher: Send + Sync {
    async fn dispatch_run(
        &self,
        trigger: &Trigger,
        inputs: Value,
        request_id: String,
    ) -> Result<String>;

    async fn dispatch_work_item(&self, trigger: &Trigger, inputs: Value) -> Result<String>;
}

/// Outcome handed to the HTTP layer for status mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Accepted {
        invocation_id: String,
        run_id: Option<String>,
        work_item_id: Option<String>,
    },
    Rejected {
        message: String,
    },
    RateLimited,
    Error {
        message: String,
    },
    NotFound,
}

pub struct TriggerEngine {
    db: Db,
    dispatcher: Arc<dyn TriggerDispatcher>,
    event_bus: EventBus,
    rate: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl TriggerEngine {
    pub fn new(db: Db, dispatcher: Arc<dyn TriggerDispatcher>, event_bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            db,
            dispatcher,
            event_bus,
            rate: Mutex::new(HashMap::new()),
        })
    }

    /// Handle one incoming webhook. `raw_body` is the body exactly as
    /// received; object and array bodies are signed over their compact JSON
    /// encoding, anything else over the received bytes.
    pub async fn handle_webhook(
        &self,
        trigger_id: &str,
        payload: Value,
        raw_body: &[u8],
        headers: HashMap<String, String>,
        source_ip: Option<String>,
    ) -> Result<WebhookOutcome> {
        let now = Utc::now();
        let trigger = match self.db.get_trigger(trigger_id).await {
            Ok(trigger) => trigger,
            Err(ServerError::NotFound(_)) => return Ok(WebhookOutcome::NotFound),
            Err(other) => return Err(other),
        };
        if !trigger.enabled {
            return Ok(WebhookOutcome::Rejected {
                message: "Trigger is disabled".to_string(),
            });
        }

        let compacted;
        let mac_body: &[u8] = if payload.is_object() || payload.is_array() {
            compacted = serde_json::to_vec(&payload)?;
            &compacted
        } else {
            raw_body
        };

        if let Some(secret) = trigger.webhook_secret.as_deref() {
            if !secret.is_empty() && !verify_signature(secret, mac_body, &headers) {
                self.record(
                    &trigger,
                    now,
                    &payload,
                    &headers,
                    source_ip,
                    TriggerInvocationStatus::Rejected,
                    None,
                    None,
                    Some("Invalid signature"),
                )
                .await?;
                return Ok(WebhookOutcome::Rejected {
                    message: "Invalid signature".to_string(),
                });
            }
        }

        if !self.within_rate_limit(&trigger, now).await {
            self.record(
                &trigger,
                now,
                &payload,
                &headers,
                source_ip,
                TriggerInvocationStatus::RateLimited,
                None,
                None,
                Some("Rate limit exceeded"),
            )
            .await?;
            return Ok(WebhookOutcome::RateLimited);
        }

        let inputs = match self.apply_template(&trigger, &payload, &headers, now) {
            Ok(inputs) => inputs,
            Err(err) => {
                let message = format!("Template error: {err}");
                self.record(
                    &trigger,
                    now,
                    &payload,
                    &headers,
                    source_ip,
                    TriggerInvocationStatus::Error,
                    None,
                    None,
                    Some(&message),
                )
                .await?;
                return Ok(WebhookOutcome::Error { message });
            }
        };

        let dispatched = match trigger.execution_mode {
            ExecutionMode::Run => self
                .dispatcher
                .dispatch_run(&trigger, inputs, format!("trigger:{}", trigger.id))
                .await
                .map(|run_id| (Some(run_id), None)),
            ExecutionMode::WorkItem => self
                .dispatcher
                .dispatch_work_item(&trigger, inputs)
                .await
                .map(|item_id| (None, Some(item_id))),
        };

        match dispatched {
            Ok((run_id, work_item_id)) => {
                let invocation_id = self
                    .record(
                        &trigger,
                        now,
                        &payload,
                        &headers,
                        source_ip,
                        TriggerInvocationStatus::Accepted,
                        run_id.as_deref(),
                        work_item_id.as_deref(),
                        None,
                    )
                    .await?;
                self.db
                    .bump_trigger_stats(&trigger.id, &datetime_to_iso(now))
                    .await?;
                tracing::info!("trigger {} ({}) invoked", trigger.id, trigger.name);
                self.event_bus.publish(ServerEvent::new(
                    "trigger.invoked",
                    serde_json::json!({
                        "trigger_id": trigger.id,
                        "invocation_id": invocation_id,
                        "run_id": run_id,
                        "work_item_id": work_item_id,
                    }),
                ));
                Ok(WebhookOutcome::Accepted {
                    invocation_id,
                    run_id,
                    work_item_id,
                })
            }
            Err(err) => {
                let message = err.to_string();
                self.record(
                    &trigger,
                    now,
                    &payload,
                    &headers,
                    source_ip,
                    TriggerInvocationStatus::Error,
                    None,
                    None,
                    Some(&message),
                )
                .await?;
                Ok(WebhookOutcome::Error { message })
            }
        }
    }

    async fn within_rate_limit(&self, trigger: &Trigger, now: DateTime<Utc>) -> bool {
        if !trigger.rate_limit_enabled {
            return true;
        }
        let minute_ago = now - chrono::Duration::seconds(60);
        let mut rate = self.rate.lock().await;
        let stamps = rate.entry(trigger.id.clone()).or_default();
        stamps.retain(|t| *t > minute_ago);
        if stamps.len() as i64 >= trigger.rate_limit_max_per_minute {
            return false;
        }
        stamps.push(now);
        true
    }

    fn apply_template(
        &self,
        trigger: &Trigger,
        payload: &Value,
        headers: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<Value> {
        let Some(raw) = trigger
            .inputs_template_json
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        else {
            // No template: object payloads pass through, everything else is
            // wrapped.
            return Ok(if payload.is_object() {
                payload.clone()
            } else {
                serde_json::json!({ "payload": payload })
            });
        };
        let template: Value = serde_json::from_str(raw)
            .map_err(|e| ServerError::Validation(format!("bad inputs template: {e}")))?;
        let timestamp = datetime_to_iso(now);
        let ctx = TemplateContext {
            payload,
            headers,
            trigger_id: &trigger.id,
            trigger_name: &trigger.name,
            timestamp: &timestamp,
        };
        Ok(resolve_template(&template, &ctx))
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        trigger: &Trigger,
        now: DateTime<Utc>,
        payload: &Value,
        headers: &HashMap<String, String>,
        source_ip: Option<String>,
        status: TriggerInvocationStatus,
        run_id: Option<&str>,
        work_item_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<String> {
        let invocation = TriggerInvocation {
            id: gen_id("tinv"),
            trigger_id: trigger.id.clone(),
            invoked_at: datetime_to_iso(now),
            source_ip,
            payload_json: Some(payload.to_string()),
            headers_json: Some(serde_json::to_string(headers)?),
            status,
            run_id: run_id.map(|s| s.to_string()),
            work_item_id: work_item_id.map(|s| s.to_string()),
            error_message: error_message.map(|s| s.to_string()),
        };
        self.db.record_trigger_invocation(&invocation).await?;
        Ok(invocation.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockDispatcher {
        runs: AtomicUsize,
        items: AtomicUsize,
        last_inputs: Mutex<Option<Value>>,
    }

    impl MockDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                items: AtomicUsize::new(0),
                last_inputs: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl TriggerDispatcher for MockDispatcher {
        async fn dispatch_run(
            &self,
            _trigger: &Trigger,
            inputs: Value,
            request_id: String,
        ) -> Result<String> {
            assert!(request_id.starts_with("trigger:"));
            *self.last_inputs.lock().await = Some(inputs);
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(format!("run-{n}"))
        }

        async fn dispatch_work_item(&self, _trigger: &Trigger, inputs: Value) -> Result<String> {
            *self.last_inputs.lock().await = Some(inputs);
            let n = self.items.fetch_add(1, Ordering::SeqCst);
            Ok(format!("wi-{n}"))
        }
    }

    fn base_trigger(id: &str) -> Trigger {
        Trigger {
            id: id.to_string(),
            name: "deploy-hook".to_string(),
            enabled: true,
            // The mock dispatcher never resolves the action row.
            action_id: None,
            execution_mode: ExecutionMode::Run,
            work_item_queue: None,
            inputs_template_json: None,
            webhook_secret: None,
            rate_limit_enabled: false,
            rate_limit_max_per_minute: 60,
            last_triggered_at: None,
            trigger_count: 0,
            created_at: runway_types::now_iso(),
            updated_at: runway_types::now_iso(),
        }
    }

    async fn engine_with_trigger(trigger: &Trigger) -> (Arc<TriggerEngine>, Db, Arc<MockDispatcher>) {
        let db = Db::open_in_memory().await.expect("db");
        db.insert_trigger(trigger).await.expect("trigger");
        let dispatcher = MockDispatcher::new();
        let engine = TriggerEngine::new(db.clone(), dispatcher.clone(), EventBus::new());
        (engine, db, dispatcher)
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[tokio::test]
    async fn accepted_webhook_records_invocation_and_bumps_stats() {
        let trigger = base_trigger("trig-ok");
        let (engine, db, dispatcher) = engine_with_trigger(&trigger).await;

        let outcome = engine
            .handle_webhook(
                "trig-ok",
                json!({"x": 1}),
                br#"{"x":1}"#,
                HashMap::new(),
                Some("10.0.0.1".to_string()),
            )
            .await
            .expect("handle");

        match outcome {
            WebhookOutcome::Accepted { run_id, .. } => {
                assert_eq!(run_id.as_deref(), Some("run-0"));
            }
            other => panic!("expected accepted, got {other:?}"),
        }
        assert_eq!(dispatcher.runs.load(Ordering::SeqCst), 1);

        let invocations = db.list_trigger_invocations("trig-ok", 10).await.expect("list");
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].status, TriggerInvocationStatus::Accepted);
        assert_eq!(invocations[0].source_ip.as_deref(), Some("10.0.0.1"));

        let stored = db.get_trigger("trig-ok").await.expect("get");
        assert_eq!(stored.trigger_count, 1);
        assert!(stored.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn hmac_validated_webhook_accepts_and_a_flipped_byte_rejects() {
        let mut trigger = base_trigger("trig-hmac");
        trigger.webhook_secret = Some("s".to_string());
        let (engine, db, _) = engine_with_trigger(&trigger).await;

        let body = br#"{"x":1}"#;
        let mut headers = HashMap::new();
        headers.insert("x-hub-signature-256".to_string(), sign("s", body));

        let outcome = engine
            .handle_webhook("trig-hmac", json!({"x": 1}), body, headers.clone(), None)
            .await
            .expect("handle");
        assert!(matches!(outcome, WebhookOutcome::Accepted { .. }));

        // Flip one character in the signature.
        let mut bad = headers["x-hub-signature-256"].clone();
        let last = bad.pop().unwrap();
        bad.push(if last == 'a' { 'b' } else { 'a' });
        let mut bad_headers = HashMap::new();
        bad_headers.insert("x-hub-signature-256".to_string(), bad);

        let outcome = engine
            .handle_webhook("trig-hmac", json!({"x": 1}), body, bad_headers, None)
            .await
            .expect("handle");
        assert!(matches!(outcome, WebhookOutcome::Rejected { .. }));

        let invocations = db
            .list_trigger_invocations("trig-hmac", 10)
            .await
            .expect("list");
        let accepted = invocations
            .iter()
            .filter(|i| i.status == TriggerInvocationStatus::Accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn pretty_printed_body_verifies_against_the_compact_encoding() {
        let mut trigger = base_trigger("trig-pretty");
        trigger.webhook_secret = Some("s".to_string());
        let (engine, _, _) = engine_with_trigger(&trigger).await;

        // Sender signs the compact encoding; the wire body is pretty-printed.
        let payload = json!({"x": 1});
        let wire_body = b"{\n  \"x\": 1\n}";
        let mut headers = HashMap::new();
        headers.insert(
            "x-hub-signature-256".to_string(),
            sign("s", &serde_json::to_vec(&payload).unwrap()),
        );

        let outcome = engine
            .handle_webhook("trig-pretty", payload, wire_body, headers, None)
            .await
            .expect("handle");
        assert!(matches!(outcome, WebhookOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn missing_signature_rejects_when_secret_is_set() {
        let mut trigger = base_trigger("trig-nosig");
        trigger.webhook_secret = Some("s".to_string());
        let (engine, _, dispatcher) = engine_with_trigger(&trigger).await;

        let outcome = engine
            .handle_webhook("trig-nosig", json!({}), b"{}", HashMap::new(), None)
            .await
            .expect("handle");
        assert!(matches!(outcome, WebhookOutcome::Rejected { .. }));
        assert_eq!(dispatcher.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_trigger_leaves_no_record() {
        let trigger = base_trigger("trig-known");
        let (engine, db, _) = engine_with_trigger(&trigger).await;

        let outcome = engine
            .handle_webhook("trig-ghost", json!({}), b"{}", HashMap::new(), None)
            .await
            .expect("handle");
        assert_eq!(outcome, WebhookOutcome::NotFound);
        let invocations = db
            .list_trigger_invocations("trig-ghost", 10)
            .await
            .expect("list");
        assert!(invocations.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_kicks_in_per_rolling_minute() {
        let mut trigger = base_trigger("trig-rate");
        trigger.rate_limit_enabled = true;
        trigger.rate_limit_max_per_minute = 2;
        let (engine, db, _) = engine_with_trigger(&trigger).await;

        for _ in 0..2 {
            let outcome = engine
                .handle_webhook("trig-rate", json!({}), b"{}", HashMap::new(), None)
                .await
                .expect("handle");
            assert!(matches!(outcome, WebhookOutcome::Accepted { .. }));
        }
        let outcome = engine
            .handle_webhook("trig-rate", json!({}), b"{}", HashMap::new(), None)
            .await
            .expect("handle");
        assert_eq!(outcome, WebhookOutcome::RateLimited);

        let invocations = db
            .list_trigger_invocations("trig-rate", 10)
            .await
            .expect("list");
        assert_eq!(
            invocations
                .iter()
                .filter(|i| i.status == TriggerInvocationStatus::RateLimited)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn template_resolves_before_dispatch() {
        let mut trigger = base_trigger("trig-tpl");
        trigger.inputs_template_json = Some(
            json!({
                "repo": "{{payload.repository.name}}",
                "stars": "{{payload.repository.stars}}",
                "from": "{{meta.trigger_name}}",
            })
            .to_string(),
        );
        let (engine, _, dispatcher) = engine_with_trigger(&trigger).await;

        let payload = json!({"repository": {"name": "runway", "stars": 42}});
        engine
            .handle_webhook("trig-tpl", payload.clone(), b"{}", HashMap::new(), None)
            .await
            .expect("handle");

        let inputs = dispatcher.last_inputs.lock().await.clone().expect("inputs");
        assert_eq!(inputs["repo"], json!("runway"));
        assert_eq!(inputs["stars"], json!(42));
        assert_eq!(inputs["from"], json!("deploy-hook"));
    }

    #[tokio::test]
    async fn work_item_mode_seeds_the_queue() {
        let mut trigger = base_trigger("trig-wi");
        trigger.execution_mode = ExecutionMode::WorkItem;
        trigger.work_item_queue = Some("ingest".to_string());
        let (engine, db, dispatcher) = engine_with_trigger(&trigger).await;

        let outcome = engine
            .handle_webhook("trig-wi", json!({"k": 1}), b"{}", HashMap::new(), None)
            .await
            .expect("handle");
        match outcome {
            WebhookOutcome::Accepted { work_item_id, run_id, .. } => {
                assert_eq!(work_item_id.as_deref(), Some("wi-0"));
                assert!(run_id.is_none());
            }
            other => panic!("expected accepted, got {other:?}"),
        }
        assert_eq!(dispatcher.items.load(Ordering::SeqCst), 1);

        let invocations = db.list_trigger_invocations("trig-wi", 10).await.expect("list");
        assert_eq!(invocations[0].work_item_id.as_deref(), Some("wi-0"));
    }
}
