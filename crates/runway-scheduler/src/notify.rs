use std::time::Duration;

use serde_json::json;

use runway_types::{Result, Schedule, ScheduleExecution, ServerError};

/// Outbound notification dispatch. Webhooks POST a JSON report with a 30s
/// budget; email needs SMTP settings the server does not carry, so the
/// attempt is recorded as a delivery error.
#[derive(Clone)]
pub struct NotificationService {
    client: reqwest::Client,
}

impl NotificationService {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn send_webhook(
        &self,
        schedule: &Schedule,
        execution: &ScheduleExecution,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let Some(url) = schedule.notification_webhook_url.as_deref() else {
            return Ok(());
        };
        let payload = json!({
            "schedule_id": schedule.id,
            "schedule_name": schedule.name,
            "execution_id": execution.id,
            "success": success,
            "status": if success { "completed" } else { "failed" },
            "error": error,
            "scheduled_time": execution.scheduled_time,
            "actual_start_time": execution.actual_start_time,
            "duration_ms": execution.duration_ms,
        });
        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ServerError::Transport(format!("webhook failed: {e}")))?;
        if response.status().as_u16() >= 400 {
            return Err(ServerError::Transport(format!(
                "webhook returned status {}",
                response.status().as_u16()
            )));
        }
        tracing::info!("sent webhook notification for schedule {}", schedule.id);
        Ok(())
    }

    pub async fn send_email(&self, schedule: &Schedule) -> Result<()> {
        tracing::warn!(
            "schedule {} requests email notification but no SMTP settings are configured",
            schedule.id
        );
        Err(ServerError::Transport(
            "email notifications not configured (no SMTP settings)".to_string(),
        ))
    }
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}
