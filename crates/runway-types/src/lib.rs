mod entities;
mod error;
mod event_bus;
mod response;

pub use entities::*;
pub use error::{Result, ServerError};
pub use event_bus::{EventBus, ServerEvent};
pub use response::ActionResponse;

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

/// Generates an opaque id whose prefix indicates the entity kind
/// (`run-…`, `act-…`, `ap-…`, `sched-…`).
pub fn gen_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Current time as the canonical ISO-8601 UTC string stored in the database.
/// The format is fixed so that string comparison orders chronologically.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn datetime_to_iso(dt: chrono::DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The URL segment an action is served under: `calculator_sum` becomes
/// `calculator-sum`.
pub fn action_url_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_id_carries_prefix() {
        let id = gen_id("run");
        assert!(id.starts_with("run-"));
        assert!(id.len() > 10);
    }

    #[test]
    fn url_names_are_dashed() {
        assert_eq!(action_url_name("calculator_sum"), "calculator-sum");
        assert_eq!(action_url_name("Greet"), "greet");
    }

    #[test]
    fn iso_timestamps_order_lexicographically() {
        let a = datetime_to_iso(chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let b = datetime_to_iso(chrono::DateTime::from_timestamp(1_700_000_001, 0).unwrap());
        assert!(a < b);
    }
}
