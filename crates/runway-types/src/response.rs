use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The first-class result envelope an action may return instead of a bare
/// value. When `error` is populated the run still PASSES: the error is the
/// action's answer, not an execution failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    /// Whether a returned JSON value has the envelope shape: an object whose
    /// keys are drawn from {result, error} with at least one present.
    pub fn matches(value: &Value) -> bool {
        let Some(obj) = value.as_object() else {
            return false;
        };
        if obj.is_empty() || !obj.keys().all(|k| k == "result" || k == "error") {
            return false;
        }
        obj.contains_key("result") || obj.contains_key("error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_shape_is_recognized() {
        assert!(ActionResponse::matches(&json!({"result": 3})));
        assert!(ActionResponse::matches(&json!({"error": "boom"})));
        assert!(ActionResponse::matches(&json!({"result": null, "error": "x"})));
        assert!(!ActionResponse::matches(&json!({"result": 1, "extra": 2})));
        assert!(!ActionResponse::matches(&json!({})));
        assert!(!ActionResponse::matches(&json!(3)));
    }
}
