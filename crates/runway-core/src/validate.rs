use serde_json::Value;

use runway_types::{Result, ServerError};

/// Validate caller inputs against the action's input schema. Failures map to
/// HTTP 422 at the surface.
pub fn validate_input(schema_json: &str, inputs: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(schema_json)
        .map_err(|e| ServerError::Infrastructure(format!("stored input schema is invalid: {e}")))?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| ServerError::Infrastructure(format!("cannot compile input schema: {e}")))?;
    if let Some(error) = validator.iter_errors(inputs).next() {
        return Err(ServerError::Validation(format!(
            "invalid inputs: {error} (at {})",
            error.instance_path
        )));
    }
    Ok(())
}

/// Check a returned value against the action's output schema. The error
/// string is the wire contract, so it is rendered here rather than taken
/// from the validator.
pub fn check_output(schema_json: &str, value: &Value) -> std::result::Result<(), String> {
    let Ok(schema) = serde_json::from_str::<Value>(schema_json) else {
        return Ok(());
    };
    if schema.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        return Ok(());
    }
    let Ok(validator) = jsonschema::validator_for(&schema) else {
        return Ok(());
    };
    if validator.is_valid(value) {
        return Ok(());
    }

    let message = match schema.get("type").and_then(|t| t.as_str()) {
        Some(expected) => format!(
            "Inconsistent value returned from action: {} is not of type '{}'",
            py_repr(value),
            expected
        ),
        None => {
            let detail = validator
                .iter_errors(value)
                .next()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "schema mismatch".to_string());
            format!("Inconsistent value returned from action: {detail}")
        }
    };
    Err(message)
}

/// Values rendered the way the original server reports them.
fn py_repr(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SUM_SCHEMA: &str = r#"{
        "type": "object",
        "properties": {
            "v1": {"type": "number"},
            "v2": {"type": "number"}
        },
        "required": ["v1", "v2"],
        "additionalProperties": false
    }"#;

    #[test]
    fn valid_inputs_pass() {
        validate_input(SUM_SCHEMA, &json!({"v1": 1.0, "v2": 2.0})).expect("valid");
    }

    #[test]
    fn missing_required_input_is_a_validation_error() {
        let err = validate_input(SUM_SCHEMA, &json!({"v1": 1.0})).expect_err("invalid");
        assert!(matches!(err, ServerError::Validation(_)));
    }

    #[test]
    fn wrong_type_is_a_validation_error() {
        let err = validate_input(SUM_SCHEMA, &json!({"v1": "x", "v2": 2.0})).expect_err("invalid");
        assert!(err.to_string().contains("invalid inputs"));
    }

    #[test]
    fn none_for_string_renders_the_contract_message() {
        let err = check_output(r#"{"type": "string"}"#, &Value::Null).expect_err("mismatch");
        assert_eq!(
            err,
            "Inconsistent value returned from action: None is not of type 'string'"
        );
    }

    #[test]
    fn matching_output_passes() {
        check_output(r#"{"type": "number"}"#, &json!(3.0)).expect("valid");
        check_output(r#"{"type": "string"}"#, &json!("ok")).expect("valid");
    }

    #[test]
    fn empty_schema_accepts_anything() {
        check_output("{}", &json!({"anything": true})).expect("valid");
    }
}
