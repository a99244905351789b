// MCP bridge: every package is re-exposed at /{package}/mcp (streamable
// HTTP) and /{package}/sse (SSE sessions). Actions with a tool-like kind
// become tools, prompt actions become prompts, resource actions become
// resources; calls run through the ordinary run engine.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use runway_types::{Action, ActionKind, RunStatus};

use crate::http::resolve_action;
use crate::AppState;

const PROTOCOL_VERSION: &str = "2024-11-05";

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

pub async fn streamable_http(
    State(state): State<AppState>,
    Path(package): Path<String>,
    Json(frame): Json<Value>,
) -> Response {
    match handle_frame(&state, &package, &frame).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    session_id: String,
}

pub async fn sse_connect(
    State(state): State<AppState>,
    Path(package): Path<String>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<Value>(64);
    state
        .mcp_sessions
        .write()
        .await
        .insert(session_id.clone(), tx);
    tracing::debug!("mcp sse session {session_id} opened for package {package}");

    let endpoint = tokio_stream::once(Ok(Event::default()
        .event("endpoint")
        .data(format!("/{package}/sse/message?session_id={session_id}"))));
    let messages = ReceiverStream::new(rx)
        .map(|frame| Ok(Event::default().event("message").data(frame.to_string())));
    Sse::new(endpoint.chain(messages))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

pub async fn sse_message(
    State(state): State<AppState>,
    Path(package): Path<String>,
    Query(query): Query<SessionQuery>,
    Json(frame): Json<Value>,
) -> Response {
    let sender = state
        .mcp_sessions
        .read()
        .await
        .get(&query.session_id)
        .cloned();
    let Some(sender) = sender else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "unknown session"})),
        )
            .into_response();
    };

    if let Some(response) = handle_frame(&state, &package, &frame).await {
        if sender.send(response).await.is_err() {
            // Client went away; drop the session.
            state.mcp_sessions.write().await.remove(&query.session_id);
            return StatusCode::GONE.into_response();
        }
    }
    StatusCode::ACCEPTED.into_response()
}

fn rpc_result(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn rpc_error(id: &Value, code: i64, message: String) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

/// Handle one JSON-RPC frame. Notifications return None.
async fn handle_frame(state: &AppState, package: &str, frame: &Value) -> Option<Value> {
    let method = frame.get("method").and_then(|m| m.as_str())?;
    let id = frame.get("id").cloned();
    let params = frame.get("params").cloned().unwrap_or_else(|| json!({}));

    if method.starts_with("notifications/") {
        return None;
    }
    let id = id.unwrap_or(Value::Null);

    let response = match method {
        "initialize" => rpc_result(
            &id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {},
                    "prompts": {},
                    "resources": {},
                },
                "serverInfo": {
                    "name": package,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "ping" => rpc_result(&id, json!({})),
        "tools/list" => match package_actions(state, package).await {
            Ok(actions) => {
                let tools: Vec<Value> = actions
                    .iter()
                    .filter(|a| a.kind.is_tool_like())
                    .map(|a| {
                        json!({
                            "name": a.name,
                            "description": a.docs,
                            "inputSchema": parse_schema(&a.input_schema),
                        })
                    })
                    .collect();
                rpc_result(&id, json!({"tools": tools}))
            }
            Err(message) => rpc_error(&id, INVALID_PARAMS, message),
        },
        "tools/call" => call_tool(state, package, &id, &params).await,
        "prompts/list" => match package_actions(state, package).await {
            Ok(actions) => {
                let prompts: Vec<Value> = actions
                    .iter()
                    .filter(|a| a.kind == ActionKind::Prompt)
                    .map(|a| {
                        json!({
                            "name": a.name,
                            "description": a.docs,
                            "arguments": prompt_arguments(a),
                        })
                    })
                    .collect();
                rpc_result(&id, json!({"prompts": prompts}))
            }
            Err(message) => rpc_error(&id, INVALID_PARAMS, message),
        },
        "prompts/get" => get_prompt(state, package, &id, &params).await,
        "resources/list" => match package_actions(state, package).await {
            Ok(actions) => {
                let resources: Vec<Value> = actions
                    .iter()
                    .filter_map(|a| {
                        let uri = resource_uri(a)?;
                        if uri.contains('{') {
                            return None;
                        }
                        Some(json!({
                            "uri": uri,
                            "name": a.name,
                            "description": a.docs,
                            "mimeType": "text/plain",
                        }))
                    })
                    .collect();
                rpc_result(&id, json!({"resources": resources}))
            }
            Err(message) => rpc_error(&id, INVALID_PARAMS, message),
        },
        "resources/templates/list" => match package_actions(state, package).await {
            Ok(actions) => {
                let templates: Vec<Value> = actions
                    .iter()
                    .filter_map(|a| {
                        let uri = resource_uri(a)?;
                        if !uri.contains('{') {
                            return None;
                        }
                        Some(json!({
                            "uriTemplate": uri,
                            "name": a.name,
                            "description": a.docs,
                            "mimeType": "text/plain",
                        }))
                    })
                    .collect();
                rpc_result(&id, json!({"resourceTemplates": templates}))
            }
            Err(message) => rpc_error(&id, INVALID_PARAMS, message),
        },
        "resources/read" => read_resource(state, package, &id, &params).await,
        other => rpc_error(&id, METHOD_NOT_FOUND, format!("unknown method: {other}")),
    };
    Some(response)
}

async fn package_actions(state: &AppState, package: &str) -> Result<Vec<Action>, String> {
    let package = state
        .db
        .get_action_package_by_name(package)
        .await
        .map_err(|e| e.to_string())?;
    let actions = state
        .db
        .list_actions(&package.id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(actions.into_iter().filter(|a| a.enabled).collect())
}

fn parse_schema(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!({"type": "object"}))
}

fn prompt_arguments(action: &Action) -> Vec<Value> {
    let schema = parse_schema(&action.input_schema);
    let required: Vec<String> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|properties| {
            properties
                .iter()
                .map(|(name, prop)| {
                    json!({
                        "name": name,
                        "description": prop.get("description").cloned()
                            .or_else(|| prop.get("title").cloned())
                            .unwrap_or(Value::Null),
                        "required": required.contains(name),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn resource_uri(action: &Action) -> Option<String> {
    if action.kind != ActionKind::Resource {
        return None;
    }
    let options: Value = serde_json::from_str(action.options_json.as_deref()?).ok()?;
    options
        .get("uri")
        .and_then(|u| u.as_str())
        .map(|u| u.to_string())
}

async fn call_tool(state: &AppState, package: &str, id: &Value, params: &Value) -> Value {
    let Some(name) = params.get("name").and_then(|n| n.as_str()) else {
        return rpc_error(id, INVALID_PARAMS, "missing tool name".to_string());
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let action = match resolve_action(state, package, name).await {
        Ok(action) => action,
        Err(err) => return rpc_error(id, INVALID_PARAMS, err.to_string()),
    };
    if !action.kind.is_tool_like() {
        return rpc_error(id, INVALID_PARAMS, format!("{name} is not a tool"));
    }

    match state
        .run_engine
        .run_action(&action, &arguments, Some(format!("mcp:{package}")), Map::new())
        .await
    {
        Ok(run) if run.status == RunStatus::Passed => {
            let text = run
                .result
                .as_deref()
                .map(result_text)
                .unwrap_or_default();
            rpc_result(
                id,
                json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": false,
                }),
            )
        }
        Ok(run) => rpc_result(
            id,
            json!({
                "content": [{
                    "type": "text",
                    "text": run.error_message.unwrap_or_else(|| "action failed".to_string()),
                }],
                "isError": true,
            }),
        ),
        Err(err) => rpc_error(id, INTERNAL_ERROR, err.to_string()),
    }
}

/// String results unwrap to their inner text; everything else stays JSON.
fn result_text(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(text)) => text,
        Ok(other) => other.to_string(),
        Err(_) => raw.to_string(),
    }
}

async fn get_prompt(state: &AppState, package: &str, id: &Value, params: &Value) -> Value {
    let Some(name) = params.get("name").and_then(|n| n.as_str()) else {
        return rpc_error(id, INVALID_PARAMS, "missing prompt name".to_string());
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let action = match resolve_action(state, package, name).await {
        Ok(action) => action,
        Err(err) => return rpc_error(id, INVALID_PARAMS, err.to_string()),
    };
    if action.kind != ActionKind::Prompt {
        return rpc_error(id, INVALID_PARAMS, format!("{name} is not a prompt"));
    }

    match state
        .run_engine
        .run_action(&action, &arguments, Some(format!("mcp:{package}")), Map::new())
        .await
    {
        Ok(run) if run.status == RunStatus::Passed => {
            let text = run.result.as_deref().map(result_text).unwrap_or_default();
            rpc_result(
                id,
                json!({
                    "description": action.docs,
                    "messages": [{
                        "role": "user",
                        "content": {"type": "text", "text": text},
                    }],
                }),
            )
        }
        Ok(run) => rpc_error(
            id,
            INTERNAL_ERROR,
            run.error_message.unwrap_or_else(|| "prompt failed".to_string()),
        ),
        Err(err) => rpc_error(id, INTERNAL_ERROR, err.to_string()),
    }
}

async fn read_resource(state: &AppState, package: &str, id: &Value, params: &Value) -> Value {
    let Some(uri) = params.get("uri").and_then(|u| u.as_str()) else {
        return rpc_error(id, INVALID_PARAMS, "missing resource uri".to_string());
    };
    let actions = match package_actions(state, package).await {
        Ok(actions) => actions,
        Err(message) => return rpc_error(id, INVALID_PARAMS, message),
    };

    for action in actions.iter().filter(|a| a.kind == ActionKind::Resource) {
        let Some(template) = resource_uri(action) else {
            continue;
        };
        let Some(arguments) = match_uri(&template, uri) else {
            continue;
        };
        return match state
            .run_engine
            .run_action(
                action,
                &Value::Object(arguments),
                Some(format!("mcp:{package}")),
                Map::new(),
            )
            .await
        {
            Ok(run) if run.status == RunStatus::Passed => {
                let text = run.result.as_deref().map(result_text).unwrap_or_default();
                rpc_result(
                    id,
                    json!({
                        "contents": [{
                            "uri": uri,
                            "mimeType": "text/plain",
                            "text": text,
                        }],
                    }),
                )
            }
            Ok(run) => rpc_error(
                id,
                INTERNAL_ERROR,
                run.error_message.unwrap_or_else(|| "resource failed".to_string()),
            ),
            Err(err) => rpc_error(id, INTERNAL_ERROR, err.to_string()),
        };
    }
    rpc_error(id, INVALID_PARAMS, format!("unknown resource: {uri}"))
}

/// Match a URI against a `custom://path/{param}` template, extracting
/// parameters. An exact template matches with no parameters.
fn match_uri(template: &str, uri: &str) -> Option<Map<String, Value>> {
    let mut params = Map::new();
    let template_parts: Vec<&str> = template.split('/').collect();
    let uri_parts: Vec<&str> = uri.split('/').collect();
    if template_parts.len() != uri_parts.len() {
        return None;
    }
    for (part, actual) in template_parts.iter().zip(uri_parts.iter()) {
        if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            params.insert(name.to_string(), Value::String((*actual).to_string()));
        } else if part != actual {
            return None;
        }
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_types::gen_id;

    #[test]
    fn uri_templates_match_and_extract() {
        let params = match_uri("custom://my/resource/{name}", "custom://my/resource/John")
            .expect("match");
        assert_eq!(params["name"], json!("John"));

        assert!(match_uri("custom://my/resource/simple", "custom://my/resource/simple")
            .expect("exact")
            .is_empty());
        assert!(match_uri("custom://my/resource/{name}", "custom://other/John").is_none());
        assert!(match_uri("custom://a/{x}", "custom://a/b/c").is_none());
    }

    #[test]
    fn prompt_arguments_come_from_the_input_schema() {
        let action = Action {
            id: gen_id("act"),
            action_package_id: gen_id("ap"),
            name: "my_prompt".to_string(),
            docs: "A prompt.".to_string(),
            file: "actions.py".to_string(),
            lineno: 1,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "topic": {"type": "string", "title": "Topic"},
                    "tone": {"type": "string", "title": "Tone"},
                },
                "required": ["topic"],
            })
            .to_string(),
            output_schema: json!({"type": "string"}).to_string(),
            managed_params_json: None,
            options_json: None,
            is_consequential: None,
            enabled: true,
            kind: ActionKind::Prompt,
        };
        let arguments = prompt_arguments(&action);
        assert_eq!(arguments.len(), 2);
        let topic = arguments
            .iter()
            .find(|a| a["name"] == "topic")
            .expect("topic");
        assert_eq!(topic["required"], json!(true));
        let tone = arguments.iter().find(|a| a["name"] == "tone").expect("tone");
        assert_eq!(tone["required"], json!(false));
    }

    #[test]
    fn result_text_unwraps_strings_only() {
        assert_eq!(result_text("\"Hello Mr. John.\""), "Hello Mr. John.");
        assert_eq!(result_text("3.0"), "3.0");
        assert_eq!(result_text(r#"{"a":1}"#), r#"{"a":1}"#);
    }
}
