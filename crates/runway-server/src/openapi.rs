// OpenAPI document generation. The document reflects the enabled actions at
// request time, so imports and disables show up without a restart.

use serde_json::{json, Map, Value};

use runway_types::{action_url_name, Result};

use crate::AppState;

pub async fn build(state: &AppState) -> Result<Value> {
    let mut paths = Map::new();

    for package in state.db.list_action_packages().await? {
        let package_segment = action_url_name(&package.name);
        for action in state.db.list_actions(&package.id).await? {
            if !action.enabled || !action.kind.is_tool_like() {
                continue;
            }
            let input_schema: Value =
                serde_json::from_str(&action.input_schema).unwrap_or_else(|_| json!({}));
            let output_schema: Value =
                serde_json::from_str(&action.output_schema).unwrap_or_else(|_| json!({}));
            let summary = action
                .docs
                .lines()
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            let path = format!(
                "/api/actions/{package_segment}/{}/run",
                action_url_name(&action.name)
            );
            paths.insert(
                path,
                json!({
                    "post": {
                        "operationId": format!("{}_{}", package_segment, action.name),
                        "summary": summary,
                        "description": action.docs,
                        "requestBody": {
                            "required": true,
                            "content": {
                                "application/json": {"schema": input_schema}
                            }
                        },
                        "responses": {
                            "200": {
                                "description": "Successful Response",
                                "content": {
                                    "application/json": {"schema": output_schema}
                                }
                            },
                            "422": {"description": "Invalid input"},
                            "500": {"description": "Action failed"}
                        },
                        "x-openai-isConsequential": action.is_consequential,
                    }
                }),
            );
        }
    }

    paths.insert(
        "/api/runs".to_string(),
        json!({
            "get": {
                "operationId": "list_runs",
                "summary": "List runs",
                "responses": {"200": {"description": "Successful Response"}}
            }
        }),
    );
    paths.insert(
        "/api/runs/{run_id}".to_string(),
        json!({
            "get": {
                "operationId": "get_run",
                "summary": "Get one run",
                "parameters": [{
                    "name": "run_id",
                    "in": "path",
                    "required": true,
                    "schema": {"type": "string"}
                }],
                "responses": {
                    "200": {"description": "Successful Response"},
                    "404": {"description": "Run not found"}
                }
            }
        }),
    );

    Ok(json!({
        "openapi": "3.1.0",
        "info": {
            "title": "Runway Action Server",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": paths,
    }))
}
