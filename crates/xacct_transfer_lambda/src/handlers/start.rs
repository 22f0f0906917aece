use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use xacct_transfer_core::contract::StartPayload;

use crate::error::PipelineError;
use crate::handlers::orchestrator::{ExecutionOutcome, Orchestrator};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiGatewayResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: Value,
    pub body: String,
}

/// How the execution was triggered, which decides the response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// HTTP front door; the payload sits in `body`.
    ApiGateway,
    /// Scheduler rule; an optional payload sits in `detail`.
    Scheduled,
    /// Direct invocation with the payload as the event.
    Direct,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartEvent {
    pub trigger: TriggerKind,
    pub payload: StartPayload,
}

/// Unwraps the trigger envelope around a start payload.
pub fn parse_start_event(event: Value) -> Result<StartEvent, String> {
    let Some(object) = event.as_object() else {
        return Err("Request payload must be a JSON object".to_string());
    };

    let (trigger, payload) = if let Some(body) = object.get("body") {
        let payload = match body {
            Value::Null => json!({}),
            Value::Object(_) => body.clone(),
            Value::String(text) if text.trim().is_empty() => json!({}),
            Value::String(text) => serde_json::from_str(text)
                .map_err(|error| format!("Malformed JSON body: {error}"))?,
            _ => return Err("Request body must be a JSON object".to_string()),
        };
        (TriggerKind::ApiGateway, payload)
    } else if object.contains_key("detail-type") {
        let payload = match object.get("detail") {
            Some(Value::Object(detail)) => Value::Object(detail.clone()),
            _ => json!({}),
        };
        (TriggerKind::Scheduled, payload)
    } else {
        (TriggerKind::Direct, event)
    };

    let payload = serde_json::from_value::<StartPayload>(payload)
        .map_err(|error| format!("Malformed request: {error}"))?;
    Ok(StartEvent { trigger, payload })
}

/// Runs one execution for a raw trigger event and renders the response in
/// the shape the trigger expects.
pub async fn handle_start_event(
    event: Value,
    orchestrator: &Orchestrator,
    cancel: CancellationToken,
) -> Result<Value, PipelineError> {
    let start = match parse_start_event(event) {
        Ok(value) => value,
        Err(message) => return Ok(to_value(validation_error_response(&message))),
    };

    match orchestrator.run(start.payload, cancel).await {
        Ok(outcome) => Ok(match start.trigger {
            TriggerKind::ApiGateway => to_value(success_response(200, &outcome)),
            TriggerKind::Scheduled | TriggerKind::Direct => outcome_value(&outcome),
        }),
        Err(error) => match start.trigger {
            TriggerKind::ApiGateway => Ok(to_value(validation_error_response(&error.to_string()))),
            TriggerKind::Scheduled | TriggerKind::Direct => Err(error),
        },
    }
}

fn outcome_value(outcome: &ExecutionOutcome) -> Value {
    serde_json::to_value(outcome).unwrap_or_else(|error| {
        json!({
            "execution_id": outcome.execution_id,
            "state": outcome.state,
            "error": format!("failed to serialize outcome: {error}"),
        })
    })
}

fn validation_error_response(message: &str) -> ApiGatewayResponse {
    error_response(
        400,
        json!({
            "error": "validation_error",
            "message": message,
        }),
    )
}

fn success_response(status_code: u16, outcome: &ExecutionOutcome) -> ApiGatewayResponse {
    ApiGatewayResponse {
        status_code,
        headers: json!({"Content-Type": "application/json"}),
        body: outcome_value(outcome).to_string(),
    }
}

fn error_response(status_code: u16, payload: Value) -> ApiGatewayResponse {
    ApiGatewayResponse {
        status_code,
        headers: json!({"Content-Type": "application/json"}),
        body: payload.to_string(),
    }
}

fn to_value(response: ApiGatewayResponse) -> Value {
    json!({
        "statusCode": response.status_code,
        "headers": response.headers,
        "body": response.body,
    })
}
