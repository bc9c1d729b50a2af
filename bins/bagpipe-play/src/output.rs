use base64::Engine;
use serde_json::{Value, json};

use bagpipe_api::message::{IteratorResult, MessageEvent, MessagePayload, PlayerProblem};

pub fn event(event: &MessageEvent, backfill: bool) -> Value {
    let payload = match &event.payload {
        MessagePayload::Decoded(value) => value.clone(),
        MessagePayload::Raw(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    };
    let mut line = json!({
        "topic": event.topic,
        "time": event.receive_time.to_string(),
        "size": event.size_in_bytes,
        "payload": payload,
    });
    if backfill {
        line["backfill"] = Value::Bool(true);
    }
    line
}

pub fn problem(connection_id: &str, problem: &PlayerProblem) -> Value {
    json!({
        "connection_id": connection_id,
        "problem": problem,
    })
}

/// JSON line for an iterator item. Stamps carry nothing to print.
pub fn item(item: &IteratorResult) -> Option<Value> {
    match item {
        IteratorResult::MessageEvent(e) => Some(event(e, false)),
        IteratorResult::Problem {
            connection_id,
            problem: p,
        } => Some(problem(connection_id, p)),
        IteratorResult::Stamp(_) => None,
    }
}
