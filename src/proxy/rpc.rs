//! JSON-RPC message classification.
//!
//! Messages are validated into a tagged union at the boundary; a missing or
//! null field makes a message `Other`, never a panic. RPC ids are normalized
//! to their string form so numeric and string ids key identically.

use serde_json::Value;

/// Terminal outcome carried by a tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcOutcome {
    Ok,
    Err { message: String },
}

/// One classified JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// `{"jsonrpc":"2.0","id":...,"method":"tools/call","params":{"name":...}}`
    ToolCall {
        id: String,
        tool_name: Option<String>,
    },
    /// A message with a matching id and a non-null `result` or `error`.
    ToolResult { id: String, outcome: RpcOutcome },
    /// Anything else, including non-terminal responses (no result, no error).
    Other,
}

fn rpc_id(value: &Value) -> Option<String> {
    match value.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn is_present(value: &Value, field: &str) -> bool {
    matches!(value.get(field), Some(v) if !v.is_null())
}

/// Classify one parsed JSON value.
pub fn classify(value: &Value) -> RpcMessage {
    let Some(id) = rpc_id(value) else {
        return RpcMessage::Other;
    };

    if value.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
        && value.get("method").and_then(Value::as_str) == Some("tools/call")
    {
        let tool_name = value
            .get("params")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        return RpcMessage::ToolCall { id, tool_name };
    }

    if is_present(value, "error") {
        let message = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("tool_error")
            .to_owned();
        return RpcMessage::ToolResult {
            id,
            outcome: RpcOutcome::Err { message },
        };
    }

    if is_present(value, "result") {
        return RpcMessage::ToolResult {
            id,
            outcome: RpcOutcome::Ok,
        };
    }

    RpcMessage::Other
}
