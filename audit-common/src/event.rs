use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Enumeration of errors raised while turning a raw topic payload into a
/// `TypedEvent`. All of these are terminal for the record: the pipeline
/// routes them to the dead-letter topic without retrying.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot determine log type from message fields")]
    Unclassified,
    #[error("{0} schema violation: {1}")]
    Schema(EventKind, String),
}

/// The closed set of event shapes the worker knows how to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    MethodAudit,
    HttpAudit,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::MethodAudit => write!(f, "MethodAudit"),
            EventKind::HttpAudit => write!(f, "HttpAudit"),
        }
    }
}

/// An audit entry emitted around a method invocation (START/END/ERROR).
///
/// `timestamp` stays a string here: the producer emits local datetimes in
/// two slightly different grammars, and malformed values are replaced with
/// ingestion wall-clock time at persistence, never rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MethodAuditEvent {
    pub message_id: String,
    /// Correlation id of the audited invocation, emitted as `id`.
    #[serde(rename = "id")]
    pub event_id: String,
    /// START, END or ERROR. Free string in practice.
    #[serde(rename = "type")]
    pub event_type: String,
    pub method_name: String,
    /// Invocation arguments, opaque to us. Present for START events.
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub log_level: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// An audit entry for an HTTP exchange, incoming or outgoing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HttpAuditEvent {
    pub message_id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub direction: String,
    pub method: String,
    pub status_code: i32,
    pub url: String,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub response_body: Option<String>,
}

/// A classified and schema-checked audit event.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedEvent {
    Method(MethodAuditEvent),
    Http(HttpAuditEvent),
}

impl TypedEvent {
    /// The producer-assigned idempotence key.
    pub fn message_id(&self) -> &str {
        match self {
            TypedEvent::Method(event) => &event.message_id,
            TypedEvent::Http(event) => &event.message_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            TypedEvent::Method(_) => EventKind::MethodAudit,
            TypedEvent::Http(_) => EventKind::HttpAudit,
        }
    }
}

/// Assign a parsed JSON tree one of the known event kinds.
///
/// Rules are evaluated in order and the first match wins, so a payload
/// carrying both discriminator sets classifies as a method audit.
pub fn classify(tree: &Value) -> Result<EventKind, ParseError> {
    let has = |field: &str| tree.get(field).is_some();

    if has("id") && has("methodName") && has("logLevel") {
        Ok(EventKind::MethodAudit)
    } else if has("direction") && has("method") && has("statusCode") {
        Ok(EventKind::HttpAudit)
    } else {
        Err(ParseError::Unclassified)
    }
}

/// Classify and strictly deserialize a raw topic payload.
///
/// Strict mode: unknown fields and missing required fields are schema
/// violations. No defaults are substituted here.
pub fn parse_event(payload: &[u8]) -> Result<TypedEvent, ParseError> {
    let tree: Value = serde_json::from_slice(payload)?;

    match classify(&tree)? {
        EventKind::MethodAudit => serde_json::from_value::<MethodAuditEvent>(tree)
            .map(TypedEvent::Method)
            .map_err(|e| ParseError::Schema(EventKind::MethodAudit, e.to_string())),
        EventKind::HttpAudit => serde_json::from_value::<HttpAuditEvent>(tree)
            .map(TypedEvent::Http)
            .map_err(|e| ParseError::Schema(EventKind::HttpAudit, e.to_string())),
    }
}

/// Collapse invocation arguments into their bracket-delimited printable
/// form: `[a, b, c]`. Scalars are rendered bare, `null` as the literal
/// `null`, and nested structures as their compact JSON.
pub fn render_args(args: &[Value]) -> String {
    let mut out = String::from("[");
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match arg {
            Value::Null => out.push_str("null"),
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
    }
    out.push(']');
    out
}
