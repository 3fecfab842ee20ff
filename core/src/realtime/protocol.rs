//! Realtime wire protocol: Phoenix channel frames carrying row changes

use crate::clock::parse_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Topic used for connection-level heartbeats
pub const HEARTBEAT_TOPIC: &str = "phoenix";
/// Protocol version sent in the connection URL
pub const PROTOCOL_VSN: &str = "1.0.0";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_CHANGES: &str = "postgres_changes";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Invalid filter '{0}': expected column=eq.value")]
    InvalidFilter(String),
}

/// One Phoenix channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixFrame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
        }
    }

    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Which row changes a subscription wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicFilter {
    pub schema: String,
    pub table: String,
    /// Equality expression `column=eq.value`
    pub filter: Option<String>,
}

impl TopicFilter {
    /// All changes on `public.<table>`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Only rows where `column` equals `value`.
    pub fn where_eq(mut self, column: &str, value: impl std::fmt::Display) -> Self {
        self.filter = Some(format!("{}=eq.{}", column, value));
        self
    }

    /// Use a raw filter expression, checked for the `column=eq.value` shape.
    pub fn with_filter(mut self, expr: impl Into<String>) -> Result<Self, ProtocolError> {
        let expr = expr.into();
        parse_filter(&expr)?;
        self.filter = Some(expr);
        Ok(self)
    }

    /// Local check mirroring the server-side filter.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || event.schema.as_deref().is_some_and(|s| s != self.schema)
        {
            return false;
        }
        let Some(expr) = &self.filter else {
            return true;
        };
        let Ok((column, expected)) = parse_filter(expr) else {
            return false;
        };
        let row = event.new.as_ref().or(event.old.as_ref());
        match row.and_then(|r| r.get(column)) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Null) => false,
            Some(other) => other.to_string() == expected,
            // Delete payloads carry only the primary key unless the table
            // has full replica identity; the server has already filtered them
            None => event.event_type == ChangeEventType::Delete,
        }
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)?;
        if let Some(filter) = &self.filter {
            write!(f, " [{}]", filter)?;
        }
        Ok(())
    }
}

/// Split `column=eq.value` into its column and value.
pub fn parse_filter(expr: &str) -> Result<(&str, &str), ProtocolError> {
    let invalid = || ProtocolError::InvalidFilter(expr.to_string());
    let (column, rest) = expr.split_once('=').ok_or_else(invalid)?;
    let value = rest.strip_prefix("eq.").ok_or_else(invalid)?;
    if column.is_empty() || column.contains(char::is_whitespace) {
        return Err(invalid());
    }
    Ok((column, value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
}

/// A row change delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    pub schema: Option<String>,
    pub table: String,
    /// Row after the change (absent for deletes)
    pub new: Option<Value>,
    /// Row before the change, when the table publishes it
    pub old: Option<Value>,
    /// Commit time (unix ms)
    pub commit_timestamp: Option<u64>,
}

#[derive(Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    event_type: ChangeEventType,
    schema: Option<String>,
    table: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

fn non_empty(value: Option<Value>) -> Option<Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        other => other,
    }
}

impl ChangeEvent {
    fn from_payload(payload: &Value) -> Result<Self, ProtocolError> {
        let data = payload
            .get("data")
            .cloned()
            .ok_or_else(|| ProtocolError::Malformed("change frame without data".into()))?;
        let data: ChangeData =
            serde_json::from_value(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(Self {
            event_type: data.event_type,
            schema: data.schema,
            table: data.table,
            new: non_empty(data.record),
            old: non_empty(data.old_record),
            commit_timestamp: data.commit_timestamp.as_deref().and_then(parse_rfc3339),
        })
    }

    /// The row identity, from the new row or else the old one.
    pub fn row_id(&self) -> Option<String> {
        let row = self.new.as_ref().or(self.old.as_ref())?;
        match row.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Frames the client reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Reply {
        topic: String,
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    Change {
        topic: String,
        event: ChangeEvent,
    },
    ChannelError {
        topic: String,
    },
    ChannelClose {
        topic: String,
    },
    Other(PhoenixFrame),
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame = PhoenixFrame::decode(text)?;
        Ok(match frame.event.as_str() {
            EVENT_REPLY => ServerMessage::Reply {
                ok: frame.payload.get("status").and_then(Value::as_str) == Some("ok"),
                response: frame.payload.get("response").cloned().unwrap_or(Value::Null),
                topic: frame.topic,
                reference: frame.reference,
            },
            EVENT_CHANGES => ServerMessage::Change {
                event: ChangeEvent::from_payload(&frame.payload)?,
                topic: frame.topic,
            },
            EVENT_ERROR => ServerMessage::ChannelError { topic: frame.topic },
            EVENT_CLOSE => ServerMessage::ChannelClose { topic: frame.topic },
            _ => ServerMessage::Other(frame),
        })
    }
}

/// Join a channel topic with one change filter.
pub fn join_frame(
    topic: &str,
    filter: &TopicFilter,
    access_token: Option<&str>,
    reference: &str,
) -> PhoenixFrame {
    let mut change = json!({
        "event": "*",
        "schema": filter.schema,
        "table": filter.table,
    });
    if let Some(expr) = &filter.filter {
        change["filter"] = Value::String(expr.clone());
    }
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [change],
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    PhoenixFrame::new(topic, EVENT_JOIN, payload).with_ref(reference)
}

pub fn leave_frame(topic: &str, reference: &str) -> PhoenixFrame {
    PhoenixFrame::new(topic, EVENT_LEAVE, json!({})).with_ref(reference)
}

pub fn heartbeat_frame(reference: &str) -> PhoenixFrame {
    PhoenixFrame::new(HEARTBEAT_TOPIC, EVENT_HEARTBEAT, json!({})).with_ref(reference)
}

/// Build a `postgres_changes` frame, as the server sends it.
pub fn change_frame(topic: &str, event: &ChangeEvent) -> PhoenixFrame {
    let event_type = match event.event_type {
        ChangeEventType::Insert => "INSERT",
        ChangeEventType::Update => "UPDATE",
        ChangeEventType::Delete => "DELETE",
    };
    let mut data = json!({
        "type": event_type,
        "schema": event.schema.clone().unwrap_or_else(|| "public".to_string()),
        "table": event.table,
        "record": event.new.clone().unwrap_or_else(|| json!({})),
        "old_record": event.old.clone().unwrap_or_else(|| json!({})),
    });
    if let Some(ts) = event.commit_timestamp {
        data["commit_timestamp"] = Value::String(crate::clock::to_rfc3339(ts));
    }
    PhoenixFrame::new(topic, EVENT_CHANGES, json!({ "data": data, "ids": [] }))
}

/// Build a reply frame answering `request`.
pub fn reply_frame(request: &PhoenixFrame, ok: bool) -> PhoenixFrame {
    let status = if ok { "ok" } else { "error" };
    let mut frame = PhoenixFrame::new(
        request.topic.clone(),
        EVENT_REPLY,
        json!({ "status": status, "response": {} }),
    );
    frame.reference = request.reference.clone();
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_postgres_change() {
        let text = r#"{
            "topic": "realtime:rvois-1",
            "event": "postgres_changes",
            "ref": null,
            "payload": {
                "ids": [42],
                "data": {
                    "schema": "public",
                    "table": "volunteer_locations",
                    "commit_timestamp": "2024-03-01T08:00:00.000Z",
                    "type": "UPDATE",
                    "record": {"id": 7, "user_id": "u1", "latitude": 10.7},
                    "old_record": {"id": 7}
                }
            }
        }"#;
        let ServerMessage::Change { topic, event } = ServerMessage::parse(text).unwrap() else {
            panic!("expected change");
        };
        assert_eq!(topic, "realtime:rvois-1");
        assert_eq!(event.event_type, ChangeEventType::Update);
        assert_eq!(event.table, "volunteer_locations");
        assert_eq!(event.row_id().as_deref(), Some("7"));
        assert_eq!(event.commit_timestamp, Some(1_709_280_000_000));
    }

    #[test]
    fn test_delete_has_no_new_row() {
        let event = ChangeEvent {
            event_type: ChangeEventType::Delete,
            schema: Some("public".into()),
            table: "notifications".into(),
            new: None,
            old: Some(json!({"id": "n1"})),
            commit_timestamp: None,
        };
        let text = change_frame("t", &event).encode().unwrap();
        let ServerMessage::Change { event: parsed, .. } = ServerMessage::parse(&text).unwrap()
        else {
            panic!("expected change");
        };
        assert_eq!(parsed.new, None);
        assert_eq!(parsed.row_id().as_deref(), Some("n1"));
    }

    #[test]
    fn test_join_frame_carries_filter() {
        let filter = TopicFilter::table("notifications").where_eq("user_id", "u1");
        let frame = join_frame("realtime:x", &filter, Some("tok"), "3");
        let change = &frame.payload["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "notifications");
        assert_eq!(change["filter"], "user_id=eq.u1");
        assert_eq!(frame.payload["access_token"], "tok");
        assert_eq!(frame.reference.as_deref(), Some("3"));
    }

    #[test]
    fn test_filter_parsing() {
        assert_eq!(parse_filter("user_id=eq.abc").unwrap(), ("user_id", "abc"));
        assert!(parse_filter("user_id=gt.3").is_err());
        assert!(parse_filter("=eq.3").is_err());
        assert!(TopicFilter::table("t").with_filter("nonsense").is_err());
    }

    #[test]
    fn test_filter_matches_rows() {
        let filter = TopicFilter::table("volunteer_locations").where_eq("user_id", "u1");
        let mut event = ChangeEvent {
            event_type: ChangeEventType::Insert,
            schema: Some("public".into()),
            table: "volunteer_locations".into(),
            new: Some(json!({"user_id": "u1"})),
            old: None,
            commit_timestamp: None,
        };
        assert!(filter.matches(&event));
        event.new = Some(json!({"user_id": "u2"}));
        assert!(!filter.matches(&event));
        event.table = "incidents".into();
        assert!(!TopicFilter::table("volunteer_locations").matches(&event));
    }

    #[test]
    fn test_filter_passes_key_only_delete() {
        let filter = TopicFilter::table("notifications").where_eq("user_id", "vol-1");
        let mut delete = ChangeEvent {
            event_type: ChangeEventType::Delete,
            schema: Some("public".into()),
            table: "notifications".into(),
            new: None,
            old: Some(json!({"id": "n1"})),
            commit_timestamp: None,
        };
        assert!(filter.matches(&delete));

        // With full replica identity the column is there and still checked
        delete.old = Some(json!({"id": "n1", "user_id": "vol-2"}));
        assert!(!filter.matches(&delete));

        // Inserts without the column are not let through
        let insert = ChangeEvent {
            event_type: ChangeEventType::Insert,
            new: Some(json!({"id": "n2"})),
            old: None,
            ..delete
        };
        assert!(!filter.matches(&insert));
    }

    #[test]
    fn test_reply_status() {
        let join = heartbeat_frame("9");
        let text = reply_frame(&join, true).encode().unwrap();
        match ServerMessage::parse(&text).unwrap() {
            ServerMessage::Reply { topic, reference, ok, .. } => {
                assert_eq!(topic, HEARTBEAT_TOPIC);
                assert_eq!(reference.as_deref(), Some("9"));
                assert!(ok);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame() {
        assert!(ServerMessage::parse("not json").is_err());
    }
}
