//! Message records, command operations and the well-known header names.
//!
//! Messages are opaque structured records to the broker: it only reads the
//! routing fields and a handful of headers, everything else passes through.

use broker_common::id::{prefix, prefixed_ulid};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrokerError;

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

pub mod headers {
    /// Id of the endpoint the message arrived over.
    pub const ENDPOINT: &str = "DSEndpoint";
    /// Forces channel validation for this message.
    pub const VALIDATE_ENDPOINT: &str = "DSValidateEndpoint";
    /// Base64 `user:password` credentials for a backend destination.
    pub const REMOTE_CREDENTIALS: &str = "DSRemoteCredentials";
    pub const REMOTE_CREDENTIALS_CHARSET: &str = "DSRemoteCredentialsCharset";
    pub const SUBTOPIC: &str = "DSSubtopic";
    pub const SELECTOR: &str = "DSSelector";
    /// Client identity id, echoed on ping and login replies.
    pub const FLEX_CLIENT_ID: &str = "DSId";
    pub const MESSAGING_VERSION: &str = "DSMessagingVersion";
    pub const SUBSCRIPTION_INVALIDATED: &str = "DSSubscriptionInvalidated";
    pub const NEEDS_CONFIG: &str = "DSNeedsConfig";
    pub const MAX_FREQUENCY: &str = "DSMaxFrequency";
    /// Milliseconds a poll may park waiting for pushed messages.
    pub const POLL_WAIT: &str = "DSPollWait";
    /// Subscriptions to add on a multi-subscribe, as `[subtopic, selector]` pairs.
    pub const ADD_SUBSCRIPTIONS: &str = "DSAddSub";
    /// Subscriptions to remove on a multi-subscribe, as `[subtopic, selector]` pairs.
    pub const REMOVE_SUBSCRIPTIONS: &str = "DSRemSub";
}

// ---------------------------------------------------------------------------
// Command operations
// ---------------------------------------------------------------------------

/// Command operations understood by the router and the bundled services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOperation {
    Subscribe,
    Unsubscribe,
    Poll,
    ClientSync,
    ClientPing,
    ClusterRequest,
    Login,
    Logout,
    SubscriptionInvalidate,
    MultiSubscribe,
    Disconnect,
    TriggerConnect,
    #[serde(other)]
    Unknown,
}

impl CommandOperation {
    /// Protocol operation number.
    pub fn code(self) -> u32 {
        match self {
            CommandOperation::Subscribe => 0,
            CommandOperation::Unsubscribe => 1,
            CommandOperation::Poll => 2,
            CommandOperation::ClientSync => 4,
            CommandOperation::ClientPing => 5,
            CommandOperation::ClusterRequest => 7,
            CommandOperation::Login => 8,
            CommandOperation::Logout => 9,
            CommandOperation::SubscriptionInvalidate => 10,
            CommandOperation::MultiSubscribe => 11,
            CommandOperation::Disconnect => 12,
            CommandOperation::TriggerConnect => 13,
            CommandOperation::Unknown => 10000,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => CommandOperation::Subscribe,
            1 => CommandOperation::Unsubscribe,
            2 => CommandOperation::Poll,
            4 => CommandOperation::ClientSync,
            5 => CommandOperation::ClientPing,
            7 => CommandOperation::ClusterRequest,
            8 => CommandOperation::Login,
            9 => CommandOperation::Logout,
            10 => CommandOperation::SubscriptionInvalidate,
            11 => CommandOperation::MultiSubscribe,
            12 => CommandOperation::Disconnect,
            13 => CommandOperation::TriggerConnect,
            _ => CommandOperation::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Async,
    Command,
    Acknowledge,
    Error,
}

/// A message flowing through the broker, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<CommandOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Value,
    /// Milliseconds since the unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    /// Milliseconds the message stays deliverable; 0 means forever.
    #[serde(default)]
    pub time_to_live: i64,
}

pub fn new_message_id() -> String {
    prefixed_ulid(prefix::MESSAGE)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Message {
    fn blank(kind: MessageKind) -> Self {
        Self {
            kind,
            operation: None,
            message_id: Some(new_message_id()),
            destination: None,
            client_id: None,
            correlation_id: None,
            headers: Map::new(),
            body: Value::Null,
            timestamp: now_millis(),
            time_to_live: 0,
        }
    }

    /// A data message addressed to `destination`.
    pub fn data(destination: impl Into<String>, body: Value) -> Self {
        let mut msg = Self::blank(MessageKind::Async);
        msg.destination = Some(destination.into());
        msg.body = body;
        msg
    }

    pub fn command(operation: CommandOperation) -> Self {
        let mut msg = Self::blank(MessageKind::Command);
        msg.operation = Some(operation);
        msg
    }

    /// An acknowledgement correlated to `request`.
    pub fn acknowledge(request: &Message) -> Self {
        let mut msg = Self::blank(MessageKind::Acknowledge);
        msg.correlation_id = request.message_id.clone();
        msg.client_id = request.client_id.clone();
        msg.destination = request.destination.clone();
        msg
    }

    /// An error reply correlated to `request`.
    pub fn error_reply(request: &Message, err: &BrokerError) -> Self {
        let mut msg = Self::blank(MessageKind::Error);
        msg.correlation_id = request.message_id.clone();
        msg.client_id = request.client_id.clone();
        msg.destination = request.destination.clone();
        msg.body = serde_json::json!({
            "faultCode": err.fault_code(),
            "faultString": err.to_string(),
            "code": err.code(),
        });
        msg
    }

    pub fn with_header(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn is_command(&self) -> bool {
        self.kind == MessageKind::Command
    }

    pub fn is_acknowledge(&self) -> bool {
        matches!(self.kind, MessageKind::Acknowledge | MessageKind::Error)
    }

    /// The command operation, `Unknown` for commands without one.
    pub fn operation(&self) -> CommandOperation {
        self.operation.unwrap_or(CommandOperation::Unknown)
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name).filter(|v| !v.is_null())
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(Value::as_str)
    }

    /// Boolean header, accepting `true` or `"true"`.
    pub fn header_flag(&self, name: &str) -> bool {
        match self.header(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<Value>) {
        self.headers.insert(name.to_string(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    pub fn subtopic(&self) -> Option<&str> {
        self.header_str(headers::SUBTOPIC)
    }

    pub fn endpoint_id(&self) -> Option<&str> {
        self.header_str(headers::ENDPOINT)
    }

    /// Whether the message outlived its time-to-live at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.time_to_live > 0 && self.timestamp.saturating_add(self.time_to_live) < now_ms
    }

    /// Value a selector identifier resolves to: headers first, then top-level body fields.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.header(name).or_else(|| match &self.body {
            Value::Object(map) => map.get(name).filter(|v| !v.is_null()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_codes_round_trip() {
        for code in [0, 1, 2, 4, 5, 7, 8, 9, 10, 11, 12, 13] {
            assert_eq!(CommandOperation::from_code(code).code(), code);
        }
        assert_eq!(CommandOperation::from_code(3), CommandOperation::Unknown);
    }

    #[test]
    fn acknowledge_copies_correlation_fields() {
        let request = Message::data("chat", Value::Null).with_client_id("c1");
        let ack = Message::acknowledge(&request);
        assert_eq!(ack.kind, MessageKind::Acknowledge);
        assert_eq!(ack.correlation_id, request.message_id);
        assert_eq!(ack.client_id.as_deref(), Some("c1"));
        assert_ne!(ack.message_id, request.message_id);
    }

    #[test]
    fn expiry_survives_extreme_timestamps() {
        let mut msg = Message::data("chat", Value::Null);
        msg.timestamp = i64::MAX;
        msg.time_to_live = 10;
        assert!(!msg.is_expired(i64::MAX));

        msg.timestamp = i64::MIN;
        msg.time_to_live = i64::MAX;
        assert!(msg.is_expired(0));
    }

    #[test]
    fn header_flag_accepts_strings() {
        let msg = Message::command(CommandOperation::ClientPing)
            .with_header(headers::NEEDS_CONFIG, "TRUE")
            .with_header(headers::VALIDATE_ENDPOINT, false);
        assert!(msg.header_flag(headers::NEEDS_CONFIG));
        assert!(!msg.header_flag(headers::VALIDATE_ENDPOINT));
        assert!(!msg.header_flag("missing"));
    }

    #[test]
    fn property_falls_back_to_body() {
        let msg = Message::data("d", serde_json::json!({ "price": 120 }))
            .with_header("region", "eu");
        assert_eq!(msg.property("region"), Some(&Value::from("eu")));
        assert_eq!(msg.property("price"), Some(&Value::from(120)));
        assert!(msg.property("missing").is_none());
    }

    #[test]
    fn deserializes_minimal_wire_form() {
        let msg: Message = serde_json::from_str(
            r#"{"kind":"command","operation":"client_ping","messageId":"m1"}"#,
        )
        .unwrap();
        assert!(msg.is_command());
        assert_eq!(msg.operation(), CommandOperation::ClientPing);
        assert_eq!(msg.message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn expiry_respects_ttl() {
        let mut msg = Message::data("d", Value::Null);
        msg.timestamp = 1_000;
        assert!(!msg.is_expired(10_000));
        msg.time_to_live = 500;
        assert!(msg.is_expired(10_000));
        assert!(!msg.is_expired(1_200));
    }
}
