//! Wire messages for the matchmaking and signaling endpoints
//!
//! Both endpoints speak JSON text frames. Matchmaking uses fixed request and
//! response shapes; signaling messages are open-ended objects whose only
//! server-recognized field is the `type` discriminator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SignalError;

/// Discriminator key recognized on signaling messages
pub const TYPE_KEY: &str = "type";

/// Key carrying the room id on a `register` message
pub const ROOM_ID_KEY: &str = "roomId";

/// `type` value of a matchmaking response
pub const MATCH_TYPE: &str = "MATCH";

/// Server-recognized signaling message kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Register,
    Ping,
    /// Anything else; forwarded to the other room occupant untouched
    Relay,
}

/// A signaling message: an ordered JSON object passed through verbatim
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalingMessage(Map<String, Value>);

impl SignalingMessage {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Parse from JSON. The document must be an object.
    pub fn from_json(json: &str) -> Result<Self, SignalError> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(SignalError::protocol(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, SignalError> {
        serde_json::to_string(&self.0).map_err(|e| SignalError::Send(e.to_string()))
    }

    pub fn message_type(&self) -> Option<&str> {
        self.0.get(TYPE_KEY).and_then(Value::as_str)
    }

    pub fn kind(&self) -> MessageKind {
        match self.message_type() {
            Some("register") => MessageKind::Register,
            Some("ping") => MessageKind::Ping,
            _ => MessageKind::Relay,
        }
    }

    /// Room id carried by a `register` message
    pub fn room_id(&self) -> Option<&str> {
        self.0.get(ROOM_ID_KEY).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    fn typed(kind: &str) -> Self {
        let mut msg = Self::new();
        msg.insert(TYPE_KEY, kind);
        msg
    }

    pub fn pong() -> Self {
        Self::typed("pong")
    }

    /// Reply to a successful `register`
    pub fn accept(ice_servers: &[IceServer], is_exist_client: bool) -> Self {
        let mut msg = Self::typed("accept");
        let servers = serde_json::to_value(ice_servers).unwrap_or(Value::Array(Vec::new()));
        msg.insert("iceServers", servers);
        msg.insert("isExistClient", is_exist_client);
        msg
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// ICE server entry handed to clients in `accept`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// First message on the matchmaking endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub user_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl MatchRequest {
    /// Parse and check the required fields
    pub fn from_json(json: &str) -> Result<Self, SignalError> {
        let req: MatchRequest = serde_json::from_str(json)?;
        if req.user_id.is_empty() {
            return Err(SignalError::protocol("user_id must not be empty"));
        }
        Ok(req)
    }
}

/// Sent to both members of a pair
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub room_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl MatchResponse {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: MATCH_TYPE.to_string(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            created_at,
        }
    }

    pub fn to_json(&self) -> Result<String, SignalError> {
        serde_json::to_string(self).map_err(|e| SignalError::Send(e.to_string()))
    }
}

#[cfg(test)]
impl SignalingMessage {
    fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    fn register(room_id: &str) -> Self {
        let mut msg = Self::typed("register");
        msg.insert(ROOM_ID_KEY, room_id);
        msg
    }

    fn ping() -> Self {
        Self::typed("ping")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_preserves_fields_and_order() {
        let raw = r#"{"type":"candidate","ice":{"candidate":"a=1","sdpMLineIndex":0},"zeta":true,"alpha":[1,2.5,null]}"#;
        let msg = SignalingMessage::from_json(raw).unwrap();

        assert_eq!(msg.kind(), MessageKind::Relay);
        assert_eq!(msg.message_type(), Some("candidate"));
        let keys: Vec<&str> = msg.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["type", "ice", "zeta", "alpha"]);
        assert_eq!(msg.to_json().unwrap(), raw);
    }

    #[test]
    fn test_message_kinds() {
        assert_eq!(SignalingMessage::register("room1").kind(), MessageKind::Register);
        assert_eq!(SignalingMessage::ping().kind(), MessageKind::Ping);
        assert_eq!(SignalingMessage::pong().to_json().unwrap(), r#"{"type":"pong"}"#);

        let untyped = SignalingMessage::from_json(r#"{"sdp":"v=0"}"#).unwrap();
        assert_eq!(untyped.kind(), MessageKind::Relay);
        assert_eq!(untyped.message_type(), None);

        let numeric_type = SignalingMessage::from_json(r#"{"type":7}"#).unwrap();
        assert_eq!(numeric_type.kind(), MessageKind::Relay);
    }

    #[test]
    fn test_register_room_id() {
        let msg = SignalingMessage::from_json(r#"{"type":"register","roomId":"room1"}"#).unwrap();
        assert_eq!(msg.room_id(), Some("room1"));

        let missing = SignalingMessage::from_json(r#"{"type":"register"}"#).unwrap();
        assert_eq!(missing.room_id(), None);
    }

    #[test]
    fn test_non_object_rejected() {
        let err = SignalingMessage::from_json("[1,2]").unwrap_err();
        assert!(matches!(err, SignalError::Protocol(ref m) if m.contains("an array")));
        assert!(SignalingMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_accept_message() {
        let servers = vec![IceServer::stun("stun:stun.l.google.com:19302")];
        let json = SignalingMessage::accept(&servers, true).to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"accept","iceServers":[{"urls":["stun:stun.l.google.com:19302"]}],"isExistClient":true}"#
        );
    }

    #[test]
    fn test_match_request() {
        let req = MatchRequest::from_json(
            r#"{"user_id":"x","created_at":"2024-05-01T10:00:00.123456789+09:00"}"#,
        )
        .unwrap();
        assert_eq!(req.user_id, "x");
        assert!(req.created_at.is_some());

        let no_ts = MatchRequest::from_json(r#"{"user_id":"y"}"#).unwrap();
        assert!(no_ts.created_at.is_none());

        assert!(MatchRequest::from_json(r#"{"created_at":"2024-05-01T10:00:00Z"}"#).is_err());
        assert!(MatchRequest::from_json(r#"{"user_id":""}"#).is_err());
    }

    #[test]
    fn test_match_response_shape() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let json = MatchResponse::new("ab12cd34", "x", at).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "MATCH");
        assert_eq!(value["room_id"], "ab12cd34");
        assert_eq!(value["user_id"], "x");
        assert_eq!(value["created_at"], "2024-05-01T10:00:00Z");
    }
}
