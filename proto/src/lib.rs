// proto: wire types for the realtime event-delivery protocol.
//
// Every message on both transports (WebSocket and SSE) shares the same
// envelope: `{"op": <opcode>, "d": <opcode-specific payload>}`. Modeled as
// a single adjacently-tagged enum rather than a raw-JSON catch-all, so
// callers pattern-match instead of re-parsing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type Condition = HashMap<String, String>;

/// Maximum dotted-path length for an event type (§3 Data Model).
pub const MAX_TYPE_LEN: usize = 64;
/// Maximum number of condition key/value pairs on one subscription.
pub const MAX_CONDITION_KEYS: usize = 10;
/// Maximum length of a condition key.
pub const MAX_CONDITION_KEY_LEN: usize = 64;
/// Maximum length of a condition value.
pub const MAX_CONDITION_VALUE_LEN: usize = 128;

/// All wire message kinds, tagged by the top-level `op` field with the
/// payload carried under `d`.
///
/// ```json
/// {"op": "Subscribe", "d": {"type": "emote.create", "condition": {"channel": "abc"}}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d")]
pub enum WsMessage {
    Hello(HelloPayload),
    Heartbeat(HeartbeatPayload),
    Ack(AckPayload),
    Error(ErrorPayload),
    EndOfStream(EndOfStreamPayload),
    Reconnect(ReconnectPayload),
    Dispatch(OutboundDispatchPayload),
    Subscribe(SubscribePayload),
    Unsubscribe(UnsubscribePayload),
    Resume(ResumePayload),
    Bridge(serde_json::Value),
    Identify(serde_json::Value),
    Signal(serde_json::Value),
}

impl WsMessage {
    /// Opcodes the client is permitted to send (§4.6).
    #[must_use]
    pub fn is_client_sendable(op: &str) -> bool {
        matches!(
            op,
            "Heartbeat" | "Identify" | "Resume" | "Subscribe" | "Unsubscribe" | "Signal" | "Bridge"
        )
    }

    /// The `op` string for this message's variant, lowercased for SSE framing.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            WsMessage::Hello(_) => "Hello",
            WsMessage::Heartbeat(_) => "Heartbeat",
            WsMessage::Ack(_) => "Ack",
            WsMessage::Error(_) => "Error",
            WsMessage::EndOfStream(_) => "EndOfStream",
            WsMessage::Reconnect(_) => "Reconnect",
            WsMessage::Dispatch(_) => "Dispatch",
            WsMessage::Subscribe(_) => "Subscribe",
            WsMessage::Unsubscribe(_) => "Unsubscribe",
            WsMessage::Resume(_) => "Resume",
            WsMessage::Bridge(_) => "Bridge",
            WsMessage::Identify(_) => "Identify",
            WsMessage::Signal(_) => "Signal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub heartbeat_interval: u64,
    pub session_id: String,
    pub subscription_limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub command: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndOfStreamPayload {
    pub code: CloseCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPayload {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribePayload {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub session_id: String,
}

/// Inbound dispatch, as published by the upstream producer onto Redis.
///
/// Never serialized to a client directly — always converted into
/// `OutboundDispatchPayload` first (conditions/effect/hash/whisper stripped).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whisper: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,
    #[serde(default)]
    pub d: serde_json::Value,
}

/// Outbound dispatch, as written to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundDispatchPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<u32>,
    #[serde(default)]
    pub d: serde_json::Value,
}

/// An inline instruction carried by a dispatch that mutates the receiving
/// session's subscriptions or dedup state (§4.8 step 4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    #[serde(default)]
    pub add_subscriptions: Vec<EffectAddSubscription>,
    #[serde(default)]
    pub remove_subscriptions: Vec<EffectRemoveSubscription>,
    #[serde(default)]
    pub remove_hashes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectAddSubscription {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub condition: Condition,
    /// TTL in milliseconds from the moment the effect is applied; 0 means no TTL.
    #[serde(default)]
    pub ttl: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectRemoveSubscription {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub condition: Condition,
}

/// Semantic close codes (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseCode {
    ServerError,
    Timeout,
    InvalidPayload,
    UnknownOperation,
    InsufficientPrivilege,
    AlreadySubscribed,
    NotSubscribed,
    RateLimit,
    Restart,
    Reconnect,
    NormalClosure,
    GoingAway,
    AbnormalClosure,
}

impl CloseCode {
    /// The numeric WebSocket close code used on the wire.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::NormalClosure => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::AbnormalClosure => 1006,
            CloseCode::ServerError => 4000,
            CloseCode::Timeout => 4001,
            CloseCode::InvalidPayload => 4002,
            CloseCode::UnknownOperation => 4003,
            CloseCode::InsufficientPrivilege => 4004,
            CloseCode::AlreadySubscribed => 4005,
            CloseCode::NotSubscribed => 4006,
            CloseCode::RateLimit => 4007,
            CloseCode::Restart => 4008,
            CloseCode::Reconnect => 4009,
        }
    }

    /// Reverses [`CloseCode::as_u16`], for classifying a peer-sent close
    /// frame's raw wire code.
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(CloseCode::NormalClosure),
            1001 => Some(CloseCode::GoingAway),
            1006 => Some(CloseCode::AbnormalClosure),
            4000 => Some(CloseCode::ServerError),
            4001 => Some(CloseCode::Timeout),
            4002 => Some(CloseCode::InvalidPayload),
            4003 => Some(CloseCode::UnknownOperation),
            4004 => Some(CloseCode::InsufficientPrivilege),
            4005 => Some(CloseCode::AlreadySubscribed),
            4006 => Some(CloseCode::NotSubscribed),
            4007 => Some(CloseCode::RateLimit),
            4008 => Some(CloseCode::Restart),
            4009 => Some(CloseCode::Reconnect),
            _ => None,
        }
    }

    /// Whether a client disconnecting with this code is eligible for
    /// resume-buffer attachment (§4.6).
    #[must_use]
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            CloseCode::NormalClosure
                | CloseCode::GoingAway
                | CloseCode::AbnormalClosure
                | CloseCode::Timeout
                | CloseCode::Reconnect
        )
    }

    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            CloseCode::ServerError => "server error",
            CloseCode::Timeout => "connection timed out",
            CloseCode::InvalidPayload => "invalid payload",
            CloseCode::UnknownOperation => "unknown operation",
            CloseCode::InsufficientPrivilege => "insufficient privilege",
            CloseCode::AlreadySubscribed => "already subscribed",
            CloseCode::NotSubscribed => "not subscribed",
            CloseCode::RateLimit => "rate limit exceeded",
            CloseCode::Restart => "server restarting",
            CloseCode::Reconnect => "please reconnect",
            CloseCode::NormalClosure => "normal closure",
            CloseCode::GoingAway => "going away",
            CloseCode::AbnormalClosure => "abnormal closure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_op_and_d() {
        let msg = WsMessage::Subscribe(SubscribePayload {
            event_type: "emote.create".to_owned(),
            condition: Condition::from([("channel".to_owned(), "abc".to_owned())]),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"op\":\"Subscribe\""));
        let back: WsMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn outbound_dispatch_omits_conditions_hash_whisper_effect() {
        let out = OutboundDispatchPayload {
            event_type: "emote.create".to_owned(),
            matches: vec![42],
            d: serde_json::json!({"id": "abc"}),
        };
        let json = serde_json::to_value(&out).unwrap();
        assert!(json.get("conditions").is_none());
        assert!(json.get("hash").is_none());
        assert!(json.get("whisper").is_none());
        assert!(json.get("effect").is_none());
        assert_eq!(json["matches"], serde_json::json!([42]));
    }

    #[test]
    fn close_code_resumability_matches_spec_list() {
        assert!(CloseCode::NormalClosure.is_resumable());
        assert!(CloseCode::GoingAway.is_resumable());
        assert!(CloseCode::AbnormalClosure.is_resumable());
        assert!(CloseCode::Timeout.is_resumable());
        assert!(CloseCode::Reconnect.is_resumable());
        assert!(!CloseCode::InvalidPayload.is_resumable());
        assert!(!CloseCode::RateLimit.is_resumable());
    }

    #[test]
    fn from_u16_reverses_as_u16_for_every_variant() {
        for code in [
            CloseCode::ServerError,
            CloseCode::Timeout,
            CloseCode::InvalidPayload,
            CloseCode::UnknownOperation,
            CloseCode::InsufficientPrivilege,
            CloseCode::AlreadySubscribed,
            CloseCode::NotSubscribed,
            CloseCode::RateLimit,
            CloseCode::Restart,
            CloseCode::Reconnect,
            CloseCode::NormalClosure,
            CloseCode::GoingAway,
            CloseCode::AbnormalClosure,
        ] {
            assert_eq!(CloseCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(CloseCode::from_u16(9999), None);
    }

    #[test]
    fn is_client_sendable_matches_spec_set() {
        for op in [
            "Heartbeat",
            "Identify",
            "Resume",
            "Subscribe",
            "Unsubscribe",
            "Signal",
            "Bridge",
        ] {
            assert!(WsMessage::is_client_sendable(op), "{op} should be client-sendable");
        }
        for op in ["Hello", "Ack", "Dispatch", "EndOfStream", "Reconnect", "Error"] {
            assert!(!WsMessage::is_client_sendable(op), "{op} should not be client-sendable");
        }
    }
}
