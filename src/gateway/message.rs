//! Classification of raw gateway callbacks into inbound events.
//!
//! Pure function of the payload, the bridged account id and the current
//! wall-clock. Never errors: the gateway is known to deliver heartbeat and
//! test payloads that must be acknowledged without processing, so unknown
//! shapes classify as non-user noise instead.

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A real user message; the only kind that reaches the aggregator.
    UserText,
    /// Echo of a message the bridged account itself sent.
    SelfEcho,
    /// Client status synchronization noise.
    StatusSync,
    /// Heartbeats, official-account pushes, group chatter without a
    /// mention, non-text payloads, unknown shapes.
    NonUserBroadcast,
    /// Replayed history older than the stale window.
    Stale,
}

#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub peer: String,
    pub text: String,
    pub timestamp: i64,
    pub kind: EventKind,
}

impl InboundEvent {
    fn ignored(kind: EventKind, peer: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            text: text.into(),
            timestamp: 0,
            kind,
        }
    }
}

const STATUS_SYNC_MSG_TYPE: i64 = 51;
const TEXT_MSG_TYPE: i64 = 1;

pub fn classify(
    payload: &Value,
    self_wxid: &str,
    stale_window_s: i64,
    now: DateTime<Utc>,
) -> InboundEvent {
    // Gateway connectivity probe: `{"testMsg": ..., "token": ...}`.
    if payload.get("testMsg").is_some() && payload.get("token").is_some() {
        return InboundEvent::ignored(EventKind::NonUserBroadcast, "", "");
    }

    let Some(type_name) = payload.get("TypeName").and_then(Value::as_str) else {
        return InboundEvent::ignored(EventKind::NonUserBroadcast, "", "");
    };
    if type_name != "AddMsg" {
        return InboundEvent::ignored(EventKind::StatusSync, "", type_name);
    }

    let data = payload.get("Data").cloned().unwrap_or(Value::Null);
    let msg_type = data.get("MsgType").and_then(Value::as_i64).unwrap_or(0);
    let from = nested_string(&data, "FromUserName");
    let content = nested_string(&data, "Content");
    let create_time = data.get("CreateTime").and_then(Value::as_i64).unwrap_or(0);
    let self_wxid = payload
        .get("Wxid")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(self_wxid);

    if msg_type == STATUS_SYNC_MSG_TYPE {
        return InboundEvent::ignored(EventKind::StatusSync, from, "");
    }
    // Official accounts and system pushes.
    if from.starts_with("gh_") {
        return InboundEvent::ignored(EventKind::NonUserBroadcast, from, content);
    }
    if !from.is_empty() && from == self_wxid {
        return InboundEvent::ignored(EventKind::SelfEcho, from, content);
    }
    if msg_type != TEXT_MSG_TYPE || from.is_empty() {
        return InboundEvent::ignored(EventKind::NonUserBroadcast, from, content);
    }

    let (peer, text) = if from.ends_with("@chatroom") {
        // Group traffic only counts as a user turn when the account is
        // @-mentioned; the peer is the room, replies go back there.
        if !group_mentions(&data, self_wxid) {
            return InboundEvent::ignored(EventKind::NonUserBroadcast, from, content);
        }
        (from.clone(), group_text(&content))
    } else {
        (from.clone(), content.trim().to_string())
    };

    if create_time > 0 && create_time < now.timestamp() - stale_window_s {
        return InboundEvent {
            peer,
            text,
            timestamp: create_time,
            kind: EventKind::Stale,
        };
    }
    if text.is_empty() {
        return InboundEvent::ignored(EventKind::NonUserBroadcast, peer, "");
    }

    InboundEvent {
        peer,
        text,
        timestamp: create_time,
        kind: EventKind::UserText,
    }
}

/// Gateway string fields arrive wrapped as `{"string": "..."}`.
fn nested_string(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(|value| value.get("string"))
        .and_then(Value::as_str)
        .or_else(|| data.get(key).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn group_mentions(data: &Value, self_wxid: &str) -> bool {
    if self_wxid.is_empty() {
        return false;
    }
    let msg_source = nested_string(data, "MsgSource");
    if let Some(start) = msg_source.find("<atuserlist>") {
        let rest = &msg_source[start + "<atuserlist>".len()..];
        if let Some(end) = rest.find("</atuserlist>") {
            return rest[..end].contains(self_wxid);
        }
    }
    false
}

/// Group content is `"sender_wxid:\n@Bot message"`; strip the sender prefix
/// and the leading mention token.
fn group_text(content: &str) -> String {
    let body = content
        .split_once(":\n")
        .map(|(_, rest)| rest)
        .unwrap_or(content)
        .trim();
    let without_mention = if body.starts_with('@') {
        body.split_once(char::is_whitespace)
            .map(|(_, rest)| rest)
            .unwrap_or("")
    } else {
        body
    };
    without_mention.trim().to_string()
}
