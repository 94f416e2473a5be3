//! Typed inbound/outbound payloads for events not already owned by the
//! Matcher (`search:*`) or ChatRouter (`chat:*`) modules: connection
//! lifecycle and the contact-request relay. Per spec §9's design note, no
//! handler deserializes an untyped/`any` payload — every inbound event has
//! a closed, validated shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatJoinPayload {
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatLeavePayload {
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessagePayload {
    pub chat_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatTypingPayload {
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatReadPayload {
    pub chat_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatEndPayload {
    pub chat_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRatePayload {
    pub chat_id: Uuid,
    pub score: i32,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Accepted,
    Declined,
    Blocked,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContactRequestPayload {
    pub to: Uuid,
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContactRespondPayload {
    pub user_id: Uuid,
    pub status: ContactStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequestOutPayload {
    pub from: Uuid,
    pub chat_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactStatusPayload {
    pub user_id: Uuid,
    pub status: ContactStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecoveredPayload {
    pub recovered: bool,
}
