//! ChatRouter: the message/typing/read/rate/end surface for an anonymous
//! chat once the Matcher has paired two searchers (spec §4.4). Every
//! mutating call is re-checked against `ChatRecord.participants`/`isActive`
//! at the Store layer rather than trusted from the caller's claim.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use socketioxide::socket::Sid;
use uuid::Uuid;

use matcher_shared::clients::rabbitmq::RabbitMQClient;
use matcher_shared::errors::{AppError, AppResult};

use crate::circuit_breaker::CircuitBreaker;
use crate::events::publisher;
use crate::models::{ChatMessage, NewRating};
use crate::presence::{chat_room, ConnectionHub};
use crate::store::Store;

const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatJoinedPayload {
    pub chat_id: Uuid,
    pub partner_telegram_id: Option<i64>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessagePayload {
    chat_id: Uuid,
    sender: Uuid,
    content: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatTypingPayload {
    chat_id: Uuid,
    user_id: Uuid,
    is_typing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatReadPayload {
    chat_id: Uuid,
    reader: Uuid,
    up_to: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatEndedPayload {
    chat_id: Uuid,
    ended_by: Uuid,
    reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingAckPayload {
    pub chat_id: Uuid,
    pub rated_user_id: Uuid,
    pub new_average: f64,
}

pub struct ChatRouter {
    store: Arc<Store>,
    hub: Arc<ConnectionHub>,
    rabbitmq: Arc<RabbitMQClient>,
    breaker: CircuitBreaker,
}

impl ChatRouter {
    pub fn new(store: Arc<Store>, hub: Arc<ConnectionHub>, rabbitmq: Arc<RabbitMQClient>) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            rabbitmq,
            breaker: CircuitBreaker::for_chat_router(),
        })
    }

    fn guard(&self) -> AppResult<()> {
        if !self.breaker.is_available() {
            return Err(AppError::transient_store("chat service temporarily unavailable"));
        }
        Ok(())
    }

    /// `send_message`'s own breaker-open fallback (spec §4.5): a "Message
    /// queued" hint rather than the generic refusal the other four
    /// operations return, distinguishing "try again, this will still be
    /// delivered" from "the service is down, nothing happened".
    fn guard_message(&self) -> AppResult<()> {
        if !self.breaker.is_available() {
            return Err(AppError::transient_store("Message queued"));
        }
        Ok(())
    }

    pub async fn join(&self, user_id: Uuid, sid: &Sid, chat_id: Uuid) -> AppResult<ChatJoinedPayload> {
        self.guard()?;

        let chat = match self.store.find_chat(chat_id) {
            Ok(Some(c)) => {
                self.breaker.record_success();
                c
            }
            Ok(None) => return Err(AppError::not_found("chat not found")),
            Err(e) => {
                self.breaker.record_failure();
                return Err(e);
            }
        };

        if !chat.has_participant(user_id) {
            return Err(AppError::precondition("you are not a participant of this chat"));
        }
        if !chat.is_active {
            return Err(AppError::precondition("this chat has ended"));
        }

        self.hub.join_chat_room(user_id, sid, chat_id);

        let partner_telegram_id = match chat.other_participant(user_id) {
            Some(partner_id) => self.store.find_user(partner_id)?.map(|u| u.telegram_id),
            None => None,
        };

        Ok(ChatJoinedPayload {
            chat_id,
            partner_telegram_id,
            messages: chat.messages(),
        })
    }

    pub fn leave(&self, user_id: Uuid, sid: &Sid, chat_id: Uuid) {
        self.hub.leave_room(user_id, sid, &chat_room(chat_id));
    }

    pub async fn send_message(&self, user_id: Uuid, chat_id: Uuid, content: &str) -> AppResult<()> {
        self.guard_message()?;

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(AppError::validation("message content must not be empty"));
        }
        if trimmed.chars().count() > MAX_MESSAGE_LEN {
            return Err(AppError::validation(format!(
                "message content exceeds {MAX_MESSAGE_LEN} characters"
            )));
        }

        self.authorize_participant(chat_id, user_id)?;

        let timestamp = Utc::now();
        match self.store.append_message(chat_id, user_id, trimmed) {
            Ok(_) => self.breaker.record_success(),
            Err(e @ AppError::Known { code: matcher_shared::errors::ErrorCode::PreconditionError, .. }) => {
                return Err(e);
            }
            Err(e) => {
                self.breaker.record_failure();
                return Err(e);
            }
        }

        self.hub.broadcast_to_room(
            &chat_room(chat_id),
            "chat:message",
            ChatMessagePayload { chat_id, sender: user_id, content: trimmed.to_string(), timestamp },
        );
        Ok(())
    }

    /// `chat:typing` is ephemeral presence noise, not persisted, so it
    /// bypasses the circuit breaker entirely (spec §4.4). Unlike
    /// `chat:message`/`chat:read`, spec §4.4 requires this one event never
    /// echo back to its own sender, so it goes through
    /// `broadcast_to_room_except` rather than the plain `broadcast_to_room`
    /// the other room fan-outs use.
    pub fn set_typing(&self, sender_sid: &Sid, user_id: Uuid, chat_id: Uuid, is_typing: bool) {
        self.hub.broadcast_to_room_except(
            &chat_room(chat_id),
            sender_sid,
            "chat:typing",
            ChatTypingPayload { chat_id, user_id, is_typing },
        );
    }

    pub async fn mark_read(&self, user_id: Uuid, chat_id: Uuid, up_to: DateTime<Utc>) -> AppResult<()> {
        self.guard()?;
        self.authorize_participant(chat_id, user_id)?;

        match self.store.mark_read(chat_id, user_id, up_to) {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                self.breaker.record_failure();
                return Err(e);
            }
        }

        self.hub.broadcast_to_room(&chat_room(chat_id), "chat:read", ChatReadPayload { chat_id, reader: user_id, up_to });
        Ok(())
    }

    pub async fn end(&self, user_id: Uuid, chat_id: Uuid, reason: Option<String>) -> AppResult<()> {
        self.guard()?;
        let chat = self.authorize_participant(chat_id, user_id)?;

        let ended = match self.store.end_chat(chat_id, user_id, reason.clone()) {
            Ok(c) => {
                self.breaker.record_success();
                c
            }
            Err(e @ AppError::Known { code: matcher_shared::errors::ErrorCode::PreconditionError, .. }) => {
                return Err(e);
            }
            Err(e) => {
                self.breaker.record_failure();
                return Err(e);
            }
        };

        let duration_secs = (ended.ended_at.unwrap_or_else(Utc::now) - ended.started_at).num_seconds().max(0);
        let reason_str = reason.clone().unwrap_or_else(|| "user_ended".to_string());
        if let Some(partner) = chat.other_participant(user_id) {
            publisher::publish_chat_ended(&self.rabbitmq, chat_id, user_id, partner, duration_secs, &reason_str)
                .await;
        }

        self.hub.broadcast_to_room(
            &chat_room(chat_id),
            "chat:ended",
            ChatEndedPayload { chat_id, ended_by: user_id, reason },
        );
        Ok(())
    }

    pub async fn rate(&self, user_id: Uuid, chat_id: Uuid, score: i32, comment: Option<String>) -> AppResult<RatingAckPayload> {
        self.guard()?;

        if !(1..=5).contains(&score) {
            return Err(AppError::validation("score must be between 1 and 5"));
        }

        let chat = match self.store.find_chat(chat_id) {
            Ok(Some(c)) => c,
            Ok(None) => return Err(AppError::not_found("chat not found")),
            Err(e) => {
                self.breaker.record_failure();
                return Err(e);
            }
        };

        if !chat.has_participant(user_id) {
            return Err(AppError::precondition("you are not a participant of this chat"));
        }
        let Some(rated_user_id) = chat.other_participant(user_id) else {
            return Err(AppError::precondition("chat has no other participant to rate"));
        };

        let new_rating = NewRating {
            rated_user_id,
            rater_user_id: user_id,
            chat_id,
            score,
            comment,
        };

        match self.store.insert_rating_and_recompute(&new_rating) {
            Ok((_, mean)) => {
                self.breaker.record_success();
                Ok(RatingAckPayload { chat_id, rated_user_id, new_average: mean })
            }
            Err(e @ AppError::Known { code: matcher_shared::errors::ErrorCode::PreconditionError, .. }) => Err(e),
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    fn authorize_participant(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<crate::models::ChatRecord> {
        let chat = self
            .store
            .find_chat(chat_id)?
            .ok_or_else(|| AppError::not_found("chat not found"))?;
        if !chat.has_participant(user_id) {
            return Err(AppError::precondition("you are not a participant of this chat"));
        }
        if !chat.is_active {
            return Err(AppError::precondition("this chat has ended"));
        }
        Ok(chat)
    }
}
