//! Socket.IO event dispatch: authenticates the handshake, registers every
//! handler before any async work runs (so events emitted immediately after
//! `connected` are never silently dropped), then routes each event to the
//! Matcher, ChatRouter, StatsBroadcaster or ConnectionHub. State is threaded
//! through closures captured at registration time rather than socketioxide's
//! `State` extractor, the way the messaging service's call-signaling socket
//! does it.

use std::sync::Arc;

use socketioxide::extract::{Data, SocketRef};
use uuid::Uuid;

use matcher_shared::errors::AppError;
use matcher_shared::middleware::verify_token;

use crate::matching::matcher::{self as matcher_mod, SearchCriteria};
use crate::presence::STATS_ROOM;
use crate::socket::payloads::*;
use crate::AppState;

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

pub async fn on_connect_with_state(socket: SocketRef, auth: serde_json::Value, state: Arc<AppState>) {
    let user_id = match authenticate_socket(&socket, &auth, &state) {
        Ok(id) => id,
        Err(msg) => {
            tracing::warn!(error = %msg, "socket auth failed");
            let _ = socket.emit("auth_error", &ErrorPayload { message: msg });
            socket.disconnect().ok();
            return;
        }
    };

    socket.extensions.insert(user_id);

    socket.on("connection:ack", on_connection_ack);

    socket.on("search:start", {
        let state = state.clone();
        move |socket: SocketRef, Data(raw): Data<serde_json::Value>| {
            let state = state.clone();
            async move { on_search_start(socket, raw, &state).await }
        }
    });

    socket.on("search:cancel", {
        let state = state.clone();
        move |socket: SocketRef| {
            let state = state.clone();
            async move { on_search_cancel(socket, &state).await }
        }
    });

    socket.on("search:subscribe_stats", {
        let state = state.clone();
        move |socket: SocketRef| {
            let state = state.clone();
            async move { on_subscribe_stats(socket, &state).await }
        }
    });

    socket.on("search:unsubscribe_stats", on_unsubscribe_stats);

    socket.on("chat:join", {
        let state = state.clone();
        move |socket: SocketRef, Data(payload): Data<ChatJoinPayload>| {
            let state = state.clone();
            async move { on_chat_join(socket, payload, &state).await }
        }
    });

    socket.on("chat:leave", {
        let state = state.clone();
        move |socket: SocketRef, Data(payload): Data<ChatLeavePayload>| {
            let state = state.clone();
            on_chat_leave(socket, payload, &state);
        }
    });

    socket.on("chat:message", {
        let state = state.clone();
        move |socket: SocketRef, Data(payload): Data<ChatMessagePayload>| {
            let state = state.clone();
            async move { on_chat_message(socket, payload, &state).await }
        }
    });

    socket.on("chat:typing", {
        let state = state.clone();
        move |socket: SocketRef, Data(payload): Data<ChatTypingPayload>| {
            let state = state.clone();
            on_chat_typing(socket, payload, &state);
        }
    });

    socket.on("chat:read", {
        let state = state.clone();
        move |socket: SocketRef, Data(payload): Data<ChatReadPayload>| {
            let state = state.clone();
            async move { on_chat_read(socket, payload, &state).await }
        }
    });

    socket.on("chat:end", {
        let state = state.clone();
        move |socket: SocketRef, Data(payload): Data<ChatEndPayload>| {
            let state = state.clone();
            async move { on_chat_end(socket, payload, &state).await }
        }
    });

    socket.on("chat:rate", {
        let state = state.clone();
        move |socket: SocketRef, Data(payload): Data<ChatRatePayload>| {
            let state = state.clone();
            async move { on_chat_rate(socket, payload, &state).await }
        }
    });

    socket.on("contact:request", {
        let state = state.clone();
        move |socket: SocketRef, Data(payload): Data<ContactRequestPayload>| {
            let state = state.clone();
            on_contact_request(socket, payload, &state);
        }
    });

    socket.on("contact:respond", {
        let state = state.clone();
        move |socket: SocketRef, Data(payload): Data<ContactRespondPayload>| {
            let state = state.clone();
            on_contact_respond(socket, payload, &state);
        }
    });

    socket.on_disconnect({
        let state = state.clone();
        move |socket: SocketRef| {
            let state = state.clone();
            async move { on_disconnect(socket, state).await }
        }
    });

    let is_reconnect = auth.get("reconnect").and_then(|v| v.as_bool()).unwrap_or(false);
    let recovered = state.hub.register(user_id, socket.clone(), is_reconnect);

    tracing::info!(user_id = %user_id, sid = %socket.id, recovered = recovered, "socket connected");

    let _ = socket.emit("connected", &serde_json::json!({ "userId": user_id }));
    if recovered {
        let _ = socket.emit("connection:recovered", &ConnectionRecoveredPayload { recovered: true });
    }
}

async fn on_disconnect(socket: SocketRef, state: Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    tracing::info!(user_id = %user_id, sid = %socket.id, "socket disconnected");
    state.hub.on_disconnect(user_id, socket.id);
}

fn on_connection_ack(socket: SocketRef) {
    let user_id = get_user_id(&socket);
    tracing::debug!(user_id = ?user_id, "connection:ack received");
}

// ---------------------------------------------------------------------------
// search:* events
// ---------------------------------------------------------------------------

async fn on_search_start(socket: SocketRef, raw: serde_json::Value, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };

    let criteria: SearchCriteria = match serde_json::from_value(raw) {
        Ok(c) => c,
        Err(e) => {
            emit_error(&socket, format!("invalid search criteria: {e}"));
            return;
        }
    };

    match state.matcher.start_search(user_id, criteria).await {
        Ok(matcher_mod::SearchOutcome::Searching) => {
            matcher_mod::emit_searching_status(&state.hub, user_id);
        }
        Ok(matcher_mod::SearchOutcome::Matched { .. }) => {
            // Both participants are notified from inside the Matcher — it
            // knows the partner's identity, the caller's socket does not.
        }
        Err(e) => emit_app_error(&socket, &e),
    }
}

async fn on_search_cancel(socket: SocketRef, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    if let Err(e) = state.matcher.cancel_search(user_id).await {
        emit_app_error(&socket, &e);
    }
}

async fn on_subscribe_stats(socket: SocketRef, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    socket.join(STATS_ROOM.to_string()).ok();

    let own_search = state.matcher.active_search_started_at(user_id);
    let snapshot = state.stats.snapshot_for_subscriber(own_search).await;
    let _ = socket.emit("search:stats", &crate::stats::StatsPayload::from(&snapshot));
}

fn on_unsubscribe_stats(socket: SocketRef) {
    socket.leave(STATS_ROOM.to_string()).ok();
}

// ---------------------------------------------------------------------------
// chat:* events
// ---------------------------------------------------------------------------

async fn on_chat_join(socket: SocketRef, payload: ChatJoinPayload, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    match state.chat_router.join(user_id, &socket.id, payload.chat_id).await {
        Ok(joined) => {
            let _ = socket.emit("chat:joined", &joined);
        }
        Err(e) => emit_app_error(&socket, &e),
    }
}

fn on_chat_leave(socket: SocketRef, payload: ChatLeavePayload, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    state.chat_router.leave(user_id, &socket.id, payload.chat_id);
}

async fn on_chat_message(socket: SocketRef, payload: ChatMessagePayload, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    if let Err(e) = state.chat_router.send_message(user_id, payload.chat_id, &payload.content).await {
        emit_app_error(&socket, &e);
    }
}

fn on_chat_typing(socket: SocketRef, payload: ChatTypingPayload, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    state.chat_router.set_typing(&socket.id, user_id, payload.chat_id, true);
}

async fn on_chat_read(socket: SocketRef, payload: ChatReadPayload, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    if let Err(e) = state.chat_router.mark_read(user_id, payload.chat_id, payload.timestamp).await {
        emit_app_error(&socket, &e);
    }
}

async fn on_chat_end(socket: SocketRef, payload: ChatEndPayload, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    if let Err(e) = state.chat_router.end(user_id, payload.chat_id, payload.reason).await {
        emit_app_error(&socket, &e);
    }
}

async fn on_chat_rate(socket: SocketRef, payload: ChatRatePayload, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    let score = payload.score;
    match state.chat_router.rate(user_id, payload.chat_id, score, payload.comment).await {
        Ok(ack) => {
            state.hub.send_to_user(
                ack.rated_user_id,
                "chat:rated",
                serde_json::json!({ "chatId": ack.chat_id, "ratedBy": user_id, "score": score }),
            );
        }
        Err(e) => emit_app_error(&socket, &e),
    }
}

// ---------------------------------------------------------------------------
// contact:* events — a thin relay, no persisted state of its own
// ---------------------------------------------------------------------------

fn on_contact_request(socket: SocketRef, payload: ContactRequestPayload, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    state.hub.send_to_user(
        payload.to,
        "contact:request",
        ContactRequestOutPayload { from: user_id, chat_id: payload.chat_id },
    );
}

fn on_contact_respond(socket: SocketRef, payload: ContactRespondPayload, state: &Arc<AppState>) {
    let Some(user_id) = get_user_id(&socket) else { return };
    state.hub.send_to_user(
        payload.user_id,
        "contact:status",
        ContactStatusPayload { user_id, status: payload.status },
    );
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn get_user_id(socket: &SocketRef) -> Option<Uuid> {
    socket.extensions.get::<Uuid>()
}

fn emit_error(socket: &SocketRef, message: impl Into<String>) {
    let _ = socket.emit("error", &ErrorPayload { message: message.into() });
}

fn emit_app_error(socket: &SocketRef, error: &AppError) {
    emit_error(socket, error.client_message());
}

/// Token source priority per spec §6: handshake-auth field `token`, then
/// header `token`, then header `Authorization: Bearer <token>`.
fn authenticate_socket(socket: &SocketRef, auth: &serde_json::Value, state: &Arc<AppState>) -> Result<Uuid, String> {
    let token = auth
        .get("token")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| header_value(socket, "token"))
        .or_else(|| header_value(socket, "authorization").and_then(|h| h.strip_prefix("Bearer ").map(str::to_string)))
        .ok_or_else(|| "missing authentication token".to_string())?;

    verify_token(&token, &state.config.jwt_secret)
        .map(|user| user.id)
        .map_err(|e| e.client_message())
}

fn header_value(socket: &SocketRef, name: &str) -> Option<String> {
    socket
        .req_parts()
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
