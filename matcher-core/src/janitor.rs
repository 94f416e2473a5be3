//! JanitorLoop: three independently-scheduled sweeps keeping `searches` and
//! `chats` honest against their TTLs (spec §4.6). Grounded on the
//! analytics service's hourly `spawn_aggregation_task`, generalized to
//! three distinct intervals instead of one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::Serialize;

use crate::config::AppConfig;
use crate::presence::{search_room, ConnectionHub};
use crate::stats::{StatsAction, StatsBroadcaster};
use crate::store::Store;

const SEARCH_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const CHAT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize)]
struct SearchExpiredPayload {
    reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatExpiredPayload {
    chat_id: uuid::Uuid,
}

pub fn spawn(store: Arc<Store>, hub: Arc<ConnectionHub>, stats: Arc<StatsBroadcaster>, config: Arc<AppConfig>) {
    spawn_search_expiry(store.clone(), hub.clone(), stats.clone(), config.clone());
    spawn_chat_expiry(store.clone(), hub.clone());
    spawn_retention_sweep(store);
}

/// Expires `searching` rows whose age exceeds `searchTtlSecs`, notifying
/// the searcher and bumping the StatsBroadcaster's counters so a stale
/// search never silently lingers in the cached totals.
fn spawn_search_expiry(store: Arc<Store>, hub: Arc<ConnectionHub>, stats: Arc<StatsBroadcaster>, config: Arc<AppConfig>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SEARCH_SWEEP_INTERVAL);
        let max_age = ChronoDuration::seconds(config.search_ttl_secs);

        loop {
            interval.tick().await;

            match store.expire_stale_searches(max_age) {
                Ok(expired) => {
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "expired stale searches");
                    }
                    for record in expired {
                        hub.send_to_user(record.user_id, "search:expired", SearchExpiredPayload { reason: "ttl" });
                        hub.broadcast_to_room(&search_room(record.user_id), "search:expired", SearchExpiredPayload { reason: "ttl" });
                        stats.apply_delta(StatsAction::Cancel, record.gender());
                    }
                }
                Err(e) => tracing::error!(error = %e, "search expiry sweep failed"),
            }
        }
    });
}

/// Expires anonymous chats past their 24h `expiresAt`, notifying both
/// participants' rooms so clients can leave the conversation cleanly.
fn spawn_chat_expiry(store: Arc<Store>, hub: Arc<ConnectionHub>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CHAT_SWEEP_INTERVAL);

        loop {
            interval.tick().await;

            match store.expire_stale_chats() {
                Ok(expired) => {
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "expired stale chats");
                    }
                    for chat in expired {
                        hub.broadcast_to_room(
                            &crate::presence::chat_room(chat.id),
                            "chat:ended",
                            ChatExpiredPayload { chat_id: chat.id },
                        );
                    }
                }
                Err(e) => tracing::error!(error = %e, "chat expiry sweep failed"),
            }
        }
    });
}

/// Daily retention hook (spec §4.6's 24h housekeeping slot). Currently a
/// log-only placeholder: no retention policy beyond the TTL sweeps above is
/// in scope, but the schedule is kept as its own loop so a future retention
/// job (e.g. hard-deleting ended chats older than N days) has a slot
/// without perturbing the other two sweeps' cadence.
fn spawn_retention_sweep(_store: Arc<Store>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            tracing::info!("daily retention sweep tick (no-op)");
        }
    });
}
