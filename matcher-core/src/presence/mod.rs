//! ConnectionHub: the authenticated real-time session layer. Owns the
//! `userId -> sessions` and `userId -> rooms` maps (spec §4.2), the
//! disconnect-triggered cancellation grace timer, and the per-user room
//! memory used to recover rooms across a reconnect.
//!
//! Cancellation of in-flight grace timers uses the same `tokio::sync::watch`
//! idiom the indexer's file watcher uses for its shutdown signal: a `watch`
//! channel per pending timer, flipped to `true` to cancel, raced against the
//! sleep with `tokio::select!`.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use socketioxide::extract::SocketRef;
use socketioxide::SocketIo;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::matching::matcher::Matcher;
use crate::stats::StatsBroadcaster;
use crate::store::Store;

pub const STATS_ROOM: &str = "search_stats_room";

pub fn chat_room(chat_id: Uuid) -> String {
    format!("chat:{chat_id}")
}

pub fn search_room(user_id: Uuid) -> String {
    format!("search:{user_id}")
}

struct SessionEntry {
    socket: SocketRef,
    rooms: HashSet<String>,
    connected_at: DateTime<Utc>,
    #[allow(dead_code)]
    reconnected_from: Option<String>,
}

pub struct ConnectionHub {
    sessions: DashMap<Uuid, Vec<SessionEntry>>,
    /// Rooms remembered for a user between their last session dropping and
    /// the reconnection/room-memory window expiring (spec §4.2 items 2-4;
    /// the two windows share the same 2-minute default so one timer serves
    /// both concepts).
    remembered_rooms: DashMap<Uuid, HashSet<String>>,
    grace_cancel: DashMap<Uuid, watch::Sender<bool>>,
    room_cancel: DashMap<Uuid, watch::Sender<bool>>,
    io: SocketIo,
    store: Arc<Store>,
    config: Arc<AppConfig>,
    matcher: OnceLock<Arc<Matcher>>,
    stats: OnceLock<Arc<StatsBroadcaster>>,
}

impl ConnectionHub {
    pub fn new(io: SocketIo, store: Arc<Store>, config: Arc<AppConfig>) -> Self {
        Self {
            sessions: DashMap::new(),
            remembered_rooms: DashMap::new(),
            grace_cancel: DashMap::new(),
            room_cancel: DashMap::new(),
            io,
            store,
            config,
            matcher: OnceLock::new(),
            stats: OnceLock::new(),
        }
    }

    /// Matcher and ConnectionHub hold circular references (Matcher notifies
    /// through the hub; the hub's disconnect-grace timer cancels a search
    /// through the Matcher) so the Matcher handle is wired in once, after
    /// both are constructed, rather than threaded through `new`.
    pub fn set_matcher(&self, matcher: Arc<Matcher>) {
        let _ = self.matcher.set(matcher);
    }

    /// Same circular-reference problem as `set_matcher`: the
    /// StatsBroadcaster is constructed from an already-built `ConnectionHub`,
    /// so the hub can only get a handle back to it once both exist.
    pub fn set_stats(&self, stats: Arc<StatsBroadcaster>) {
        let _ = self.stats.set(stats);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|e| e.value().len()).sum()
    }

    pub fn online_user_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registers a newly authenticated socket. `is_reconnect` reflects the
    /// client's handshake-declared reconnection flag; returns `true` when
    /// the recovery window was still open and rooms were restored.
    pub fn register(self: &Arc<Self>, user_id: Uuid, socket: SocketRef, is_reconnect: bool) -> bool {
        if let Some((_, tx)) = self.grace_cancel.remove(&user_id) {
            let _ = tx.send(true);
        }

        let mut recovered = false;
        let mut restored_rooms = HashSet::new();

        if is_reconnect {
            if let Some(rooms) = self.remembered_rooms.get(&user_id) {
                restored_rooms = rooms.clone();
                for room in &restored_rooms {
                    socket.join(room.clone()).ok();
                }
                if let Some((_, tx)) = self.room_cancel.remove(&user_id) {
                    let _ = tx.send(true);
                }
                recovered = true;
            }
        }

        self.sessions.entry(user_id).or_default().push(SessionEntry {
            socket,
            rooms: restored_rooms,
            connected_at: Utc::now(),
            reconnected_from: None,
        });

        if let Err(e) = self.store.touch_user_active(user_id, true) {
            tracing::warn!(error = %e, user_id = %user_id, "failed to mark user active");
        }

        self.spawn_activity_refresh(user_id);

        recovered
    }

    pub fn join_room(&self, user_id: Uuid, sid: &socketioxide::socket::Sid, room: &str) {
        if let Some(mut sessions) = self.sessions.get_mut(&user_id) {
            if let Some(entry) = sessions.iter_mut().find(|e| &e.socket.id == sid) {
                entry.socket.join(room.to_string()).ok();
                entry.rooms.insert(room.to_string());
            }
        }
    }

    pub fn leave_room(&self, user_id: Uuid, sid: &socketioxide::socket::Sid, room: &str) {
        if let Some(mut sessions) = self.sessions.get_mut(&user_id) {
            if let Some(entry) = sessions.iter_mut().find(|e| &e.socket.id == sid) {
                entry.socket.leave(room.to_string()).ok();
                entry.rooms.remove(room);
            }
        }
    }

    /// Delivers to every session of `userId`, in dispatch order per
    /// session; cross-session ordering is explicitly not guaranteed (spec
    /// §5).
    pub fn send_to_user<T: serde::Serialize + Clone>(&self, user_id: Uuid, event: &'static str, payload: T) {
        if let Some(sessions) = self.sessions.get(&user_id) {
            for entry in sessions.iter() {
                let _ = entry.socket.emit(event, &payload);
            }
        }
    }

    pub fn broadcast_to_room<T: serde::Serialize + Clone>(&self, room: &str, event: &'static str, payload: T) {
        if let Err(e) = self.io.to(room.to_string()).emit(event, &payload) {
            tracing::warn!(error = %e, room = %room, event = %event, "room broadcast failed");
        }
    }

    /// Same as [`Self::broadcast_to_room`] but excludes `except`, the
    /// originating session. `io.to(room)` has no notion of a caller to leave
    /// out; this walks the session list instead, the way `chat:typing` (the
    /// one event in spec §4.4 that must never echo back to its sender)
    /// needs.
    pub fn broadcast_to_room_except<T: serde::Serialize + Clone>(
        &self,
        room: &str,
        except: &socketioxide::socket::Sid,
        event: &'static str,
        payload: T,
    ) {
        for sessions in self.sessions.iter() {
            for entry in sessions.value().iter() {
                if &entry.socket.id == except || !entry.rooms.contains(room) {
                    continue;
                }
                let _ = entry.socket.emit(event, &payload);
            }
        }
    }

    /// Called from `chat:join`/`chat:leave` handlers to keep both the
    /// socketioxide room and the per-user remembered set in sync.
    pub fn join_chat_room(&self, user_id: Uuid, sid: &socketioxide::socket::Sid, chat_id: Uuid) {
        self.join_room(user_id, sid, &chat_room(chat_id));
    }

    pub fn on_disconnect(self: &Arc<Self>, user_id: Uuid, sid: socketioxide::socket::Sid) {
        let remaining_rooms = {
            let Some(mut sessions) = self.sessions.get_mut(&user_id) else {
                return;
            };
            if let Some(pos) = sessions.iter().position(|e| e.socket.id == sid) {
                let removed = sessions.swap_remove(pos);
                if sessions.is_empty() {
                    Some(removed.rooms)
                } else {
                    None
                }
            } else {
                None
            }
        };

        // Drop the now-empty session vec entry so `online_user_count` stays
        // accurate; DashMap's retain avoids holding the per-shard lock
        // across the removal above.
        self.sessions.retain(|_, v| !v.is_empty());

        let Some(rooms) = remaining_rooms else {
            return; // user still has other live sessions
        };

        if let Err(e) = self.store.touch_user_active(user_id, false) {
            tracing::warn!(error = %e, user_id = %user_id, "failed to mark user inactive");
        }

        self.remembered_rooms.insert(user_id, rooms);
        self.spawn_room_forget_timer(user_id);
        self.spawn_cancellation_grace_timer(user_id);
    }

    /// Spec §4.2 item 5: while a user holds at least one session, refresh
    /// their `lastActive` every 10s and nudge the StatsBroadcaster so the
    /// online-count cache does not go stale for users who never send
    /// another event. One loop per `register` call; it exits on its own
    /// once the user's session set empties out, rather than being tracked
    /// and cancelled explicitly like the grace/room-forget timers.
    fn spawn_activity_refresh(self: &Arc<Self>, user_id: Uuid) {
        let hub = self.clone();
        let period = Duration::from_secs(self.config.activity_refresh_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; skip it

            loop {
                interval.tick().await;

                if !hub.sessions.contains_key(&user_id) {
                    return;
                }

                if let Err(e) = hub.store.touch_user_active(user_id, true) {
                    tracing::warn!(error = %e, user_id = %user_id, "activity refresh failed");
                }

                if let Some(stats) = hub.stats.get() {
                    stats.refresh_and_broadcast().await;
                }
            }
        });
    }

    fn spawn_cancellation_grace_timer(self: &Arc<Self>, user_id: Uuid) {
        let (tx, mut rx) = watch::channel(false);
        self.grace_cancel.insert(user_id, tx);

        let hub = self.clone();
        let grace = Duration::from_secs(self.config.disconnect_grace_secs);

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = rx.changed() => return, // reconnected within the grace window
            }

            hub.grace_cancel.remove(&user_id);
            if hub.sessions.contains_key(&user_id) {
                return; // reconnected without going through `register`'s cancel path
            }

            if let Some(matcher) = hub.matcher.get() {
                if let Err(e) = matcher.cancel_search(user_id).await {
                    tracing::warn!(error = %e, user_id = %user_id, "disconnect-grace cancellation failed");
                }
            }
        });
    }

    fn spawn_room_forget_timer(self: &Arc<Self>, user_id: Uuid) {
        let (tx, mut rx) = watch::channel(false);
        self.room_cancel.insert(user_id, tx);

        let hub = self.clone();
        let retention = Duration::from_secs(self.config.room_memory_secs);

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(retention) => {}
                _ = rx.changed() => return,
            }

            hub.room_cancel.remove(&user_id);
            hub.remembered_rooms.remove(&user_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_room_is_namespaced_per_chat() {
        let id = Uuid::nil();
        assert_eq!(chat_room(id), format!("chat:{id}"));
    }

    #[test]
    fn search_room_is_namespaced_per_user() {
        let id = Uuid::nil();
        assert_eq!(search_room(id), format!("search:{id}"));
    }

    #[test]
    fn chat_and_search_rooms_never_collide() {
        let id = Uuid::nil();
        assert_ne!(chat_room(id), search_room(id));
    }
}
