//! StatsBroadcaster: the cached `StatsSnapshot` plus the debounce/coalesce
//! timer and the re-entrance guard around full recomputation (spec §4.3).
//! A process-wide singleton — one instance, injected into the Matcher and
//! the ChatRouter, owning its own debounce state the way a static service
//! class would in a single-process runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::Gender;
use crate::presence::{ConnectionHub, STATS_ROOM};
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub searching_total: i64,
    pub searching_male: i64,
    pub searching_female: i64,
    pub online_total: i64,
    pub online_male: i64,
    pub online_female: i64,
    pub avg_search_male_secs: f64,
    pub avg_search_female_secs: f64,
    pub avg_search_total_secs: f64,
    pub matches_24h: i64,
    pub cached_at: DateTime<Utc>,
}

impl StatsSnapshot {
    fn empty(stale_since: DateTime<Utc>) -> Self {
        Self {
            searching_total: 0,
            searching_male: 0,
            searching_female: 0,
            online_total: 0,
            online_male: 0,
            online_female: 0,
            avg_search_male_secs: 0.0,
            avg_search_female_secs: 0.0,
            avg_search_total_secs: 0.0,
            matches_24h: 0,
            cached_at: stale_since,
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct OnlinePayload {
    pub t: i64,
    pub m: i64,
    pub f: i64,
}

#[derive(Debug, Serialize, Clone)]
pub struct AvgSearchTimePayload {
    pub t: f64,
    pub m: f64,
    pub f: f64,
    #[serde(rename = "matches24h")]
    pub matches_24h: i64,
}

#[derive(Debug, Serialize, Clone)]
pub struct StatsPayload {
    pub t: i64,
    pub m: i64,
    pub f: i64,
    pub online: OnlinePayload,
    #[serde(rename = "avgSearchTime")]
    pub avg_search_time: AvgSearchTimePayload,
}

impl From<&StatsSnapshot> for StatsPayload {
    fn from(s: &StatsSnapshot) -> Self {
        Self {
            t: s.searching_total,
            m: s.searching_male,
            f: s.searching_female,
            online: OnlinePayload {
                t: s.online_total,
                m: s.online_male,
                f: s.online_female,
            },
            avg_search_time: AvgSearchTimePayload {
                t: s.avg_search_total_secs,
                m: s.avg_search_male_secs,
                f: s.avg_search_female_secs,
                matches_24h: s.matches_24h,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum StatsAction {
    Start,
    Cancel,
    /// `gender` is the known participant; the other side of the pair is
    /// corrected on the next full refresh (spec §4.3 / §9, a deliberate
    /// precision-for-latency trade-off).
    Match,
}

pub struct StatsBroadcaster {
    store: Arc<Store>,
    hub: Arc<ConnectionHub>,
    snapshot: Mutex<StatsSnapshot>,
    cache_ttl: Duration,
    debounce: Duration,
    scheduled: AtomicBool,
    updating: AtomicBool,
    pending: AtomicBool,
}

impl StatsBroadcaster {
    pub fn new(store: Arc<Store>, hub: Arc<ConnectionHub>) -> Arc<Self> {
        let cache_ttl = Duration::from_secs(5);
        Arc::new(Self {
            store,
            hub,
            snapshot: Mutex::new(StatsSnapshot::empty(Utc::now() - chrono::Duration::seconds(6))),
            cache_ttl,
            debounce: Duration::from_secs(2),
            scheduled: AtomicBool::new(false),
            updating: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        })
    }

    /// Returns the cached snapshot, recomputing first if the 5s TTL has
    /// elapsed.
    pub async fn snapshot(self: &Arc<Self>) -> StatsSnapshot {
        let stale = {
            let snap = self.snapshot.lock().unwrap();
            Utc::now() - snap.cached_at > self.cache_ttl
        };
        if stale {
            self.refresh().await;
        }
        *self.snapshot.lock().unwrap()
    }

    /// Snapshot pushed immediately on `search:subscribe_stats`. If the
    /// subscriber's own search started after the cache's `cachedAt`, the
    /// cache cannot yet reflect it (their `start` delta landed after this
    /// read, or the cache is mid-recompute), so the correction is applied
    /// to this one response only — never to the shared cache (spec §4.3).
    pub async fn snapshot_for_subscriber(
        self: &Arc<Self>,
        own_search_started: Option<(Gender, DateTime<Utc>)>,
    ) -> StatsSnapshot {
        let mut snap = self.snapshot().await;
        if let Some((gender, started_at)) = own_search_started {
            if started_at > snap.cached_at {
                snap.searching_total += 1;
                match gender {
                    Gender::Male => snap.searching_male += 1,
                    Gender::Female => snap.searching_female += 1,
                }
            }
        }
        snap
    }

    /// Applies one of the three incremental deltas from spec §4.3, then
    /// schedules (or piggybacks on an already-scheduled) debounced
    /// broadcast.
    pub fn apply_delta(self: &Arc<Self>, action: StatsAction, gender: Gender) {
        {
            let mut snap = self.snapshot.lock().unwrap();
            match action {
                StatsAction::Start => {
                    snap.searching_total += 1;
                    bump(&mut snap.searching_male, &mut snap.searching_female, gender, 1);
                }
                StatsAction::Cancel => {
                    snap.searching_total = (snap.searching_total - 1).max(0);
                    bump(&mut snap.searching_male, &mut snap.searching_female, gender, -1);
                }
                StatsAction::Match => {
                    snap.searching_total = (snap.searching_total - 2).max(0);
                    bump(&mut snap.searching_male, &mut snap.searching_female, gender, -1);
                    snap.matches_24h += 1;
                }
            }
        }
        self.schedule_broadcast();
    }

    fn schedule_broadcast(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return; // a broadcast is already pending within this window
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            this.scheduled.store(false, Ordering::SeqCst);
            let snap = *this.snapshot.lock().unwrap();
            this.hub.broadcast_to_room(STATS_ROOM, "search:stats", StatsPayload::from(&snap));
        });
    }

    /// Forces a full recompute and schedules a broadcast of the result,
    /// regardless of whether the 5s cache TTL has elapsed. Used by
    /// ConnectionHub's 10s per-session activity refresh (spec §4.2 item 5)
    /// so online counts stay current even for sessions that never trigger
    /// another incremental delta.
    pub async fn refresh_and_broadcast(self: &Arc<Self>) {
        self.refresh().await;
        self.schedule_broadcast();
    }

    /// Full recompute from the Store, guarded so only one recomputation
    /// runs at a time; a recompute requested while one is already running
    /// sets `pending` and is served by one more pass once the in-flight
    /// pass finishes (spec §4.3's re-entrance guard).
    pub async fn refresh(self: &Arc<Self>) {
        if self.updating.swap(true, Ordering::SeqCst) {
            self.pending.store(true, Ordering::SeqCst);
            return;
        }

        loop {
            self.recompute_once();
            if !self.pending.swap(false, Ordering::SeqCst) {
                break;
            }
        }

        self.updating.store(false, Ordering::SeqCst);
    }

    fn recompute_once(&self) {
        let searching = self.store.count_searching_by_gender();
        let online = self.store.count_online_by_gender();
        let times = self.store.search_time_stats();

        match (searching, online, times) {
            (Ok(searching), Ok(online), Ok(times)) => {
                let mut snap = self.snapshot.lock().unwrap();
                snap.searching_total = searching.total;
                snap.searching_male = searching.male;
                snap.searching_female = searching.female;
                snap.online_total = online.total;
                snap.online_male = online.male;
                snap.online_female = online.female;
                snap.avg_search_male_secs = times.avg_male_secs;
                snap.avg_search_female_secs = times.avg_female_secs;
                snap.avg_search_total_secs = times.avg_total_secs;
                snap.matches_24h = times.matches_24h;
                snap.cached_at = Utc::now();
            }
            _ => {
                tracing::warn!("stats recompute failed; serving stale cache until the next TTL expiry");
            }
        }
    }
}

fn bump(male: &mut i64, female: &mut i64, gender: Gender, delta: i64) {
    let target = match gender {
        Gender::Male => male,
        Gender::Female => female,
    };
    *target = (*target + delta).max(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_targets_the_right_gender_counter() {
        let mut male = 3;
        let mut female = 5;
        bump(&mut male, &mut female, Gender::Male, 1);
        assert_eq!((male, female), (4, 5));
        bump(&mut male, &mut female, Gender::Female, -1);
        assert_eq!((male, female), (4, 4));
    }

    #[test]
    fn bump_never_goes_negative() {
        let mut male = 0;
        let mut female = 0;
        bump(&mut male, &mut female, Gender::Male, -1);
        assert_eq!(male, 0);
    }

    #[test]
    fn stats_payload_maps_snapshot_fields() {
        let snap = StatsSnapshot {
            searching_total: 10,
            searching_male: 4,
            searching_female: 6,
            online_total: 20,
            online_male: 9,
            online_female: 11,
            avg_search_male_secs: 30.0,
            avg_search_female_secs: 45.0,
            avg_search_total_secs: 37.5,
            matches_24h: 2,
            cached_at: Utc::now(),
        };
        let payload = StatsPayload::from(&snap);
        assert_eq!(payload.t, 10);
        assert_eq!(payload.online.m, 9);
        assert_eq!(payload.avg_search_time.matches_24h, 2);
    }
}
