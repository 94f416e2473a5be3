//! The Matcher: `startSearch`/`cancelSearch` orchestration built on top of
//! the pure predicate/scoring math in [`crate::matching::algorithm`]. Owns
//! the CircuitBreaker guarding Store calls and drives the StatsBroadcaster's
//! incremental updates and ConnectionHub's match notifications (spec §4.1).

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use matcher_shared::clients::rabbitmq::RabbitMQClient;
use matcher_shared::clients::redis::RedisClient;
use matcher_shared::errors::{AppError, AppResult, ErrorCode};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::AppConfig;
use crate::events::publisher;
use crate::matching::algorithm::{self, Candidate};
use crate::matching::history;
use crate::models::{DesiredGender, Gender, NewSearchRecord, SearchRecord};
use crate::presence::ConnectionHub;
use crate::stats::{StatsAction, StatsBroadcaster};
use crate::store::{CancelOutcome, Store};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LocationInput {
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SearchCriteria {
    pub gender: Gender,
    #[validate(range(min = 18, max = 150))]
    pub age: i32,
    pub rating: Option<f64>,
    pub desired_gender: Vec<DesiredGender>,
    #[validate(range(min = 18, max = 100))]
    pub desired_age_min: i32,
    #[validate(range(min = 18, max = 100))]
    pub desired_age_max: i32,
    pub min_acceptable_rating: Option<f64>,
    #[serde(default)]
    pub use_geolocation: bool,
    pub location: Option<LocationInput>,
    pub max_distance: Option<f64>,
}

impl SearchCriteria {
    /// Validation beyond what `validator`'s attributes express: the
    /// cross-field and conditional invariants from spec §3.
    fn check(&self) -> AppResult<()> {
        self.validate().map_err(|e| AppError::validation(e.to_string()))?;

        if self.desired_gender.is_empty() {
            return Err(AppError::validation("desiredGender must not be empty"));
        }
        if self.desired_age_min > self.desired_age_max {
            return Err(AppError::validation("desiredAgeMin must be <= desiredAgeMax"));
        }
        if self.use_geolocation && self.location.is_none() {
            return Err(AppError::validation("location is required when useGeolocation is set"));
        }
        if let Some(max_distance) = self.max_distance {
            if !(1.0..=100.0).contains(&max_distance) {
                return Err(AppError::validation("maxDistance must be between 1 and 100 km"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum SearchOutcome {
    Searching,
    Matched {
        chat_id: Uuid,
        partner_telegram_id: i64,
        partner_gender: Gender,
        partner_age: i32,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchedUser {
    telegram_id: i64,
    gender: Gender,
    age: i32,
    chat_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchMatchedPayload {
    matched_user: MatchedUser,
}

#[derive(Debug, Clone, Serialize)]
struct SearchStatusPayload {
    status: &'static str,
}

pub struct Matcher {
    store: Arc<Store>,
    hub: Arc<ConnectionHub>,
    stats: Arc<StatsBroadcaster>,
    redis: Arc<RedisClient>,
    rabbitmq: Arc<RabbitMQClient>,
    config: Arc<AppConfig>,
    breaker: CircuitBreaker,
}

impl Matcher {
    pub fn new(
        store: Arc<Store>,
        hub: Arc<ConnectionHub>,
        stats: Arc<StatsBroadcaster>,
        redis: Arc<RedisClient>,
        rabbitmq: Arc<RabbitMQClient>,
        config: Arc<AppConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            stats,
            redis,
            rabbitmq,
            config,
            breaker: CircuitBreaker::for_matcher(),
        })
    }

    /// Own search lookup, surfaced for the `search:subscribe_stats`
    /// self-under-reporting correction (spec §4.3).
    pub fn active_search_started_at(&self, user_id: Uuid) -> Option<(Gender, DateTime<Utc>)> {
        self.store
            .find_active_search(user_id)
            .ok()
            .flatten()
            .map(|s| (s.gender(), s.created_at))
    }

    pub async fn start_search(&self, user_id: Uuid, criteria: SearchCriteria) -> AppResult<SearchOutcome> {
        criteria.check()?;

        if !self.breaker.is_available() {
            return Err(AppError::transient_store("matching service temporarily unavailable"));
        }

        let user = self
            .store
            .find_user(user_id)
            .inspect_err(|_| self.breaker.record_failure())?
            .ok_or_else(|| AppError::not_found("user not found"))?;

        if !user.is_active {
            return Err(AppError::precondition("user is not active"));
        }

        // Per-user distributed lock: two concurrent `search:start` calls for
        // the same user must not both run candidate selection at once.
        let lock_key = format!("matcher:lock:{user_id}");
        let acquired = self.redis.set_nx(&lock_key, "1", 5).await.unwrap_or(false);
        if !acquired {
            return Err(AppError::precondition("a search is already in progress for this user"));
        }

        let result = self.run_search(user_id, user.telegram_id, &criteria).await;
        let _ = self.redis.del(&lock_key).await;
        result
    }

    async fn run_search(&self, user_id: Uuid, telegram_id: i64, criteria: &SearchCriteria) -> AppResult<SearchOutcome> {
        // Step 1: cancel any pre-existing `searching` record for this user.
        if let Err(e) = self.store.cancel_any_searching(user_id) {
            self.breaker.record_failure();
            return Err(e);
        }

        let new_record = NewSearchRecord {
            user_id,
            telegram_id,
            status: "searching".into(),
            gender: criteria.gender.to_string(),
            age: criteria.age,
            rating: criteria.rating.unwrap_or(0.0),
            desired_gender: criteria.desired_gender.iter().map(|g| Some(g.to_string())).collect(),
            desired_age_min: criteria.desired_age_min,
            desired_age_max: criteria.desired_age_max,
            min_acceptable_rating: criteria.min_acceptable_rating.unwrap_or(-1.0),
            use_geolocation: criteria.use_geolocation,
            longitude: criteria.location.map(|l| l.longitude),
            latitude: criteria.location.map(|l| l.latitude),
            max_distance_km: if criteria.use_geolocation {
                Some(criteria.max_distance.unwrap_or(10.0))
            } else {
                None
            },
        };

        let inserted = match self.store.insert_search(&new_record) {
            Ok(rec) => {
                self.breaker.record_success();
                rec
            }
            Err(e) => {
                self.breaker.record_failure();
                return Err(e);
            }
        };

        self.stats.apply_delta(StatsAction::Start, inserted.gender());

        let max_age = ChronoDuration::seconds(self.config.search_ttl_secs);
        let candidate_records = match self.store.find_candidates(user_id, max_age) {
            Ok(rows) => rows,
            Err(e) => {
                self.breaker.record_failure();
                return Err(e);
            }
        };

        let candidate_ids: Vec<Uuid> = candidate_records.iter().map(|r| r.user_id).collect();
        let cooldowns = history::cooling_down_mask(&self.redis, user_id, &candidate_ids).await;

        let eligible: Vec<Candidate> = candidate_records
            .iter()
            .zip(cooldowns.iter())
            .filter(|(_, cooling)| !**cooling)
            .map(|(rec, _)| Candidate::from(rec))
            .collect();

        let me = Candidate::from(&inserted);
        let Some(best) = algorithm::select_best(&me, &eligible) else {
            return Ok(SearchOutcome::Searching);
        };

        let partner_record = candidate_records
            .iter()
            .find(|r| r.user_id == best.user_id)
            .expect("best candidate came from candidate_records");

        self.commit_match(&inserted, partner_record).await
    }

    async fn commit_match(&self, a: &SearchRecord, b: &SearchRecord) -> AppResult<SearchOutcome> {
        match self.store.create_match(a, b) {
            Ok(chat) => {
                self.breaker.record_success();

                history::set_cooldown(&self.redis, a.user_id, b.user_id, self.config.pair_cooldown_secs).await;
                self.stats.apply_delta(StatsAction::Match, a.gender());
                publisher::publish_match_created(&self.rabbitmq, chat.id, a.user_id, b.user_id).await;

                self.hub.send_to_user(
                    a.user_id,
                    "search:matched",
                    SearchMatchedPayload {
                        matched_user: MatchedUser {
                            telegram_id: b.telegram_id,
                            gender: b.gender(),
                            age: b.age,
                            chat_id: chat.id,
                        },
                    },
                );
                self.hub.send_to_user(
                    b.user_id,
                    "search:matched",
                    SearchMatchedPayload {
                        matched_user: MatchedUser {
                            telegram_id: a.telegram_id,
                            gender: a.gender(),
                            age: a.age,
                            chat_id: chat.id,
                        },
                    },
                );

                Ok(SearchOutcome::Matched {
                    chat_id: chat.id,
                    partner_telegram_id: b.telegram_id,
                    partner_gender: b.gender(),
                    partner_age: b.age,
                })
            }
            Err(AppError::Known { code: ErrorCode::PreconditionError, .. }) => {
                // Lost a race to a concurrent `startSearch`; this is
                // expected contention, not a Store failure, so the breaker
                // is left alone. The caller simply stays `searching`.
                tracing::debug!(user_a = %a.user_id, user_b = %b.user_id, "match race lost, staying searching");
                Ok(SearchOutcome::Searching)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    /// `cancelSearch` (spec §4.1): idempotent, always triggers a stats
    /// delta when it actually cancels something. Returns the existing
    /// pairing if a race already matched the record (the caller surfaces
    /// nothing — the `search:matched` event already fired from the winning
    /// side of that race).
    pub async fn cancel_search(&self, user_id: Uuid) -> AppResult<()> {
        match self.store.cancel_search(user_id) {
            Ok(CancelOutcome::NoActiveSearch) => Ok(()),
            Ok(CancelOutcome::Cancelled(rec)) => {
                self.stats.apply_delta(StatsAction::Cancel, rec.gender());
                Ok(())
            }
            Ok(CancelOutcome::AlreadyMatched(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

}

pub fn emit_searching_status(hub: &ConnectionHub, user_id: Uuid) {
    hub.send_to_user(user_id, "search:status", SearchStatusPayload { status: "searching" });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_criteria() -> SearchCriteria {
        SearchCriteria {
            gender: Gender::Male,
            age: 25,
            rating: None,
            desired_gender: vec![DesiredGender::Female],
            desired_age_min: 18,
            desired_age_max: 99,
            min_acceptable_rating: None,
            use_geolocation: false,
            location: None,
            max_distance: None,
        }
    }

    #[test]
    fn valid_criteria_passes_check() {
        assert!(base_criteria().check().is_ok());
    }

    #[test]
    fn empty_desired_gender_is_rejected() {
        let mut c = base_criteria();
        c.desired_gender = vec![];
        assert!(c.check().is_err());
    }

    #[test]
    fn inverted_age_range_is_rejected() {
        let mut c = base_criteria();
        c.desired_age_min = 50;
        c.desired_age_max = 20;
        assert!(c.check().is_err());
    }

    #[test]
    fn geolocation_without_location_is_rejected() {
        let mut c = base_criteria();
        c.use_geolocation = true;
        c.location = None;
        assert!(c.check().is_err());
    }

    #[test]
    fn geolocation_with_location_passes() {
        let mut c = base_criteria();
        c.use_geolocation = true;
        c.location = Some(LocationInput { longitude: 1.0, latitude: 2.0 });
        assert!(c.check().is_ok());
    }

    #[test]
    fn max_distance_out_of_range_is_rejected() {
        let mut c = base_criteria();
        c.max_distance = Some(0.5);
        assert!(c.check().is_err());

        let mut c2 = base_criteria();
        c2.max_distance = Some(150.0);
        assert!(c2.check().is_err());
    }

    #[test]
    fn out_of_range_age_is_rejected_by_validator() {
        let mut c = base_criteria();
        c.age = 10;
        assert!(c.check().is_err());
    }
}
