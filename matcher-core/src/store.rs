//! Durable records of searches, chats and ratings, plus the stats
//! aggregations the StatsBroadcaster falls back to on a cache miss. The one
//! Postgres-backed implementation the rest of the core is written against.
//!
//! Every method that spans more than one row (atomic pair creation, message
//! append-then-read, rating insert + mean recompute) runs inside a single
//! `conn.transaction`, mirroring the blocking-Diesel-call-in-async-fn idiom
//! used throughout this workspace's services (no `spawn_blocking` wrapper).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::sql_types::{BigInt, Double, Nullable, Text};
use diesel::prelude::*;
use uuid::Uuid;

use matcher_shared::errors::{AppError, AppResult};

use crate::models::{
    ChatMessage, ChatRecord, NewChatRecord, NewRating, NewSearchRecord, Rating, SearchRecord,
    SearchStatus, User,
};
use crate::schema::{chats, ratings, searches, users};
use crate::DbPool;

#[derive(Debug, Clone, Copy)]
pub struct GenderCounts {
    pub total: i64,
    pub male: i64,
    pub female: i64,
}

impl GenderCounts {
    fn zero() -> Self {
        Self { total: 0, male: 0, female: 0 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchTimeStats {
    pub avg_male_secs: f64,
    pub avg_female_secs: f64,
    pub avg_total_secs: f64,
    pub matches_24h: i64,
}

/// Outcome of an idempotent `cancelSearch` call (spec §4.1, "Cancel vs.
/// match" race hazard).
pub enum CancelOutcome {
    NoActiveSearch,
    Cancelled(SearchRecord),
    AlreadyMatched(SearchRecord),
}

pub struct Store {
    db: DbPool,
}

impl Store {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    fn conn(&self) -> AppResult<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<diesel::pg::PgConnection>>> {
        self.db.get().map_err(|e| AppError::transient_store(e.to_string()))
    }

    /// `/health`'s database probe: acquiring a pooled connection is enough
    /// to prove the pool and the database are both reachable.
    pub fn ping(&self) -> AppResult<()> {
        self.conn()?;
        Ok(())
    }

    // --- UserDirectory-shaped reads the core owns directly -----------------

    pub fn find_user(&self, user_id: Uuid) -> AppResult<Option<User>> {
        let mut conn = self.conn()?;
        Ok(users::table.find(user_id).first::<User>(&mut conn).optional()?)
    }

    /// Flips `isActive`/`lastActive` the way ConnectionHub's session
    /// lifecycle (spec §4.2) calls for on connect/disconnect and on the
    /// 10s activity heartbeat.
    pub fn touch_user_active(&self, user_id: Uuid, active: bool) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::update(users::table.find(user_id))
            .set((users::is_active.eq(active), users::last_active.eq(Utc::now())))
            .execute(&mut conn)?;
        Ok(())
    }

    // --- SearchRecord --------------------------------------------------------

    pub fn find_active_search(&self, user_id: Uuid) -> AppResult<Option<SearchRecord>> {
        let mut conn = self.conn()?;
        Ok(searches::table
            .filter(searches::user_id.eq(user_id))
            .filter(searches::status.eq("searching"))
            .order(searches::created_at.desc())
            .first::<SearchRecord>(&mut conn)
            .optional()?)
    }

    /// Step 1 of `startSearch`: any existing `searching` record for this
    /// user is transitioned to `cancelled` before the new one is inserted.
    pub fn cancel_any_searching(&self, user_id: Uuid) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::update(
            searches::table
                .filter(searches::user_id.eq(user_id))
                .filter(searches::status.eq("searching")),
        )
        .set((searches::status.eq("cancelled"), searches::updated_at.eq(Utc::now())))
        .execute(&mut conn)?;
        Ok(())
    }

    pub fn insert_search(&self, new_search: &NewSearchRecord) -> AppResult<SearchRecord> {
        let mut conn = self.conn()?;
        Ok(diesel::insert_into(searches::table)
            .values(new_search)
            .get_result(&mut conn)?)
    }

    /// Candidate scan per spec §4.1.1: `status = searching`, not the
    /// searcher themselves, and not old enough that the JanitorLoop would
    /// expire it before a reply could reach it (Open Question #2 in
    /// DESIGN.md).
    pub fn find_candidates(&self, exclude_user: Uuid, max_age: ChronoDuration) -> AppResult<Vec<SearchRecord>> {
        let mut conn = self.conn()?;
        let cutoff = Utc::now() - max_age;
        Ok(searches::table
            .filter(searches::status.eq("searching"))
            .filter(searches::user_id.ne(exclude_user))
            .filter(searches::created_at.ge(cutoff))
            .load::<SearchRecord>(&mut conn)?)
    }

    /// Atomic pair creation (spec §4.1.3). Creates the chat, then
    /// transitions both search rows to `matched` conditioned on them still
    /// being `searching`; any row that lost the race rolls the whole
    /// transaction back rather than leaving a half-made pair observable.
    pub fn create_match(&self, search_a: &SearchRecord, search_b: &SearchRecord) -> AppResult<ChatRecord> {
        let mut conn = self.conn()?;
        let result: Result<ChatRecord, diesel::result::Error> = conn.transaction(|conn| {
            let new_chat = NewChatRecord {
                participants: vec![search_a.user_id, search_b.user_id],
                chat_type: "anonymous".into(),
                is_active: true,
                expires_at: Some(Utc::now() + ChronoDuration::hours(24)),
                messages: serde_json::json!([]),
            };
            let chat: ChatRecord = diesel::insert_into(chats::table)
                .values(&new_chat)
                .get_result(conn)?;

            let now = Utc::now();
            let updated_a = diesel::update(searches::table.find(search_a.id))
                .filter(searches::status.eq("searching"))
                .set((
                    searches::status.eq("matched"),
                    searches::matched_with_user_id.eq(Some(search_b.user_id)),
                    searches::matched_with_telegram_id.eq(Some(search_b.telegram_id)),
                    searches::matched_with_chat_id.eq(Some(chat.id)),
                    searches::updated_at.eq(now),
                ))
                .execute(conn)?;
            if updated_a == 0 {
                return Err(diesel::result::Error::RollbackTransaction);
            }

            let updated_b = diesel::update(searches::table.find(search_b.id))
                .filter(searches::status.eq("searching"))
                .set((
                    searches::status.eq("matched"),
                    searches::matched_with_user_id.eq(Some(search_a.user_id)),
                    searches::matched_with_telegram_id.eq(Some(search_a.telegram_id)),
                    searches::matched_with_chat_id.eq(Some(chat.id)),
                    searches::updated_at.eq(now),
                ))
                .execute(conn)?;
            if updated_b == 0 {
                return Err(diesel::result::Error::RollbackTransaction);
            }

            Ok(chat)
        });

        result.map_err(|e| match e {
            diesel::result::Error::RollbackTransaction => {
                AppError::precondition("candidate was claimed by a concurrent match")
            }
            other => AppError::from(other),
        })
    }

    /// Idempotent `cancelSearch` (spec §4.1). No-op if nothing is
    /// `searching`; returns the existing pairing if a race already matched
    /// the record out from under the caller.
    pub fn cancel_search(&self, user_id: Uuid) -> AppResult<CancelOutcome> {
        let mut conn = self.conn()?;

        let existing: Option<SearchRecord> = searches::table
            .filter(searches::user_id.eq(user_id))
            .filter(searches::status.eq_any(["searching", "matched"]))
            .order(searches::created_at.desc())
            .first(&mut conn)
            .optional()?;

        let Some(rec) = existing else {
            return Ok(CancelOutcome::NoActiveSearch);
        };

        if rec.status() == SearchStatus::Matched {
            return Ok(CancelOutcome::AlreadyMatched(rec));
        }

        let updated = diesel::update(searches::table.find(rec.id))
            .filter(searches::status.eq("searching"))
            .set((searches::status.eq("cancelled"), searches::updated_at.eq(Utc::now())))
            .execute(&mut conn)?;

        if updated == 0 {
            // Lost the race to a concurrent match transition.
            let refreshed: SearchRecord = searches::table.find(rec.id).first(&mut conn)?;
            return Ok(CancelOutcome::AlreadyMatched(refreshed));
        }

        Ok(CancelOutcome::Cancelled(rec))
    }

    /// JanitorLoop's 30-minute search expiry.
    pub fn expire_stale_searches(&self, max_age: ChronoDuration) -> AppResult<Vec<SearchRecord>> {
        let mut conn = self.conn()?;
        let cutoff = Utc::now() - max_age;
        Ok(diesel::update(
            searches::table
                .filter(searches::status.eq("searching"))
                .filter(searches::created_at.lt(cutoff)),
        )
        .set((searches::status.eq("expired"), searches::updated_at.eq(Utc::now())))
        .get_results::<SearchRecord>(&mut conn)?)
    }

    // --- ChatRecord ------------------------------------------------------

    pub fn find_chat(&self, chat_id: Uuid) -> AppResult<Option<ChatRecord>> {
        let mut conn = self.conn()?;
        Ok(chats::table.find(chat_id).first::<ChatRecord>(&mut conn).optional()?)
    }

    pub fn append_message(&self, chat_id: Uuid, sender: Uuid, content: &str) -> AppResult<ChatRecord> {
        let mut conn = self.conn()?;
        let result: Result<ChatRecord, diesel::result::Error> = conn.transaction(|conn| {
            let chat: ChatRecord = chats::table.find(chat_id).for_update().first(conn)?;
            if !chat.is_active {
                return Err(diesel::result::Error::RollbackTransaction);
            }

            let mut messages = chat.messages();
            messages.push(ChatMessage {
                sender,
                content: content.to_string(),
                timestamp: Utc::now(),
                is_read: false,
            });
            let messages_json = serde_json::to_value(&messages).expect("messages serialize");

            diesel::update(chats::table.find(chat_id))
                .set((chats::messages.eq(messages_json), chats::last_message.eq(Some(content.to_string()))))
                .get_result(conn)
        });

        result.map_err(|e| match e {
            diesel::result::Error::RollbackTransaction => AppError::precondition("chat is not active"),
            other => AppError::from(other),
        })
    }

    pub fn mark_read(&self, chat_id: Uuid, reader: Uuid, up_to: DateTime<Utc>) -> AppResult<ChatRecord> {
        let mut conn = self.conn()?;
        let chat: ChatRecord = chats::table.find(chat_id).for_update().first(&mut conn)?;

        let mut messages = chat.messages();
        for msg in messages.iter_mut() {
            if msg.sender != reader && msg.timestamp <= up_to {
                msg.is_read = true;
            }
        }
        let messages_json = serde_json::to_value(&messages).expect("messages serialize");

        Ok(diesel::update(chats::table.find(chat_id))
            .set(chats::messages.eq(messages_json))
            .get_result(&mut conn)?)
    }

    pub fn end_chat(&self, chat_id: Uuid, ended_by: Uuid, reason: Option<String>) -> AppResult<ChatRecord> {
        let mut conn = self.conn()?;
        let updated = diesel::update(
            chats::table.find(chat_id).filter(chats::is_active.eq(true)),
        )
        .set((
            chats::is_active.eq(false),
            chats::ended_at.eq(Some(Utc::now())),
            chats::ended_by.eq(Some(ended_by)),
            chats::end_reason.eq(reason),
        ))
        .get_results::<ChatRecord>(&mut conn)?;

        updated
            .into_iter()
            .next()
            .ok_or_else(|| AppError::precondition("chat already ended"))
    }

    /// JanitorLoop's 60-second TTL sweep for anonymous chats.
    pub fn expire_stale_chats(&self) -> AppResult<Vec<ChatRecord>> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        Ok(diesel::update(
            chats::table
                .filter(chats::is_active.eq(true))
                .filter(chats::expires_at.le(now)),
        )
        .set((
            chats::is_active.eq(false),
            chats::ended_at.eq(Some(now)),
            chats::end_reason.eq(Some("expired".to_string())),
        ))
        .get_results::<ChatRecord>(&mut conn)?)
    }

    // --- Rating ------------------------------------------------------------

    /// Inserts the rating (unique `(raterUserId, chatId)` enforced by the
    /// migration's unique index) and recomputes the ratee's mean in the
    /// same transaction, so the two invariants in spec §8 never observe an
    /// intermediate state.
    pub fn insert_rating_and_recompute(&self, new_rating: &NewRating) -> AppResult<(Rating, f64)> {
        let mut conn = self.conn()?;
        let result: Result<(Rating, f64), diesel::result::Error> = conn.transaction(|conn| {
            let rating: Rating = diesel::insert_into(ratings::table)
                .values(new_rating)
                .get_result(conn)?;

            #[derive(QueryableByName)]
            struct AvgRow {
                #[diesel(sql_type = Nullable<Double>)]
                avg: Option<f64>,
            }

            let row = diesel::sql_query(
                "SELECT AVG(score)::float8 AS avg FROM ratings WHERE rated_user_id = $1",
            )
            .bind::<diesel::sql_types::Uuid, _>(new_rating.rated_user_id)
            .get_result::<AvgRow>(conn)?;
            let mean = row.avg.unwrap_or(0.0);

            diesel::update(users::table.find(new_rating.rated_user_id))
                .set(users::rating.eq(mean))
                .execute(conn)?;

            Ok((rating, mean))
        });

        result.map_err(|e| match e {
            diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::UniqueViolation, _) => {
                AppError::precondition("you have already rated this chat")
            }
            other => AppError::from(other),
        })
    }

    // --- Stats aggregation (StatsBroadcaster's cache-miss path) -----------

    pub fn count_searching_by_gender(&self) -> AppResult<GenderCounts> {
        let mut conn = self.conn()?;

        #[derive(QueryableByName)]
        struct Row {
            #[diesel(sql_type = Text)]
            gender: String,
            #[diesel(sql_type = BigInt)]
            cnt: i64,
        }

        let rows = diesel::sql_query(
            "SELECT gender, COUNT(*) AS cnt FROM searches WHERE status = 'searching' GROUP BY gender",
        )
        .get_results::<Row>(&mut conn)?;

        let mut counts = GenderCounts::zero();
        for row in rows {
            counts.total += row.cnt;
            match row.gender.as_str() {
                "male" => counts.male += row.cnt,
                "female" => counts.female += row.cnt,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// "Online" per spec §4.3: users whose `lastActive` falls within the
    /// last 30 seconds, grouped by gender.
    pub fn count_online_by_gender(&self) -> AppResult<GenderCounts> {
        let mut conn = self.conn()?;

        #[derive(QueryableByName)]
        struct Row {
            #[diesel(sql_type = Text)]
            gender: String,
            #[diesel(sql_type = BigInt)]
            cnt: i64,
        }

        let rows = diesel::sql_query(
            "SELECT gender, COUNT(*) AS cnt FROM users \
             WHERE last_active >= now() - INTERVAL '30 seconds' GROUP BY gender",
        )
        .get_results::<Row>(&mut conn)?;

        let mut counts = GenderCounts::zero();
        for row in rows {
            counts.total += row.cnt;
            match row.gender.as_str() {
                "male" => counts.male += row.cnt,
                "female" => counts.female += row.cnt,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Average `updatedAt - createdAt` over `matched` records (a proxy for
    /// search wait time) plus the count of matches in the trailing 24h.
    pub fn search_time_stats(&self) -> AppResult<SearchTimeStats> {
        let mut conn = self.conn()?;

        #[derive(QueryableByName)]
        struct Row {
            #[diesel(sql_type = Text)]
            gender: String,
            #[diesel(sql_type = Nullable<Double>)]
            avg_secs: Option<f64>,
        }

        let rows = diesel::sql_query(
            "SELECT gender, AVG(EXTRACT(EPOCH FROM (updated_at - created_at)))::float8 AS avg_secs \
             FROM searches WHERE status = 'matched' GROUP BY gender",
        )
        .get_results::<Row>(&mut conn)?;

        let mut avg_male = 0.0;
        let mut avg_female = 0.0;
        for row in &rows {
            match row.gender.as_str() {
                "male" => avg_male = row.avg_secs.unwrap_or(0.0),
                "female" => avg_female = row.avg_secs.unwrap_or(0.0),
                _ => {}
            }
        }

        #[derive(QueryableByName)]
        struct OverallRow {
            #[diesel(sql_type = Nullable<Double>)]
            avg_secs: Option<f64>,
        }
        let overall = diesel::sql_query(
            "SELECT AVG(EXTRACT(EPOCH FROM (updated_at - created_at)))::float8 AS avg_secs \
             FROM searches WHERE status = 'matched'",
        )
        .get_result::<OverallRow>(&mut conn)?;

        #[derive(QueryableByName)]
        struct CountRow {
            #[diesel(sql_type = BigInt)]
            cnt: i64,
        }
        let matches_24h = diesel::sql_query(
            "SELECT COUNT(*) AS cnt FROM searches \
             WHERE status = 'matched' AND updated_at >= now() - INTERVAL '24 hours'",
        )
        .get_result::<CountRow>(&mut conn)?
        .cnt
            / 2; // each match transitions two search rows

        Ok(SearchTimeStats {
            avg_male_secs: avg_male,
            avg_female_secs: avg_female,
            avg_total_secs: overall.avg_secs.unwrap_or(0.0),
            matches_24h,
        })
    }
}
