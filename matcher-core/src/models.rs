use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{chats, ratings, searches, users};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Male => write!(f, "male"),
            Self::Female => write!(f, "female"),
        }
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            other => Err(format!("unknown gender: {other}")),
        }
    }
}

/// A single entry of `SearchRecord.desiredGender`, which unlike `Gender` also
/// carries the universal wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredGender {
    Male,
    Female,
    Any,
}

impl fmt::Display for DesiredGender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Male => write!(f, "male"),
            Self::Female => write!(f, "female"),
            Self::Any => write!(f, "any"),
        }
    }
}

impl FromStr for DesiredGender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            "any" => Ok(Self::Any),
            other => Err(format!("unknown desiredGender entry: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    Searching,
    Matched,
    Cancelled,
    Expired,
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Searching => write!(f, "searching"),
            Self::Matched => write!(f, "matched"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for SearchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "searching" => Ok(Self::Searching),
            "matched" => Ok(Self::Matched),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown search status: {other}")),
        }
    }
}

// --- User (read-only projection owned by the account service) ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub telegram_id: i64,
    pub gender: String,
    pub age: i32,
    pub rating: f64,
    pub is_active: bool,
    pub last_active: DateTime<Utc>,
}

impl User {
    pub fn gender(&self) -> Gender {
        self.gender.parse().unwrap_or(Gender::Male)
    }
}

// --- SearchRecord ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = searches)]
pub struct SearchRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub telegram_id: i64,
    pub status: String,
    pub gender: String,
    pub age: i32,
    pub rating: f64,
    pub desired_gender: Vec<Option<String>>,
    pub desired_age_min: i32,
    pub desired_age_max: i32,
    pub min_acceptable_rating: f64,
    pub use_geolocation: bool,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub max_distance_km: Option<f64>,
    pub matched_with_user_id: Option<Uuid>,
    pub matched_with_telegram_id: Option<i64>,
    pub matched_with_chat_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SearchRecord {
    pub fn status(&self) -> SearchStatus {
        self.status.parse().unwrap_or(SearchStatus::Expired)
    }

    pub fn gender(&self) -> Gender {
        self.gender.parse().unwrap_or(Gender::Male)
    }

    pub fn desired_genders(&self) -> Vec<DesiredGender> {
        self.desired_gender
            .iter()
            .flatten()
            .filter_map(|g| g.parse().ok())
            .collect()
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = searches)]
pub struct NewSearchRecord {
    pub user_id: Uuid,
    pub telegram_id: i64,
    pub status: String,
    pub gender: String,
    pub age: i32,
    pub rating: f64,
    pub desired_gender: Vec<Option<String>>,
    pub desired_age_min: i32,
    pub desired_age_max: i32,
    pub min_acceptable_rating: f64,
    pub use_geolocation: bool,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub max_distance_km: Option<f64>,
}

// --- ChatRecord ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Uuid,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = chats)]
pub struct ChatRecord {
    pub id: Uuid,
    pub participants: Vec<Option<Uuid>>,
    pub chat_type: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub messages: serde_json::Value,
    pub last_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<Uuid>,
    pub end_reason: Option<String>,
}

impl ChatRecord {
    pub fn messages(&self) -> Vec<ChatMessage> {
        serde_json::from_value(self.messages.clone()).unwrap_or_default()
    }

    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participants.iter().flatten().any(|p| *p == user_id)
    }

    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        self.participants
            .iter()
            .flatten()
            .copied()
            .find(|p| *p != user_id)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = chats)]
pub struct NewChatRecord {
    pub participants: Vec<Uuid>,
    pub chat_type: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub messages: serde_json::Value,
}

// --- Rating ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = ratings)]
pub struct Rating {
    pub id: Uuid,
    pub rated_user_id: Uuid,
    pub rater_user_id: Uuid,
    pub chat_id: Uuid,
    pub score: i32,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = ratings)]
pub struct NewRating {
    pub rated_user_id: Uuid,
    pub rater_user_id: Uuid,
    pub chat_id: Uuid,
    pub score: i32,
    pub comment: Option<String>,
}
