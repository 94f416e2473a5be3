//! Pure, Store-independent matching math: the hard-filter predicate, the
//! additive 100-point score, and haversine distance. Kept as free functions
//! over a small `Candidate` struct so they can be unit tested without a
//! database.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{DesiredGender, Gender, SearchRecord};

const EARTH_RADIUS_KM: f64 = 6_371.0;

#[derive(Debug, Clone, Copy)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

/// Great-circle distance in kilometers. Guards `1 - a` at 0 before the
/// square root so floating-point overshoot near antipodal points never
/// produces a NaN.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let sin_dlat = (dlat / 2.0).sin();
    let sin_dlon = (dlon / 2.0).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let h = h.max(0.0);

    let c = 2.0 * h.sqrt().asin().max(0.0);
    EARTH_RADIUS_KM * c
}

/// A search record reduced to the fields the predicate and scorer need,
/// independent of how the Store fetched it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub user_id: Uuid,
    pub gender: Gender,
    pub age: i32,
    pub rating: f64,
    pub desired_gender: Vec<DesiredGender>,
    pub desired_age_min: i32,
    pub desired_age_max: i32,
    pub min_acceptable_rating: f64,
    pub use_geolocation: bool,
    pub location: Option<GeoPoint>,
    pub max_distance_km: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl From<&SearchRecord> for Candidate {
    fn from(r: &SearchRecord) -> Self {
        Self {
            user_id: r.user_id,
            gender: r.gender(),
            age: r.age,
            rating: r.rating,
            desired_gender: r.desired_genders(),
            desired_age_min: r.desired_age_min,
            desired_age_max: r.desired_age_max,
            min_acceptable_rating: r.min_acceptable_rating,
            use_geolocation: r.use_geolocation,
            location: match (r.longitude, r.latitude) {
                (Some(longitude), Some(latitude)) => Some(GeoPoint { longitude, latitude }),
                _ => None,
            },
            max_distance_km: r.max_distance_km,
            created_at: r.created_at,
        }
    }
}

fn desired_set(desired: &[DesiredGender]) -> [bool; 2] {
    // index 0 = accepts male, index 1 = accepts female
    if desired.iter().any(|d| matches!(d, DesiredGender::Any)) {
        return [true, true];
    }
    [
        desired.iter().any(|d| matches!(d, DesiredGender::Male)),
        desired.iter().any(|d| matches!(d, DesiredGender::Female)),
    ]
}

fn accepts(desired: &[DesiredGender], gender: Gender) -> bool {
    let set = desired_set(desired);
    match gender {
        Gender::Male => set[0],
        Gender::Female => set[1],
    }
}

/// All filter terms from spec §4.1.1. `self` is the searcher `S`, `other`
/// is the prospective candidate `P`.
pub fn passes_filters(s: &Candidate, p: &Candidate) -> bool {
    if p.user_id == s.user_id {
        return false;
    }

    if !accepts(&s.desired_gender, p.gender) {
        return false;
    }
    if !accepts(&p.desired_gender, s.gender) {
        return false;
    }

    if !(s.desired_age_min <= p.age && p.age <= s.desired_age_max) {
        return false;
    }
    if !(p.desired_age_min <= s.age && s.age <= p.desired_age_max) {
        return false;
    }

    if s.min_acceptable_rating > -1.0 && p.rating < s.min_acceptable_rating {
        return false;
    }

    if s.use_geolocation {
        let (Some(p_loc), true) = (p.location, p.use_geolocation) else {
            return false;
        };
        let Some(s_loc) = s.location else {
            return false;
        };
        let max_km = s.max_distance_km.unwrap_or(10.0);
        if haversine_km(s_loc, p_loc) > max_km {
            return false;
        }
    }

    true
}

/// The additive 100-point score from spec §4.1.2. Callers must have already
/// run `passes_filters`.
pub fn score(s: &Candidate, p: &Candidate) -> f64 {
    let rating_proximity = (40.0 - 2.0 * (s.rating - p.rating).abs()).max(0.0);
    let age_proximity = (30.0 - 2.0 * (s.age - p.age).abs() as f64).max(0.0);

    let geo_proximity = if s.use_geolocation && p.use_geolocation {
        match (s.location, p.location) {
            (Some(s_loc), Some(p_loc)) => (30.0 - haversine_km(s_loc, p_loc)).max(0.0),
            _ => 0.0,
        }
    } else {
        0.0
    };

    rating_proximity + age_proximity + geo_proximity
}

/// Selects the best-scoring candidate, breaking ties by oldest `createdAt`
/// and then by `userId` to keep the comparison total.
pub fn select_best<'a>(s: &Candidate, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
    candidates
        .iter()
        .filter(|p| passes_filters(s, p))
        .max_by(|a, b| {
            score(s, a)
                .partial_cmp(&score(s, b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.user_id.cmp(&a.user_id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candidate(user_id: Uuid, gender: Gender, age: i32, rating: f64, desired: Gender) -> Candidate {
        Candidate {
            user_id,
            gender,
            age,
            rating,
            desired_gender: vec![match desired {
                Gender::Male => DesiredGender::Male,
                Gender::Female => DesiredGender::Female,
            }],
            desired_age_min: 18,
            desired_age_max: 100,
            min_acceptable_rating: -1.0,
            use_geolocation: false,
            location: None,
            max_distance_km: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn mutual_gender_preference_passes() {
        let s = candidate(Uuid::new_v4(), Gender::Male, 25, 4.0, Gender::Female);
        let p = candidate(Uuid::new_v4(), Gender::Female, 24, 4.0, Gender::Male);
        assert!(passes_filters(&s, &p));
    }

    #[test]
    fn one_sided_gender_preference_fails() {
        let s = candidate(Uuid::new_v4(), Gender::Male, 25, 4.0, Gender::Female);
        let p = candidate(Uuid::new_v4(), Gender::Female, 24, 4.0, Gender::Female);
        assert!(!passes_filters(&s, &p));
    }

    #[test]
    fn any_desired_gender_is_universal_wildcard() {
        let mut s = candidate(Uuid::new_v4(), Gender::Male, 25, 4.0, Gender::Female);
        s.desired_gender = vec![DesiredGender::Any];
        let p = candidate(Uuid::new_v4(), Gender::Female, 24, 4.0, Gender::Male);
        assert!(passes_filters(&s, &p));
    }

    #[test]
    fn identical_age_bounds_match_only_identical_age() {
        let mut s = candidate(Uuid::new_v4(), Gender::Male, 25, 4.0, Gender::Female);
        s.desired_age_min = 25;
        s.desired_age_max = 25;
        let mut p = candidate(Uuid::new_v4(), Gender::Female, 25, 4.0, Gender::Male);
        p.desired_age_min = 18;
        p.desired_age_max = 100;
        assert!(passes_filters(&s, &p));

        p.age = 26;
        assert!(!passes_filters(&s, &p));
    }

    #[test]
    fn min_rating_floor_excludes_lower_rated() {
        let mut s = candidate(Uuid::new_v4(), Gender::Male, 25, 4.0, Gender::Female);
        s.min_acceptable_rating = 5.0;
        let p = candidate(Uuid::new_v4(), Gender::Female, 24, 4.9, Gender::Male);
        assert!(!passes_filters(&s, &p));
    }

    #[test]
    fn min_rating_negative_one_accepts_any() {
        let s = candidate(Uuid::new_v4(), Gender::Male, 25, 4.0, Gender::Female);
        let p = candidate(Uuid::new_v4(), Gender::Female, 24, 0.0, Gender::Male);
        assert!(passes_filters(&s, &p));
    }

    #[test]
    fn geofence_excludes_just_past_max_distance() {
        let mut s = candidate(Uuid::new_v4(), Gender::Male, 25, 4.0, Gender::Female);
        s.use_geolocation = true;
        s.location = Some(GeoPoint { longitude: 0.0, latitude: 0.0 });
        s.max_distance_km = Some(10.0);

        let mut p = candidate(Uuid::new_v4(), Gender::Female, 24, 4.0, Gender::Male);
        p.use_geolocation = true;
        // roughly 11km north
        p.location = Some(GeoPoint { longitude: 0.0, latitude: 0.0988 });

        assert!(!passes_filters(&s, &p));

        s.max_distance_km = Some(15.0);
        assert!(passes_filters(&s, &p));
    }

    #[test]
    fn haversine_same_point_is_zero() {
        let point = GeoPoint { longitude: 2.35, latitude: 48.85 };
        assert_eq!(haversine_km(point, point), 0.0);
    }

    #[test]
    fn haversine_antipodal_does_not_nan() {
        let a = GeoPoint { longitude: 0.0, latitude: 0.0 };
        let b = GeoPoint { longitude: 180.0, latitude: 0.0 };
        let d = haversine_km(a, b);
        assert!(d.is_finite());
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1.0);
    }

    #[test]
    fn tie_break_prefers_oldest_created_at() {
        let s = candidate(Uuid::new_v4(), Gender::Male, 25, 4.0, Gender::Female);
        let now = Utc::now();

        let mut older = candidate(Uuid::new_v4(), Gender::Female, 25, 4.0, Gender::Male);
        older.created_at = now - Duration::minutes(5);

        let mut newer = candidate(Uuid::new_v4(), Gender::Female, 25, 4.0, Gender::Male);
        newer.created_at = now;

        let candidates = vec![newer.clone(), older.clone()];
        let best = select_best(&s, &candidates).unwrap();
        assert_eq!(best.user_id, older.user_id);
    }

    #[test]
    fn empty_candidate_set_selects_nothing() {
        let s = candidate(Uuid::new_v4(), Gender::Male, 25, 4.0, Gender::Female);
        assert!(select_best(&s, &[]).is_none());
    }
}
