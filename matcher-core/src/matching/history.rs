//! Pair cooldown: a short exclusion window preventing two users who just
//! finished a chat from being immediately re-matched. Supplemental to the
//! Matcher's required predicate — an additional exclusion applied before
//! scoring, never a replacement for any of its terms.

use matcher_shared::clients::redis::RedisClient;
use uuid::Uuid;

const COOLDOWN_PREFIX: &str = "matcher:cooldown";

fn pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    format!("{COOLDOWN_PREFIX}:{lo}:{hi}")
}

pub async fn set_cooldown(redis: &RedisClient, a: Uuid, b: Uuid, ttl_secs: u64) {
    let key = pair_key(a, b);
    if let Err(e) = redis.set(&key, "1", ttl_secs).await {
        tracing::warn!(error = %e, "failed to set pair cooldown");
    }
}

pub async fn is_cooling_down(redis: &RedisClient, a: Uuid, b: Uuid) -> bool {
    let key = pair_key(a, b);
    redis.exists(&key).await.unwrap_or(false)
}

/// Checks a whole candidate set against one user's cooldowns in a single
/// round trip.
pub async fn cooling_down_mask(redis: &RedisClient, user_id: Uuid, others: &[Uuid]) -> Vec<bool> {
    let keys: Vec<String> = others.iter().map(|other| pair_key(user_id, *other)).collect();
    redis.exists_multi(&keys).await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to batch-check pair cooldowns");
        vec![false; others.len()]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_symmetric() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(pair_key(a, b), pair_key(b, a));
    }
}
