use crate::config::ChallengeConfig;
use crate::gesture::GestureKind;
use chrono::{DateTime, Duration, Utc};
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Challenge not found: {0}")]
    NotFound(Uuid),
    #[error("Challenge expired: {0}")]
    Expired(Uuid),
    #[error("Challenge already used (replay protection): {0}")]
    AlreadyUsed(Uuid),
}

/// A single-use ordered gesture sequence with an expiry.
///
/// `used` flips to true exactly once, atomically with the verification
/// attempt that consumes the challenge, and never reverts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: Uuid,
    pub steps: Vec<GestureKind>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl Challenge {
    /// Generate a fresh challenge: `length` gestures drawn without
    /// replacement from the pool, in randomized order.
    pub fn generate(cfg: &ChallengeConfig) -> Self {
        Self::generate_with_rng(cfg, &mut rand::thread_rng())
    }

    pub fn generate_with_rng<R: Rng + ?Sized>(cfg: &ChallengeConfig, rng: &mut R) -> Self {
        let pool = GestureKind::POOL;
        let count = cfg.length.min(pool.len());
        let steps: Vec<GestureKind> = index::sample(rng, pool.len(), count)
            .into_iter()
            .map(|i| pool[i])
            .collect();

        let created_at = Utc::now();
        let challenge = Self {
            id: Uuid::new_v4(),
            steps,
            created_at,
            expires_at: created_at + Duration::seconds(cfg.expiry_seconds),
            used: false,
        };

        log::info!(
            "Generated challenge {} with steps [{}]",
            challenge.id,
            challenge
                .steps
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        challenge
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn expires_in_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn cfg(length: usize, expiry_seconds: i64) -> ChallengeConfig {
        ChallengeConfig {
            expiry_seconds,
            length,
        }
    }

    #[test]
    fn test_steps_are_unique_and_bounded() {
        for _ in 0..50 {
            let challenge = Challenge::generate(&cfg(3, 120));
            assert_eq!(challenge.steps.len(), 3);
            let unique: HashSet<_> = challenge.steps.iter().collect();
            assert_eq!(unique.len(), challenge.steps.len());
        }
    }

    #[test]
    fn test_length_clamped_to_pool_size() {
        let challenge = Challenge::generate(&cfg(20, 120));
        assert_eq!(challenge.steps.len(), GestureKind::POOL.len());
        let unique: HashSet<_> = challenge.steps.iter().collect();
        assert_eq!(unique.len(), GestureKind::POOL.len());
    }

    #[test]
    fn test_order_varies_across_generations() {
        // Full-pool draws must not always come out in pool order.
        let mut orders = HashSet::new();
        for _ in 0..50 {
            let challenge = Challenge::generate(&cfg(6, 120));
            orders.insert(challenge.steps.clone());
        }
        assert!(orders.len() > 1, "step order never varied");
    }

    #[test]
    fn test_expiry_window() {
        let challenge = Challenge::generate(&cfg(3, 120));
        assert!(challenge.expires_at > challenge.created_at);
        assert!(!challenge.is_expired(challenge.created_at));
        assert!(challenge.is_expired(challenge.expires_at + Duration::seconds(1)));
        let remaining = challenge.expires_in_seconds(challenge.created_at);
        assert!((119..=120).contains(&remaining));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Challenge::generate(&cfg(3, 120));
        let b = Challenge::generate(&cfg(3, 120));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_fresh_challenge_is_unused() {
        assert!(!Challenge::generate(&cfg(3, 120)).used);
    }
}
