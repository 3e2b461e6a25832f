use futures::future::join_all;

use crate::{
    error::{RateLimitError, Result},
    limiter::RateLimiter,
    result::RateLimitResult,
};

/// AND-composition of limiters: a request passes only if every tier admits it.
///
/// Typical use combines a short burst tier with longer-term quotas, e.g. a
/// token bucket of 5/s in front of a sliding window of 100/min.
#[derive(Debug, Clone)]
pub struct TieredRateLimiter {
    tiers: Vec<RateLimiter>,
}

impl TieredRateLimiter {
    /// Compose `tiers` in evaluation order; at least one is required
    pub fn new(tiers: Vec<RateLimiter>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(RateLimitError::Config(
                "At least one rate limiter tier is required".to_string(),
            ));
        }
        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[RateLimiter] {
        &self.tiers
    }

    /// Check every tier and return all results. Never fails.
    pub fn check(&self, key: &str) -> Vec<RateLimitResult> {
        self.tiers.iter().map(|tier| tier.check(key)).collect()
    }

    /// Enforce tiers in order, stopping at the first denial.
    ///
    /// Tiers after a denying tier are not charged for the request.
    pub fn enforce(&self, key: &str) -> Result<Vec<RateLimitResult>> {
        let mut results = Vec::with_capacity(self.tiers.len());
        for (index, tier) in self.tiers.iter().enumerate() {
            results.push(tier.enforce(key).map_err(|e| tag_tier(e, index))?);
        }
        Ok(results)
    }

    /// Check every tier concurrently. Never fails.
    pub async fn async_check(&self, key: &str) -> Vec<RateLimitResult> {
        join_all(self.tiers.iter().map(|tier| tier.async_check(key))).await
    }

    /// Enforce all tiers concurrently.
    ///
    /// Unlike [`enforce`](Self::enforce) every tier is evaluated, and so
    /// charged, even when an earlier tier denies. When several tiers fail
    /// the lowest-indexed failure is reported.
    pub async fn async_enforce(&self, key: &str) -> Result<Vec<RateLimitResult>> {
        let outcomes = join_all(self.tiers.iter().map(|tier| tier.async_enforce(key))).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (index, outcome) in outcomes.into_iter().enumerate() {
            results.push(outcome.map_err(|e| tag_tier(e, index))?);
        }
        Ok(results)
    }

    /// Clear state for `key` in every tier
    pub fn reset(&self, key: &str) -> Result<()> {
        self.tiers.iter().try_for_each(|tier| tier.reset(key))
    }

    pub fn health_check(&self) -> Result<()> {
        self.tiers.iter().try_for_each(|tier| tier.health_check())
    }
}

/// The result with the least remaining capacity, preferring denials.
///
/// Used to pick which tier's headers to send back to a client.
pub fn most_restrictive(results: &[RateLimitResult]) -> Option<&RateLimitResult> {
    results
        .iter()
        .min_by_key(|result| (result.allowed, result.remaining, std::cmp::Reverse(result.retry_after)))
}

fn tag_tier(err: RateLimitError, index: usize) -> RateLimitError {
    match err {
        RateLimitError::Exceeded(exceeded) => (*exceeded).with_tier(index).into(),
        other => other,
    }
}
