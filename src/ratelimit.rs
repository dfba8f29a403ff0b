//! Per-provider token bucket (§4.3).
//!
//! Grounded on the teacher's `src/llm/batch.rs::ProviderRateLimiter`
//! (`Mutex<HashMap<Provider, State>>` shape), adapted from a windowed
//! request counter to a continuously-refilled token bucket, and on
//! `examples/original_source/src/parallel/limiter.py` for the idempotent
//! `set_rate_limit_scaling` semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::model_id::Provider;

const MIN_RATE: f64 = 1e-6;

struct BucketState {
    rate_per_60s: f64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn new(rate_per_60s: f64) -> Self {
        BucketState {
            rate_per_60s,
            tokens: rate_per_60s.min(1.0).max(0.0),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let refill_amount = elapsed / 60.0 * self.rate_per_60s;
        self.tokens = (self.tokens + refill_amount).min(self.rate_per_60s.max(1.0));
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn wait_estimate(&self) -> Duration {
        if self.rate_per_60s <= 0.0 {
            return Duration::from_secs(1);
        }
        let deficit = 1.0 - self.tokens;
        let seconds = (deficit / self.rate_per_60s) * 60.0;
        Duration::from_secs_f64(seconds.max(0.0).min(60.0))
    }
}

/// Thread-safe per-provider token bucket set. Cloning shares the same
/// underlying buckets (cheap `Arc` clone), matching §9's "only two
/// process-wide singletons" design note -- this is one of them.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<Provider, BucketState>>>,
    scaled: Arc<AtomicBool>,
}

impl RateLimiter {
    pub fn new(defaults: &[(Provider, f64)]) -> Self {
        let mut map = HashMap::new();
        for (provider, rate) in defaults {
            map.insert(*provider, BucketState::new(*rate));
        }
        RateLimiter {
            buckets: Arc::new(Mutex::new(map)),
            scaled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Blocks until one token is available for `provider`, then consumes it.
    pub async fn acquire(&self, provider: Provider) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let state = buckets
                    .entry(provider)
                    .or_insert_with(|| BucketState::new(15.0));
                if state.try_take() {
                    return;
                }
                state.wait_estimate()
            };
            tokio::time::sleep(wait.max(Duration::from_millis(5))).await;
        }
    }

    /// Rescales every limiter by `factor`, once per process (idempotent).
    /// Rates are clamped to a minimum of `1e-6` so a large `factor` never
    /// produces a zero or negative rate (§4.3).
    pub async fn set_rate_limit_scaling(&self, factor: f64) {
        if self
            .scaled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let mut buckets = self.buckets.lock().await;
        for state in buckets.values_mut() {
            state.rate_per_60s = (state.rate_per_60s * factor).max(MIN_RATE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_consumes_exactly_one_token() {
        let limiter = RateLimiter::new(&[(Provider::OpenAI, 60.0)]);
        limiter.acquire(Provider::OpenAI).await;
        let buckets = limiter.buckets.lock().await;
        let state = buckets.get(&Provider::OpenAI).unwrap();
        assert!(state.tokens < 1.0);
    }

    #[tokio::test]
    async fn scaling_is_idempotent() {
        let limiter = RateLimiter::new(&[(Provider::OpenAI, 20.0)]);
        limiter.set_rate_limit_scaling(0.5).await;
        limiter.set_rate_limit_scaling(0.5).await; // second call is a no-op
        let buckets = limiter.buckets.lock().await;
        let state = buckets.get(&Provider::OpenAI).unwrap();
        assert_eq!(state.rate_per_60s, 10.0);
    }

    #[tokio::test]
    async fn scaling_clamps_to_minimum_rate() {
        let limiter = RateLimiter::new(&[(Provider::Anthropic, 1.0)]);
        limiter.set_rate_limit_scaling(0.0).await;
        let buckets = limiter.buckets.lock().await;
        let state = buckets.get(&Provider::Anthropic).unwrap();
        assert_eq!(state.rate_per_60s, MIN_RATE);
    }

    #[tokio::test(start_paused = true)]
    async fn within_60s_at_most_rate_plus_one_acquisitions() {
        let rate = 5.0;
        let limiter = RateLimiter::new(&[(Provider::Google, rate)]);
        let mut completed = 0u32;
        let start = Instant::now();
        loop {
            limiter.acquire(Provider::Google).await;
            completed += 1;
            if Instant::now().duration_since(start) >= Duration::from_secs(60) {
                break;
            }
            if completed > 1000 {
                break;
            }
        }
        assert!((completed as f64) <= rate + 1.0);
    }
}
