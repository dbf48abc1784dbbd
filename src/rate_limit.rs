//! Token-bucket rate limiting keyed by client identifier.
//!
//! Buckets live in the shared transient store, so the refill-and-consume
//! cycle runs inside one atomic update and concurrent requests can never
//! both spend the last token.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transient::TransientStore;

const BUCKET_PREFIX: &str = "rate_limit:";

#[derive(Serialize, Deserialize)]
struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
}

pub struct RateLimiter {
    store: Arc<TransientStore>,
    capacity: f64,
    window_secs: f64,
}

impl RateLimiter {
    pub fn new(store: Arc<TransientStore>, capacity: f64, window_secs: f64) -> Self {
        RateLimiter {
            store,
            capacity,
            window_secs,
        }
    }

    /// Spends one token for `key` if available. Denied requests leave the
    /// bucket untouched; the balance never goes negative.
    pub async fn check(&self, key: &str) -> bool {
        self.check_at(key, Utc::now()).await
    }

    pub async fn check_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let storage_key = format!("{}{}", BUCKET_PREFIX, key);
        // Idle buckets vanish well after they have refilled to capacity.
        let ttl_secs = (self.window_secs * 2.0).ceil() as i64;

        self.store
            .update_at(&storage_key, Some(ttl_secs), now, |current| {
                let mut bucket = current
                    .and_then(|value| serde_json::from_value::<Bucket>(value).ok())
                    .unwrap_or(Bucket {
                        tokens: self.capacity,
                        last_refill_ms: now.timestamp_millis(),
                    });

                let elapsed_secs =
                    (now.timestamp_millis() - bucket.last_refill_ms).max(0) as f64 / 1000.0;
                if elapsed_secs > 0.0 {
                    let refill = elapsed_secs * self.capacity / self.window_secs;
                    bucket.tokens = (bucket.tokens + refill).min(self.capacity);
                    bucket.last_refill_ms = now.timestamp_millis();
                }

                let allowed = bucket.tokens >= 1.0;
                if allowed {
                    bucket.tokens -= 1.0;
                }

                let next = serde_json::to_value(&bucket).unwrap_or(Value::Null);
                (next, allowed)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn limiter(capacity: f64, window_secs: f64) -> (RateLimiter, Arc<TransientStore>) {
        let store = Arc::new(TransientStore::new());
        (
            RateLimiter::new(Arc::clone(&store), capacity, window_secs),
            store,
        )
    }

    #[tokio::test]
    async fn burst_is_capped_at_capacity() {
        let (limiter, _) = limiter(2.0, 60.0);
        let t0 = Utc::now();

        assert!(limiter.check_at("1.2.3.4", t0).await);
        assert!(limiter.check_at("1.2.3.4", t0).await);
        assert!(!limiter.check_at("1.2.3.4", t0).await);
    }

    #[tokio::test]
    async fn half_window_refills_half_capacity() {
        let (limiter, _) = limiter(2.0, 60.0);
        let t0 = Utc::now();

        assert!(limiter.check_at("c", t0).await);
        assert!(limiter.check_at("c", t0).await);
        assert!(!limiter.check_at("c", t0).await);

        // 30s at 2 tokens / 60s earns exactly one token back.
        let t1 = t0 + Duration::seconds(30);
        assert!(limiter.check_at("c", t1).await);
        assert!(!limiter.check_at("c", t1).await);
    }

    #[tokio::test]
    async fn refill_never_exceeds_capacity() {
        let (limiter, _) = limiter(2.0, 60.0);
        let t0 = Utc::now();

        assert!(limiter.check_at("c", t0).await);

        // Hours of idle time still cap the bucket at two tokens.
        let t1 = t0 + Duration::hours(5);
        assert!(limiter.check_at("c", t1).await);
        assert!(limiter.check_at("c", t1).await);
        assert!(!limiter.check_at("c", t1).await);
    }

    #[tokio::test]
    async fn denied_requests_do_not_spend_tokens() {
        let (limiter, _) = limiter(1.0, 60.0);
        let t0 = Utc::now();

        assert!(limiter.check_at("c", t0).await);
        for _ in 0..10 {
            assert!(!limiter.check_at("c", t0).await);
        }

        // A full window of hammering denied requests still earns the refill.
        let t1 = t0 + Duration::seconds(60);
        assert!(limiter.check_at("c", t1).await);
    }

    #[tokio::test]
    async fn clients_have_independent_buckets() {
        let (limiter, _) = limiter(1.0, 60.0);
        let t0 = Utc::now();

        assert!(limiter.check_at("10.0.0.1", t0).await);
        assert!(limiter.check_at("10.0.0.2", t0).await);
        assert!(!limiter.check_at("10.0.0.1", t0).await);
    }

    #[tokio::test]
    async fn idle_buckets_expire_from_the_store() {
        let (limiter, store) = limiter(2.0, 60.0);
        let t0 = Utc::now();

        assert!(limiter.check_at("c", t0).await);
        assert_eq!(store.cleanup_at(t0 + Duration::seconds(60)).await, 0);
        assert_eq!(store.cleanup_at(t0 + Duration::seconds(121)).await, 1);
    }
}
