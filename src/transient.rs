//! Process-wide expiring key-value store.
//!
//! Session records and rate-limit buckets live here. Entries expire lazily on
//! read, with a periodic sweep picking up whatever reads never touch. All
//! writes go through one lock, and [`TransientStore::update`] runs a full
//! read-modify-write cycle without releasing it.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

struct Entry {
    value: Value,
    /// `None` means the entry never expires. An entry is live through its
    /// deadline and gone strictly after it.
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => now > at,
            None => false,
        }
    }
}

#[derive(Default)]
pub struct TransientStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl TransientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_at(key, Utc::now()).await
    }

    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<Value> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock before removing, since the
        // entry may have been rewritten in between.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
            entries.remove(key);
        }
        None
    }

    pub async fn set(&self, key: &str, value: Value, ttl_secs: Option<i64>) {
        self.set_at(key, value, ttl_secs, Utc::now()).await
    }

    pub async fn set_at(&self, key: &str, value: Value, ttl_secs: Option<i64>, now: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl_secs.map(|secs| now + Duration::seconds(secs)),
            },
        );
    }

    /// Removes an entry. Returns whether anything was there to remove.
    pub async fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(key).is_some()
    }

    /// Atomic read-modify-write. The closure sees the current live value (or
    /// `None`) and returns the replacement plus a caller-chosen result; no
    /// other writer can interleave between the read and the write.
    pub async fn update<T, F>(&self, key: &str, ttl_secs: Option<i64>, f: F) -> T
    where
        F: FnOnce(Option<Value>) -> (Value, T),
    {
        self.update_at(key, ttl_secs, Utc::now(), f).await
    }

    pub async fn update_at<T, F>(
        &self,
        key: &str,
        ttl_secs: Option<i64>,
        now: DateTime<Utc>,
        f: F,
    ) -> T
    where
        F: FnOnce(Option<Value>) -> (Value, T),
    {
        let mut entries = self.entries.write().await;

        let current = entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone());

        let (next, result) = f(current);
        entries.insert(
            key.to_string(),
            Entry {
                value: next,
                expires_at: ttl_secs.map(|secs| now + Duration::seconds(secs)),
            },
        );
        result
    }

    /// Sweeps out expired entries and reports how many were dropped.
    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now()).await
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();

        if removed > 0 {
            tracing::debug!("Cleaned up {} expired transient entries", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_then_get() {
        let store = TransientStore::new();
        store.set("greeting", json!({"text": "hi"}), None).await;
        assert_eq!(store.get("greeting").await, Some(json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn entry_lives_through_its_deadline() {
        let store = TransientStore::new();
        let t0 = Utc::now();
        store.set_at("k", json!(1), Some(60), t0).await;

        let exactly = t0 + Duration::seconds(60);
        assert_eq!(store.get_at("k", exactly).await, Some(json!(1)));

        let after = exactly + Duration::seconds(1);
        assert_eq!(store.get_at("k", after).await, None);
    }

    #[tokio::test]
    async fn expired_entry_is_removed_on_read() {
        let store = TransientStore::new();
        let t0 = Utc::now();
        store.set_at("k", json!(1), Some(10), t0).await;

        assert_eq!(store.get_at("k", t0 + Duration::seconds(11)).await, None);
        // The read itself dropped the entry, so the sweep finds nothing.
        assert_eq!(store.cleanup_at(t0 + Duration::seconds(11)).await, 0);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = TransientStore::new();
        store.set("k", json!(true), None).await;
        assert!(store.delete("k").await);
        assert!(!store.delete("k").await);
    }

    #[tokio::test]
    async fn cleanup_only_touches_expired() {
        let store = TransientStore::new();
        let t0 = Utc::now();
        store.set_at("short", json!(1), Some(5), t0).await;
        store.set_at("long", json!(2), Some(500), t0).await;
        store.set_at("forever", json!(3), None, t0).await;

        assert_eq!(store.cleanup_at(t0 + Duration::seconds(60)).await, 1);
        assert_eq!(store.get_at("long", t0 + Duration::seconds(60)).await, Some(json!(2)));
        assert_eq!(store.get_at("forever", t0 + Duration::seconds(60)).await, Some(json!(3)));
    }

    #[tokio::test]
    async fn update_sees_latest_value() {
        let store = TransientStore::new();
        let total = store
            .update("counter", None, |current| {
                let next = current.and_then(|v| v.as_i64()).unwrap_or(0) + 1;
                (json!(next), next)
            })
            .await;
        assert_eq!(total, 1);

        let total = store
            .update("counter", None, |current| {
                let next = current.and_then(|v| v.as_i64()).unwrap_or(0) + 1;
                (json!(next), next)
            })
            .await;
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn concurrent_updates_never_lose_increments() {
        let store = Arc::new(TransientStore::new());
        let mut handles = Vec::new();

        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update("counter", None, |current| {
                        let next = current.and_then(|v| v.as_i64()).unwrap_or(0) + 1;
                        (json!(next), ())
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("counter").await, Some(json!(50)));
    }

    #[tokio::test]
    async fn update_treats_expired_value_as_absent() {
        let store = TransientStore::new();
        let t0 = Utc::now();
        store.set_at("counter", json!(40), Some(10), t0).await;

        let seen = store
            .update_at("counter", Some(10), t0 + Duration::seconds(30), |current| {
                (json!(1), current)
            })
            .await;
        assert_eq!(seen, None);
    }
}
