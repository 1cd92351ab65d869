use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::db::rate_limit_queries;
use crate::models::credential::Credential;

/// Length of the sliding window.
pub const WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

/// Seconds until the oldest in-window entry leaves the window (at least 1).
pub fn retry_after(oldest: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    let Some(oldest) = oldest else {
        return WINDOW_SECS as u64;
    };
    let remaining_ms = (oldest + ChronoDuration::seconds(WINDOW_SECS) - now).num_milliseconds();
    let secs = (remaining_ms + 999) / 1000;
    secs.clamp(1, WINDOW_SECS) as u64
}

/// Append-only log of requests per credential.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count the trailing window and, if under `limit`, append an entry at
    /// `now`. Count and append are atomic per credential.
    async fn check_and_record(
        &self,
        credential_id: Uuid,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, RateLimitError>;

    /// Drop entries older than `cutoff`.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64, RateLimitError>;
}

pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn check_and_record(
        &self,
        credential_id: Uuid,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, RateLimitError> {
        let window_start = now - ChronoDuration::seconds(WINDOW_SECS);
        let (snapshot, recorded) =
            rate_limit_queries::check_and_record(&self.pool, credential_id, limit, window_start, now)
                .await?;

        if recorded {
            Ok(RateDecision::Allowed)
        } else {
            Ok(RateDecision::Limited {
                retry_after_secs: retry_after(snapshot.oldest, now),
            })
        }
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64, RateLimitError> {
        Ok(rate_limit_queries::prune(&self.pool, cutoff).await?)
    }
}

type Window = Arc<Mutex<VecDeque<DateTime<Utc>>>>;

/// Process-local window log for single-instance deployments and tests.
///
/// Each credential has its own lock; the map lock is only held to find or
/// create a window.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    windows: RwLock<HashMap<Uuid, Window>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entry_count(&self) -> usize {
        let windows: Vec<Window> = self.windows.read().await.values().cloned().collect();
        let mut total = 0;
        for window in windows {
            total += window.lock().await.len();
        }
        total
    }

    async fn window(&self, credential_id: Uuid) -> Window {
        if let Some(window) = self.windows.read().await.get(&credential_id) {
            return window.clone();
        }
        self.windows
            .write()
            .await
            .entry(credential_id)
            .or_default()
            .clone()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn check_and_record(
        &self,
        credential_id: Uuid,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, RateLimitError> {
        let window_start = now - ChronoDuration::seconds(WINDOW_SECS);
        let window = self.window(credential_id).await;
        let mut entries = window.lock().await;

        let in_window: Vec<&DateTime<Utc>> =
            entries.iter().filter(|ts| **ts > window_start).collect();

        if in_window.len() as i64 >= limit {
            let oldest = in_window.iter().map(|ts| **ts).min();
            return Ok(RateDecision::Limited {
                retry_after_secs: retry_after(oldest, now),
            });
        }

        entries.push_back(now);
        Ok(RateDecision::Allowed)
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64, RateLimitError> {
        let windows: Vec<Window> = self.windows.read().await.values().cloned().collect();
        let mut removed = 0u64;
        for window in windows {
            let mut entries = window.lock().await;
            let before = entries.len();
            entries.retain(|ts| *ts >= cutoff);
            removed += (before - entries.len()) as u64;
        }

        // A window nobody else holds cannot gain entries while the map is
        // write-locked, so it is safe to drop once empty.
        self.windows.write().await.retain(|_, window| {
            Arc::strong_count(window) > 1
                || window.try_lock().map_or(true, |entries| !entries.is_empty())
        });
        Ok(removed)
    }
}

/// Sliding-window limiter keyed by credential.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    pub async fn check_and_record(&self, credential: &Credential) -> Result<RateDecision, RateLimitError> {
        let decision = self
            .store
            .check_and_record(
                credential.id,
                i64::from(credential.rate_limit_per_minute),
                Utc::now(),
            )
            .await?;

        if let RateDecision::Limited { retry_after_secs } = decision {
            metrics::counter!("rate_limited_requests").increment(1);
            tracing::info!(
                credential_id = %credential.id,
                limit = credential.rate_limit_per_minute,
                retry_after_secs,
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    /// Periodically prune expired window entries. Runs until the task is dropped.
    pub async fn run_sweeper(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - ChronoDuration::seconds(WINDOW_SECS);
            match self.store.prune(cutoff).await {
                Ok(removed) => tracing::debug!(removed, "Pruned rate limit window"),
                Err(e) => tracing::warn!(error = %e, "Rate limit sweep failed, retrying next cycle"),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn excess_requests_in_window_are_limited() {
        let store = InMemoryRateLimitStore::new();
        let id = Uuid::new_v4();

        for i in 0..3 {
            assert_eq!(
                store.check_and_record(id, 3, at(i)).await.unwrap(),
                RateDecision::Allowed
            );
        }
        assert_eq!(
            store.check_and_record(id, 3, at(10)).await.unwrap(),
            RateDecision::Limited { retry_after_secs: 50 }
        );
    }

    #[tokio::test]
    async fn window_slides_rather_than_resetting() {
        let store = InMemoryRateLimitStore::new();
        let id = Uuid::new_v4();

        store.check_and_record(id, 2, at(0)).await.unwrap();
        store.check_and_record(id, 2, at(30)).await.unwrap();
        assert!(matches!(
            store.check_and_record(id, 2, at(59)).await.unwrap(),
            RateDecision::Limited { .. }
        ));
        // First entry has aged out, second still counts.
        assert_eq!(
            store.check_and_record(id, 2, at(61)).await.unwrap(),
            RateDecision::Allowed
        );
        assert!(matches!(
            store.check_and_record(id, 2, at(62)).await.unwrap(),
            RateDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn limited_requests_are_not_recorded() {
        let store = InMemoryRateLimitStore::new();
        let id = Uuid::new_v4();

        store.check_and_record(id, 1, at(0)).await.unwrap();
        for i in 1..10 {
            store.check_and_record(id, 1, at(i)).await.unwrap();
        }
        assert_eq!(store.entry_count().await, 1);
        assert_eq!(
            store.check_and_record(id, 1, at(61)).await.unwrap(),
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn credentials_are_isolated() {
        let store = InMemoryRateLimitStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        store.check_and_record(a, 1, at(0)).await.unwrap();
        assert_eq!(
            store.check_and_record(b, 1, at(0)).await.unwrap(),
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn concurrent_checks_never_exceed_limit() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let id = Uuid::new_v4();

        let checks = (0..20).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.check_and_record(id, 5, at(0)).await })
        });
        let allowed = futures::future::join_all(checks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(RateDecision::Allowed))))
            .count();

        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn prune_drops_expired_entries() {
        let store = InMemoryRateLimitStore::new();
        let id = Uuid::new_v4();
        store.check_and_record(id, 10, at(0)).await.unwrap();
        store.check_and_record(id, 10, at(100)).await.unwrap();

        assert_eq!(store.prune(at(40)).await.unwrap(), 1);
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn busy_credential_does_not_block_others() {
        let store = InMemoryRateLimitStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.check_and_record(a, 10, at(0)).await.unwrap();

        let window_a = store.window(a).await;
        let _held = window_a.lock().await;

        let decision = tokio::time::timeout(
            Duration::from_secs(1),
            store.check_and_record(b, 10, at(0)),
        )
        .await
        .expect("credential b waited on credential a's window")
        .unwrap();
        assert_eq!(decision, RateDecision::Allowed);
    }

    #[tokio::test]
    async fn prune_forgets_idle_credentials() {
        let store = InMemoryRateLimitStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.check_and_record(a, 10, at(0)).await.unwrap();
        store.check_and_record(b, 10, at(100)).await.unwrap();

        assert_eq!(store.prune(at(40)).await.unwrap(), 1);
        let remaining: Vec<Uuid> = store.windows.read().await.keys().copied().collect();
        assert_eq!(remaining, vec![b]);
    }

    #[test]
    fn retry_after_rounds_up_and_is_at_least_one() {
        assert_eq!(retry_after(Some(at(0)), at(59)), 1);
        assert_eq!(retry_after(Some(at(0)), at(0)), 60);
        let almost = at(0) + ChronoDuration::milliseconds(500);
        assert_eq!(retry_after(Some(at(0)), almost), 60);
        assert_eq!(retry_after(None, at(0)), 60);
    }
}
