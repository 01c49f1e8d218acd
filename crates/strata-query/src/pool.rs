//! Bounded client pool for adapters that keep connections between queries.
//!
//! Checkout waits at most `acquire_timeout` for a free slot and then fails
//! with [`AdapterError::PoolExhausted`] instead of blocking.

use crate::config::ValidatedConfig;
use crate::error::{AdapterError, AdapterResult};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Upper bound for a configured `pool_size`
pub const MAX_POOL_SIZE: usize = 1024;

/// Sizing and wait policy of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_size: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolSettings {
    /// Read `pool_size` and `pool_timeout_ms`, keeping defaults for absent values.
    /// The size is clamped to `1..=MAX_POOL_SIZE`.
    pub fn from_config(config: &ValidatedConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_size: config
                .u64("pool_size")
                .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
                .unwrap_or(defaults.max_size)
                .clamp(1, MAX_POOL_SIZE),
            acquire_timeout: config
                .u64("pool_timeout_ms")
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquire_timeout),
        }
    }
}

/// A checked-out client. Holds its pool slot until checked in or dropped.
pub struct Pooled<T> {
    client: T,
    _permit: OwnedSemaphorePermit,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.client
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.client
    }
}

/// Bounded pool of reusable clients
pub struct ClientPool<T> {
    idle: Mutex<Vec<T>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    settings: PoolSettings,
    healthy: fn(&T) -> bool,
}

impl<T: Send> ClientPool<T> {
    pub fn new(settings: PoolSettings) -> Self {
        let capacity = settings.max_size.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            settings,
            healthy: |_| true,
        }
    }

    /// Skip idle clients failing `healthy` on checkout
    pub fn with_health_check(mut self, healthy: fn(&T) -> bool) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    /// Take an idle client or open one with `connect`
    pub async fn checkout<F, Fut>(&self, connect: F) -> AdapterResult<Pooled<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let permit = match tokio::time::timeout(
            self.settings.acquire_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AdapterError::connection("connection pool is closed")),
            Err(_) => return Err(AdapterError::PoolExhausted(self.settings.acquire_timeout)),
        };

        let reused = {
            let mut idle = self.idle.lock().await;
            let mut found = None;
            while let Some(client) = idle.pop() {
                if (self.healthy)(&client) {
                    found = Some(client);
                    break;
                }
                debug!("Dropping unhealthy idle client");
            }
            found
        };

        let client = match reused {
            Some(client) => client,
            // On failure the permit drops with the error, freeing the slot.
            None => connect().await?,
        };

        Ok(Pooled {
            client,
            _permit: permit,
        })
    }

    /// Return a client for reuse and free its slot
    pub async fn checkin(&self, pooled: Pooled<T>) {
        let Pooled { client, _permit } = pooled;
        if (self.healthy)(&client) {
            self.idle.lock().await.push(client);
        } else {
            debug!("Discarding unhealthy client on checkin");
        }
        drop(_permit);
    }

    /// Close a client instead of returning it, freeing its slot
    pub fn discard(&self, pooled: Pooled<T>) {
        drop(pooled);
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Whether no client is checked out
    pub fn is_unused(&self) -> bool {
        self.permits.available_permits() == self.capacity
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Stop handing out clients and drop idle ones
    pub async fn close(&self) {
        self.permits.close();
        self.idle.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(max_size: usize, timeout_ms: u64) -> PoolSettings {
        PoolSettings {
            max_size,
            acquire_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_checkout_reuses_idle_clients() {
        let pool: ClientPool<usize> = ClientPool::new(settings(2, 50));
        let opened = AtomicUsize::new(0);

        let first = pool
            .checkout(|| async { Ok(opened.fetch_add(1, Ordering::SeqCst)) })
            .await
            .unwrap();
        assert_eq!(*first, 0);
        pool.checkin(first).await;
        assert_eq!(pool.idle_count().await, 1);

        let again = pool
            .checkout(|| async { Ok(opened.fetch_add(1, Ordering::SeqCst)) })
            .await
            .unwrap();
        assert_eq!(*again, 0);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_fast() {
        let pool: ClientPool<u8> = ClientPool::new(settings(1, 20));
        let held = pool.checkout(|| async { Ok(1) }).await.unwrap();

        let err = match pool.checkout(|| async { Ok(2) }).await {
            Err(e) => e,
            Ok(_) => panic!("Expected PoolExhausted"),
        };
        assert!(matches!(err, AdapterError::PoolExhausted(d) if d == Duration::from_millis(20)));

        pool.discard(held);
        assert_eq!(pool.available(), 1);
        assert!(pool.checkout(|| async { Ok(3) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_connect_frees_slot() {
        let pool: ClientPool<u8> = ClientPool::new(settings(1, 20));
        let result = pool
            .checkout(|| async { Err(AdapterError::connection("refused")) })
            .await;
        assert!(matches!(result, Err(AdapterError::Connection(_))));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_from_config_clamps_pool_size() {
        use crate::config::DatasourceConfig;
        use crate::schema::IntegrationSchema;
        use crate::types::{FieldDescriptor, FieldType};

        let schema = IntegrationSchema::new("pooled")
            .with_config_field("pool_size", FieldDescriptor::optional(FieldType::Number))
            .with_config_field("pool_timeout_ms", FieldDescriptor::optional(FieldType::Number));
        let sized = |value: serde_json::Value| {
            let raw = DatasourceConfig::new().with_value("pool_size", value);
            PoolSettings::from_config(&ValidatedConfig::new(&schema, &raw).unwrap())
        };

        assert_eq!(sized(u64::MAX.into()).max_size, MAX_POOL_SIZE);
        assert_eq!(sized(0.into()).max_size, 1);
        assert_eq!(sized("25".into()).max_size, 25);
        assert_eq!(sized(25.into()).acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_oversized_settings_do_not_panic() {
        let pool: ClientPool<u8> = ClientPool::new(settings(usize::MAX, 20));
        assert_eq!(pool.available(), Semaphore::MAX_PERMITS);
        assert!(pool.is_unused());
    }

    #[tokio::test]
    async fn test_is_unused_tracks_checkouts() {
        let pool: ClientPool<u8> = ClientPool::new(settings(2, 20));
        let held = pool.checkout(|| async { Ok(1) }).await.unwrap();
        assert!(!pool.is_unused());
        pool.checkin(held).await;
        assert!(pool.is_unused());
    }

    #[tokio::test]
    async fn test_unhealthy_clients_are_skipped() {
        let pool: ClientPool<i32> =
            ClientPool::new(settings(2, 20)).with_health_check(|c| *c >= 0);
        let bad = pool.checkout(|| async { Ok(-1) }).await.unwrap();
        pool.checkin(bad).await;
        assert_eq!(pool.idle_count().await, 0);

        let fresh = pool.checkout(|| async { Ok(5) }).await.unwrap();
        assert_eq!(*fresh, 5);
    }
}
