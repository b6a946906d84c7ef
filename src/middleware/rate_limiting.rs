//! # Rate Limiting System
//!
//! Per-client sliding-window admission control. Each client owns an ordered set of
//! admission timestamps in a shared store (`rl:<client>`); on every check the
//! limiter
//!
//! 1. prunes entries older than `now - window`
//! 2. counts what is left
//! 3. denies when the count has reached `requests_per_second + burst`
//! 4. otherwise records `now` with a TTL of twice the window and admits
//!
//! The three store operations are separate round trips, not a transaction. Two
//! concurrent checks for the same client can both see a count just under the
//! limit and both be admitted; that small over-admission is accepted.
//!
//! If the store fails at any step the request is admitted. The limiter reports
//! [`RateLimitDecision::StoreUnavailable`] and leaves logging of the degraded state
//! to its caller.
//!
//! ## Architecture
//! - [`WindowStore`]: the four operations the limiter needs from a store
//! - [`RedisWindowStore`]: sorted sets in Redis, shared by every gateway instance
//! - [`InMemoryWindowStore`]: the same semantics in process memory
//!
//! ## Usage Example
//! ```rust,ignore
//! let store = Arc::new(InMemoryWindowStore::new());
//! let limiter = RateLimiter::new(config.rate_limit.clone(), store);
//! if !limiter.allow("uid_42").await {
//!     // 429
//! }
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{Client as RedisClient, IntoConnectionInfo};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::config::{RateLimitConfig, RateLimitStoreKind, RedisConfig};
use crate::core::types::ANONYMOUS_CLIENT;

/// Prefix of every window key in the store
pub const KEY_PREFIX: &str = "rl:";

/// Errors that can occur talking to the window store
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store unavailable, next connection attempt in {0:?}")]
    Backoff(Duration),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Outcome of one admission check
#[derive(Debug)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
    /// The store failed; the request is admitted anyway
    StoreUnavailable(RateLimitError),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Limited)
    }
}

/// Operations the limiter issues against the shared store.
///
/// Scores are milliseconds since the Unix epoch.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Remove every entry with a score `<= max_score`
    async fn prune(&self, key: &str, max_score: i64) -> Result<(), RateLimitError>;

    async fn count(&self, key: &str) -> Result<u64, RateLimitError>;

    /// Add one entry and (re)arm the key's expiry
    async fn insert(&self, key: &str, member: &str, score: i64, ttl: Duration) -> Result<(), RateLimitError>;

    async fn clear(&self, key: &str) -> Result<(), RateLimitError>;

    fn kind(&self) -> &'static str;
}

/// Build the store selected in the configuration
pub fn create_window_store(
    config: &RateLimitConfig,
    redis: &RedisConfig,
) -> Result<Arc<dyn WindowStore>, RateLimitError> {
    match config.store {
        RateLimitStoreKind::Redis => Ok(Arc::new(RedisWindowStore::new(redis)?)),
        RateLimitStoreKind::Memory => Ok(Arc::new(InMemoryWindowStore::new())),
    }
}

/// Sliding-window rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn WindowStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("store", &self.store.kind())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn WindowStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    /// Admissions allowed per window
    pub fn limit(&self) -> u32 {
        self.config
            .requests_per_second
            .saturating_add(self.config.burst)
    }

    pub fn window_key(client: &str) -> String {
        let client = if client.is_empty() { ANONYMOUS_CLIENT } else { client };
        format!("{}{}", KEY_PREFIX, client)
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }

    /// Decide whether `client` may make another request now
    pub async fn check(&self, client: &str) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::Allowed;
        }

        let key = Self::window_key(client);
        let now = Self::now_ms();
        let window_ms = self.config.window.as_millis() as i64;

        if let Err(e) = self.store.prune(&key, now - window_ms).await {
            return RateLimitDecision::StoreUnavailable(e);
        }

        let count = match self.store.count(&key).await {
            Ok(count) => count,
            Err(e) => return RateLimitDecision::StoreUnavailable(e),
        };

        if count >= u64::from(self.limit()) {
            debug!(client = %client, count, limit = self.limit(), "Rate limit reached");
            return RateLimitDecision::Limited;
        }

        // Unique members keep same-millisecond admissions from collapsing into one entry
        let member = format!("{}-{}", now, uuid::Uuid::new_v4().simple());
        if let Err(e) = self
            .store
            .insert(&key, &member, now, self.config.window * 2)
            .await
        {
            return RateLimitDecision::StoreUnavailable(e);
        }

        RateLimitDecision::Allowed
    }

    /// `check` reduced to a yes/no answer; store failures answer yes
    pub async fn allow(&self, client: &str) -> bool {
        self.check(client).await.is_allowed()
    }

    /// Administrative override: forget the client's window
    pub async fn reset(&self, client: &str) -> Result<(), RateLimitError> {
        self.store.clear(&Self::window_key(client)).await?;
        info!(client = %client, "Rate limit window reset");
        Ok(())
    }
}

/// Window store backed by Redis sorted sets.
///
/// The connection is established lazily so that the gateway starts, and keeps
/// admitting traffic, while Redis is down. After a failed connection attempt
/// further attempts are suppressed for `connect_timeout`.
pub struct RedisWindowStore {
    client: RedisClient,
    connection: RwLock<Option<ConnectionManager>>,
    last_connect_failure: Mutex<Option<Instant>>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl RedisWindowStore {
    pub fn new(config: &RedisConfig) -> Result<Self, RateLimitError> {
        let mut info = config.url.as_str().into_connection_info()?;
        if let Some(password) = config.password.as_ref().filter(|p| !p.is_empty()) {
            info.redis.password = Some(password.clone());
        }
        let client = RedisClient::open(info)?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            last_connect_failure: Mutex::new(None),
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, RateLimitError> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        if let Some(failed_at) = *self.last_connect_failure.lock() {
            let since = failed_at.elapsed();
            if since < self.connect_timeout {
                return Err(RateLimitError::Backoff(self.connect_timeout - since));
            }
        }

        let mut slot = self.connection.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let connected =
            tokio::time::timeout(self.connect_timeout, ConnectionManager::new(self.client.clone()))
                .await
                .map_err(|_| RateLimitError::Timeout(self.connect_timeout))
                .and_then(|r| r.map_err(RateLimitError::from));

        match connected {
            Ok(conn) => {
                *self.last_connect_failure.lock() = None;
                info!("Connected to rate limit store");
                *slot = Some(conn.clone());
                Ok(conn)
            }
            Err(e) => {
                *self.last_connect_failure.lock() = Some(Instant::now());
                Err(e)
            }
        }
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, RateLimitError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.command_timeout, operation)
            .await
            .map_err(|_| RateLimitError::Timeout(self.command_timeout))?
            .map_err(RateLimitError::from)
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn prune(&self, key: &str, max_score: i64) -> Result<(), RateLimitError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
        cmd.arg(key).arg("-inf").arg(max_score);
        self.bounded(cmd.query_async::<_, ()>(&mut conn)).await
    }

    async fn count(&self, key: &str) -> Result<u64, RateLimitError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(key);
        self.bounded(cmd.query_async::<_, u64>(&mut conn)).await
    }

    async fn insert(&self, key: &str, member: &str, score: i64, ttl: Duration) -> Result<(), RateLimitError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .ignore();
        self.bounded(pipe.query_async::<_, ()>(&mut conn)).await
    }

    async fn clear(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.bounded(cmd.query_async::<_, ()>(&mut conn)).await
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug)]
struct MemoryWindow {
    entries: Vec<(i64, String)>,
    expires_at: Instant,
}

/// How often inserts sweep out windows of clients that never came back
pub const DEFAULT_MEMORY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Process-local window store with the same semantics as the Redis store.
///
/// Expired windows are dropped when their key is touched and, at most once per
/// sweep interval, across the whole map on insert. The map therefore stays
/// bounded by the clients seen within roughly one TTL.
#[derive(Debug)]
pub struct InMemoryWindowStore {
    windows: DashMap<String, MemoryWindow>,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_MEMORY_SWEEP_INTERVAL)
    }
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Number of client windows currently held
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop every expired window; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| window.expires_at > now);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, remaining = self.windows.len(), "Swept expired rate limit windows");
        }
        removed
    }

    fn sweep_if_due(&self) {
        {
            let mut last = self.last_sweep.lock();
            if last.elapsed() < self.sweep_interval {
                return;
            }
            *last = Instant::now();
        }
        self.sweep_expired();
    }

    fn drop_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.windows.remove_if(key, |_, window| window.expires_at <= now);
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn prune(&self, key: &str, max_score: i64) -> Result<(), RateLimitError> {
        self.drop_if_expired(key);
        if let Some(mut window) = self.windows.get_mut(key) {
            window.entries.retain(|(score, _)| *score > max_score);
        }
        Ok(())
    }

    async fn count(&self, key: &str) -> Result<u64, RateLimitError> {
        self.drop_if_expired(key);
        Ok(self
            .windows
            .get(key)
            .map_or(0, |window| window.entries.len() as u64))
    }

    async fn insert(&self, key: &str, member: &str, score: i64, ttl: Duration) -> Result<(), RateLimitError> {
        // Must run before taking the entry guard below
        self.sweep_if_due();

        let expires_at = Instant::now() + ttl;
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| MemoryWindow {
                entries: Vec::new(),
                expires_at,
            });
        window.entries.retain(|(_, m)| m != member);
        window.entries.push((score, member.to_string()));
        window.expires_at = expires_at;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), RateLimitError> {
        self.windows.remove(key);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl WindowStore for BrokenStore {
        async fn prune(&self, _key: &str, _max_score: i64) -> Result<(), RateLimitError> {
            Err(RateLimitError::Storage("connection reset".to_string()))
        }

        async fn count(&self, _key: &str) -> Result<u64, RateLimitError> {
            Err(RateLimitError::Storage("connection reset".to_string()))
        }

        async fn insert(&self, _key: &str, _member: &str, _score: i64, _ttl: Duration) -> Result<(), RateLimitError> {
            Err(RateLimitError::Storage("connection reset".to_string()))
        }

        async fn clear(&self, _key: &str) -> Result<(), RateLimitError> {
            Err(RateLimitError::Storage("connection reset".to_string()))
        }

        fn kind(&self) -> &'static str {
            "broken"
        }
    }

    fn limiter(rps: u32, burst: u32, window: Duration) -> (RateLimiter, Arc<InMemoryWindowStore>) {
        let store = Arc::new(InMemoryWindowStore::new());
        let config = RateLimitConfig {
            enabled: true,
            requests_per_second: rps,
            burst,
            window,
            store: RateLimitStoreKind::Memory,
        };
        (RateLimiter::new(config, store.clone()), store)
    }

    #[tokio::test]
    async fn test_eleventh_request_in_window_is_denied() {
        let (limiter, _) = limiter(10, 0, Duration::from_millis(300));

        for i in 1..=10 {
            assert!(limiter.allow("5.6.7.8").await, "request {} should pass", i);
        }
        assert!(matches!(limiter.check("5.6.7.8").await, RateLimitDecision::Limited));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(limiter.allow("5.6.7.8").await);
    }

    #[tokio::test]
    async fn test_burst_extends_limit() {
        let (limiter, _) = limiter(2, 3, Duration::from_secs(1));
        let admitted = {
            let mut n = 0;
            for _ in 0..8 {
                if limiter.allow("uid_7").await {
                    n += 1;
                }
            }
            n
        };
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_clients_are_independent() {
        let (limiter, _) = limiter(1, 0, Duration::from_secs(1));
        assert!(limiter.allow("uid_1").await);
        assert!(!limiter.allow("uid_1").await);
        assert!(limiter.allow("uid_2").await);
    }

    #[tokio::test]
    async fn test_denied_requests_are_not_recorded() {
        let (limiter, store) = limiter(2, 0, Duration::from_secs(1));
        for _ in 0..5 {
            limiter.allow("uid_1").await;
        }
        assert_eq!(store.count("rl:uid_1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disabled_limiter_allows_everything() {
        let store = Arc::new(InMemoryWindowStore::new());
        let config = RateLimitConfig {
            enabled: false,
            requests_per_second: 0,
            burst: 0,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, store.clone());

        for _ in 0..20 {
            assert!(limiter.allow("uid_1").await);
        }
        assert_eq!(store.count("rl:uid_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let config = RateLimitConfig {
            requests_per_second: 0,
            burst: 1,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, Arc::new(BrokenStore));

        for _ in 0..3 {
            let decision = limiter.check("uid_1").await;
            assert!(matches!(decision, RateLimitDecision::StoreUnavailable(_)));
            assert!(decision.is_allowed());
        }
        assert!(limiter.reset("uid_1").await.is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_window() {
        let (limiter, _) = limiter(1, 0, Duration::from_secs(60));
        assert!(limiter.allow("uid_9").await);
        assert!(!limiter.allow("uid_9").await);

        limiter.reset("uid_9").await.unwrap();
        assert!(limiter.allow("uid_9").await);
    }

    #[test]
    fn test_window_key() {
        assert_eq!(RateLimiter::window_key("uid_3"), "rl:uid_3");
        assert_eq!(RateLimiter::window_key(""), "rl:anonymous");
    }

    #[tokio::test]
    async fn test_memory_store_prune_and_expiry() {
        let store = InMemoryWindowStore::new();
        store.insert("rl:a", "m1", 100, Duration::from_secs(10)).await.unwrap();
        store.insert("rl:a", "m2", 200, Duration::from_secs(10)).await.unwrap();
        store.insert("rl:a", "m2", 200, Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.count("rl:a").await.unwrap(), 2);

        store.prune("rl:a", 100).await.unwrap();
        assert_eq!(store.count("rl:a").await.unwrap(), 1);

        store.insert("rl:b", "m1", 100, Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.count("rl:b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_forgets_clients_that_never_return() {
        let store = Arc::new(InMemoryWindowStore::with_sweep_interval(Duration::from_millis(50)));
        let config = RateLimitConfig {
            enabled: true,
            requests_per_second: 10,
            burst: 0,
            window: Duration::from_millis(10),
            store: RateLimitStoreKind::Memory,
        };
        let limiter = RateLimiter::new(config, store.clone());

        for i in 0..2000u32 {
            let ip = std::net::Ipv4Addr::from(0x0a00_0000 + i).to_string();
            assert!(limiter.allow(&ip).await);
        }
        assert!(store.len() > 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(limiter.allow("5.6.7.8").await);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_sweep_keeps_live_windows() {
        let store = InMemoryWindowStore::new();
        store.insert("rl:old", "m1", 1, Duration::from_millis(10)).await.unwrap();
        store.insert("rl:live", "m1", 1, Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.count("rl:live").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_open() {
        let redis = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(300),
            ..RedisConfig::default()
        };
        let store = Arc::new(RedisWindowStore::new(&redis).unwrap());
        let limiter = RateLimiter::new(RateLimitConfig::default(), store);

        let started = Instant::now();
        let first = limiter.check("uid_1").await;
        assert!(matches!(first, RateLimitDecision::StoreUnavailable(_)));

        // Within the backoff the store answers immediately
        let second = limiter.check("uid_1").await;
        assert!(matches!(
            second,
            RateLimitDecision::StoreUnavailable(RateLimitError::Backoff(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_create_window_store() {
        let mut config = RateLimitConfig::default();
        config.store = RateLimitStoreKind::Memory;
        assert_eq!(
            create_window_store(&config, &RedisConfig::default()).unwrap().kind(),
            "memory"
        );

        config.store = RateLimitStoreKind::Redis;
        assert_eq!(
            create_window_store(&config, &RedisConfig::default()).unwrap().kind(),
            "redis"
        );
    }
}
