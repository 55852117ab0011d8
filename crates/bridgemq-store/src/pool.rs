//! Store connectivity: command-connection pool and pub/sub client.
//!
//! Commands go through a deadpool-managed pool of multiplexed connections
//! with a bounded acquire. Pub/sub uses a dedicated client because subscribe
//! mode cannot share the command pool. Initial connect retries with capped
//! exponential backoff and ±20% jitter before surfacing a fatal error.

use std::time::Duration;

use deadpool_redis::{PoolConfig, Runtime, Timeouts};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::keys::{Keys, DEFAULT_NAMESPACE};

/// Store connection configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Redis URL.
    pub url: String,
    /// Namespace prefix for every key.
    pub namespace: String,
    /// Connections the health probe keeps warm.
    pub pool_min: usize,
    /// Hard cap on pooled connections.
    pub pool_max: usize,
    /// Bound on pool acquire; exceeding it is a pool-exhaustion error.
    pub acquire_timeout: Duration,
    /// Connect attempts before giving up.
    pub connect_retries: u32,
    /// Base delay for connect backoff (doubles each attempt).
    pub connect_base_delay: Duration,
    /// Cap on connect backoff.
    pub connect_max_delay: Duration,
    /// Health probe period.
    pub health_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            pool_min: 2,
            pool_max: 16,
            acquire_timeout: Duration::from_millis(3_000),
            connect_retries: 5,
            connect_base_delay: Duration::from_millis(250),
            connect_max_delay: Duration::from_secs(10),
            health_interval: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("BRIDGEMQ_REDIS_URL")
                .or_else(|_| std::env::var("REDIS_URL"))
                .unwrap_or(defaults.url),
            namespace: std::env::var("BRIDGEMQ_NAMESPACE").unwrap_or(defaults.namespace),
            pool_min: env_parse("BRIDGEMQ_POOL_MIN", defaults.pool_min),
            pool_max: env_parse("BRIDGEMQ_POOL_MAX", defaults.pool_max),
            acquire_timeout: Duration::from_millis(env_parse(
                "BRIDGEMQ_ACQUIRE_TIMEOUT_MS",
                defaults.acquire_timeout.as_millis() as u64,
            )),
            connect_retries: env_parse("BRIDGEMQ_CONNECT_RETRIES", defaults.connect_retries),
            connect_base_delay: defaults.connect_base_delay,
            connect_max_delay: defaults.connect_max_delay,
            health_interval: Duration::from_secs(env_parse(
                "BRIDGEMQ_HEALTH_INTERVAL_SECS",
                defaults.health_interval.as_secs(),
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Shared handle to the store.
pub struct Store {
    pool: deadpool_redis::Pool,
    pubsub_client: redis::Client,
    config: StoreConfig,
}

impl Store {
    /// Connect to the store, verifying reachability with PING.
    ///
    /// Retries up to `connect_retries` times with capped exponential backoff
    /// and ±20% jitter, then fails with the last connection error.
    pub async fn connect(config: StoreConfig) -> StoreResult<Self> {
        let mut pool_cfg = deadpool_redis::Config::from_url(&config.url);
        pool_cfg.pool = Some(PoolConfig {
            max_size: config.pool_max,
            timeouts: Timeouts {
                wait: Some(config.acquire_timeout),
                create: Some(config.acquire_timeout),
                recycle: Some(config.acquire_timeout),
            },
            ..Default::default()
        });
        let pool = pool_cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let pubsub_client = redis::Client::open(config.url.as_str())?;

        let store = Self {
            pool,
            pubsub_client,
            config,
        };

        let mut attempt = 0u32;
        loop {
            match store.ping().await {
                Ok(()) => break,
                Err(e) if attempt < store.config.connect_retries => {
                    attempt += 1;
                    let delay = backoff_with_jitter(
                        store.config.connect_base_delay,
                        store.config.connect_max_delay,
                        attempt,
                    );
                    warn!(
                        attempt,
                        "Store not reachable, retrying in {:?}: {}", delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(StoreError::ConnectionFailed(format!(
                        "giving up after {} attempts: {e}",
                        attempt + 1
                    )))
                }
            }
        }

        info!(
            url = %store.config.url,
            namespace = %store.config.namespace,
            pool_max = store.config.pool_max,
            "Connected to store"
        );
        Ok(store)
    }

    /// Connect using environment configuration.
    pub async fn connect_from_env() -> StoreResult<Self> {
        Self::connect(StoreConfig::from_env()).await
    }

    /// Acquire a pooled command connection.
    pub async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| match e {
            deadpool_redis::PoolError::Timeout(_) => {
                StoreError::PoolExhausted(self.config.acquire_timeout)
            }
            other => StoreError::Pool(other),
        })
    }

    /// Open a dedicated pub/sub connection (never pooled).
    pub async fn pubsub(&self) -> StoreResult<redis::aio::PubSub> {
        Ok(self.pubsub_client.get_async_pubsub().await?)
    }

    /// Key builder for this store's namespace.
    pub fn keys(&self) -> Keys {
        Keys::new(self.config.namespace.clone())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Spawn the periodic health probe: touches `pool_min` connections with
    /// PING so dead ones are evicted on recycle and the pool stays warm.
    pub fn spawn_health_probe(self: &std::sync::Arc<Self>) -> JoinHandle<()> {
        let store = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                let mut held = Vec::with_capacity(store.config.pool_min);
                for _ in 0..store.config.pool_min {
                    match store.conn().await {
                        Ok(mut conn) => {
                            match redis::cmd("PING").query_async::<String>(&mut conn).await {
                                Ok(_) => held.push(conn),
                                Err(e) => warn!("Health probe ping failed: {}", e),
                            }
                        }
                        Err(e) => {
                            warn!("Health probe could not acquire connection: {}", e);
                            break;
                        }
                    }
                }
                debug!(warm = held.len(), "Health probe pass complete");
                drop(held);
            }
        })
    }
}

/// Capped exponential backoff with ±20% jitter.
fn backoff_with_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(cap);
    let jitter: f64 = rand::thread_rng().gen_range(-0.2..=0.2);
    let millis = (exp.as_millis() as f64 * (1.0 + jitter)).max(0.0);
    Duration::from_millis(millis as u64)
}

/// Millisecond wall-clock read. The single caller-side clock: every script
/// invocation receives its `now` from here (or from a test's fixed value).
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_and_jittered() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(10);
        for attempt in 1..=12 {
            let d = backoff_with_jitter(base, cap, attempt);
            assert!(d <= Duration::from_secs(12), "attempt {attempt}: {d:?}");
        }
        // Deep attempts stay within the jitter band around the cap.
        let d = backoff_with_jitter(base, cap, 30);
        assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12));
    }

    #[test]
    fn config_defaults() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.namespace, "bridgemq");
        assert_eq!(cfg.acquire_timeout, Duration::from_millis(3_000));
        assert!(cfg.pool_min <= cfg.pool_max);
    }
}
