/// Configuration management for the eventhook engine
use crate::error::{HookError, HookResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub service: ServiceConfig,
    pub store: StoreConfig,
    pub storage: StorageConfig,
    pub distribution: DistributionConfig,
    pub logging: LoggingConfig,
}

/// Admin HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
}

/// Coordination store (Redis) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub redis_url: String,
    /// Prefix applied to every key and channel
    pub key_prefix: String,
    /// Dedicated connections kept around for blocking pops
    pub pop_pool_size: usize,
}

/// Persisted subscription storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub subscription_db: PathBuf,
    pub max_connections: u32,
}

/// Timing knobs for the consumer, distributors and supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    /// Bound on a single blocking pop before the loop re-checks its signals
    pub poll_interval: Duration,
    /// Time given to the previous event's worker to register its running marker
    pub event_grace_period: Duration,
    /// Upper bound on waiting for the previous event to be marked done
    pub event_wait_timeout: Duration,
    /// Time given to the previous distribution item's worker to register
    pub distribution_grace_period: Duration,
    /// Sleep between done-marker checks while waiting on a predecessor
    pub wait_poll_interval: Duration,
    /// Added on top of the wait timeout when sizing running marker TTLs
    pub lock_ttl_slack: Duration,
    /// Delivery timeout applied when a subscription does not set one
    pub default_delivery_timeout: Duration,
    /// Number of done markers kept per scope before old entries are pruned
    pub done_retention: i64,
    /// Delay before a panicked worker is restarted
    pub restart_delay: Duration,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            event_grace_period: Duration::from_millis(500),
            event_wait_timeout: Duration::from_secs(30),
            distribution_grace_period: Duration::from_secs(3),
            wait_poll_interval: Duration::from_millis(100),
            lock_ttl_slack: Duration::from_secs(10),
            default_delivery_timeout: Duration::from_secs(10),
            done_retention: 1024,
            restart_delay: Duration::from_secs(5),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level for the crate and the HTTP trace layer, or a full filter directive
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }

    /// Filter directives used when `RUST_LOG` is not set
    pub fn filter_directives(&self) -> String {
        let level = self.level.trim();
        if level.contains('=') || level.contains(',') {
            level.to_string()
        } else {
            format!("eventhook={},tower_http={}", level, level)
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                hostname: "0.0.0.0".to_string(),
                port: 9160,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            store: StoreConfig {
                redis_url: "redis://localhost:6379".to_string(),
                key_prefix: "eventhook:".to_string(),
                pop_pool_size: 8,
            },
            storage: StorageConfig {
                subscription_db: PathBuf::from("./data/subscriptions.sqlite"),
                max_connections: 5,
            },
            distribution: DistributionConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl DistributionConfig {
    /// Load distribution timings from environment variables (milliseconds)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            poll_interval: env_millis("EVENTHOOK_POLL_INTERVAL_MS", defaults.poll_interval),
            event_grace_period: env_millis(
                "EVENTHOOK_EVENT_GRACE_MS",
                defaults.event_grace_period,
            ),
            event_wait_timeout: env_millis(
                "EVENTHOOK_EVENT_WAIT_TIMEOUT_MS",
                defaults.event_wait_timeout,
            ),
            distribution_grace_period: env_millis(
                "EVENTHOOK_DISTRIBUTION_GRACE_MS",
                defaults.distribution_grace_period,
            ),
            wait_poll_interval: env_millis(
                "EVENTHOOK_WAIT_POLL_INTERVAL_MS",
                defaults.wait_poll_interval,
            ),
            lock_ttl_slack: env_millis("EVENTHOOK_LOCK_TTL_SLACK_MS", defaults.lock_ttl_slack),
            default_delivery_timeout: env_millis(
                "EVENTHOOK_DEFAULT_DELIVERY_TIMEOUT_MS",
                defaults.default_delivery_timeout,
            ),
            done_retention: env_or("EVENTHOOK_DONE_RETENTION", defaults.done_retention),
            restart_delay: env_millis("EVENTHOOK_RESTART_DELAY_MS", defaults.restart_delay),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> HookResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("EVENTHOOK_HOSTNAME").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("EVENTHOOK_PORT")
            .unwrap_or_else(|_| "9160".to_string())
            .parse()
            .map_err(|_| HookError::Validation("Invalid port number".to_string()))?;
        let version =
            env::var("EVENTHOOK_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let key_prefix =
            env::var("EVENTHOOK_KEY_PREFIX").unwrap_or_else(|_| "eventhook:".to_string());
        let pop_pool_size = env_or("EVENTHOOK_POP_POOL_SIZE", 8usize);

        let data_directory: PathBuf = env::var("EVENTHOOK_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let subscription_db = env::var("EVENTHOOK_SUBSCRIPTION_DB_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("subscriptions.sqlite"));
        let max_connections = env_or("EVENTHOOK_DB_MAX_CONNECTIONS", 5u32);

        let level = env::var("EVENTHOOK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let format = env::var("EVENTHOOK_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

        Ok(EngineConfig {
            service: ServiceConfig {
                hostname,
                port,
                version,
            },
            store: StoreConfig {
                redis_url,
                key_prefix,
                pop_pool_size,
            },
            storage: StorageConfig {
                subscription_db,
                max_connections,
            },
            distribution: DistributionConfig::from_env(),
            logging: LoggingConfig { level, format },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> HookResult<()> {
        if self.service.hostname.is_empty() {
            return Err(HookError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.store.key_prefix.is_empty() {
            return Err(HookError::Validation(
                "Key prefix cannot be empty".to_string(),
            ));
        }

        let dist = &self.distribution;
        if dist.poll_interval.is_zero() || dist.wait_poll_interval.is_zero() {
            return Err(HookError::Validation(
                "Poll intervals must be greater than zero".to_string(),
            ));
        }

        if dist.default_delivery_timeout.is_zero() {
            return Err(HookError::Validation(
                "Default delivery timeout must be greater than zero".to_string(),
            ));
        }

        if dist.done_retention < 2 {
            return Err(HookError::Validation(
                "Done retention must keep at least two markers".to_string(),
            ));
        }

        Ok(())
    }
}
