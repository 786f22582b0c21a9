/// Redis-backed coordination store
///
/// Ordinary commands go through a shared `ConnectionManager`. Blocking pops
/// get their own multiplexed connections from a small pool, because a
/// `BLPOP` on the shared connection would hold up every command queued
/// behind it. Each subscription opens a dedicated pub/sub connection.

use crate::config::StoreConfig;
use crate::error::{HookError, HookResult};
use crate::store::CoordinationStore;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Buffer between the pub/sub reader task and the subscriber
const SUBSCRIBE_BUFFER: usize = 256;

/// Redis coordination store
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    pop_pool: Arc<Mutex<Vec<MultiplexedConnection>>>,
    pop_pool_size: usize,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn connect(config: &StoreConfig) -> HookResult<Self> {
        info!("Connecting to Redis at {}", config.redis_url);

        let client = Client::open(config.redis_url.as_str()).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            HookError::Store(format!("Redis client creation failed: {}", e))
        })?;

        let connection = ConnectionManager::new(client.clone()).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            HookError::Store(format!("Redis connection failed: {}", e))
        })?;

        info!("✓ Redis connection established");

        Ok(Self {
            client,
            connection,
            pop_pool: Arc::new(Mutex::new(Vec::new())),
            pop_pool_size: config.pop_pool_size.max(1),
            key_prefix: config.key_prefix.clone(),
        })
    }

    /// Build a namespaced key
    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Take a dedicated connection for a blocking command
    async fn checkout_pop_connection(&self) -> HookResult<MultiplexedConnection> {
        if let Some(conn) = self.pop_pool.lock().await.pop() {
            return Ok(conn);
        }

        debug!("Opening dedicated Redis connection for blocking pop");
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| HookError::Store(format!("Redis pop connection failed: {}", e)))
    }

    async fn return_pop_connection(&self, conn: MultiplexedConnection) {
        let mut pool = self.pop_pool.lock().await;
        if pool.len() < self.pop_pool_size {
            pool.push(conn);
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn incr(&self, key: &str) -> HookResult<i64> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        conn.incr(&key, 1).await.map_err(|e| {
            warn!("Redis INCR failed for {}: {}", key, e);
            HookError::Store(format!("Counter increment failed: {}", e))
        })
    }

    async fn push(&self, key: &str, value: &str) -> HookResult<()> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        let _: i64 = conn.rpush(&key, value).await.map_err(|e| {
            warn!("Redis RPUSH failed for {}: {}", key, e);
            HookError::Store(format!("Queue push failed: {}", e))
        })?;
        Ok(())
    }

    async fn push_front(&self, key: &str, value: &str) -> HookResult<()> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        let _: i64 = conn.lpush(&key, value).await.map_err(|e| {
            warn!("Redis LPUSH failed for {}: {}", key, e);
            HookError::Store(format!("Queue requeue failed: {}", e))
        })?;
        Ok(())
    }

    async fn blocking_pop(&self, key: &str, timeout: Duration) -> HookResult<Option<String>> {
        let key = self.build_key(key);
        let mut conn = self.checkout_pop_connection().await?;

        // BLPOP treats 0 as "block forever"
        let secs = timeout.as_secs_f64().max(0.01);
        let result: Option<(String, String)> = match conn.blpop(&key, secs).await {
            Ok(result) => result,
            Err(e) => {
                // The connection state is unknown after a failed blocking call
                warn!("Redis BLPOP failed for {}: {}", key, e);
                return Err(HookError::Store(format!("Queue pop failed: {}", e)));
            }
        };

        self.return_pop_connection(conn).await;
        Ok(result.map(|(_, value)| value))
    }

    async fn queue_len(&self, key: &str) -> HookResult<usize> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        conn.llen(&key)
            .await
            .map_err(|e| HookError::Store(format!("Queue length failed: {}", e)))
    }

    async fn hash_get(&self, key: &str, field: &str) -> HookResult<Option<String>> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        conn.hget(&key, field).await.map_err(|e| {
            warn!("Redis HGET failed for {} {}: {}", key, field, e);
            HookError::Store(format!("Hash get failed: {}", e))
        })
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> HookResult<()> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        let _: i64 = conn.hset(&key, field, value).await.map_err(|e| {
            warn!("Redis HSET failed for {} {}: {}", key, field, e);
            HookError::Store(format!("Hash set failed: {}", e))
        })?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> HookResult<()> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .hdel(&key, field)
            .await
            .map_err(|e| HookError::Store(format!("Hash delete failed: {}", e)))?;
        Ok(())
    }

    async fn set_add(&self, key: &str, members: &[String]) -> HookResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        let _: i64 = conn.sadd(&key, members).await.map_err(|e| {
            warn!("Redis SADD failed for {}: {}", key, e);
            HookError::Store(format!("Set add failed: {}", e))
        })?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> HookResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        let _: i64 = conn.srem(&key, members).await.map_err(|e| {
            warn!("Redis SREM failed for {}: {}", key, e);
            HookError::Store(format!("Set remove failed: {}", e))
        })?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> HookResult<HashSet<String>> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        conn.smembers(&key).await.map_err(|e| {
            warn!("Redis SMEMBERS failed for {}: {}", key, e);
            HookError::Store(format!("Set members failed: {}", e))
        })
    }

    async fn keys(&self, pattern: &str) -> HookResult<Vec<String>> {
        let pattern = self.build_key(pattern);
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys(&pattern).await.map_err(|e| {
            error!("Redis KEYS failed: {}", e);
            HookError::Store(format!("Key lookup failed: {}", e))
        })?;

        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.key_prefix).map(str::to_string))
            .collect())
    }

    async fn delete(&self, key: &str) -> HookResult<()> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        let _: i64 = conn.del(&key).await.map_err(|e| {
            warn!("Redis DEL failed for {}: {}", key, e);
            HookError::Store(format!("Delete failed: {}", e))
        })?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> HookResult<bool> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        conn.exists(&key).await.map_err(|e| {
            warn!("Redis EXISTS failed for {}: {}", key, e);
            HookError::Store(format!("Exists check failed: {}", e))
        })
    }

    async fn acquire(&self, key: &str, value: &str, ttl: Duration) -> HookResult<bool> {
        let key = self.build_key(key);
        let mut conn = self.connection.clone();
        let millis = ttl.as_millis().max(1) as u64;

        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!("Redis SET NX failed for {}: {}", key, e);
                HookError::Store(format!("Marker acquire failed: {}", e))
            })?;

        Ok(reply.is_some())
    }

    async fn release(&self, key: &str) -> HookResult<()> {
        self.delete(key).await
    }

    async fn publish(&self, channel: &str, message: &str) -> HookResult<()> {
        let channel = self.build_key(channel);
        let mut conn = self.connection.clone();
        let receivers: i64 = conn.publish(&channel, message).await.map_err(|e| {
            warn!("Redis PUBLISH failed for {}: {}", channel, e);
            HookError::Store(format!("Publish failed: {}", e))
        })?;
        debug!("Published on {} to {} receiver(s)", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> HookResult<mpsc::Receiver<String>> {
        let channel = self.build_key(channel);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| HookError::Store(format!("Pub/sub connection failed: {}", e)))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| HookError::Store(format!("Subscribe to {} failed: {}", channel, e)))?;

        info!("Subscribed to Redis channel {}", channel);

        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Dropping undecodable message on {}: {}", channel, e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    debug!("Subscriber for {} went away", channel);
                    break;
                }
            }
            warn!("Redis pub/sub stream for {} ended", channel);
        });

        Ok(rx)
    }

    async fn ping(&self) -> HookResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            error!("Redis PING failed: {}", e);
            HookError::Store(format!("Ping failed: {}", e))
        })?;

        if pong != "PONG" {
            return Err(HookError::Store(
                "Unexpected Redis PING response".to_string(),
            ));
        }

        Ok(())
    }
}
