/// Application context and dependency injection
use crate::{
    config::EngineConfig,
    db::{self, SqliteSubscriptionStore, SubscriptionManager},
    distribution::{DeliveryClient, Engine, EventProducer},
    error::HookResult,
    store::{RedisStore, SharedStore},
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<EngineConfig>,
    pub store: SharedStore,
    pub subscription_db: SqlitePool,
    pub subscriptions: SqliteSubscriptionStore,
    pub subscription_manager: SubscriptionManager,
    pub producer: EventProducer,
    pub delivery: DeliveryClient,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: EngineConfig) -> HookResult<Self> {
        config.validate()?;

        let store: SharedStore = Arc::new(RedisStore::connect(&config.store).await?);
        store.ping().await?;
        info!("Connected to coordination store at {}", config.store.redis_url);

        let subscription_db = db::create_pool(
            &config.storage.subscription_db,
            db::DatabaseOptions::from(&config.storage),
        )
        .await?;
        db::run_migrations(&subscription_db).await?;
        db::test_connection(&subscription_db).await?;
        info!(
            "Subscription database ready at {}",
            config.storage.subscription_db.display()
        );

        Self::with_parts(config, store, subscription_db)
    }

    /// Build a context around an existing store and migrated pool
    pub fn with_parts(
        config: EngineConfig,
        store: SharedStore,
        subscription_db: SqlitePool,
    ) -> HookResult<Self> {
        let subscriptions = SqliteSubscriptionStore::new(subscription_db.clone());
        let subscription_manager = SubscriptionManager::new(subscriptions.clone(), store.clone());
        let producer = EventProducer::new(store.clone());
        let delivery = DeliveryClient::new(config.distribution.default_delivery_timeout)?;

        Ok(Self {
            config: Arc::new(config),
            store,
            subscription_db,
            subscriptions,
            subscription_manager,
            producer,
            delivery,
        })
    }

    /// Reconcile and start every worker
    pub async fn start_engine(&self) -> HookResult<Engine> {
        Engine::start(
            self.store.clone(),
            Arc::new(self.subscriptions.clone()),
            self.delivery.clone(),
            &self.config.distribution,
        )
        .await
    }

    /// Admin listen address
    pub fn bind_address(&self) -> String {
        format!(
            "{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}
