/// Persisted subscription records and the management operations on them
use crate::{
    distribution::{
        reconciler::publish_subscription_change, ConfirmMode, ControlAction, Subscription,
        MAX_TIMEOUT_SECS,
    },
    error::{HookError, HookResult},
    store::SharedStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use sqlx::{sqlite::SqlitePool, FromRow};
use tracing::info;

/// Authoritative list of subscriptions read at startup and on reconcile
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn list_subscriptions(&self) -> HookResult<Vec<Subscription>>;
}

/// Fields supplied when registering a subscription
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subscription_name: String,
    pub owner_id: String,
    pub subscription_form: String,
    pub callback_url: String,
    pub time_out: u64,
    pub confirm_mode: ConfirmMode,
    pub confirm_pattern: String,
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    subscription_id: i64,
    subscription_name: String,
    owner_id: String,
    subscription_form: String,
    callback_url: String,
    time_out: i64,
    confirm_mode: String,
    confirm_pattern: String,
    last_time: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = HookError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let confirm_mode = row.confirm_mode.parse().map_err(|e| {
            HookError::Internal(format!(
                "subscription {} has a corrupt confirm mode: {}",
                row.subscription_id, e
            ))
        })?;

        Ok(Subscription {
            subscription_id: row.subscription_id,
            subscription_name: row.subscription_name,
            owner_id: row.owner_id,
            subscription_form: row.subscription_form,
            callback_url: row.callback_url,
            time_out: row.time_out.max(0) as u64,
            confirm_mode,
            confirm_pattern: row.confirm_pattern,
            last_time: row.last_time,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT subscription_id, subscription_name, owner_id, subscription_form,
        callback_url, time_out, confirm_mode, confirm_pattern, last_time
 FROM subscription";

/// Check the fields a delivery depends on before they are persisted
fn validate(
    name: &str,
    form: &str,
    callback_url: &str,
    time_out: u64,
    confirm_mode: ConfirmMode,
    confirm_pattern: &str,
) -> HookResult<()> {
    if name.trim().is_empty() {
        return Err(HookError::Validation("subscription name is required".to_string()));
    }

    if form.split(',').all(|t| t.trim().is_empty()) {
        return Err(HookError::Validation(
            "subscription form must name at least one event type".to_string(),
        ));
    }

    if !(callback_url.starts_with("http://") || callback_url.starts_with("https://")) {
        return Err(HookError::Validation(format!(
            "callback url must be http(s): {}",
            callback_url
        )));
    }

    if time_out > MAX_TIMEOUT_SECS {
        return Err(HookError::Validation(format!(
            "timeout must not exceed {} seconds",
            MAX_TIMEOUT_SECS
        )));
    }

    match confirm_mode {
        ConfirmMode::StatusCode => {
            let code = confirm_pattern.trim();
            if code.len() != 3 || !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(HookError::Validation(format!(
                    "confirm pattern must be an HTTP status code, got '{}'",
                    confirm_pattern
                )));
            }
        }
        ConfirmMode::Regex => {
            Regex::new(confirm_pattern).map_err(|source| HookError::InvalidConfirmPattern {
                pattern: confirm_pattern.to_string(),
                source,
            })?;
        }
    }

    Ok(())
}

/// SQLite-backed subscription table
#[derive(Clone)]
pub struct SqliteSubscriptionStore {
    db: SqlitePool,
}

impl SqliteSubscriptionStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Insert a new subscription and return it with its assigned ID
    pub async fn create(&self, new: NewSubscription) -> HookResult<Subscription> {
        validate(
            &new.subscription_name,
            &new.subscription_form,
            &new.callback_url,
            new.time_out,
            new.confirm_mode,
            &new.confirm_pattern,
        )?;

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO subscription (subscription_name, owner_id, subscription_form, callback_url,
                                       time_out, confirm_mode, confirm_pattern, last_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&new.subscription_name)
        .bind(&new.owner_id)
        .bind(&new.subscription_form)
        .bind(&new.callback_url)
        .bind(new.time_out as i64)
        .bind(new.confirm_mode.as_str())
        .bind(&new.confirm_pattern)
        .bind(now)
        .execute(&self.db)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => HookError::Validation(
                format!(
                    "subscription '{}' already exists for owner {}",
                    new.subscription_name, new.owner_id
                ),
            ),
            other => HookError::Database(other),
        })?;

        self.get(result.last_insert_rowid()).await
    }

    /// Fetch one subscription
    pub async fn get(&self, subscription_id: i64) -> HookResult<Subscription> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "{} WHERE subscription_id = ?1",
            SELECT_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| HookError::NotFound(format!("subscription {}", subscription_id)))?;

        row.try_into()
    }

    /// Replace a subscription's configuration; bumps `last_time`
    pub async fn update(&self, subscription: &Subscription) -> HookResult<Subscription> {
        validate(
            &subscription.subscription_name,
            &subscription.subscription_form,
            &subscription.callback_url,
            subscription.time_out,
            subscription.confirm_mode,
            &subscription.confirm_pattern,
        )?;

        let result = sqlx::query(
            "UPDATE subscription
             SET subscription_name = ?1, subscription_form = ?2, callback_url = ?3,
                 time_out = ?4, confirm_mode = ?5, confirm_pattern = ?6, last_time = ?7
             WHERE subscription_id = ?8",
        )
        .bind(&subscription.subscription_name)
        .bind(&subscription.subscription_form)
        .bind(&subscription.callback_url)
        .bind(subscription.time_out as i64)
        .bind(subscription.confirm_mode.as_str())
        .bind(&subscription.confirm_pattern)
        .bind(Utc::now())
        .bind(subscription.subscription_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HookError::NotFound(format!(
                "subscription {}",
                subscription.subscription_id
            )));
        }

        self.get(subscription.subscription_id).await
    }

    /// Remove a subscription, returning the removed record
    pub async fn delete(&self, subscription_id: i64) -> HookResult<Subscription> {
        let existing = self.get(subscription_id).await?;

        sqlx::query("DELETE FROM subscription WHERE subscription_id = ?1")
            .bind(subscription_id)
            .execute(&self.db)
            .await?;

        Ok(existing)
    }

    /// Every subscription, ordered by ID
    pub async fn list(&self) -> HookResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "{} ORDER BY subscription_id",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }
}

#[async_trait]
impl SubscriptionSource for SqliteSubscriptionStore {
    async fn list_subscriptions(&self) -> HookResult<Vec<Subscription>> {
        self.list().await
    }
}

/// Subscription management: persist first, then announce on the control channel
#[derive(Clone)]
pub struct SubscriptionManager {
    subscriptions: SqliteSubscriptionStore,
    store: SharedStore,
}

impl SubscriptionManager {
    pub fn new(subscriptions: SqliteSubscriptionStore, store: SharedStore) -> Self {
        Self {
            subscriptions,
            store,
        }
    }

    pub fn subscriptions(&self) -> &SqliteSubscriptionStore {
        &self.subscriptions
    }

    pub async fn create(&self, new: NewSubscription) -> HookResult<Subscription> {
        let subscription = self.subscriptions.create(new).await?;
        info!(
            "Created subscription {} ({}) for owner {}",
            subscription.subscription_id, subscription.subscription_name, subscription.owner_id
        );
        publish_subscription_change(&self.store, ControlAction::Create, &subscription).await?;
        Ok(subscription)
    }

    pub async fn update(&self, subscription: &Subscription) -> HookResult<Subscription> {
        let updated = self.subscriptions.update(subscription).await?;
        info!("Updated subscription {}", updated.subscription_id);
        publish_subscription_change(&self.store, ControlAction::Update, &updated).await?;
        Ok(updated)
    }

    pub async fn delete(&self, subscription_id: i64) -> HookResult<Subscription> {
        let removed = self.subscriptions.delete(subscription_id).await?;
        info!("Deleted subscription {}", subscription_id);
        publish_subscription_change(&self.store, ControlAction::Delete, &removed).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{keys, ControlMessage};
    use crate::store::{CoordinationStore, MemoryStore};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup_store() -> SqliteSubscriptionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        SqliteSubscriptionStore::new(pool)
    }

    fn new_subscription(name: &str) -> NewSubscription {
        NewSubscription {
            subscription_name: name.to_string(),
            owner_id: "0".to_string(),
            subscription_form: "hostcreate,hostdelete".to_string(),
            callback_url: "http://127.0.0.1:8080/hook".to_string(),
            time_out: 10,
            confirm_mode: ConfirmMode::StatusCode,
            confirm_pattern: "200".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let store = setup_store().await;
        let first = store.create(new_subscription("first")).await.unwrap();
        let second = store.create(new_subscription("second")).await.unwrap();

        assert!(second.subscription_id > first.subscription_id);
        assert_eq!(store.get(first.subscription_id).await.unwrap(), first);

        let all = store.list_subscriptions().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].subscription_name, "first");
        assert_eq!(all[1].confirm_mode, ConfirmMode::StatusCode);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = setup_store().await;
        store.create(new_subscription("dup")).await.unwrap();
        let err = store.create(new_subscription("dup")).await.unwrap_err();
        assert!(matches!(err, HookError::Validation(_)));
    }

    #[tokio::test]
    async fn test_validation() {
        let store = setup_store().await;

        let mut bad_url = new_subscription("a");
        bad_url.callback_url = "ftp://example".to_string();
        assert!(matches!(store.create(bad_url).await, Err(HookError::Validation(_))));

        let mut empty_form = new_subscription("b");
        empty_form.subscription_form = " , ".to_string();
        assert!(matches!(store.create(empty_form).await, Err(HookError::Validation(_))));

        let mut bad_regex = new_subscription("c");
        bad_regex.confirm_mode = ConfirmMode::Regex;
        bad_regex.confirm_pattern = "(".to_string();
        assert!(matches!(
            store.create(bad_regex).await,
            Err(HookError::InvalidConfirmPattern { .. })
        ));

        let mut bad_code = new_subscription("d");
        bad_code.confirm_pattern = "ok".to_string();
        assert!(matches!(store.create(bad_code).await, Err(HookError::Validation(_))));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = setup_store().await;
        let mut sub = store.create(new_subscription("upd")).await.unwrap();

        sub.callback_url = "https://example.com/new".to_string();
        sub.confirm_mode = ConfirmMode::Regex;
        sub.confirm_pattern = "^OK$".to_string();
        let updated = store.update(&sub).await.unwrap();
        assert_eq!(updated.callback_url, "https://example.com/new");
        assert_eq!(updated.confirm_mode, ConfirmMode::Regex);
        assert!(updated.last_time >= sub.last_time);

        store.delete(sub.subscription_id).await.unwrap();
        assert!(matches!(
            store.get(sub.subscription_id).await,
            Err(HookError::NotFound(_))
        ));
        assert!(matches!(store.update(&sub).await, Err(HookError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_manager_publishes_changes() {
        let coordination = MemoryStore::new();
        let mut changes = coordination
            .subscribe(keys::SUBSCRIPTION_CHANNEL)
            .await
            .unwrap();
        let manager = SubscriptionManager::new(setup_store().await, Arc::new(coordination));

        let created = manager.create(new_subscription("pub")).await.unwrap();
        manager.delete(created.subscription_id).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();

        let first: ControlMessage = serde_json::from_str(&first).unwrap();
        let second: ControlMessage = serde_json::from_str(&second).unwrap();
        assert_eq!(first.action, ControlAction::Create);
        assert_eq!(first.subscription.subscription_id, created.subscription_id);
        assert_eq!(second.action, ControlAction::Delete);
    }
}
