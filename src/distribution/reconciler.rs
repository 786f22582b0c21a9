/// Subscription reconciler and control-channel listener
///
/// The reconciler brings the interest index (`subscribers:{owner}:{type}`
/// sets) into exact agreement with the persisted subscription list. The
/// listener then keeps it in agreement incrementally from control messages
/// and forwards each change to the supervisor.

use crate::{
    db::SubscriptionSource,
    distribution::{
        keys, ControlAction, ControlMessage, SequenceScope, StopSignal, Subscription, Supervisor,
    },
    error::HookResult,
    store::SharedStore,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Interest key (`owner:eventType`) to subscription IDs
pub type InterestIndex = HashMap<String, HashSet<String>>;

/// Mutations applied by one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Subscription IDs added to interest sets
    pub added: usize,
    /// Stale subscription IDs removed from interest sets
    pub removed: usize,
    /// Interest sets deleted because no subscription wants them
    pub deleted_keys: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.deleted_keys == 0
    }
}

/// Cached and persisted views of the interest index
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    pub cached: InterestIndex,
    pub persisted: InterestIndex,
    pub subscriptions: Vec<Subscription>,
}

/// Expand subscriptions into the interest index they imply
pub fn persisted_index(subscriptions: &[Subscription]) -> InterestIndex {
    let mut index = InterestIndex::new();
    for subscription in subscriptions {
        let id = subscription.subscription_id.to_string();
        for key in subscription.event_keys() {
            index.entry(key).or_default().insert(id.clone());
        }
    }
    index
}

pub struct Reconciler {
    store: SharedStore,
    source: Arc<dyn SubscriptionSource>,
}

impl Reconciler {
    pub fn new(store: SharedStore, source: Arc<dyn SubscriptionSource>) -> Self {
        Self { store, source }
    }

    /// Read the interest index as stored and as implied by the persisted list
    pub async fn load(&self) -> HookResult<IndexSnapshot> {
        let mut cached = InterestIndex::new();
        for full_key in self.store.keys(&keys::subscribers_pattern()).await? {
            let Some(interest_key) = full_key.strip_prefix(keys::SUBSCRIBERS_PREFIX) else {
                continue;
            };
            let members = self.store.set_members(&full_key).await?;
            cached.insert(interest_key.to_string(), members);
        }

        let subscriptions = self.source.list_subscriptions().await?;
        let persisted = persisted_index(&subscriptions);

        Ok(IndexSnapshot {
            cached,
            persisted,
            subscriptions,
        })
    }

    /// Diff and apply; returns the mutations made and the persisted subscriptions
    pub async fn reconcile(&self) -> HookResult<(ReconcileReport, Vec<Subscription>)> {
        let snapshot = self.load().await?;
        let mut report = ReconcileReport::default();
        let empty = HashSet::new();

        for (interest_key, wanted) in &snapshot.persisted {
            let have = snapshot.cached.get(interest_key).unwrap_or(&empty);
            let set_key = keys::subscribers(interest_key);

            let stale: Vec<String> = have.difference(wanted).cloned().collect();
            if !stale.is_empty() {
                self.store.set_remove(&set_key, &stale).await?;
                report.removed += stale.len();
            }

            let missing: Vec<String> = wanted.difference(have).cloned().collect();
            if !missing.is_empty() {
                self.store.set_add(&set_key, &missing).await?;
                report.added += missing.len();
            }
        }

        for interest_key in snapshot.cached.keys() {
            if !snapshot.persisted.contains_key(interest_key) {
                self.store.delete(&keys::subscribers(interest_key)).await?;
                report.deleted_keys += 1;
            }
        }

        info!(
            "Reconciled interest index for {} subscriptions: +{} -{} keys deleted {}",
            snapshot.subscriptions.len(),
            report.added,
            report.removed,
            report.deleted_keys
        );

        Ok((report, snapshot.subscriptions))
    }
}

/// Announce a subscription change on the control channel
pub async fn publish_subscription_change(
    store: &SharedStore,
    action: ControlAction,
    subscription: &Subscription,
) -> HookResult<()> {
    let message = ControlMessage {
        action,
        subscription: subscription.clone(),
    };
    let payload = serde_json::to_string(&message)?;
    store.publish(keys::SUBSCRIPTION_CHANNEL, &payload).await?;
    debug!(
        "Published {} for subscription {}",
        action.as_str(),
        subscription.subscription_id
    );
    Ok(())
}

/// Applies control messages to the interest index and the supervisor
pub struct ControlListener {
    store: SharedStore,
    supervisor: Arc<Supervisor>,
}

impl ControlListener {
    pub fn new(store: SharedStore, supervisor: Arc<Supervisor>) -> Self {
        Self { store, supervisor }
    }

    /// Consume messages until the stop signal fires or the channel closes
    pub async fn run(self, mut messages: mpsc::Receiver<String>, mut stop: StopSignal) {
        info!("Control listener started on {}", keys::SUBSCRIPTION_CHANNEL);

        loop {
            let payload = tokio::select! {
                _ = stop.stopped() => break,
                payload = messages.recv() => payload,
            };

            let Some(payload) = payload else {
                warn!("Control channel closed, listener exiting");
                break;
            };

            let message: ControlMessage = match serde_json::from_str(&payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Ignoring undecodable control message: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.apply(message).await {
                error!("Failed to apply control message: {}", e);
            }
        }

        info!("Control listener stopped");
    }

    /// Apply one control message
    pub async fn apply(&self, message: ControlMessage) -> HookResult<()> {
        let subscription = message.subscription;
        let id = subscription.subscription_id;
        info!("Control message: {} subscription {}", message.action.as_str(), id);

        match message.action {
            ControlAction::Create => {
                self.index_add(&subscription).await?;
                self.supervisor.spawn(subscription).await;
            }
            ControlAction::Update => {
                self.index_replace(&subscription).await?;
                self.supervisor.renew(subscription).await;
            }
            ControlAction::Delete => {
                // Unroute first so nothing new lands in the queue being torn down
                self.index_remove_everywhere(id).await?;
                match self.supervisor.retire(id).await {
                    Some(exited) => {
                        let store = self.store.clone();
                        tokio::spawn(async move {
                            // An in-flight delivery still writes its done marker
                            let _ = exited.await;
                            if let Err(e) = purge_subscription_keys(&store, id).await {
                                warn!("Failed to clean up subscription {}: {}", id, e);
                            }
                        });
                    }
                    None => purge_subscription_keys(&self.store, id).await?,
                }
            }
        }

        Ok(())
    }

    async fn index_add(&self, subscription: &Subscription) -> HookResult<()> {
        let member = [subscription.subscription_id.to_string()];
        for interest_key in subscription.event_keys() {
            self.store
                .set_add(&keys::subscribers(&interest_key), &member)
                .await?;
        }
        Ok(())
    }

    async fn index_replace(&self, subscription: &Subscription) -> HookResult<()> {
        let member = [subscription.subscription_id.to_string()];
        let wanted: HashSet<String> = subscription
            .event_keys()
            .into_iter()
            .map(|k| keys::subscribers(&k))
            .collect();

        for set_key in self.store.keys(&keys::subscribers_pattern()).await? {
            if !wanted.contains(&set_key) {
                self.store.set_remove(&set_key, &member).await?;
            }
        }

        self.index_add(subscription).await
    }

    async fn index_remove_everywhere(&self, subscription_id: i64) -> HookResult<()> {
        let member = [subscription_id.to_string()];
        for set_key in self.store.keys(&keys::subscribers_pattern()).await? {
            self.store.set_remove(&set_key, &member).await?;
        }
        Ok(())
    }
}

/// Drop a deleted subscription's queue, ID counter and done markers
pub async fn purge_subscription_keys(store: &SharedStore, subscription_id: i64) -> HookResult<()> {
    store.delete(&keys::dist_queue(subscription_id)).await?;
    store.delete(&keys::dist_id(subscription_id)).await?;
    store
        .delete(&SequenceScope::Distribution(subscription_id).done_key())
        .await?;
    debug!("Removed distribution keys of subscription {}", subscription_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistributionConfig;
    use crate::distribution::{ConfirmMode, DeliveryClient};
    use crate::store::{CoordinationStore, MemoryStore};
    use std::time::Duration;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Mutex;

    struct FixedSource(Mutex<Vec<Subscription>>);

    #[async_trait]
    impl SubscriptionSource for FixedSource {
        async fn list_subscriptions(&self) -> HookResult<Vec<Subscription>> {
            Ok(self.0.lock().await.clone())
        }
    }

    fn subscription(id: i64, owner: &str, form: &str) -> Subscription {
        Subscription {
            subscription_id: id,
            subscription_name: format!("sub-{}", id),
            owner_id: owner.to_string(),
            subscription_form: form.to_string(),
            callback_url: "http://127.0.0.1:1/hook".to_string(),
            time_out: 0,
            confirm_mode: ConfirmMode::StatusCode,
            confirm_pattern: "200".to_string(),
            last_time: Utc::now(),
        }
    }

    fn members(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_persisted_index_expands_forms() {
        let index = persisted_index(&[
            subscription(1, "0", "hostcreate, hostdelete"),
            subscription(2, "0", "hostcreate"),
            subscription(3, "7", "hostcreate"),
        ]);

        assert_eq!(index["0:hostcreate"], members(&["1", "2"]));
        assert_eq!(index["0:hostdelete"], members(&["1"]));
        assert_eq!(index["7:hostcreate"], members(&["3"]));
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_repairs_index_and_is_idempotent() {
        let store = MemoryStore::new();
        // Drift: stale member, missing member and an orphaned key
        store
            .set_add("subscribers:0:hostcreate", &["1".to_string(), "99".to_string()])
            .await
            .unwrap();
        store
            .set_add("subscribers:0:orphan", &["5".to_string()])
            .await
            .unwrap();

        let source = Arc::new(FixedSource(Mutex::new(vec![
            subscription(1, "0", "hostcreate"),
            subscription(2, "0", "hostcreate,hostupdate"),
        ])));
        let reconciler = Reconciler::new(Arc::new(store.clone()), source);

        let (report, subscriptions) = reconciler.reconcile().await.unwrap();
        assert_eq!(subscriptions.len(), 2);
        assert_eq!(report.added, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.deleted_keys, 1);

        assert_eq!(
            store.set_members("subscribers:0:hostcreate").await.unwrap(),
            members(&["1", "2"])
        );
        assert_eq!(
            store.set_members("subscribers:0:hostupdate").await.unwrap(),
            members(&["2"])
        );
        assert!(!store.exists("subscribers:0:orphan").await.unwrap());

        let (second, _) = reconciler.reconcile().await.unwrap();
        assert!(second.is_noop());
    }

    #[tokio::test]
    async fn test_reconcile_empty_source_clears_index() {
        let store = MemoryStore::new();
        store
            .set_add("subscribers:0:hostcreate", &["1".to_string()])
            .await
            .unwrap();
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(FixedSource(Mutex::new(Vec::new()))),
        );

        let (report, _) = reconciler.reconcile().await.unwrap();
        assert_eq!(report.deleted_keys, 1);
        assert!(store.keys("subscribers:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unroutes_stops_and_cleans_up() {
        let store = MemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        let delivery = DeliveryClient::new(Duration::from_secs(1)).unwrap();
        let config = DistributionConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (supervisor, _exits) = Supervisor::new(shared.clone(), delivery, &config);
        let listener = ControlListener::new(shared, supervisor.clone());

        let sub = subscription(6, "0", "hostcreate,hostdelete");
        listener
            .apply(ControlMessage {
                action: ControlAction::Create,
                subscription: sub.clone(),
            })
            .await
            .unwrap();
        assert!(supervisor.generation(6).await.is_some());
        assert_eq!(store.keys("subscribers:*").await.unwrap().len(), 2);

        store.incr("dist:id:6").await.unwrap();
        store.hash_set("dist:done:6", "1", "now").await.unwrap();

        listener
            .apply(ControlMessage {
                action: ControlAction::Delete,
                subscription: sub,
            })
            .await
            .unwrap();
        assert!(supervisor.generation(6).await.is_none());
        assert!(store.keys("subscribers:*").await.unwrap().is_empty());

        for _ in 0..100 {
            if !store.exists("dist:id:6").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!store.exists("dist:id:6").await.unwrap());
        assert!(!store.exists("dist:done:6").await.unwrap());
        assert!(!store.exists("dist:queue:6").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_subscription_change() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe(keys::SUBSCRIPTION_CHANNEL).await.unwrap();
        let shared: SharedStore = Arc::new(store);

        publish_subscription_change(&shared, ControlAction::Update, &subscription(4, "0", "a"))
            .await
            .unwrap();

        let raw = rx.recv().await.unwrap();
        let message: ControlMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(message.action, ControlAction::Update);
        assert_eq!(message.subscription.subscription_id, 4);
    }
}
