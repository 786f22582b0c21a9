/// Sequential event consumer
///
/// Drains the global event queue in assigned-ID order, resolves the
/// subscriptions interested in each event through the interest index and
/// pushes one distribution item per subscription onto its private queue.

use crate::{
    config::DistributionConfig,
    distribution::{
        keys, DistInst, EventInst, PreviousState, SequenceGate, SequenceScope, StopSignal,
    },
    error::HookResult,
    metrics,
    store::SharedStore,
};
use tracing::{debug, error, info, warn};

/// Outcome of processing one popped event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Event was fanned out to this many subscriptions
    FannedOut(usize),
    /// Another worker holds the running marker for this ID
    Skipped,
    /// Stop signal fired while waiting on the previous event
    Cancelled,
}

/// Single worker draining the global event queue
pub struct SequentialConsumer {
    store: SharedStore,
    gate: SequenceGate,
    config: DistributionConfig,
    stop: StopSignal,
    holder: String,
}

impl SequentialConsumer {
    pub fn new(store: SharedStore, config: &DistributionConfig, stop: StopSignal) -> Self {
        Self {
            gate: SequenceGate::new(store.clone(), config),
            holder: format!("consumer:{}:{}", std::process::id(), uuid::Uuid::new_v4()),
            store,
            config: config.clone(),
            stop,
        }
    }

    /// Run until the stop signal fires
    pub async fn run(mut self) -> HookResult<()> {
        info!("Sequential event consumer started on {}", keys::EVENT_QUEUE);

        loop {
            if self.stop.is_stopped() {
                break;
            }

            let popped = match self
                .store
                .blocking_pop(keys::EVENT_QUEUE, self.config.poll_interval)
                .await
            {
                Ok(popped) => popped,
                Err(e) => {
                    error!("Failed to pop from {}: {}", keys::EVENT_QUEUE, e);
                    tokio::select! {
                        _ = self.stop.stopped() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
            };

            let Some(raw) = popped else {
                continue;
            };

            let event: EventInst = match serde_json::from_str(&raw) {
                Ok(event) => event,
                Err(e) => {
                    // The producer is the only retry surface
                    warn!("Dropping undecodable event: {}", e);
                    metrics::record_event_consumed("dropped");
                    continue;
                }
            };

            if let Err(e) = self.process(event, raw).await {
                error!("Event processing failed: {}", e);
            }
        }

        info!("Sequential event consumer stopped");
        Ok(())
    }

    /// Process one event to completion
    pub async fn process(&mut self, event: EventInst, raw: String) -> HookResult<ConsumeOutcome> {
        let scope = SequenceScope::Events;
        let seq = event.id;
        let ttl = self.config.event_wait_timeout + self.config.lock_ttl_slack;

        if !self.gate.try_lock(scope, seq, &self.holder, ttl).await? {
            debug!("Event {} already owned by another worker, skipping", seq);
            metrics::record_event_consumed("skipped");
            return Ok(ConsumeOutcome::Skipped);
        }

        match self
            .gate
            .wait_for_previous(
                scope,
                seq,
                self.config.event_grace_period,
                self.config.event_wait_timeout,
                &mut self.stop,
            )
            .await
        {
            Ok(PreviousState::Cancelled) => {
                warn!("Consumer stopped while event {} waited on its predecessor", seq);
                self.store.release(&scope.running_key(seq)).await?;
                return Ok(ConsumeOutcome::Cancelled);
            }
            Ok(state) => debug!("Event {} predecessor {:?}", seq, state),
            Err(e) => warn!("Could not check predecessor of event {}, proceeding: {}", seq, e),
        }

        let fanned_out = self.fan_out(&event, &raw).await;

        // Always finish, a partial fan-out must not stall the pipeline
        if let Err(e) = self.gate.finish(scope, seq).await {
            error!("Failed to mark event {} done: {}", seq, e);
        }

        metrics::record_event_consumed("fanned_out");
        Ok(ConsumeOutcome::FannedOut(fanned_out))
    }

    /// Push one distribution item per interested subscription
    async fn fan_out(&self, event: &EventInst, raw: &str) -> usize {
        let interest_key = event.interest_key();
        let members = match self
            .store
            .set_members(&keys::subscribers(&interest_key))
            .await
        {
            Ok(members) => members,
            Err(e) => {
                error!("Failed to resolve subscribers of {}: {}", interest_key, e);
                return 0;
            }
        };

        let mut subscription_ids: Vec<i64> = members
            .iter()
            .filter_map(|m| match m.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!("Ignoring malformed subscriber id '{}' under {}", m, interest_key);
                    None
                }
            })
            .collect();
        subscription_ids.sort_unstable();

        let mut pushed = 0;
        for subscription_id in subscription_ids {
            match self.push_distribution(event, raw, subscription_id).await {
                Ok(dstb_id) => {
                    pushed += 1;
                    metrics::record_distribution_created(subscription_id);
                    debug!(
                        "Event {} -> subscription {} as dstb {}",
                        event.id, subscription_id, dstb_id
                    );
                }
                Err(e) => error!(
                    "Failed to distribute event {} to subscription {}: {}",
                    event.id, subscription_id, e
                ),
            }
        }

        pushed
    }

    async fn push_distribution(
        &self,
        event: &EventInst,
        raw: &str,
        subscription_id: i64,
    ) -> HookResult<i64> {
        let dstb_id = self.store.incr(&keys::dist_id(subscription_id)).await?;
        let item = DistInst::new(event.clone(), raw.to_string(), subscription_id, dstb_id);
        let payload = serde_json::to_string(&item)?;
        self.store
            .push(&keys::dist_queue(subscription_id), &payload)
            .await?;
        Ok(dstb_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{EventChange, EventProducer};
    use crate::store::{CoordinationStore, MemoryStore};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> DistributionConfig {
        DistributionConfig {
            poll_interval: Duration::from_millis(20),
            event_grace_period: Duration::from_millis(10),
            event_wait_timeout: Duration::from_millis(200),
            wait_poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn drain(store: &MemoryStore, subscription_id: i64) -> Vec<DistInst> {
        let mut items = Vec::new();
        while let Some(raw) = store
            .blocking_pop(&keys::dist_queue(subscription_id), Duration::from_millis(1))
            .await
            .unwrap()
        {
            items.push(serde_json::from_str(&raw).unwrap());
        }
        items
    }

    #[tokio::test]
    async fn test_fans_out_to_matching_subscriptions_only() {
        let store = MemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        store
            .set_add("subscribers:0:hostcreate", &["1".to_string(), "2".to_string()])
            .await
            .unwrap();
        store
            .set_add("subscribers:0:hostdelete", &["2".to_string()])
            .await
            .unwrap();

        let producer = EventProducer::new(shared.clone());
        for event_type in ["hostcreate", "hostdelete", "hostupdate", "hostcreate"] {
            producer
                .enqueue(EventChange::new("0", event_type, "host", "x"))
                .await
                .unwrap();
        }

        let (_tx, stop) = StopSignal::channel();
        let mut consumer = SequentialConsumer::new(shared, &test_config(), stop);
        for _ in 0..4 {
            let raw = store
                .blocking_pop(keys::EVENT_QUEUE, Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            let event: EventInst = serde_json::from_str(&raw).unwrap();
            consumer.process(event, raw).await.unwrap();
        }

        let first = drain(&store, 1).await;
        let second = drain(&store, 2).await;
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 3);
        assert_eq!(first.iter().map(|d| d.dstb_id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second.iter().map(|d| d.event.id).collect::<Vec<_>>(), vec![1, 2, 4]);

        // Raw is the payload exactly as enqueued
        let original: EventInst = serde_json::from_str(&second[1].raw).unwrap();
        assert_eq!(original, second[1].event);
        assert!(store.hash_get("event:done", "4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_held_event_is_skipped() {
        let store = MemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        store.set_add("subscribers:0:hostcreate", &["1".to_string()]).await.unwrap();
        EventProducer::new(shared.clone())
            .enqueue(EventChange::new("0", "hostcreate", "host", "create"))
            .await
            .unwrap();

        assert!(store
            .acquire("event:running:1", "someone-else", Duration::from_secs(30))
            .await
            .unwrap());

        let (_tx, stop) = StopSignal::channel();
        let mut consumer = SequentialConsumer::new(shared, &test_config(), stop);
        let raw = store
            .blocking_pop(keys::EVENT_QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let event: EventInst = serde_json::from_str(&raw).unwrap();

        assert_eq!(consumer.process(event, raw).await.unwrap(), ConsumeOutcome::Skipped);
        assert_eq!(store.queue_len(&keys::dist_queue(1)).await.unwrap(), 0);
        assert!(store.hash_get("event:done", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dstb_ids_unique_under_concurrent_fan_out() {
        let store = MemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        store.set_add("subscribers:0:hostcreate", &["5".to_string()]).await.unwrap();

        let producer = EventProducer::new(shared.clone());
        for _ in 0..40 {
            producer
                .enqueue(EventChange::new("0", "hostcreate", "host", "create"))
                .await
                .unwrap();
        }

        // Several consumers racing on the same queue
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let (tx, stop) = StopSignal::channel();
            let consumer = SequentialConsumer::new(shared.clone(), &test_config(), stop);
            let task = tokio::spawn(consumer.run());
            tasks.push((tx, task));
        }

        for _ in 0..300 {
            if store.hash_get("event:done", "40").await.unwrap().is_some()
                && store.queue_len(keys::EVENT_QUEUE).await.unwrap() == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for (tx, task) in tasks {
            tx.send(true).unwrap();
            task.await.unwrap().unwrap();
        }

        let items = drain(&store, 5).await;
        assert_eq!(items.len(), 40);
        let ids: HashSet<i64> = items.iter().map(|d| d.dstb_id).collect();
        assert_eq!(ids, (1..=40).collect::<HashSet<i64>>());
        let events: HashSet<i64> = items.iter().map(|d| d.event.id).collect();
        assert_eq!(events.len(), 40);
    }

    #[tokio::test]
    async fn test_run_drops_undecodable_events() {
        let store = MemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        store.push(keys::EVENT_QUEUE, "not json").await.unwrap();

        let (tx, stop) = StopSignal::channel();
        let task = tokio::spawn(SequentialConsumer::new(shared, &test_config(), stop).run());

        for _ in 0..100 {
            if store.queue_len(keys::EVENT_QUEUE).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(store.queue_len(keys::EVENT_QUEUE).await.unwrap(), 0);
    }
}
