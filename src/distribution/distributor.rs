/// Per-subscription distributor
///
/// One worker per live subscription. It drains the subscription's private
/// queue in `dstb_id` order and hands each item to the delivery client.
/// Configuration can be swapped through the renewal channel without
/// restarting the worker; only the latest configuration is kept. The stop
/// signal is raced against every pop and every wait on a predecessor, and
/// an item popped but not processed is put back at the head of the queue.

use crate::{
    config::DistributionConfig,
    distribution::{
        keys, DeliveryClient, DistInst, PreviousState, SequenceGate, SequenceScope, StopSignal,
        Subscription,
    },
    error::{HookError, HookResult},
    store::SharedStore,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Supervisor-side handle to a running distributor
#[derive(Debug)]
pub struct DistributorHandle {
    pub subscription_id: i64,
    pub generation: u64,
    stop_tx: watch::Sender<bool>,
    renew_tx: watch::Sender<Subscription>,
}

impl DistributorHandle {
    /// Ask the worker to exit at its next pop cycle or wait step
    pub fn stop(&self) {
        // Err only means the worker is already gone
        let _ = self.stop_tx.send(true);
    }

    /// Replace the running worker's configuration. Never waits on the
    /// worker; a newer configuration overwrites one not yet picked up.
    pub fn renew(&self, subscription: Subscription) -> HookResult<()> {
        self.renew_tx.send(subscription).map_err(|_| {
            HookError::Internal(format!(
                "distributor for subscription {} is no longer running",
                self.subscription_id
            ))
        })
    }
}

/// Worker draining one subscription's queue
pub struct Distributor {
    subscription: Subscription,
    store: SharedStore,
    gate: SequenceGate,
    delivery: DeliveryClient,
    config: DistributionConfig,
    stop: StopSignal,
    renew_rx: watch::Receiver<Subscription>,
    holder: String,
}

impl Distributor {
    /// Build a worker and the handle that controls it
    pub fn new(
        subscription: Subscription,
        store: SharedStore,
        delivery: DeliveryClient,
        config: &DistributionConfig,
        generation: u64,
    ) -> (Self, DistributorHandle) {
        let (stop_tx, stop) = StopSignal::channel();
        let (renew_tx, renew_rx) = watch::channel(subscription.clone());
        let subscription_id = subscription.subscription_id;

        let worker = Self {
            gate: SequenceGate::new(store.clone(), config),
            holder: format!(
                "distributor:{}:{}:{}",
                std::process::id(),
                subscription_id,
                generation
            ),
            subscription,
            store,
            delivery,
            config: config.clone(),
            stop,
            renew_rx,
        };
        let handle = DistributorHandle {
            subscription_id,
            generation,
            stop_tx,
            renew_tx,
        };

        (worker, handle)
    }

    fn subscription_id(&self) -> i64 {
        self.subscription.subscription_id
    }

    /// Adopt the latest configuration if it changed since the last check
    fn apply_renewals(&mut self) {
        if !self.renew_rx.has_changed().unwrap_or(false) {
            return;
        }

        let renewed = self.renew_rx.borrow_and_update().clone();
        if renewed.subscription_id != self.subscription_id() {
            warn!(
                "Ignoring renewal for subscription {} sent to distributor {}",
                renewed.subscription_id,
                self.subscription_id()
            );
            return;
        }
        info!(
            "Subscription {} renewed (callback {})",
            renewed.subscription_id, renewed.callback_url
        );
        self.subscription = renewed;
    }

    /// Put an unprocessed item back at the head of the queue
    async fn requeue(&self, queue: &str, raw: &str) {
        if let Err(e) = self.store.push_front(queue, raw).await {
            error!("Failed to requeue item on {}: {}", queue, e);
        }
    }

    /// Run until the stop signal fires
    pub async fn run(mut self) -> HookResult<()> {
        let queue = keys::dist_queue(self.subscription_id());
        info!(
            "Distributor for subscription {} started on {}",
            self.subscription_id(),
            queue
        );

        loop {
            if self.stop.is_stopped() {
                break;
            }
            self.apply_renewals();

            let popped = tokio::select! {
                biased;
                _ = self.stop.stopped() => break,
                popped = self.store.blocking_pop(&queue, self.config.poll_interval) => popped,
            };

            let popped = match popped {
                Ok(popped) => popped,
                Err(e) => {
                    error!("Failed to pop from {}: {}", queue, e);
                    tokio::select! {
                        _ = self.stop.stopped() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
            };

            let Some(raw) = popped else {
                continue;
            };

            if self.stop.is_stopped() {
                self.requeue(&queue, &raw).await;
                break;
            }

            // A renewal may have arrived while blocked on the pop
            self.apply_renewals();

            let item: DistInst = match serde_json::from_str(&raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!("Dropping undecodable item from {}: {}", queue, e);
                    continue;
                }
            };

            self.process(&queue, item, &raw).await;
        }

        info!("Distributor for subscription {} stopped", self.subscription_id());
        Ok(())
    }

    async fn process(&mut self, queue: &str, item: DistInst, raw: &str) {
        let scope = SequenceScope::Distribution(self.subscription_id());
        let seq = item.dstb_id;
        let wait_timeout = self
            .subscription
            .timeout_or(self.config.default_delivery_timeout);
        // Covers the wait on the predecessor plus our own delivery
        let ttl = wait_timeout.saturating_mul(2) + self.config.lock_ttl_slack;

        match self.gate.try_lock(scope, seq, &self.holder, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("{} seq {} already running elsewhere, skipping", scope.label(), seq);
                return;
            }
            Err(e) => {
                error!("Failed to lock {} seq {}: {}", scope.label(), seq, e);
                return;
            }
        }

        match self
            .gate
            .wait_for_previous(
                scope,
                seq,
                self.config.distribution_grace_period,
                wait_timeout,
                &mut self.stop,
            )
            .await
        {
            Ok(PreviousState::Cancelled) => {
                warn!(
                    "{} stopped while seq {} waited on its predecessor, requeueing it",
                    scope.label(),
                    seq
                );
                if let Err(e) = self.store.release(&scope.running_key(seq)).await {
                    error!("Failed to release {} seq {}: {}", scope.label(), seq, e);
                }
                self.requeue(queue, raw).await;
                return;
            }
            Ok(state) => debug!("{} seq {} predecessor {:?}", scope.label(), seq, state),
            Err(e) => warn!(
                "Could not check predecessor of {} seq {}, proceeding: {}",
                scope.label(),
                seq,
                e
            ),
        }

        // Failed deliveries are still marked done
        match self.delivery.deliver(&self.subscription, &item.raw).await {
            Ok(()) => debug!("{} seq {} delivered", scope.label(), seq),
            Err(e) => warn!("{} seq {} not delivered: {}", scope.label(), seq, e),
        }

        if let Err(e) = self.gate.finish(scope, seq).await {
            error!("Failed to mark {} seq {} done: {}", scope.label(), seq, e);
        }
    }
}
