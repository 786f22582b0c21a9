/// Worker supervision
///
/// The supervisor owns the stop and renewal handles of every distributor,
/// spawns workers as tokio tasks and watches their join handles. A worker
/// that panics or fails is reported on the exit channel and restarted
/// after `restart_delay`, provided it is still registered and the exit
/// belongs to its current generation.
///
/// `Engine` wires the supervisor together with the reconciler, the control
/// listener and the sequential consumer.

use crate::{
    config::DistributionConfig,
    db::SubscriptionSource,
    distribution::{
        keys, ControlListener, DeliveryClient, Distributor, DistributorHandle, ReconcileReport,
        Reconciler, SequentialConsumer, StopSignal, Subscription,
    },
    error::{HookError, HookResult},
    metrics,
    store::SharedStore,
};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which worker a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Consumer,
    Distributor(i64),
}

impl WorkerKind {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerKind::Consumer => "consumer",
            WorkerKind::Distributor(_) => "distributor",
        }
    }
}

/// How a worker task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Returned normally after its stop signal fired
    Stopped,
    /// Returned an error
    Failed(String),
    /// Panicked; carries the panic message
    Panicked(String),
    /// Task was aborted by the runtime
    Aborted,
}

impl ExitOutcome {
    pub fn needs_restart(&self) -> bool {
        !matches!(self, ExitOutcome::Stopped)
    }
}

/// Report sent on the exit channel when a worker task ends
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub kind: WorkerKind,
    pub generation: u64,
    pub outcome: ExitOutcome,
}

impl WorkerExit {
    /// The exit as an error, `None` for a clean stop
    pub fn error(&self) -> Option<HookError> {
        match &self.outcome {
            ExitOutcome::Stopped => None,
            ExitOutcome::Failed(msg) => Some(HookError::Internal(msg.clone())),
            ExitOutcome::Panicked(msg) => Some(HookError::WorkerPanicked(msg.clone())),
            ExitOutcome::Aborted => Some(HookError::Internal("worker aborted".to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Spawn `worker` and report how it ended on `exits`
///
/// Panics are caught at the task boundary, so they never take down the
/// process or the watcher.
pub fn spawn_supervised<F>(
    kind: WorkerKind,
    generation: u64,
    worker: F,
    exits: mpsc::UnboundedSender<WorkerExit>,
) -> JoinHandle<()>
where
    F: Future<Output = HookResult<()>> + Send + 'static,
{
    let task = tokio::spawn(worker);

    tokio::spawn(async move {
        let outcome = match task.await {
            Ok(Ok(())) => ExitOutcome::Stopped,
            Ok(Err(e)) => ExitOutcome::Failed(e.to_string()),
            Err(e) if e.is_panic() => ExitOutcome::Panicked(panic_message(e.into_panic())),
            Err(_) => ExitOutcome::Aborted,
        };

        if outcome.needs_restart() {
            error!(
                "{} worker (generation {}) exited: {:?}",
                kind.label(),
                generation,
                outcome
            );
        }

        // Err only means the supervisor is gone
        let _ = exits.send(WorkerExit {
            kind,
            generation,
            outcome,
        });
    })
}

struct DistributorEntry {
    handle: DistributorHandle,
    subscription: Subscription,
    /// Resolves once the worker has exited and its exit was reported
    exited: JoinHandle<()>,
}

struct ConsumerSlot {
    generation: u64,
    stop: StopSignal,
}

/// Process-wide lifecycle bookkeeping for workers
pub struct Supervisor {
    store: SharedStore,
    delivery: DeliveryClient,
    config: DistributionConfig,
    distributors: Mutex<HashMap<i64, DistributorEntry>>,
    consumer: Mutex<Option<ConsumerSlot>>,
    generations: AtomicU64,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
}

impl Supervisor {
    /// Create a supervisor and the receiving end of its exit channel
    pub fn new(
        store: SharedStore,
        delivery: DeliveryClient,
        config: &DistributionConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WorkerExit>) {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            store,
            delivery,
            config: config.clone(),
            distributors: Mutex::new(HashMap::new()),
            consumer: Mutex::new(None),
            generations: AtomicU64::new(1),
            exits_tx,
        });
        (supervisor, exits_rx)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn launch(&self, subscription: Subscription) -> DistributorEntry {
        let generation = self.next_generation();
        let id = subscription.subscription_id;
        let (worker, handle) = Distributor::new(
            subscription.clone(),
            self.store.clone(),
            self.delivery.clone(),
            &self.config,
            generation,
        );
        let exited = spawn_supervised(
            WorkerKind::Distributor(id),
            generation,
            worker.run(),
            self.exits_tx.clone(),
        );
        debug!("Launched distributor {} generation {}", id, generation);

        DistributorEntry {
            handle,
            subscription,
            exited,
        }
    }

    /// Hot-swap a live worker's configuration or launch a new one
    async fn ensure(&self, subscription: Subscription) -> u64 {
        let id = subscription.subscription_id;
        let mut distributors = self.distributors.lock().await;

        if let Some(entry) = distributors.get_mut(&id) {
            match entry.handle.renew(subscription.clone()) {
                Ok(()) => {
                    entry.subscription = subscription;
                    return entry.handle.generation;
                }
                Err(e) => warn!("Relaunching distributor {}: {}", id, e),
            }
        }

        let entry = self.launch(subscription);
        let generation = entry.handle.generation;
        if let Some(old) = distributors.insert(id, entry) {
            old.handle.stop();
        }
        metrics::ACTIVE_DISTRIBUTORS.set(distributors.len() as i64);
        generation
    }

    /// Start a distributor for a new subscription. A subscription that
    /// already has a live worker is renewed instead.
    pub async fn spawn(&self, subscription: Subscription) -> u64 {
        info!("Starting distributor for subscription {}", subscription.subscription_id);
        self.ensure(subscription).await
    }

    /// Push a new configuration into a running distributor without
    /// restarting it; launches one when none is running.
    pub async fn renew(&self, subscription: Subscription) -> u64 {
        info!("Renewing distributor for subscription {}", subscription.subscription_id);
        self.ensure(subscription).await
    }

    /// Signal a distributor to stop and forget it. Returns whether it was registered.
    pub async fn stop(&self, subscription_id: i64) -> bool {
        self.retire(subscription_id).await.is_some()
    }

    /// Like `stop`, but hands back a handle that resolves once the worker
    /// has actually exited
    pub async fn retire(&self, subscription_id: i64) -> Option<JoinHandle<()>> {
        let removed = {
            let mut distributors = self.distributors.lock().await;
            let removed = distributors.remove(&subscription_id);
            metrics::ACTIVE_DISTRIBUTORS.set(distributors.len() as i64);
            removed
        };

        removed.map(|entry| {
            entry.handle.stop();
            info!("Stopped distributor for subscription {}", subscription_id);
            entry.exited
        })
    }

    /// Stop every distributor
    pub async fn stop_all(&self) {
        let mut distributors = self.distributors.lock().await;
        for (_, entry) in distributors.drain() {
            entry.handle.stop();
        }
        metrics::ACTIVE_DISTRIBUTORS.set(0);
        *self.consumer.lock().await = None;
        info!("All distributors signalled to stop");
    }

    /// Current generation of a registered distributor
    pub async fn generation(&self, subscription_id: i64) -> Option<u64> {
        self.distributors
            .lock()
            .await
            .get(&subscription_id)
            .map(|entry| entry.handle.generation)
    }

    /// Configuration a registered distributor is running with
    pub async fn subscription(&self, subscription_id: i64) -> Option<Subscription> {
        self.distributors
            .lock()
            .await
            .get(&subscription_id)
            .map(|entry| entry.subscription.clone())
    }

    /// IDs of every registered distributor, sorted
    pub async fn subscription_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.distributors.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Launch the sequential consumer under supervision
    pub async fn start_consumer(&self, stop: StopSignal) -> u64 {
        let generation = self.next_generation();
        let consumer = SequentialConsumer::new(self.store.clone(), &self.config, stop.clone());
        spawn_supervised(
            WorkerKind::Consumer,
            generation,
            consumer.run(),
            self.exits_tx.clone(),
        );
        *self.consumer.lock().await = Some(ConsumerSlot { generation, stop });
        info!("Sequential consumer started (generation {})", generation);
        generation
    }

    /// React to a worker exit, scheduling a restart when it is still wanted
    pub async fn handle_exit(self: &Arc<Self>, exit: WorkerExit) {
        match exit.kind {
            WorkerKind::Distributor(id) => {
                if self.generation(id).await != Some(exit.generation) {
                    debug!(
                        "Ignoring exit of stale distributor {} generation {}",
                        id, exit.generation
                    );
                    return;
                }

                if !exit.outcome.needs_restart() {
                    // Exited on its own while still registered
                    let mut distributors = self.distributors.lock().await;
                    if distributors
                        .get(&id)
                        .is_some_and(|e| e.handle.generation == exit.generation)
                    {
                        distributors.remove(&id);
                        metrics::ACTIVE_DISTRIBUTORS.set(distributors.len() as i64);
                    }
                    return;
                }

                let supervisor = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(supervisor.config.restart_delay).await;
                    supervisor.restart_distributor(id, exit.generation).await;
                });
            }
            WorkerKind::Consumer => {
                if !exit.outcome.needs_restart() {
                    return;
                }
                let supervisor = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(supervisor.config.restart_delay).await;
                    supervisor.restart_consumer(exit.generation).await;
                });
            }
        }
    }

    async fn restart_distributor(&self, id: i64, failed_generation: u64) {
        let mut distributors = self.distributors.lock().await;
        let subscription = match distributors.get(&id) {
            Some(entry) if entry.handle.generation == failed_generation => {
                entry.subscription.clone()
            }
            _ => {
                debug!("Distributor {} replaced or removed before restart", id);
                return;
            }
        };

        let entry = self.launch(subscription);
        warn!(
            "Restarted distributor {} (generation {} -> {})",
            id, failed_generation, entry.handle.generation
        );
        distributors.insert(id, entry);
        metrics::record_worker_restart(WorkerKind::Distributor(id).label());
    }

    async fn restart_consumer(&self, failed_generation: u64) {
        let stop = {
            let slot = self.consumer.lock().await;
            match slot.as_ref() {
                Some(slot) if slot.generation == failed_generation => slot.stop.clone(),
                _ => return,
            }
        };

        if stop.is_stopped() {
            return;
        }

        let generation = self.start_consumer(stop).await;
        warn!(
            "Restarted sequential consumer (generation {} -> {})",
            failed_generation, generation
        );
        metrics::record_worker_restart(WorkerKind::Consumer.label());
    }

    /// Drain the exit channel until `stop` fires
    pub async fn watch_exits(
        self: Arc<Self>,
        mut exits: mpsc::UnboundedReceiver<WorkerExit>,
        mut stop: StopSignal,
    ) {
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                exit = exits.recv() => match exit {
                    Some(exit) => self.handle_exit(exit).await,
                    None => break,
                },
            }
        }
        debug!("Exit watcher stopped");
    }
}

/// A running distribution engine
pub struct Engine {
    supervisor: Arc<Supervisor>,
    report: ReconcileReport,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Reconcile, bootstrap one distributor per subscription, then start the
    /// control listener, the consumer and the exit watcher
    pub async fn start(
        store: SharedStore,
        source: Arc<dyn SubscriptionSource>,
        delivery: DeliveryClient,
        config: &DistributionConfig,
    ) -> HookResult<Self> {
        // Subscribe before reconciling so no change published in between is lost
        let control = store.subscribe(keys::SUBSCRIPTION_CHANNEL).await?;

        let reconciler = Reconciler::new(store.clone(), source);
        let (report, subscriptions) = reconciler.reconcile().await?;

        let (supervisor, exits) = Supervisor::new(store.clone(), delivery, config);
        for subscription in subscriptions {
            supervisor.spawn(subscription).await;
        }

        let (stop_tx, stop) = StopSignal::channel();
        let listener = ControlListener::new(store, supervisor.clone());
        let tasks = vec![
            tokio::spawn(listener.run(control, stop.clone())),
            tokio::spawn(supervisor.clone().watch_exits(exits, stop.clone())),
        ];
        supervisor.start_consumer(stop).await;

        info!(
            "Distribution engine started with {} distributors",
            supervisor.subscription_ids().await.len()
        );

        Ok(Self {
            supervisor,
            report,
            stop_tx,
            tasks,
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Mutations applied by the startup reconcile
    pub fn reconcile_report(&self) -> &ReconcileReport {
        &self.report
    }

    /// Signal every worker to stop and wait for the engine's own tasks
    pub async fn shutdown(self) {
        info!("Shutting down distribution engine");
        let _ = self.stop_tx.send(true);
        self.supervisor.stop_all().await;

        for task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Engine task did not stop within 5s");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{ConfirmMode, DistInst, EventInst};
    use crate::store::{CoordinationStore, MemoryStore};
    use chrono::Utc;

    fn test_config() -> DistributionConfig {
        DistributionConfig {
            poll_interval: Duration::from_millis(20),
            restart_delay: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn subscription(id: i64, url: &str) -> Subscription {
        Subscription {
            subscription_id: id,
            subscription_name: format!("sub-{}", id),
            owner_id: "0".to_string(),
            subscription_form: "hostcreate".to_string(),
            callback_url: url.to_string(),
            time_out: 0,
            confirm_mode: ConfirmMode::StatusCode,
            confirm_pattern: "200".to_string(),
            last_time: Utc::now(),
        }
    }

    fn supervisor() -> (Arc<Supervisor>, mpsc::UnboundedReceiver<WorkerExit>) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let delivery = DeliveryClient::new(Duration::from_secs(1)).unwrap();
        Supervisor::new(store, delivery, &test_config())
    }

    #[tokio::test]
    async fn test_spawn_supervised_reports_panic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_supervised(
            WorkerKind::Distributor(1),
            7,
            async {
                if true {
                    panic!("boom");
                }
                Ok::<(), HookError>(())
            },
            tx,
        );

        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.kind, WorkerKind::Distributor(1));
        assert_eq!(exit.generation, 7);
        assert_eq!(exit.outcome, ExitOutcome::Panicked("boom".to_string()));
        assert!(matches!(exit.error(), Some(HookError::WorkerPanicked(_))));
    }

    #[tokio::test]
    async fn test_spawn_supervised_reports_clean_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_supervised(WorkerKind::Consumer, 1, async { Ok::<(), HookError>(()) }, tx);

        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.outcome, ExitOutcome::Stopped);
        assert!(exit.error().is_none());
    }

    #[tokio::test]
    async fn test_renew_keeps_generation() {
        let (supervisor, _exits) = supervisor();
        let first = supervisor.spawn(subscription(1, "http://127.0.0.1:1/a")).await;
        let renewed = supervisor.renew(subscription(1, "http://127.0.0.1:1/b")).await;

        assert_eq!(first, renewed);
        assert_eq!(
            supervisor.subscription(1).await.unwrap().callback_url,
            "http://127.0.0.1:1/b"
        );
        supervisor.stop_all().await;
    }

    fn queued_item(subscription_id: i64, dstb_id: i64) -> String {
        let event = EventInst {
            id: dstb_id,
            owner_id: "0".to_string(),
            event_type: "hostcreate".to_string(),
            obj_type: "host".to_string(),
            action: "create".to_string(),
            data: Vec::new(),
            request_id: format!("req-{}", dstb_id),
            request_time: Utc::now(),
        };
        let raw = serde_json::to_string(&event).unwrap();
        serde_json::to_string(&DistInst::new(event, raw, subscription_id, dstb_id)).unwrap()
    }

    #[tokio::test]
    async fn test_renewals_to_busy_worker_do_not_block_stop() {
        let store = MemoryStore::new();
        let delivery = DeliveryClient::new(Duration::from_secs(1)).unwrap();
        let config = DistributionConfig {
            default_delivery_timeout: Duration::from_secs(30),
            distribution_grace_period: Duration::from_millis(20),
            wait_poll_interval: Duration::from_millis(10),
            ..test_config()
        };
        let (supervisor, _exits) = Supervisor::new(Arc::new(store.clone()), delivery, &config);

        // Item 2 waits on item 1, which another worker holds
        assert!(store
            .acquire("dist:running:9:1", "other-worker", Duration::from_secs(60))
            .await
            .unwrap());
        let generation = supervisor.spawn(subscription(9, "http://127.0.0.1:1/a")).await;
        store
            .push(&keys::dist_queue(9), &queued_item(9, 2))
            .await
            .unwrap();
        for _ in 0..100 {
            if store.exists("dist:running:9:2").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.exists("dist:running:9:2").await.unwrap());

        for i in 0..8 {
            let renewed = tokio::time::timeout(
                Duration::from_secs(1),
                supervisor.renew(subscription(9, &format!("http://127.0.0.1:1/{}", i))),
            )
            .await
            .unwrap();
            assert_eq!(renewed, generation);
        }
        assert_eq!(
            supervisor.subscription(9).await.unwrap().callback_url,
            "http://127.0.0.1:1/7"
        );

        let stopped = tokio::time::timeout(Duration::from_secs(1), supervisor.stop(9))
            .await
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_retire_resolves_after_worker_exit() {
        let (supervisor, _exits) = supervisor();
        supervisor.spawn(subscription(10, "http://127.0.0.1:1/a")).await;

        let exited = supervisor.retire(10).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), exited)
            .await
            .unwrap()
            .unwrap();
        assert!(supervisor.retire(10).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_forgets_distributor() {
        let (supervisor, mut exits) = supervisor();
        let generation = supervisor.spawn(subscription(2, "http://127.0.0.1:1/a")).await;

        assert!(supervisor.stop(2).await);
        assert!(!supervisor.stop(2).await);
        assert!(supervisor.subscription_ids().await.is_empty());

        let exit = tokio::time::timeout(Duration::from_secs(1), exits.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.kind, WorkerKind::Distributor(2));
        assert_eq!(exit.generation, generation);
        assert_eq!(exit.outcome, ExitOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_panicked_distributor_is_restarted() {
        let (supervisor, _exits) = supervisor();
        let generation = supervisor.spawn(subscription(3, "http://127.0.0.1:1/a")).await;

        supervisor
            .handle_exit(WorkerExit {
                kind: WorkerKind::Distributor(3),
                generation,
                outcome: ExitOutcome::Panicked("boom".to_string()),
            })
            .await;

        let mut restarted = None;
        for _ in 0..100 {
            let current = supervisor.generation(3).await;
            if current != Some(generation) {
                restarted = current;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(restarted.unwrap() > generation);
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_stale_or_removed_exit_is_ignored() {
        let (supervisor, _exits) = supervisor();
        let generation = supervisor.spawn(subscription(4, "http://127.0.0.1:1/a")).await;

        supervisor
            .handle_exit(WorkerExit {
                kind: WorkerKind::Distributor(4),
                generation: generation + 100,
                outcome: ExitOutcome::Panicked("old".to_string()),
            })
            .await;

        supervisor.stop(4).await;
        supervisor
            .handle_exit(WorkerExit {
                kind: WorkerKind::Distributor(4),
                generation,
                outcome: ExitOutcome::Panicked("late".to_string()),
            })
            .await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(supervisor.generation(4).await, None);
    }
}
