/// Distribution - ordered fan-out of change events to HTTP subscribers
///
/// Producer -> global queue -> sequential consumer -> per-subscription
/// queues -> distributors -> delivery client -> subscriber callback.
/// Ordering between workers is coordinated through running/done markers
/// held in the coordination store.

pub mod consumer;
pub mod delivery;
pub mod distributor;
pub mod events;
pub mod ordering;
pub mod producer;
pub mod reconciler;
pub mod supervisor;

pub use consumer::{ConsumeOutcome, SequentialConsumer};
pub use delivery::DeliveryClient;
pub use distributor::{Distributor, DistributorHandle};
pub use events::*;
pub use ordering::{PreviousState, SequenceGate};
pub use producer::{EventChange, EventProducer};
pub use reconciler::{publish_subscription_change, ControlListener, ReconcileReport, Reconciler};
pub use supervisor::{Engine, ExitOutcome, Supervisor, WorkerExit, WorkerKind};

use tokio::sync::watch;

/// Coordination store key layout
pub mod keys {
    /// Global event ID counter
    pub const EVENT_ID: &str = "event:id";
    /// Global event queue
    pub const EVENT_QUEUE: &str = "event:queue";
    /// Prefix of interest-index sets
    pub const SUBSCRIBERS_PREFIX: &str = "subscribers:";
    /// Control channel for subscription lifecycle messages
    pub const SUBSCRIPTION_CHANNEL: &str = "subscription:changes";

    /// Per-subscription distribution ID counter
    pub fn dist_id(subscription_id: i64) -> String {
        format!("dist:id:{}", subscription_id)
    }

    /// Per-subscription private queue
    pub fn dist_queue(subscription_id: i64) -> String {
        format!("dist:queue:{}", subscription_id)
    }

    /// Interest-index set for an `owner:eventType` key
    pub fn subscribers(event_key: &str) -> String {
        format!("{}{}", SUBSCRIBERS_PREFIX, event_key)
    }

    /// Pattern matching every interest-index set
    pub fn subscribers_pattern() -> String {
        format!("{}*", SUBSCRIBERS_PREFIX)
    }
}

/// Sequence stream a running/done marker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceScope {
    /// The global event stream
    Events,
    /// One subscription's distribution stream
    Distribution(i64),
}

impl SequenceScope {
    /// Key of the TTL'd running marker for `seq`
    pub fn running_key(&self, seq: i64) -> String {
        match self {
            SequenceScope::Events => format!("event:running:{}", seq),
            SequenceScope::Distribution(sub) => format!("dist:running:{}:{}", sub, seq),
        }
    }

    /// Hash holding this scope's done markers
    pub fn done_key(&self) -> String {
        match self {
            SequenceScope::Events => "event:done".to_string(),
            SequenceScope::Distribution(sub) => format!("dist:done:{}", sub),
        }
    }

    /// Label used in logs and metrics
    pub fn label(&self) -> String {
        match self {
            SequenceScope::Events => "events".to_string(),
            SequenceScope::Distribution(sub) => format!("subscription:{}", sub),
        }
    }
}

/// Receiving side of a worker's stop signal
///
/// A worker is stopped when `true` is sent or when the sender is dropped.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Create a linked sender/signal pair
    pub fn channel() -> (watch::Sender<bool>, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, StopSignal(rx))
    }

    /// Non-blocking check, used once per queue-pop cycle
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolve once the signal fires
    pub async fn stopped(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_scope_keys() {
        assert_eq!(SequenceScope::Events.running_key(5), "event:running:5");
        assert_eq!(SequenceScope::Events.done_key(), "event:done");
        assert_eq!(
            SequenceScope::Distribution(3).running_key(9),
            "dist:running:3:9"
        );
        assert_eq!(SequenceScope::Distribution(3).done_key(), "dist:done:3");
    }

    #[test]
    fn test_subscriber_keys() {
        assert_eq!(keys::subscribers("0:hostcreate"), "subscribers:0:hostcreate");
        assert_eq!(keys::subscribers_pattern(), "subscribers:*");
        assert_eq!(keys::dist_queue(12), "dist:queue:12");
    }

    #[tokio::test]
    async fn test_stop_signal_on_send() {
        let (tx, mut stop) = StopSignal::channel();
        assert!(!stop.is_stopped());
        tx.send(true).unwrap();
        assert!(stop.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), stop.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_signal_on_drop() {
        let (tx, mut stop) = StopSignal::channel();
        drop(tx);
        assert!(stop.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), stop.stopped())
            .await
            .unwrap();
    }
}
