/// Running/done markers and the bounded wait-for-previous policy
///
/// Both the sequential consumer and every distributor order their work the
/// same way: take an exclusive running marker for `seq`, then wait (bounded)
/// for `seq - 1` to be marked done before doing the work, then mark `seq`
/// done and drop the running marker. Ordering is best-effort: a predecessor
/// that never registered, vanished, or overran the wait timeout does not
/// block its successor.

use crate::{
    config::DistributionConfig,
    distribution::{SequenceScope, StopSignal},
    error::HookResult,
    metrics,
    store::SharedStore,
};
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How the wait for the previous sequence number ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousState {
    /// Previous sequence is marked done (or there is none)
    Done,
    /// Previous sequence has no live running marker; presumed abandoned
    Abandoned,
    /// Previous sequence is still running after the wait timeout
    TimedOut,
    /// The worker's stop signal fired while waiting
    Cancelled,
}

/// Marker operations scoped to one sequence stream
#[derive(Clone)]
pub struct SequenceGate {
    store: SharedStore,
    wait_poll_interval: Duration,
    done_retention: i64,
}

impl SequenceGate {
    pub fn new(store: SharedStore, config: &DistributionConfig) -> Self {
        Self {
            store,
            wait_poll_interval: config.wait_poll_interval,
            done_retention: config.done_retention,
        }
    }

    /// Take the running marker for `seq`. `false` means another worker owns it.
    pub async fn try_lock(
        &self,
        scope: SequenceScope,
        seq: i64,
        holder: &str,
        ttl: Duration,
    ) -> HookResult<bool> {
        let acquired = self
            .store
            .acquire(&scope.running_key(seq), holder, ttl)
            .await?;
        if !acquired {
            metrics::record_lock_contention(&scope);
        }
        Ok(acquired)
    }

    /// Whether `seq` is marked done. Sequence numbers below 1 are trivially done.
    pub async fn is_done(&self, scope: SequenceScope, seq: i64) -> HookResult<bool> {
        if seq < 1 {
            return Ok(true);
        }
        Ok(self
            .store
            .hash_get(&scope.done_key(), &seq.to_string())
            .await?
            .is_some())
    }

    /// Whether a live running marker exists for `seq`
    pub async fn is_running(&self, scope: SequenceScope, seq: i64) -> HookResult<bool> {
        self.store.exists(&scope.running_key(seq)).await
    }

    /// Wait until `seq - 1` is done, abandoned, or `timeout` elapses
    pub async fn wait_for_previous(
        &self,
        scope: SequenceScope,
        seq: i64,
        grace: Duration,
        timeout: Duration,
        stop: &mut StopSignal,
    ) -> HookResult<PreviousState> {
        let prev = seq - 1;

        if self.is_done(scope, prev).await? {
            return Ok(PreviousState::Done);
        }

        if !self.is_running(scope, prev).await? {
            // The previous worker may not have registered yet
            tokio::select! {
                _ = stop.stopped() => return Ok(PreviousState::Cancelled),
                _ = tokio::time::sleep(grace) => {}
            }

            if self.is_done(scope, prev).await? {
                return Ok(PreviousState::Done);
            }
            if !self.is_running(scope, prev).await? {
                debug!(
                    "{} seq {} not running after grace period, proceeding with {}",
                    scope.label(),
                    prev,
                    seq
                );
                return Ok(PreviousState::Abandoned);
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.is_done(scope, prev).await? {
                return Ok(PreviousState::Done);
            }

            if !self.is_running(scope, prev).await? {
                // Marking done happens before the marker is released
                if self.is_done(scope, prev).await? {
                    return Ok(PreviousState::Done);
                }
                debug!(
                    "{} seq {} released without finishing, proceeding with {}",
                    scope.label(),
                    prev,
                    seq
                );
                return Ok(PreviousState::Abandoned);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "{} seq {} still running after {:?}, processing {} out of order",
                    scope.label(),
                    prev,
                    timeout,
                    seq
                );
                metrics::record_ordering_timeout(&scope);
                return Ok(PreviousState::TimedOut);
            }

            let pause = self.wait_poll_interval.min(deadline - now);
            tokio::select! {
                _ = stop.stopped() => return Ok(PreviousState::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Mark `seq` done and drop its running marker
    ///
    /// The marker is released even when recording the done entry fails.
    pub async fn finish(&self, scope: SequenceScope, seq: i64) -> HookResult<()> {
        let done_key = scope.done_key();
        let marked = self
            .store
            .hash_set(&done_key, &seq.to_string(), &Utc::now().to_rfc3339())
            .await;

        if marked.is_ok() && seq > self.done_retention {
            let stale = seq - self.done_retention;
            if let Err(e) = self.store.hash_delete(&done_key, &stale.to_string()).await {
                debug!("Failed to prune done marker {} for {}: {}", stale, scope.label(), e);
            }
        }

        let released = self.store.release(&scope.running_key(seq)).await;
        marked?;
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CoordinationStore, MemoryStore};
    use std::sync::Arc;

    fn gate(store: &MemoryStore) -> SequenceGate {
        let config = DistributionConfig {
            wait_poll_interval: Duration::from_millis(10),
            done_retention: 4,
            ..Default::default()
        };
        SequenceGate::new(Arc::new(store.clone()), &config)
    }

    #[tokio::test]
    async fn test_second_lock_attempt_is_skipped() {
        let store = MemoryStore::new();
        let gate = gate(&store);
        let scope = SequenceScope::Events;
        let ttl = Duration::from_secs(5);

        assert!(gate.try_lock(scope, 3, "a", ttl).await.unwrap());
        assert!(!gate.try_lock(scope, 3, "b", ttl).await.unwrap());
        assert!(gate.try_lock(SequenceScope::Distribution(1), 3, "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_first_sequence_has_no_predecessor() {
        let store = MemoryStore::new();
        let gate = gate(&store);
        let (_tx, mut stop) = StopSignal::channel();

        let state = gate
            .wait_for_previous(
                SequenceScope::Events,
                1,
                Duration::from_secs(5),
                Duration::from_secs(5),
                &mut stop,
            )
            .await
            .unwrap();
        assert_eq!(state, PreviousState::Done);
    }

    #[tokio::test]
    async fn test_unregistered_predecessor_is_abandoned_after_grace() {
        let store = MemoryStore::new();
        let gate = gate(&store);
        let (_tx, mut stop) = StopSignal::channel();

        let started = Instant::now();
        let state = gate
            .wait_for_previous(
                SequenceScope::Events,
                5,
                Duration::from_millis(30),
                Duration::from_secs(5),
                &mut stop,
            )
            .await
            .unwrap();
        assert_eq!(state, PreviousState::Abandoned);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_waits_for_running_predecessor_to_finish() {
        let store = MemoryStore::new();
        let gate = gate(&store);
        let scope = SequenceScope::Distribution(2);
        let (_tx, mut stop) = StopSignal::channel();

        assert!(gate.try_lock(scope, 1, "w1", Duration::from_secs(5)).await.unwrap());

        let finisher = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            finisher.finish(scope, 1).await.unwrap();
        });

        let state = gate
            .wait_for_previous(scope, 2, Duration::ZERO, Duration::from_secs(5), &mut stop)
            .await
            .unwrap();
        assert_eq!(state, PreviousState::Done);
        assert!(!gate.is_running(scope, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_times_out_on_stuck_predecessor() {
        let store = MemoryStore::new();
        let gate = gate(&store);
        let scope = SequenceScope::Events;
        let (_tx, mut stop) = StopSignal::channel();

        assert!(gate.try_lock(scope, 1, "stuck", Duration::from_secs(30)).await.unwrap());

        let state = gate
            .wait_for_previous(scope, 2, Duration::ZERO, Duration::from_millis(50), &mut stop)
            .await
            .unwrap();
        assert_eq!(state, PreviousState::TimedOut);
    }

    #[tokio::test]
    async fn test_stop_signal_cancels_wait() {
        let store = MemoryStore::new();
        let gate = gate(&store);
        let scope = SequenceScope::Distribution(9);
        let (tx, mut stop) = StopSignal::channel();

        assert!(gate.try_lock(scope, 1, "stuck", Duration::from_secs(30)).await.unwrap());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let state = gate
            .wait_for_previous(scope, 2, Duration::ZERO, Duration::from_secs(30), &mut stop)
            .await
            .unwrap();
        assert_eq!(state, PreviousState::Cancelled);
    }

    #[tokio::test]
    async fn test_finish_prunes_old_done_markers() {
        let store = MemoryStore::new();
        let gate = gate(&store);
        let scope = SequenceScope::Events;

        for seq in 1..=6 {
            gate.finish(scope, seq).await.unwrap();
        }

        // retention is 4: finishing 5 and 6 pruned 1 and 2
        assert!(store.hash_get("event:done", "1").await.unwrap().is_none());
        assert!(store.hash_get("event:done", "2").await.unwrap().is_none());
        assert!(gate.is_done(scope, 3).await.unwrap());
        assert!(gate.is_done(scope, 6).await.unwrap());
    }
}
