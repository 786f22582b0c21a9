/// In-process coordination store
///
/// Mirrors the Redis semantics the engine relies on (atomic counters,
/// FIFO lists with blocking pop, hashes, sets, TTL'd set-if-absent markers,
/// pub/sub) so the whole pipeline can run without an external server.

use crate::error::{HookError, HookResult};
use crate::store::{glob_match, CoordinationStore};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

/// Buffer for each in-process subscriber
const SUBSCRIBE_BUFFER: usize = 256;

#[derive(Debug)]
enum Value {
    Counter(i64),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Marker {
        holder: String,
        expires_at: Instant,
    },
}

#[derive(Default)]
struct State {
    data: HashMap<String, Value>,
    channels: HashMap<String, Vec<mpsc::Sender<String>>>,
}

impl State {
    /// Drop the entry if it is an expired marker
    fn purge_expired(&mut self, key: &str) {
        let expired = matches!(
            self.data.get(key),
            Some(Value::Marker { expires_at, .. }) if *expires_at <= Instant::now()
        );
        if expired {
            self.data.remove(key);
        }
    }
}

fn wrong_type(key: &str) -> HookError {
    HookError::Store(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

/// In-memory coordination store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    pushed: Arc<Notify>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_pop(&self, key: &str) -> HookResult<Option<String>> {
        let mut state = self.state.lock().await;
        let (value, now_empty) = match state.data.get_mut(key) {
            Some(Value::List(list)) => {
                let value = list.pop_front();
                (value, list.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
            None => (None, false),
        };
        if now_empty {
            state.data.remove(key);
        }
        Ok(value)
    }

    /// Current holder of an unexpired marker
    pub async fn marker_holder(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        state.purge_expired(key);
        match state.data.get(key) {
            Some(Value::Marker { holder, .. }) => Some(holder.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn incr(&self, key: &str) -> HookResult<i64> {
        let mut state = self.state.lock().await;
        match state
            .data
            .entry(key.to_string())
            .or_insert(Value::Counter(0))
        {
            Value::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn push(&self, key: &str, value: &str) -> HookResult<()> {
        {
            let mut state = self.state.lock().await;
            match state
                .data
                .entry(key.to_string())
                .or_insert_with(|| Value::List(VecDeque::new()))
            {
                Value::List(list) => list.push_back(value.to_string()),
                _ => return Err(wrong_type(key)),
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn push_front(&self, key: &str, value: &str) -> HookResult<()> {
        {
            let mut state = self.state.lock().await;
            match state
                .data
                .entry(key.to_string())
                .or_insert_with(|| Value::List(VecDeque::new()))
            {
                Value::List(list) => list.push_front(value.to_string()),
                _ => return Err(wrong_type(key)),
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(&self, key: &str, timeout: Duration) -> HookResult<Option<String>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a push in between is not missed
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key).await? {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop(key).await;
            }
        }
    }

    async fn queue_len(&self, key: &str) -> HookResult<usize> {
        let state = self.state.lock().await;
        match state.data.get(key) {
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> HookResult<Option<String>> {
        let state = self.state.lock().await;
        match state.data.get(key) {
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> HookResult<()> {
        let mut state = self.state.lock().await;
        match state
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hash_delete(&self, key: &str, field: &str) -> HookResult<()> {
        let mut state = self.state.lock().await;
        let now_empty = match state.data.get_mut(key) {
            Some(Value::Hash(hash)) => {
                hash.remove(field);
                hash.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
            None => false,
        };
        if now_empty {
            state.data.remove(key);
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, members: &[String]) -> HookResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        match state
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()))
        {
            Value::Set(set) => {
                set.extend(members.iter().cloned());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> HookResult<()> {
        let mut state = self.state.lock().await;
        let now_empty = match state.data.get_mut(key) {
            Some(Value::Set(set)) => {
                for member in members {
                    set.remove(member);
                }
                set.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
            None => false,
        };
        // Redis removes empty sets
        if now_empty {
            state.data.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> HookResult<HashSet<String>> {
        let state = self.state.lock().await;
        match state.data.get(key) {
            Some(Value::Set(set)) => Ok(set.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashSet::new()),
        }
    }

    async fn keys(&self, pattern: &str) -> HookResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state
            .data
            .retain(|_, v| !matches!(v, Value::Marker { expires_at, .. } if *expires_at <= now));

        let mut keys: Vec<String> = state
            .data
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> HookResult<()> {
        self.state.lock().await.data.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> HookResult<bool> {
        let mut state = self.state.lock().await;
        state.purge_expired(key);
        Ok(state.data.contains_key(key))
    }

    async fn acquire(&self, key: &str, value: &str, ttl: Duration) -> HookResult<bool> {
        let mut state = self.state.lock().await;
        state.purge_expired(key);
        if state.data.contains_key(key) {
            return Ok(false);
        }
        state.data.insert(
            key.to_string(),
            Value::Marker {
                holder: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str) -> HookResult<()> {
        let mut state = self.state.lock().await;
        if let Some(Value::Marker { .. }) = state.data.get(key) {
            state.data.remove(key);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> HookResult<()> {
        let senders = {
            let mut state = self.state.lock().await;
            match state.channels.get_mut(channel) {
                Some(senders) => {
                    senders.retain(|tx| !tx.is_closed());
                    senders.clone()
                }
                None => Vec::new(),
            }
        };

        for tx in senders {
            // A subscriber dropping between retain and send is not an error
            let _ = tx.send(message.to_string()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> HookResult<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        self.state
            .lock()
            .await
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn ping(&self) -> HookResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}
