/// Event producer - entry point for components that observe instance changes
use crate::{
    distribution::{events::EventData, keys, EventInst},
    error::HookResult,
    metrics,
    store::SharedStore,
};
use chrono::Utc;
use tracing::debug;

/// An instance change to be enqueued
#[derive(Debug, Clone, Default)]
pub struct EventChange {
    pub owner_id: String,
    pub event_type: String,
    pub obj_type: String,
    pub action: String,
    pub cur_data: Option<serde_json::Value>,
    pub pre_data: Option<serde_json::Value>,
    /// Propagated from the originating request; generated when absent
    pub request_id: Option<String>,
}

impl EventChange {
    pub fn new(
        owner_id: impl Into<String>,
        event_type: impl Into<String>,
        obj_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            event_type: event_type.into(),
            obj_type: obj_type.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn with_data(
        mut self,
        cur_data: Option<serde_json::Value>,
        pre_data: Option<serde_json::Value>,
    ) -> Self {
        self.cur_data = cur_data;
        self.pre_data = pre_data;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Pushes events on the global queue with atomically assigned IDs
#[derive(Clone)]
pub struct EventProducer {
    store: SharedStore,
}

impl EventProducer {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Assign the next global ID and enqueue the event. Returns the ID.
    pub async fn enqueue(&self, change: EventChange) -> HookResult<i64> {
        let id = self.store.incr(keys::EVENT_ID).await?;

        let event = EventInst {
            id,
            owner_id: change.owner_id,
            event_type: change.event_type,
            obj_type: change.obj_type,
            action: change.action,
            data: vec![EventData {
                pre_data: change.pre_data,
                cur_data: change.cur_data,
            }],
            request_id: change
                .request_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            request_time: Utc::now(),
        };

        let payload = serde_json::to_string(&event)?;
        self.store.push(keys::EVENT_QUEUE, &payload).await?;

        metrics::record_event_enqueued(&event.event_type);
        debug!("Enqueued event {} ({})", id, event.interest_key());

        Ok(id)
    }
}
