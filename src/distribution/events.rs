/// Event and subscription type definitions for the distribution pipeline
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Previous/current representation of the changed object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub pre_data: Option<serde_json::Value>,
    #[serde(default)]
    pub cur_data: Option<serde_json::Value>,
}

/// A single observed change, ordered by `id` on the global stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInst {
    pub id: i64,
    pub owner_id: String,
    pub event_type: String,
    pub obj_type: String,
    pub action: String,
    pub data: Vec<EventData>,
    pub request_id: String,
    pub request_time: DateTime<Utc>,
}

impl EventInst {
    /// Interest-index key this event is routed by
    pub fn interest_key(&self) -> String {
        interest_key(&self.owner_id, &self.event_type)
    }
}

/// One subscriber's copy of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistInst {
    pub dstb_id: i64,
    pub subscription_id: i64,
    #[serde(flatten)]
    pub event: EventInst,
    /// Serialized event exactly as it was enqueued; this is the callback body
    pub raw: String,
}

impl DistInst {
    /// Derive a distribution item from a popped event and its raw payload
    pub fn new(event: EventInst, raw: String, subscription_id: i64, dstb_id: i64) -> Self {
        Self {
            dstb_id,
            subscription_id,
            event,
            raw,
        }
    }
}

/// How a subscriber acknowledges a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmMode {
    /// Compare the HTTP status code (as a string) with the pattern
    #[serde(rename = "httpstatus", alias = "status_code")]
    StatusCode,
    /// Match the pattern as a regular expression against the response body
    #[serde(rename = "regular", alias = "regex")]
    Regex,
}

impl ConfirmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmMode::StatusCode => "httpstatus",
            ConfirmMode::Regex => "regular",
        }
    }
}

impl std::str::FromStr for ConfirmMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "httpstatus" | "status_code" => Ok(ConfirmMode::StatusCode),
            "regular" | "regex" => Ok(ConfirmMode::Regex),
            other => Err(format!("unknown confirm mode '{}'", other)),
        }
    }
}

/// Upper bound on a subscription's delivery timeout
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// A registered interest in a set of event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: i64,
    pub subscription_name: String,
    pub owner_id: String,
    /// Comma-separated event-type keys
    pub subscription_form: String,
    pub callback_url: String,
    /// Delivery timeout in seconds, 0 means the process default
    #[serde(default)]
    pub time_out: u64,
    pub confirm_mode: ConfirmMode,
    pub confirm_pattern: String,
    #[serde(default = "Utc::now")]
    pub last_time: DateTime<Utc>,
}

impl Subscription {
    /// Event types named in the form, trimmed and de-duplicated
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for t in self.subscription_form.split(',') {
            let t = t.trim();
            if !t.is_empty() && !types.iter().any(|existing| existing == t) {
                types.push(t.to_string());
            }
        }
        types
    }

    /// Interest-index keys (`owner:eventType`) this subscription listens on
    pub fn event_keys(&self) -> Vec<String> {
        self.event_types()
            .iter()
            .map(|t| interest_key(&self.owner_id, t))
            .collect()
    }

    /// Delivery timeout, falling back to `default` when unset.
    /// Capped at `MAX_TIMEOUT_SECS`.
    pub fn timeout_or(&self, default: std::time::Duration) -> std::time::Duration {
        if self.time_out == 0 {
            default
        } else {
            std::time::Duration::from_secs(self.time_out.min(MAX_TIMEOUT_SECS))
        }
    }
}

/// Interest key for an owner and event type
pub fn interest_key(owner_id: &str, event_type: &str) -> String {
    format!("{}:{}", owner_id, event_type)
}

/// Subscription lifecycle action carried on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Create,
    Update,
    Delete,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Create => "create",
            ControlAction::Update => "update",
            ControlAction::Delete => "delete",
        }
    }
}

/// Control-channel payload published by the subscription management API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub subscription: Subscription,
}
