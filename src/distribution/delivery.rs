/// Delivery client - performs subscriber callbacks and confirms them
use crate::{
    distribution::{ConfirmMode, Subscription},
    error::{HookError, HookResult},
    metrics,
};
use regex::Regex;
use reqwest::{header, Client};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// HTTP callback client shared by all distributors
#[derive(Clone)]
pub struct DeliveryClient {
    http: Client,
    default_timeout: Duration,
}

impl DeliveryClient {
    /// Create a new delivery client
    pub fn new(default_timeout: Duration) -> HookResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("eventhook/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HookError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            default_timeout,
        })
    }

    /// POST `payload` to the subscription's callback URL and confirm the response
    ///
    /// Counts every attempt, and counts a failure on build errors, transport
    /// errors and confirmation mismatches. An invalid regex confirm pattern is
    /// returned as `InvalidConfirmPattern` without counting a failure.
    pub async fn deliver(&self, subscription: &Subscription, payload: &str) -> HookResult<()> {
        let id = subscription.subscription_id;
        metrics::record_delivery(id);

        let matcher = match subscription.confirm_mode {
            ConfirmMode::Regex => Some(Regex::new(&subscription.confirm_pattern).map_err(
                |source| HookError::InvalidConfirmPattern {
                    pattern: subscription.confirm_pattern.clone(),
                    source,
                },
            )?),
            ConfirmMode::StatusCode => None,
        };

        let timeout = subscription.timeout_or(self.default_timeout);
        let request = self
            .http
            .post(&subscription.callback_url)
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(payload.to_string())
            .build()
            .map_err(|e| self.failure(id, "build", format!("build request failed: {}", e), payload))?;

        let started = Instant::now();
        let response = self.http.execute(request).await.map_err(|e| {
            self.failure(
                id,
                "transport",
                format!("callback to {} failed: {}", subscription.callback_url, e),
                payload,
            )
        })?;
        let status = response.status();

        match matcher {
            None => {
                metrics::record_delivery_duration(id, started.elapsed().as_secs_f64());
                let code = status.as_u16().to_string();
                if code != subscription.confirm_pattern.trim() {
                    return Err(self.failure(
                        id,
                        "confirm",
                        format!(
                            "status {} does not match confirm pattern {}",
                            code, subscription.confirm_pattern
                        ),
                        payload,
                    ));
                }
            }
            Some(matcher) => {
                let body = response.text().await.map_err(|e| {
                    self.failure(
                        id,
                        "transport",
                        format!("reading callback response failed: {}", e),
                        payload,
                    )
                })?;
                metrics::record_delivery_duration(id, started.elapsed().as_secs_f64());
                if !matcher.is_match(&body) {
                    return Err(self.failure(
                        id,
                        "confirm",
                        format!(
                            "response body does not match confirm pattern {} (status {})",
                            subscription.confirm_pattern, status
                        ),
                        payload,
                    ));
                }
            }
        }

        debug!(
            "Delivered to subscription {} at {} ({})",
            id, subscription.callback_url, status
        );
        Ok(())
    }

    fn failure(&self, subscription_id: i64, kind: &str, reason: String, payload: &str) -> HookError {
        metrics::record_delivery_failure(subscription_id, kind);
        warn!("Delivery to subscription {} failed: {}", subscription_id, reason);
        HookError::Delivery {
            reason,
            payload: payload.to_string(),
        }
    }
}
