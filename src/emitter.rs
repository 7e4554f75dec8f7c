//! Event emitter: the single integration point business services call.
//!
//! `emit()` durably records the event, fans it out to matching subscribed
//! endpoints, and returns. Delivery happens asynchronously in the engine;
//! delivery failures never propagate back to the emitting service.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;

use crate::catalog::EventCatalog;
use crate::error::EmitError;
use crate::filter;
use crate::retry::after;
use crate::storage::Store;
use crate::types::{
    EndpointConfig, EventId, EventTypeDefinition, OriginContext, RetryStrategy, WebhookDelivery,
    WebhookEvent,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

pub struct EventEmitter {
    store: Arc<dyn Store>,
    catalog: Arc<EventCatalog>,
    wakeup: Option<Arc<Notify>>,
}

impl EventEmitter {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<EventCatalog>) -> Self {
        Self {
            store,
            catalog,
            wakeup: None,
        }
    }

    /// Nudge the delivery engine when new deliveries are scheduled, instead
    /// of waiting for its next poll.
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = Some(wakeup);
        self
    }

    /// Record an event and fan it out to subscribed endpoints.
    ///
    /// The event row is the durability boundary: it is persisted even when
    /// zero endpoints match, and `emit` succeeds independent of any
    /// delivery outcome. Unknown event types fail loudly.
    pub async fn emit(
        &self,
        event_type: &str,
        payload: Value,
        origin: OriginContext,
    ) -> Result<WebhookEvent, EmitError> {
        self.emit_delayed(event_type, payload, origin, Duration::ZERO)
            .await
    }

    /// Like [`emit`](Self::emit), scheduling deliveries `delay` into the
    /// future.
    pub async fn emit_delayed(
        &self,
        event_type: &str,
        payload: Value,
        origin: OriginContext,
        delay: Duration,
    ) -> Result<WebhookEvent, EmitError> {
        let definition =
            self.catalog
                .get(event_type)
                .await
                .ok_or_else(|| EmitError::UnknownEventType {
                    name: event_type.to_string(),
                })?;

        let event = WebhookEvent {
            id: EventId::new(),
            event_type: event_type.to_string(),
            payload,
            metadata: None,
            origin,
            occurred_at: Utc::now(),
            is_processed: false,
        };
        self.store.insert_event(&event).await?;
        metric_inc("webhook.event.recorded");

        let created = self.fan_out(&event, &definition, delay).await;
        if created > 0 {
            if let Some(wakeup) = &self.wakeup {
                wakeup.notify_waiters();
            }
        }

        // Fan-out is complete (possibly with zero deliveries); the flag
        // write is best-effort and never fails the emit.
        if let Err(_err) = self.store.mark_processed(event.id).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(event_id = %event.id, error = %_err, "failed to mark event processed");
        }

        Ok(event)
    }

    /// Create one pending delivery per subscribed, active, filter-matching
    /// endpoint. Failures are isolated per endpoint: one bad endpoint
    /// cannot block fan-out to healthy ones.
    async fn fan_out(
        &self,
        event: &WebhookEvent,
        definition: &EventTypeDefinition,
        delay: Duration,
    ) -> usize {
        let endpoints = match self.store.subscribers_of(&event.event_type).await {
            Ok(endpoints) => endpoints,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(event_id = %event.id, error = %_err, "fan-out subscriber lookup failed");
                return 0;
            }
        };

        let scheduled_at = after(event.occurred_at, delay);
        let mut created = 0usize;
        for endpoint in endpoints {
            if !endpoint.accepts_deliveries() {
                continue;
            }
            if !filter::matches(
                endpoint.filters_enabled,
                &endpoint.filters,
                endpoint.filter_conjunction,
                &event.payload,
            ) {
                metric_inc("webhook.fanout.filtered");
                continue;
            }

            let delivery = WebhookDelivery::new(
                event.id,
                endpoint.id,
                effective_max_attempts(&endpoint, definition),
                scheduled_at,
            );
            match self.store.insert_delivery(&delivery).await {
                Ok(()) => {
                    created += 1;
                    metric_inc("webhook.fanout.scheduled");
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        event_id = %event.id,
                        endpoint_id = %endpoint.id,
                        error = %_err,
                        "failed to schedule delivery"
                    );
                }
            }
        }
        created
    }
}

/// Attempt ceiling for one delivery: the endpoint's limit bounded by the
/// event type's ceiling. A no-retry strategy clamps to a single attempt.
fn effective_max_attempts(endpoint: &EndpointConfig, definition: &EventTypeDefinition) -> u32 {
    if endpoint.retry_strategy == RetryStrategy::None {
        return 1;
    }
    endpoint
        .max_retry_attempts
        .min(definition.max_retry_ceiling)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EndpointConfig;

    #[test]
    fn max_attempts_is_bounded_by_both_ceilings() {
        let endpoint = EndpointConfig::new("https://example.com/hook").with_retry_policy(
            RetryStrategy::ExponentialBackoff,
            8,
            Duration::from_secs(60),
        );
        let definition =
            EventTypeDefinition::new("customer.created", "customer").with_max_retry_ceiling(5);
        assert_eq!(effective_max_attempts(&endpoint, &definition), 5);

        let definition =
            EventTypeDefinition::new("customer.created", "customer").with_max_retry_ceiling(20);
        assert_eq!(effective_max_attempts(&endpoint, &definition), 8);
    }

    #[test]
    fn no_retry_strategy_means_one_attempt() {
        let endpoint = EndpointConfig::new("https://example.com/hook").with_retry_policy(
            RetryStrategy::None,
            8,
            Duration::from_secs(60),
        );
        let definition = EventTypeDefinition::new("customer.created", "customer");
        assert_eq!(effective_max_attempts(&endpoint, &definition), 1);
    }
}
