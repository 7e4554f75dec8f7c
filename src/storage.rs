//! Data-access interfaces for the delivery subsystem.
//!
//! Each component receives the store interfaces it needs by injection;
//! there is no process-wide session. The [`Store`] supertrait bundles them
//! for callers that hold a single backend, and [`InMemoryStore`] implements
//! all of them for embedded use and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::types::{
    DeliveryAttempt, DeliveryId, EndpointConfig, EndpointId, EndpointStats, EndpointSubscription,
    EventId, RateLimits, WebhookDelivery, WebhookEvent,
};

/// Persistence for immutable event records.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(&self, event: &WebhookEvent) -> Result<(), StorageError>;
    async fn get_event(&self, id: EventId) -> Result<Option<WebhookEvent>, StorageError>;
    /// The only permitted event mutation: flip the processed flag after
    /// fan-out completes.
    async fn mark_processed(&self, id: EventId) -> Result<(), StorageError>;
}

/// Persistence for endpoint configurations, subscriptions, and counters.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn insert_endpoint(&self, endpoint: &EndpointConfig) -> Result<(), StorageError>;
    async fn update_endpoint(&self, endpoint: &EndpointConfig) -> Result<(), StorageError>;
    async fn get_endpoint(&self, id: EndpointId) -> Result<Option<EndpointConfig>, StorageError>;
    /// Removes the endpoint together with its subscriptions and counters.
    /// Filters and secrets are embedded in the config and die with it.
    async fn delete_endpoint(&self, id: EndpointId) -> Result<(), StorageError>;
    async fn list_endpoints(&self) -> Result<Vec<EndpointConfig>, StorageError>;

    /// Idempotent: subscribing twice is a no-op.
    async fn subscribe(&self, subscription: &EndpointSubscription) -> Result<(), StorageError>;
    async fn unsubscribe(&self, subscription: &EndpointSubscription) -> Result<(), StorageError>;
    async fn subscriptions_for(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Vec<EndpointSubscription>, StorageError>;
    /// Endpoint configs subscribed to the given event type name.
    async fn subscribers_of(&self, event_type: &str)
        -> Result<Vec<EndpointConfig>, StorageError>;

    async fn record_outcome(
        &self,
        endpoint_id: EndpointId,
        success: bool,
    ) -> Result<(), StorageError>;
    async fn endpoint_stats(&self, endpoint_id: EndpointId)
        -> Result<EndpointStats, StorageError>;
}

/// Persistence and claiming for delivery rows.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StorageError>;
    /// Full-row write-back after an attempt. Callers clear `lease_until`
    /// before writing to release their claim.
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StorageError>;
    async fn get_delivery(&self, id: DeliveryId)
        -> Result<Option<WebhookDelivery>, StorageError>;

    /// Atomically claim up to `limit` due deliveries.
    ///
    /// A delivery is due when its status is pending or retrying, its due
    /// time has passed, and no unexpired lease is held on it. Claimed rows
    /// get `lease_until = now + lease`; concurrent callers never receive
    /// the same row.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WebhookDelivery>, StorageError>;

    async fn deliveries_for_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Vec<WebhookDelivery>, StorageError>;
    async fn deliveries_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<WebhookDelivery>, StorageError>;
}

/// Append-only log of HTTP attempts.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError>;
    /// Attempts ordered by attempt number.
    async fn attempts_for_delivery(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StorageError>;
}

/// Shared fixed-window rate counters, enforced identically by all workers.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomic increment-and-check against the endpoint's minute and hour
    /// windows. Returns false, without consuming quota, when either window
    /// is exhausted.
    async fn try_consume_rate(
        &self,
        endpoint_id: EndpointId,
        limits: RateLimits,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
}

/// Bundle of all store interfaces, for callers holding one backend.
pub trait Store:
    EventStore + EndpointStore + DeliveryStore + AttemptStore + RateLimitStore
{
}

impl<T> Store for T where
    T: EventStore + EndpointStore + DeliveryStore + AttemptStore + RateLimitStore
{
}

#[derive(Debug, Default, Clone, Copy)]
struct RateWindows {
    minute_start: Option<DateTime<Utc>>,
    minute_count: u32,
    hour_start: Option<DateTime<Utc>>,
    hour_count: u32,
}

/// In-memory store for embedded deployments and tests.
#[derive(Default)]
pub struct InMemoryStore {
    events: Mutex<HashMap<EventId, WebhookEvent>>,
    endpoints: Mutex<HashMap<EndpointId, EndpointConfig>>,
    subscriptions: Mutex<Vec<EndpointSubscription>>,
    stats: Mutex<HashMap<EndpointId, EndpointStats>>,
    deliveries: Mutex<HashMap<DeliveryId, WebhookDelivery>>,
    attempts: Mutex<Vec<DeliveryAttempt>>,
    rate_windows: Mutex<HashMap<EndpointId, RateWindows>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_event(&self, event: &WebhookEvent) -> Result<(), StorageError> {
        self.events.lock().await.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<WebhookEvent>, StorageError> {
        Ok(self.events.lock().await.get(&id).cloned())
    }

    async fn mark_processed(&self, id: EventId) -> Result<(), StorageError> {
        if let Some(event) = self.events.lock().await.get_mut(&id) {
            event.is_processed = true;
        }
        Ok(())
    }
}

#[async_trait]
impl EndpointStore for InMemoryStore {
    async fn insert_endpoint(&self, endpoint: &EndpointConfig) -> Result<(), StorageError> {
        self.endpoints
            .lock()
            .await
            .insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn update_endpoint(&self, endpoint: &EndpointConfig) -> Result<(), StorageError> {
        self.endpoints
            .lock()
            .await
            .insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn get_endpoint(&self, id: EndpointId) -> Result<Option<EndpointConfig>, StorageError> {
        Ok(self.endpoints.lock().await.get(&id).cloned())
    }

    async fn delete_endpoint(&self, id: EndpointId) -> Result<(), StorageError> {
        self.endpoints.lock().await.remove(&id);
        self.subscriptions
            .lock()
            .await
            .retain(|s| s.endpoint_id != id);
        self.stats.lock().await.remove(&id);
        self.rate_windows.lock().await.remove(&id);
        Ok(())
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointConfig>, StorageError> {
        Ok(self.endpoints.lock().await.values().cloned().collect())
    }

    async fn subscribe(&self, subscription: &EndpointSubscription) -> Result<(), StorageError> {
        let mut guard = self.subscriptions.lock().await;
        if !guard.contains(subscription) {
            guard.push(subscription.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &EndpointSubscription) -> Result<(), StorageError> {
        self.subscriptions
            .lock()
            .await
            .retain(|s| s != subscription);
        Ok(())
    }

    async fn subscriptions_for(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Vec<EndpointSubscription>, StorageError> {
        Ok(self
            .subscriptions
            .lock()
            .await
            .iter()
            .filter(|s| s.endpoint_id == endpoint_id)
            .cloned()
            .collect())
    }

    async fn subscribers_of(
        &self,
        event_type: &str,
    ) -> Result<Vec<EndpointConfig>, StorageError> {
        let ids: Vec<EndpointId> = self
            .subscriptions
            .lock()
            .await
            .iter()
            .filter(|s| s.event_type == event_type)
            .map(|s| s.endpoint_id)
            .collect();

        let endpoints = self.endpoints.lock().await;
        Ok(ids
            .into_iter()
            .filter_map(|id| endpoints.get(&id).cloned())
            .collect())
    }

    async fn record_outcome(
        &self,
        endpoint_id: EndpointId,
        success: bool,
    ) -> Result<(), StorageError> {
        let mut guard = self.stats.lock().await;
        let stats = guard.entry(endpoint_id).or_default();
        if success {
            stats.successful_deliveries += 1;
        } else {
            stats.failed_deliveries += 1;
        }
        Ok(())
    }

    async fn endpoint_stats(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<EndpointStats, StorageError> {
        Ok(self
            .stats
            .lock()
            .await
            .get(&endpoint_id)
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StorageError> {
        self.deliveries
            .lock()
            .await
            .insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StorageError> {
        self.deliveries
            .lock()
            .await
            .insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get_delivery(
        &self,
        id: DeliveryId,
    ) -> Result<Option<WebhookDelivery>, StorageError> {
        Ok(self.deliveries.lock().await.get(&id).cloned())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WebhookDelivery>, StorageError> {
        // The whole scan-and-lease runs under one lock, which is what makes
        // the claim atomic for this backend.
        let mut guard = self.deliveries.lock().await;

        let mut due: Vec<DeliveryId> = guard
            .values()
            .filter(|d| {
                !d.status.is_terminal()
                    && d.due_at() <= now
                    && d.lease_until.map_or(true, |l| l <= now)
            })
            .map(|d| d.id)
            .collect();
        due.sort_by_key(|id| guard[id].due_at());
        due.truncate(limit);

        let lease_until = crate::retry::after(now, lease);
        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(delivery) = guard.get_mut(&id) {
                delivery.lease_until = Some(lease_until);
                claimed.push(delivery.clone());
            }
        }
        Ok(claimed)
    }

    async fn deliveries_for_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Vec<WebhookDelivery>, StorageError> {
        let mut rows: Vec<WebhookDelivery> = self
            .deliveries
            .lock()
            .await
            .values()
            .filter(|d| d.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.created_at);
        Ok(rows)
    }

    async fn deliveries_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<WebhookDelivery>, StorageError> {
        let mut rows: Vec<WebhookDelivery> = self
            .deliveries
            .lock()
            .await
            .values()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl AttemptStore for InMemoryStore {
    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
        self.attempts.lock().await.push(attempt.clone());
        Ok(())
    }

    async fn attempts_for_delivery(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StorageError> {
        let mut rows: Vec<DeliveryAttempt> = self
            .attempts
            .lock()
            .await
            .iter()
            .filter(|a| a.delivery_id == delivery_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.attempt_number);
        Ok(rows)
    }
}

fn window_start(now: DateTime<Utc>, width: chrono::Duration) -> DateTime<Utc> {
    now.duration_trunc(width).unwrap_or(now)
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn try_consume_rate(
        &self,
        endpoint_id: EndpointId,
        limits: RateLimits,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        if limits.is_unlimited() {
            return Ok(true);
        }

        let minute = window_start(now, chrono::Duration::minutes(1));
        let hour = window_start(now, chrono::Duration::hours(1));

        let mut guard = self.rate_windows.lock().await;
        let windows = guard.entry(endpoint_id).or_default();

        if windows.minute_start != Some(minute) {
            windows.minute_start = Some(minute);
            windows.minute_count = 0;
        }
        if windows.hour_start != Some(hour) {
            windows.hour_start = Some(hour);
            windows.hour_count = 0;
        }

        let minute_ok = limits.per_minute.map_or(true, |l| windows.minute_count < l);
        let hour_ok = limits.per_hour.map_or(true, |l| windows.hour_count < l);
        if !(minute_ok && hour_ok) {
            return Ok(false);
        }

        windows.minute_count += 1;
        windows.hour_count += 1;
        Ok(true)
    }
}
