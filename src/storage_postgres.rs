//! Durable store backed by PostgreSQL.
//!
//! Rows carry the serialized domain object as jsonb plus the columns the
//! delivery queries need (status, due time, lease). The claim uses
//! `FOR UPDATE SKIP LOCKED`, so concurrent workers on separate processes
//! never receive the same delivery.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use crate::error::StorageError;
use crate::storage::{
    AttemptStore, DeliveryStore, EndpointStore, EventStore, RateLimitStore,
};
use crate::types::{
    DeliveryAttempt, DeliveryId, EndpointConfig, EndpointId, EndpointStats, EndpointSubscription,
    EventId, RateLimits, WebhookDelivery, WebhookEvent,
};

pub struct PostgresStore {
    // tokio_postgres transactions need exclusive access to the client.
    client: Mutex<Client>,
}

impl PostgresStore {
    /// Wrap a connected client, creating the schema if missing. The caller
    /// owns the connection task.
    pub async fn new(client: Client) -> Result<Self, StorageError> {
        for statement in SCHEMA {
            client.execute(*statement, &[]).await?;
        }
        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS webhook_events (
        id UUID PRIMARY KEY,
        body JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS webhook_endpoints (
        id UUID PRIMARY KEY,
        body JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
        endpoint_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        PRIMARY KEY (endpoint_id, event_type)
    )",
    "CREATE TABLE IF NOT EXISTS webhook_endpoint_stats (
        endpoint_id UUID PRIMARY KEY,
        successful BIGINT NOT NULL DEFAULT 0,
        failed BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id UUID PRIMARY KEY,
        event_id UUID NOT NULL,
        endpoint_id UUID NOT NULL,
        status TEXT NOT NULL,
        due_at TIMESTAMPTZ NOT NULL,
        lease_until TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        body JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS webhook_deliveries_due
        ON webhook_deliveries (status, due_at)",
    "CREATE TABLE IF NOT EXISTS webhook_attempts (
        id UUID PRIMARY KEY,
        delivery_id UUID NOT NULL,
        attempt_number INT NOT NULL,
        body JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS webhook_attempts_delivery
        ON webhook_attempts (delivery_id, attempt_number)",
    "CREATE TABLE IF NOT EXISTS webhook_rate_windows (
        endpoint_id UUID NOT NULL,
        window_kind TEXT NOT NULL,
        window_start TIMESTAMPTZ NOT NULL,
        count BIGINT NOT NULL,
        PRIMARY KEY (endpoint_id, window_kind)
    )",
];

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, StorageError> {
    serde_json::to_value(value).map_err(|e| StorageError(e.to_string()))
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, StorageError> {
    serde_json::from_value(value).map_err(|e| StorageError(e.to_string()))
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert_event(&self, event: &WebhookEvent) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhook_events (id, body) VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body",
                &[&event.id.0, &to_json(event)?],
            )
            .await?;
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<WebhookEvent>, StorageError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT body FROM webhook_events WHERE id = $1", &[&id.0])
            .await?;
        row.map(|r| from_json(r.get(0))).transpose()
    }

    async fn mark_processed(&self, id: EventId) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "UPDATE webhook_events
                    SET body = jsonb_set(body, '{is_processed}', 'true')
                  WHERE id = $1",
                &[&id.0],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EndpointStore for PostgresStore {
    async fn insert_endpoint(&self, endpoint: &EndpointConfig) -> Result<(), StorageError> {
        self.update_endpoint(endpoint).await
    }

    async fn update_endpoint(&self, endpoint: &EndpointConfig) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhook_endpoints (id, body) VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body",
                &[&endpoint.id.0, &to_json(endpoint)?],
            )
            .await?;
        Ok(())
    }

    async fn get_endpoint(&self, id: EndpointId) -> Result<Option<EndpointConfig>, StorageError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT body FROM webhook_endpoints WHERE id = $1", &[&id.0])
            .await?;
        row.map(|r| from_json(r.get(0))).transpose()
    }

    async fn delete_endpoint(&self, id: EndpointId) -> Result<(), StorageError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        tx.execute("DELETE FROM webhook_endpoints WHERE id = $1", &[&id.0])
            .await?;
        tx.execute(
            "DELETE FROM webhook_subscriptions WHERE endpoint_id = $1",
            &[&id.0],
        )
        .await?;
        tx.execute(
            "DELETE FROM webhook_endpoint_stats WHERE endpoint_id = $1",
            &[&id.0],
        )
        .await?;
        tx.execute(
            "DELETE FROM webhook_rate_windows WHERE endpoint_id = $1",
            &[&id.0],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointConfig>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query("SELECT body FROM webhook_endpoints", &[])
            .await?;
        rows.into_iter().map(|r| from_json(r.get(0))).collect()
    }

    async fn subscribe(&self, subscription: &EndpointSubscription) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhook_subscriptions (endpoint_id, event_type)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
                &[&subscription.endpoint_id.0, &subscription.event_type],
            )
            .await?;
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &EndpointSubscription) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "DELETE FROM webhook_subscriptions
                  WHERE endpoint_id = $1 AND event_type = $2",
                &[&subscription.endpoint_id.0, &subscription.event_type],
            )
            .await?;
        Ok(())
    }

    async fn subscriptions_for(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Vec<EndpointSubscription>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT event_type FROM webhook_subscriptions WHERE endpoint_id = $1",
                &[&endpoint_id.0],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| EndpointSubscription {
                endpoint_id,
                event_type: r.get(0),
            })
            .collect())
    }

    async fn subscribers_of(
        &self,
        event_type: &str,
    ) -> Result<Vec<EndpointConfig>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT e.body FROM webhook_endpoints e
                   JOIN webhook_subscriptions s ON s.endpoint_id = e.id
                  WHERE s.event_type = $1",
                &[&event_type],
            )
            .await?;
        rows.into_iter().map(|r| from_json(r.get(0))).collect()
    }

    async fn record_outcome(
        &self,
        endpoint_id: EndpointId,
        success: bool,
    ) -> Result<(), StorageError> {
        let (ok, failed) = if success { (1i64, 0i64) } else { (0i64, 1i64) };
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhook_endpoint_stats (endpoint_id, successful, failed)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (endpoint_id) DO UPDATE SET
                    successful = webhook_endpoint_stats.successful + EXCLUDED.successful,
                    failed = webhook_endpoint_stats.failed + EXCLUDED.failed",
                &[&endpoint_id.0, &ok, &failed],
            )
            .await?;
        Ok(())
    }

    async fn endpoint_stats(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<EndpointStats, StorageError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT successful, failed FROM webhook_endpoint_stats WHERE endpoint_id = $1",
                &[&endpoint_id.0],
            )
            .await?;
        Ok(row
            .map(|r| EndpointStats {
                successful_deliveries: r.get::<_, i64>(0) as u64,
                failed_deliveries: r.get::<_, i64>(1) as u64,
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl DeliveryStore for PostgresStore {
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StorageError> {
        self.update_delivery(delivery).await
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhook_deliveries
                    (id, event_id, endpoint_id, status, due_at, lease_until, created_at, body)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    due_at = EXCLUDED.due_at,
                    lease_until = EXCLUDED.lease_until,
                    body = EXCLUDED.body",
                &[
                    &delivery.id.0,
                    &delivery.event_id.0,
                    &delivery.endpoint_id.0,
                    &delivery.status.to_string(),
                    &delivery.due_at(),
                    &delivery.lease_until,
                    &delivery.created_at,
                    &to_json(delivery)?,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_delivery(
        &self,
        id: DeliveryId,
    ) -> Result<Option<WebhookDelivery>, StorageError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT body FROM webhook_deliveries WHERE id = $1", &[&id.0])
            .await?;
        row.map(|r| from_json(r.get(0))).transpose()
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WebhookDelivery>, StorageError> {
        let lease_until = crate::retry::after(now, lease);
        let client = self.client.lock().await;
        let rows = client
            .query(
                "UPDATE webhook_deliveries SET
                    lease_until = $2,
                    body = jsonb_set(body, '{lease_until}', to_jsonb($2::timestamptz))
                  WHERE id IN (
                    SELECT id FROM webhook_deliveries
                     WHERE status IN ('pending', 'retrying')
                       AND due_at <= $1
                       AND (lease_until IS NULL OR lease_until <= $1)
                     ORDER BY due_at
                     LIMIT $3
                     FOR UPDATE SKIP LOCKED)
                  RETURNING body",
                &[&now, &lease_until, &(limit as i64)],
            )
            .await?;
        rows.into_iter().map(|r| from_json(r.get(0))).collect()
    }

    async fn deliveries_for_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Vec<WebhookDelivery>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT body FROM webhook_deliveries
                  WHERE endpoint_id = $1 ORDER BY created_at",
                &[&endpoint_id.0],
            )
            .await?;
        rows.into_iter().map(|r| from_json(r.get(0))).collect()
    }

    async fn deliveries_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<WebhookDelivery>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT body FROM webhook_deliveries
                  WHERE event_id = $1 ORDER BY created_at",
                &[&event_id.0],
            )
            .await?;
        rows.into_iter().map(|r| from_json(r.get(0))).collect()
    }
}

#[async_trait]
impl AttemptStore for PostgresStore {
    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhook_attempts (id, delivery_id, attempt_number, body)
                 VALUES ($1, $2, $3, $4)",
                &[
                    &attempt.id.0,
                    &attempt.delivery_id.0,
                    &(attempt.attempt_number as i32),
                    &to_json(attempt)?,
                ],
            )
            .await?;
        Ok(())
    }

    async fn attempts_for_delivery(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT body FROM webhook_attempts
                  WHERE delivery_id = $1 ORDER BY attempt_number",
                &[&delivery_id.0],
            )
            .await?;
        rows.into_iter().map(|r| from_json(r.get(0))).collect()
    }
}

#[async_trait]
impl RateLimitStore for PostgresStore {
    async fn try_consume_rate(
        &self,
        endpoint_id: EndpointId,
        limits: RateLimits,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        if limits.is_unlimited() {
            return Ok(true);
        }

        let minute = now
            .duration_trunc(chrono::Duration::minutes(1))
            .unwrap_or(now);
        let hour = now.duration_trunc(chrono::Duration::hours(1)).unwrap_or(now);

        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let rows = tx
            .query(
                "SELECT window_kind, window_start, count FROM webhook_rate_windows
                  WHERE endpoint_id = $1 FOR UPDATE",
                &[&endpoint_id.0],
            )
            .await?;
        let mut current: HashMap<String, (DateTime<Utc>, i64)> = rows
            .into_iter()
            .map(|r| (r.get::<_, String>(0), (r.get(1), r.get(2))))
            .collect();

        let minute_count = window_count(&mut current, "minute", minute);
        let hour_count = window_count(&mut current, "hour", hour);

        let minute_ok = limits.per_minute.map_or(true, |l| minute_count < l as i64);
        let hour_ok = limits.per_hour.map_or(true, |l| hour_count < l as i64);
        if !(minute_ok && hour_ok) {
            tx.rollback().await?;
            return Ok(false);
        }

        for (kind, start, count) in [
            ("minute", minute, minute_count + 1),
            ("hour", hour, hour_count + 1),
        ] {
            tx.execute(
                "INSERT INTO webhook_rate_windows (endpoint_id, window_kind, window_start, count)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (endpoint_id, window_kind) DO UPDATE SET
                    window_start = EXCLUDED.window_start,
                    count = EXCLUDED.count",
                &[&endpoint_id.0, &kind, &start, &count],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

/// Count already consumed in the current window; a stored row from an
/// older window counts as zero.
fn window_count(
    current: &mut HashMap<String, (DateTime<Utc>, i64)>,
    kind: &str,
    start: DateTime<Utc>,
) -> i64 {
    match current.remove(kind) {
        Some((stored_start, count)) if stored_start == start => count,
        _ => 0,
    }
}
