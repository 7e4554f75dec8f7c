//! Delivery engine: a pool of workers driving the per-delivery retry
//! state machine.
//!
//! Workers poll the store for due deliveries through an atomic
//! claim-and-lease, execute one HTTP attempt each, append the attempt row,
//! and write back the resulting state transition. Attempts within one
//! delivery are strictly sequential (the lease guarantees exclusivity);
//! deliveries across endpoints proceed in parallel with no ordering.
//!
//! Leases also give crash recovery: a delivery claimed by a worker that
//! died becomes reclaimable once its lease expires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::AttemptFailure;
use crate::retry;
use crate::signing::build_signature_headers;
use crate::storage::Store;
use crate::transport::{DeliveryRequest, DeliverySender};
use crate::types::{
    truncate_body, AttemptId, DeliveryAttempt, DeliveryEnvelope, DeliveryStatus, EndpointConfig,
    RequestSnapshot, ResponseSnapshot, WebhookDelivery,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// How long an idle worker waits before re-polling the store. The
    /// emitter's wakeup handle short-circuits this wait.
    pub poll_interval: Duration,

    /// Maximum deliveries claimed per poll.
    pub claim_batch: usize,

    /// Claim lease length. Must comfortably exceed the slowest endpoint
    /// timeout, or a slow attempt can be double-delivered by a reclaim.
    pub lease_duration: Duration,

    /// Reschedule distance for attempts deferred by rate limiting.
    pub rate_limit_defer: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            poll_interval: Duration::from_secs(1),
            claim_batch: 16,
            lease_duration: Duration::from_secs(120),
            rate_limit_defer: Duration::from_secs(5),
        }
    }
}

struct WorkerContext {
    store: Arc<dyn Store>,
    sender: Arc<dyn DeliverySender>,
    config: EngineConfig,
    is_running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

pub struct DeliveryEngine {
    ctx: Arc<WorkerContext>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl DeliveryEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        sender: Arc<dyn DeliverySender>,
    ) -> Self {
        let ctx = Arc::new(WorkerContext {
            store,
            sender,
            config,
            is_running: Arc::new(AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
        });
        Self {
            ctx,
            worker_handles: Vec::new(),
        }
    }

    /// Handle used to wake idle workers when new deliveries are scheduled.
    /// Pass to [`EventEmitter::with_wakeup`](crate::EventEmitter::with_wakeup).
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.ctx.notify.clone()
    }

    /// Spawn the worker pool.
    pub fn start(&mut self) {
        for _ in 0..self.ctx.config.worker_count.max(1) {
            self.worker_handles.push(tokio::spawn(worker_loop(self.ctx.clone())));
        }
    }

    pub fn is_running(&self) -> bool {
        self.ctx.is_running.load(Ordering::SeqCst)
    }

    /// Stop claiming new work and wait for in-flight attempts to finish
    /// and write back. Attempts already executing are not aborted.
    pub async fn shutdown(&mut self) {
        self.ctx.is_running.store(false, Ordering::SeqCst);
        self.ctx.notify.notify_waiters();
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>) {
    loop {
        if !ctx.is_running.load(Ordering::SeqCst) {
            break;
        }

        let claimed = match ctx
            .store
            .claim_due(Utc::now(), ctx.config.claim_batch, ctx.config.lease_duration)
            .await
        {
            Ok(claimed) => claimed,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_err, "claim poll failed");
                sleep(ctx.config.poll_interval).await;
                continue;
            }
        };

        if claimed.is_empty() {
            tokio::select! {
                _ = ctx.notify.notified() => {}
                _ = sleep(ctx.config.poll_interval) => {}
            }
            continue;
        }

        for delivery in claimed {
            process_delivery(delivery, &ctx).await;
        }
    }
}

enum AttemptResult {
    Success(ResponseSnapshot),
    Failure {
        response: Option<ResponseSnapshot>,
        failure: AttemptFailure,
    },
}

/// Execute one attempt for a claimed delivery and write back the state
/// transition. Errors here are contained to this delivery.
async fn process_delivery(mut delivery: WebhookDelivery, ctx: &WorkerContext) {
    let now = Utc::now();

    let endpoint = match ctx.store.get_endpoint(delivery.endpoint_id).await {
        Ok(Some(endpoint)) => endpoint,
        Ok(None) => {
            // The endpoint was deleted under an in-flight delivery.
            fail_terminally(&mut delivery, "endpoint no longer exists", ctx).await;
            return;
        }
        Err(_err) => {
            release_lease(&mut delivery, ctx).await;
            return;
        }
    };

    match ctx
        .store
        .try_consume_rate(endpoint.id, endpoint.rate_limits, now)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            // Deferral does not consume an attempt slot.
            metric_inc("webhook.delivery.rate_deferred");
            delivery.next_retry_at = Some(retry::after(now, ctx.config.rate_limit_defer));
            release_lease(&mut delivery, ctx).await;
            return;
        }
        Err(_err) => {
            release_lease(&mut delivery, ctx).await;
            return;
        }
    }

    let event = match ctx.store.get_event(delivery.event_id).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            fail_terminally(&mut delivery, "event record no longer exists", ctx).await;
            return;
        }
        Err(_err) => {
            release_lease(&mut delivery, ctx).await;
            return;
        }
    };

    let envelope = DeliveryEnvelope::from_event(&event);
    let body = match envelope.canonical_bytes() {
        Ok(body) => body,
        Err(err) => {
            fail_terminally(&mut delivery, &format!("payload serialization: {err}"), ctx).await;
            return;
        }
    };

    let request = build_request(&endpoint, body, now);
    let request_snapshot = RequestSnapshot {
        url: request.url.clone(),
        method: request.method,
        headers: request.headers.clone(),
        body: truncate_body(&request.body),
    };

    let outcome = ctx.sender.send(&request).await;
    let attempt_number = delivery.attempt_count + 1;

    let result = match outcome.result {
        Ok(response) if (200..300).contains(&response.status) => AttemptResult::Success(response),
        Ok(response) => {
            let failure = AttemptFailure::HttpStatus(response.status);
            AttemptResult::Failure {
                response: Some(response),
                failure,
            }
        }
        Err(failure) => AttemptResult::Failure {
            response: None,
            failure,
        },
    };

    // The attempt row is appended unconditionally, success or failure,
    // including the final attempt before abandonment.
    let attempt = DeliveryAttempt {
        id: AttemptId::new(),
        delivery_id: delivery.id,
        attempt_number,
        started_at: now,
        request: request_snapshot.clone(),
        response: match &result {
            AttemptResult::Success(response) => Some(response.clone()),
            AttemptResult::Failure { response, .. } => response.clone(),
        },
        timing: outcome.timing,
        error: match &result {
            AttemptResult::Success(_) => None,
            AttemptResult::Failure { failure, .. } => Some(*failure),
        },
        success: matches!(result, AttemptResult::Success(_)),
    };
    if let Err(_err) = ctx.store.record_attempt(&attempt).await {
        #[cfg(feature = "tracing")]
        tracing::error!(delivery_id = %delivery.id, error = %_err, "failed to record attempt");
    }

    delivery.attempt_count = attempt_number;
    delivery.last_request = Some(request_snapshot);
    delivery.lease_until = None;

    match result {
        AttemptResult::Success(response) => {
            metric_inc("webhook.delivery.delivered");
            delivery.last_response = Some(response);
            delivery.status = DeliveryStatus::Delivered;
            delivery.delivered_at = Some(Utc::now());
            delivery.next_retry_at = None;
            delivery.error_message = None;
            record_outcome(ctx, &delivery, true).await;
        }
        AttemptResult::Failure { response, failure } => {
            delivery.last_response = response;
            delivery.error_message = Some(failure.to_string());

            if delivery.attempt_count >= delivery.max_attempts {
                metric_inc("webhook.delivery.abandoned");
                delivery.status = DeliveryStatus::Abandoned;
                delivery.next_retry_at = None;
                record_outcome(ctx, &delivery, false).await;
            } else if !failure.is_retryable(endpoint.retry_client_errors) {
                metric_inc("webhook.delivery.failed");
                delivery.status = DeliveryStatus::Failed;
                delivery.next_retry_at = None;
                record_outcome(ctx, &delivery, false).await;
            } else {
                metric_inc("webhook.delivery.retry_scheduled");
                delivery.status = DeliveryStatus::Retrying;
                let delay = retry::retry_delay(
                    endpoint.retry_strategy,
                    delivery.attempt_count,
                    endpoint.retry_delay,
                    endpoint.retry_delay_cap,
                ) + retry::jitter(endpoint.retry_jitter);
                delivery.next_retry_at = Some(retry::after(Utc::now(), delay));
            }
        }
    }

    let immediate_retry =
        delivery.status == DeliveryStatus::Retrying && delivery.due_at() <= Utc::now();

    if let Err(_err) = ctx.store.update_delivery(&delivery).await {
        #[cfg(feature = "tracing")]
        tracing::error!(delivery_id = %delivery.id, error = %_err, "failed to write back delivery");
        return;
    }

    if immediate_retry {
        ctx.notify.notify_one();
    }
}

fn build_request(
    endpoint: &EndpointConfig,
    body: Vec<u8>,
    now: chrono::DateTime<Utc>,
) -> DeliveryRequest {
    let mut headers = vec![("Content-Type".to_string(), endpoint.content_type.clone())];
    headers.extend(endpoint.headers.iter().cloned());

    let signature = build_signature_headers(endpoint, &body, now);
    if let Some((name, value)) = signature.signature_header {
        headers.push((name, value));
    }
    if let Some((name, value)) = signature.timestamp_header {
        headers.push((name, value));
    }

    DeliveryRequest {
        url: endpoint.url.clone(),
        method: endpoint.method,
        headers,
        body,
        timeout: endpoint.timeout,
        verify_tls: endpoint.verify_tls,
    }
}

/// Terminal failure without an HTTP attempt (missing endpoint/event,
/// unserializable payload). No attempt slot is consumed and no attempt row
/// is written because no request was made.
async fn fail_terminally(delivery: &mut WebhookDelivery, reason: &str, ctx: &WorkerContext) {
    metric_inc("webhook.delivery.failed");
    delivery.status = DeliveryStatus::Failed;
    delivery.error_message = Some(reason.to_string());
    delivery.next_retry_at = None;
    delivery.lease_until = None;
    if let Err(_err) = ctx.store.update_delivery(delivery).await {
        #[cfg(feature = "tracing")]
        tracing::error!(delivery_id = %delivery.id, error = %_err, "failed to write back delivery");
    }
}

/// Put the delivery back without consuming an attempt (storage hiccup or
/// rate deferral); it becomes claimable again at its due time.
async fn release_lease(delivery: &mut WebhookDelivery, ctx: &WorkerContext) {
    delivery.lease_until = None;
    if let Err(_err) = ctx.store.update_delivery(delivery).await {
        #[cfg(feature = "tracing")]
        tracing::error!(delivery_id = %delivery.id, error = %_err, "failed to release claim");
    }
}

async fn record_outcome(ctx: &WorkerContext, delivery: &WebhookDelivery, success: bool) {
    if let Err(_err) = ctx
        .store
        .record_outcome(delivery.endpoint_id, success)
        .await
    {
        #[cfg(feature = "tracing")]
        tracing::warn!(endpoint_id = %delivery.endpoint_id, error = %_err, "failed to update endpoint counters");
    }
}
