use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use webhook_courier::{
    signing, AttemptFailure, AttemptTiming, DeliveryEngine, DeliveryRequest, DeliverySender,
    DeliveryStatus, EndpointConfig, EndpointId, EndpointRegistry, EndpointStatus, EngineConfig,
    EventCatalog, EventEmitter, EventStore, EventTypeDefinition, FilterOperator, FilterRule,
    InMemoryStore, OriginContext, ResponseSnapshot, RetryStrategy, SecretMaterial, SendOutcome,
    Store, WebhookDelivery,
};

/// Sender that replays a scripted sequence of outcomes and records every
/// request it was asked to send. Once the script is exhausted it answers 200.
struct ScriptedSender {
    script: Mutex<VecDeque<Result<u16, AttemptFailure>>>,
    requests: Mutex<Vec<DeliveryRequest>>,
}

impl ScriptedSender {
    fn new(script: Vec<Result<u16, AttemptFailure>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    async fn recorded_requests(&self) -> Vec<DeliveryRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl DeliverySender for ScriptedSender {
    async fn send(&self, request: &DeliveryRequest) -> SendOutcome {
        self.requests.lock().await.push(request.clone());
        let next = self.script.lock().await.pop_front().unwrap_or(Ok(200));
        let result = match next {
            Ok(status) => Ok(ResponseSnapshot {
                status,
                headers: vec![],
                body: String::new(),
            }),
            Err(failure) => Err(failure),
        };
        SendOutcome {
            result,
            timing: AttemptTiming::total_only(Duration::from_millis(1)),
        }
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    registry: EndpointRegistry,
    emitter: EventEmitter,
    engine: DeliveryEngine,
    sender: Arc<ScriptedSender>,
}

async fn harness(script: Vec<Result<u16, AttemptFailure>>) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let catalog = Arc::new(EventCatalog::new());
    catalog
        .register(EventTypeDefinition::new("customer.created", "customer"))
        .await
        .unwrap();

    let sender = ScriptedSender::new(script);
    let config = EngineConfig {
        worker_count: 2,
        poll_interval: Duration::from_millis(10),
        claim_batch: 8,
        lease_duration: Duration::from_secs(30),
        rate_limit_defer: Duration::from_secs(60),
    };
    let engine = DeliveryEngine::new(config, store.clone() as Arc<dyn Store>, sender.clone());

    let registry = EndpointRegistry::new(store.clone() as Arc<dyn Store>, catalog.clone());
    let emitter = EventEmitter::new(store.clone() as Arc<dyn Store>, catalog.clone())
        .with_wakeup(engine.wake_handle());

    Harness {
        store,
        registry,
        emitter,
        engine,
        sender,
    }
}

/// Endpoint that retries fast enough for tests.
fn fast_endpoint() -> EndpointConfig {
    EndpointConfig::new("https://receiver.example.com/hook").with_retry_policy(
        RetryStrategy::FixedInterval,
        5,
        Duration::from_millis(20),
    )
}

/// Poll the endpoint's delivery history until the predicate holds.
async fn wait_for_deliveries<F>(registry: &EndpointRegistry, endpoint: EndpointId, predicate: F)
where
    F: Fn(&[WebhookDelivery]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let deliveries = registry.deliveries(endpoint).await.unwrap();
        if predicate(&deliveries) {
            return;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn first_has_status(deliveries: &[WebhookDelivery], status: DeliveryStatus) -> bool {
    deliveries.first().map_or(false, |d| d.status == status)
}

#[tokio::test]
async fn emit_creates_one_pending_delivery_per_subscriber() {
    let h = harness(vec![]).await;
    let endpoint = h.registry.create(fast_endpoint()).await.unwrap();
    h.registry
        .subscribe(endpoint.id, "customer.created")
        .await
        .unwrap();

    h.emitter
        .emit(
            "customer.created",
            json!({"id": 42, "email": "a@b.com"}),
            OriginContext::default(),
        )
        .await
        .unwrap();

    let deliveries = h.registry.deliveries(endpoint.id).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Pending);
    assert_eq!(deliveries[0].attempt_count, 0);
}

#[tokio::test]
async fn transient_failure_then_success_is_delivered_with_two_attempts() {
    let mut h = harness(vec![Ok(500), Ok(200)]).await;
    let endpoint = h.registry.create(fast_endpoint()).await.unwrap();
    h.registry
        .subscribe(endpoint.id, "customer.created")
        .await
        .unwrap();

    h.engine.start();
    h.emitter
        .emit("customer.created", json!({"id": 1}), OriginContext::default())
        .await
        .unwrap();

    wait_for_deliveries(&h.registry, endpoint.id, |d| {
        first_has_status(d, DeliveryStatus::Delivered)
    })
    .await;

    let delivery = h.registry.deliveries(endpoint.id).await.unwrap().remove(0);
    assert_eq!(delivery.attempt_count, 2);
    assert_eq!(delivery.next_retry_at, None);
    assert!(delivery.delivered_at.is_some());

    let attempts = h.registry.attempts(delivery.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].success);
    assert_eq!(attempts[0].error, Some(AttemptFailure::HttpStatus(500)));
    assert!(attempts[1].success);
    assert_eq!(attempts[1].attempt_number, 2);

    let stats = h.registry.stats(endpoint.id).await.unwrap();
    assert_eq!(stats.successful_deliveries, 1);
    assert_eq!(stats.failed_deliveries, 0);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn exhausted_attempts_abandon_the_delivery() {
    let mut h = harness(vec![
        Err(AttemptFailure::Timeout),
        Err(AttemptFailure::Timeout),
        Err(AttemptFailure::Timeout),
    ])
    .await;

    let endpoint = h
        .registry
        .create(fast_endpoint().with_retry_policy(
            RetryStrategy::Immediate,
            3,
            Duration::from_millis(1),
        ))
        .await
        .unwrap();
    h.registry
        .subscribe(endpoint.id, "customer.created")
        .await
        .unwrap();

    h.engine.start();
    h.emitter
        .emit("customer.created", json!({"id": 2}), OriginContext::default())
        .await
        .unwrap();

    wait_for_deliveries(&h.registry, endpoint.id, |d| {
        first_has_status(d, DeliveryStatus::Abandoned)
    })
    .await;

    // Settle window: no fourth attempt may ever run.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let delivery = h.registry.deliveries(endpoint.id).await.unwrap().remove(0);
    assert_eq!(delivery.attempt_count, 3);
    assert_eq!(delivery.max_attempts, 3);
    assert_eq!(delivery.next_retry_at, None);

    let attempts = h.registry.attempts(delivery.id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| !a.success));
    assert!(attempts
        .iter()
        .all(|a| a.error == Some(AttemptFailure::Timeout)));

    let stats = h.registry.stats(endpoint.id).await.unwrap();
    assert_eq!(stats.failed_deliveries, 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn non_matching_filter_schedules_no_delivery() {
    let h = harness(vec![]).await;
    let endpoint = h
        .registry
        .create(fast_endpoint().with_filters(vec![FilterRule::new(
            "status",
            FilterOperator::Equals(json!("vip")),
        )]))
        .await
        .unwrap();
    h.registry
        .subscribe(endpoint.id, "customer.created")
        .await
        .unwrap();

    let event = h
        .emitter
        .emit(
            "customer.created",
            json!({"status": "regular"}),
            OriginContext::default(),
        )
        .await
        .unwrap();

    assert!(h.registry.deliveries(endpoint.id).await.unwrap().is_empty());

    // The audit record exists regardless of fan-out.
    let stored = h.store.get_event(event.id).await.unwrap().unwrap();
    assert!(stored.is_processed);
}

#[tokio::test]
async fn exclusion_filter_inverts_the_decision() {
    let h = harness(vec![]).await;
    let endpoint = h
        .registry
        .create(fast_endpoint().with_filters(vec![FilterRule::new(
            "status",
            FilterOperator::Equals(json!("vip")),
        )
        .excluding()]))
        .await
        .unwrap();
    h.registry
        .subscribe(endpoint.id, "customer.created")
        .await
        .unwrap();

    h.emitter
        .emit(
            "customer.created",
            json!({"status": "vip"}),
            OriginContext::default(),
        )
        .await
        .unwrap();
    assert!(h.registry.deliveries(endpoint.id).await.unwrap().is_empty());

    h.emitter
        .emit(
            "customer.created",
            json!({"status": "regular"}),
            OriginContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(h.registry.deliveries(endpoint.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn client_errors_fail_terminally_without_retries() {
    let mut h = harness(vec![Ok(404)]).await;
    let endpoint = h.registry.create(fast_endpoint()).await.unwrap();
    h.registry
        .subscribe(endpoint.id, "customer.created")
        .await
        .unwrap();

    h.engine.start();
    h.emitter
        .emit("customer.created", json!({"id": 3}), OriginContext::default())
        .await
        .unwrap();

    wait_for_deliveries(&h.registry, endpoint.id, |d| {
        first_has_status(d, DeliveryStatus::Failed)
    })
    .await;

    let delivery = h.registry.deliveries(endpoint.id).await.unwrap().remove(0);
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(delivery.next_retry_at, None);
    assert_eq!(h.registry.attempts(delivery.id).await.unwrap().len(), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn client_errors_can_be_retried_by_policy() {
    let mut h = harness(vec![Ok(404), Ok(200)]).await;
    let endpoint = h
        .registry
        .create(fast_endpoint().with_retry_client_errors(true))
        .await
        .unwrap();
    h.registry
        .subscribe(endpoint.id, "customer.created")
        .await
        .unwrap();

    h.engine.start();
    h.emitter
        .emit("customer.created", json!({"id": 4}), OriginContext::default())
        .await
        .unwrap();

    wait_for_deliveries(&h.registry, endpoint.id, |d| {
        first_has_status(d, DeliveryStatus::Delivered)
    })
    .await;

    let delivery = h.registry.deliveries(endpoint.id).await.unwrap().remove(0);
    assert_eq!(delivery.attempt_count, 2);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn signature_header_verifies_against_sent_body() {
    let mut h = harness(vec![Ok(200)]).await;
    let secret = SecretMaterial::new("primary", b"whsec_abc".to_vec());
    let endpoint = h
        .registry
        .create(fast_endpoint().with_secret(secret))
        .await
        .unwrap();
    h.registry
        .subscribe(endpoint.id, "customer.created")
        .await
        .unwrap();

    h.engine.start();
    h.emitter
        .emit(
            "customer.created",
            json!({"id": 42, "email": "a@b.com"}),
            OriginContext::default(),
        )
        .await
        .unwrap();

    wait_for_deliveries(&h.registry, endpoint.id, |d| {
        first_has_status(d, DeliveryStatus::Delivered)
    })
    .await;

    let requests = h.sender.recorded_requests().await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    let signature = header("X-Webhook-Signature");
    let timestamp = header("X-Webhook-Timestamp");

    assert!(signing::verify_signature(
        b"whsec_abc",
        webhook_courier::SignatureAlgorithm::HmacSha256,
        webhook_courier::SignatureEncoding::Hex,
        &request.body,
        Some(&timestamp),
        &signature,
    ));

    // The envelope carries the dedup key and the original payload.
    let envelope: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert!(envelope.get("event_id").is_some());
    assert_eq!(envelope["event_type"], "customer.created");
    assert_eq!(envelope["payload"]["id"], 42);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn inactive_endpoints_receive_no_new_deliveries() {
    let h = harness(vec![]).await;
    let endpoint = h.registry.create(fast_endpoint()).await.unwrap();
    h.registry
        .subscribe(endpoint.id, "customer.created")
        .await
        .unwrap();
    h.registry
        .set_status(endpoint.id, EndpointStatus::Inactive)
        .await
        .unwrap();

    h.emitter
        .emit("customer.created", json!({"id": 5}), OriginContext::default())
        .await
        .unwrap();

    assert!(h.registry.deliveries(endpoint.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_event_types_fail_loudly() {
    let h = harness(vec![]).await;
    let err = h
        .emitter
        .emit("billing.unknown", json!({}), OriginContext::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        webhook_courier::EmitError::UnknownEventType { .. }
    ));
}

#[tokio::test]
async fn rate_limited_attempts_are_deferred_without_consuming_a_slot() {
    let mut h = harness(vec![Ok(200), Ok(200)]).await;
    let endpoint = h
        .registry
        .create(fast_endpoint().with_rate_limits(None, Some(1)))
        .await
        .unwrap();
    h.registry
        .subscribe(endpoint.id, "customer.created")
        .await
        .unwrap();

    h.engine.start();
    for id in 0..2 {
        h.emitter
            .emit("customer.created", json!({"id": id}), OriginContext::default())
            .await
            .unwrap();
    }

    wait_for_deliveries(&h.registry, endpoint.id, |d| {
        d.iter()
            .filter(|d| d.status == DeliveryStatus::Delivered)
            .count()
            == 1
    })
    .await;

    // Let the other delivery hit the limiter and get deferred.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let deliveries = h.registry.deliveries(endpoint.id).await.unwrap();
    let deferred: Vec<&WebhookDelivery> = deliveries
        .iter()
        .filter(|d| d.status != DeliveryStatus::Delivered)
        .collect();
    assert_eq!(deferred.len(), 1);
    assert_eq!(
        deferred[0].attempt_count, 0,
        "deferral must not consume an attempt"
    );
    assert!(deferred[0].next_retry_at.is_some());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn fan_out_reaches_every_matching_endpoint() {
    let mut h = harness(vec![]).await;
    let a = h.registry.create(fast_endpoint()).await.unwrap();
    let b = h
        .registry
        .create(EndpointConfig::new("https://other.example.com/hook"))
        .await
        .unwrap();
    h.registry.subscribe(a.id, "customer.created").await.unwrap();
    h.registry.subscribe(b.id, "customer.created").await.unwrap();

    h.engine.start();
    h.emitter
        .emit("customer.created", json!({"id": 6}), OriginContext::default())
        .await
        .unwrap();

    for endpoint in [a.id, b.id] {
        wait_for_deliveries(&h.registry, endpoint, |d| {
            d.len() == 1 && first_has_status(d, DeliveryStatus::Delivered)
        })
        .await;
    }

    h.engine.shutdown().await;
}
