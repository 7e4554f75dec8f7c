//! Minimal end-to-end wiring: catalog, registry, emitter, engine.
//!
//!     cargo run --example basic

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use webhook_courier::{
    DeliveryEngine, EndpointConfig, EndpointRegistry, EngineConfig, EventCatalog, EventEmitter,
    EventTypeDefinition, HttpSender, InMemoryStore, OriginContext, RetryStrategy, SecretMaterial,
    Store,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let catalog = Arc::new(EventCatalog::new());

    catalog
        .register(EventTypeDefinition::new("customer.created", "customer"))
        .await?;

    let registry = EndpointRegistry::new(store.clone(), catalog.clone());
    let endpoint = registry
        .create(
            EndpointConfig::new("https://webhook.site/your-receiver")
                .with_secret(SecretMaterial::new("primary", b"whsec_demo".to_vec()))
                .with_retry_policy(RetryStrategy::ExponentialBackoff, 3, Duration::from_secs(2)),
        )
        .await?;
    registry.subscribe(endpoint.id, "customer.created").await?;

    let mut engine = DeliveryEngine::new(
        EngineConfig::default(),
        store.clone(),
        Arc::new(HttpSender::new()),
    );
    let emitter =
        EventEmitter::new(store, catalog).with_wakeup(engine.wake_handle());
    engine.start();

    let event = emitter
        .emit(
            "customer.created",
            json!({"id": 42, "email": "a@b.com"}),
            OriginContext::default(),
        )
        .await?;
    println!("emitted event {}", event.id);

    tokio::time::sleep(Duration::from_secs(10)).await;

    for delivery in registry.deliveries(endpoint.id).await? {
        println!(
            "delivery {} -> {} after {} attempt(s)",
            delivery.id, delivery.status, delivery.attempt_count
        );
        for attempt in registry.attempts(delivery.id).await? {
            println!(
                "  attempt {}: success={} error={:?}",
                attempt.attempt_number, attempt.success, attempt.error
            );
        }
    }

    engine.shutdown().await;
    Ok(())
}
