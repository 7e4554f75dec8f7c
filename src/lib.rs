//! An at-least-once webhook delivery engine.
//!
//! This crate is the delivery backbone for a back-office system: business
//! services emit typed events, and the engine pushes them to subscribed
//! HTTP endpoints with conditional filtering, HMAC signing, per-endpoint
//! rate limiting, and bounded retry with backoff.
//!
//! ## Guarantees
//! - Every emitted event is durably recorded before `emit` returns
//! - At-least-once delivery per matching endpoint, up to the attempt ceiling
//! - Strictly sequential attempts within one delivery
//! - Per-delivery failure isolation across endpoints
//! - An append-only attempt log for every HTTP try
//!
//! ## Non-Guarantees
//! - Exactly-once delivery: receivers must deduplicate on `event_id`
//! - Cross-event ordering at the receiver
//!
//! Delivery state lives behind the [`storage`] interfaces, so any worker
//! can pick up due retries after a crash; nothing depends on in-process
//! queues surviving a restart.

mod catalog;
mod emitter;
mod engine;
mod error;
pub mod filter;
mod registry;
mod retry;
pub mod signing;
pub mod storage;
mod transport;
mod types;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use catalog::EventCatalog;
pub use emitter::EventEmitter;
pub use engine::{DeliveryEngine, EngineConfig};
pub use error::{AttemptFailure, EmitError, RegistryError, StorageError};
pub use filter::{FilterConjunction, FilterOperator, FilterRule};
pub use registry::EndpointRegistry;
pub use retry::retry_delay;
pub use storage::{
    AttemptStore, DeliveryStore, EndpointStore, EventStore, InMemoryStore, RateLimitStore, Store,
};
pub use transport::{DeliveryRequest, DeliverySender, HttpSender, SendOutcome};
pub use types::{
    AttemptId, AttemptTiming, DeliveryAttempt, DeliveryEnvelope, DeliveryId, DeliveryStatus,
    MAX_SNAPSHOT_BODY_BYTES,
    EndpointConfig, EndpointId, EndpointStats, EndpointStatus, EndpointSubscription, EventId,
    EventTypeDefinition, HttpMethod, OriginContext, RateLimits, RequestSnapshot, ResponseSnapshot,
    RetryStrategy, SecretId, SecretMaterial, SignatureAlgorithm, SignatureEncoding, WebhookDelivery,
    WebhookEvent,
};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;
