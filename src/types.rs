use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::filter::{FilterConjunction, FilterRule};

/// Bodies stored in request/response snapshots are truncated to this size.
pub const MAX_SNAPSHOT_BODY_BYTES: usize = 4096;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Unique identifier for a persisted event.
    EventId
);
id_newtype!(
    /// Unique identifier for a registered endpoint.
    EndpointId
);
id_newtype!(
    /// Unique identifier for a delivery (one event x one endpoint).
    DeliveryId
);
id_newtype!(
    /// Unique identifier for a single delivery attempt.
    AttemptId
);
id_newtype!(
    /// Unique identifier for a signing secret.
    SecretId
);

/// Definition of a named class of business occurrence (e.g. `customer.created`).
///
/// Definitions are registered once through the catalog and treated as
/// immutable once live events reference them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTypeDefinition {
    /// Unique dotted name, e.g. `invoice.paid`.
    pub name: String,

    /// Grouping label for operator UIs (e.g. `billing`, `ticketing`).
    pub category: String,

    /// Whether subscribing to this event type requires an authenticated caller.
    pub auth_required: bool,

    /// Informational JSON schema describing the payload shape.
    pub payload_schema: Option<Value>,

    /// Ceiling on retry attempts for deliveries of this event type.
    /// The effective per-delivery maximum is the smaller of this and the
    /// endpoint's own limit.
    pub max_retry_ceiling: u32,
}

impl EventTypeDefinition {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            auth_required: false,
            payload_schema: None,
            max_retry_ceiling: 10,
        }
    }

    pub fn with_auth_required(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    pub fn with_payload_schema(mut self, schema: Value) -> Self {
        self.payload_schema = Some(schema);
        self
    }

    pub fn with_max_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.max_retry_ceiling = ceiling;
        self
    }
}

/// HTTP method used for delivery requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HMAC algorithm used to compute the signature header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    HmacSha256,
    HmacSha512,
    /// Legacy receivers only.
    HmacSha1,
}

/// Encoding applied to the raw HMAC bytes before they are sent in a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

/// Policy governing delay growth between successive retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `base * 2^(attempt-1)`, capped.
    ExponentialBackoff,
    /// `base * attempt`.
    LinearBackoff,
    /// `base` every time.
    FixedInterval,
    /// Retry with no delay, still bounded by the attempt ceiling.
    Immediate,
    /// Never retry: the first failure is final.
    None,
}

/// Administrative lifecycle state of an endpoint.
///
/// Anything other than `Active` stops *new* deliveries from being scheduled;
/// deliveries already in flight complete or abandon normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Active,
    Inactive,
    Disabled,
    /// Marked by an operator after persistent delivery failures.
    Failed,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Disabled => write!(f, "disabled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-endpoint delivery rate limits, enforced as fixed windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
}

impl RateLimits {
    pub fn is_unlimited(&self) -> bool {
        self.per_minute.is_none() && self.per_hour.is_none()
    }
}

/// A named signing secret attached to an endpoint.
///
/// Several secrets may coexist during rotation; only active, unexpired
/// secrets are eligible for signing new deliveries. Historical attempt
/// records keep the signatures they were sent with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretMaterial {
    pub id: SecretId,
    pub label: String,
    pub key: Vec<u8>,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SecretMaterial {
    pub fn new(label: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            id: SecretId::new(),
            label: label.into(),
            key: key.into(),
            active: true,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether this secret may be used to sign a delivery right now.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Destination configuration for webhook delivery.
///
/// An `EndpointConfig` describes *where* and *how* events should be
/// delivered. It is pure configuration; delivery state lives in
/// [`WebhookDelivery`] rows and per-endpoint counters live in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: EndpointId,

    /// Target URL. Must be http or https.
    pub url: String,

    pub method: HttpMethod,

    /// Content type of the delivery body.
    pub content_type: String,

    /// Extra headers sent with every delivery.
    pub headers: Vec<(String, String)>,

    /// Signing secrets. Empty means deliveries are sent unsigned.
    pub secrets: Vec<SecretMaterial>,

    pub signature_algorithm: SignatureAlgorithm,
    pub signature_encoding: SignatureEncoding,

    /// Signature header name.
    pub signature_header: String,

    /// Timestamp header name.
    pub timestamp_header: String,

    /// Whether to fold a timestamp into the signature.
    pub include_timestamp: bool,

    /// Whether to verify the receiver's TLS certificate.
    pub verify_tls: bool,

    /// Maximum time allowed for a single delivery attempt.
    pub timeout: Duration,

    pub retry_strategy: RetryStrategy,

    /// Ceiling on attempts per delivery, further bounded by the event
    /// type's own ceiling.
    pub max_retry_attempts: u32,

    /// Base delay fed into the retry strategy.
    pub retry_delay: Duration,

    /// Upper bound on any single computed backoff delay.
    pub retry_delay_cap: Duration,

    /// Random jitter added on top of the computed delay.
    pub retry_jitter: Duration,

    /// Retry 4xx responses instead of failing the delivery terminally.
    /// 429 is always retried regardless of this flag.
    pub retry_client_errors: bool,

    pub status: EndpointStatus,

    pub rate_limits: RateLimits,

    /// When false, filters are ignored and every subscribed event matches.
    pub filters_enabled: bool,

    pub filter_conjunction: FilterConjunction,

    pub filters: Vec<FilterRule>,
}

impl EndpointConfig {
    /// Create an endpoint with default delivery settings.
    ///
    /// Defaults:
    /// - method: POST, content type: application/json
    /// - timeout: 30 seconds
    /// - retry: exponential backoff, 5 attempts, 60s base, 1h cap
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: EndpointId::new(),
            url: url.into(),
            method: HttpMethod::Post,
            content_type: "application/json".to_string(),
            headers: Vec::new(),
            secrets: Vec::new(),
            signature_algorithm: SignatureAlgorithm::HmacSha256,
            signature_encoding: SignatureEncoding::Hex,
            signature_header: "X-Webhook-Signature".to_string(),
            timestamp_header: "X-Webhook-Timestamp".to_string(),
            include_timestamp: true,
            verify_tls: true,
            timeout: Duration::from_secs(30),
            retry_strategy: RetryStrategy::ExponentialBackoff,
            max_retry_attempts: 5,
            retry_delay: Duration::from_secs(60),
            retry_delay_cap: Duration::from_secs(3600),
            retry_jitter: Duration::ZERO,
            retry_client_errors: false,
            status: EndpointStatus::Active,
            rate_limits: RateLimits::default(),
            filters_enabled: true,
            filter_conjunction: FilterConjunction::All,
            filters: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_secret(mut self, secret: SecretMaterial) -> Self {
        self.secrets.push(secret);
        self
    }

    pub fn with_signature_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.signature_algorithm = algorithm;
        self
    }

    pub fn with_signature_encoding(mut self, encoding: SignatureEncoding) -> Self {
        self.signature_encoding = encoding;
        self
    }

    pub fn with_signature_header(mut self, header: impl Into<String>) -> Self {
        self.signature_header = header.into();
        self
    }

    pub fn with_timestamped_signatures(mut self, include: bool) -> Self {
        self.include_timestamp = include;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tls_verification(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_retry_policy(
        mut self,
        strategy: RetryStrategy,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Self {
        self.retry_strategy = strategy;
        self.max_retry_attempts = max_attempts;
        self.retry_delay = base_delay;
        self
    }

    pub fn with_retry_delay_cap(mut self, cap: Duration) -> Self {
        self.retry_delay_cap = cap;
        self
    }

    pub fn with_retry_jitter(mut self, jitter: Duration) -> Self {
        self.retry_jitter = jitter;
        self
    }

    pub fn with_retry_client_errors(mut self, retry: bool) -> Self {
        self.retry_client_errors = retry;
        self
    }

    pub fn with_rate_limits(mut self, per_minute: Option<u32>, per_hour: Option<u32>) -> Self {
        self.rate_limits = RateLimits { per_minute, per_hour };
        self
    }

    pub fn with_status(mut self, status: EndpointStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_filters(mut self, filters: Vec<FilterRule>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_filter_conjunction(mut self, conjunction: FilterConjunction) -> Self {
        self.filter_conjunction = conjunction;
        self
    }

    pub fn with_filters_enabled(mut self, enabled: bool) -> Self {
        self.filters_enabled = enabled;
        self
    }

    /// Whether new deliveries may be scheduled against this endpoint.
    pub fn accepts_deliveries(&self) -> bool {
        self.status == EndpointStatus::Active
    }

    /// First secret eligible for signing, if any.
    pub fn signing_secret(&self, now: DateTime<Utc>) -> Option<&SecretMaterial> {
        self.secrets.iter().find(|s| s.is_eligible(now))
    }
}

/// Explicit association between an endpoint and an event type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointSubscription {
    pub endpoint_id: EndpointId,
    pub event_type: String,
}

/// Who or what triggered an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginContext {
    pub user_id: Option<String>,
    pub customer_id: Option<String>,
    pub source_ip: Option<String>,
}

/// Immutable record of something that happened.
///
/// Created once by the emitter; the only permitted mutation is flipping
/// `is_processed` after fan-out completes. The event row exists even when
/// zero endpoints match, as the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: EventId,
    pub event_type: String,
    pub payload: Value,
    pub metadata: Option<Value>,
    pub origin: OriginContext,
    pub occurred_at: DateTime<Utc>,
    pub is_processed: bool,
}

/// JSON body sent to receivers. `event_id` is the stable dedup key for
/// at-least-once consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub event_id: EventId,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
}

impl DeliveryEnvelope {
    pub fn from_event(event: &WebhookEvent) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type.clone(),
            occurred_at: event.occurred_at,
            payload: event.payload.clone(),
        }
    }

    /// Canonical bytes the signature is computed over.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Delivered,
    /// Terminal: the receiver rejected the delivery with a non-retryable error.
    Failed,
    /// Terminal: all retry attempts exhausted.
    Abandoned,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Abandoned)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Retrying => write!(f, "retrying"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Snapshot of an outgoing request, stored with deliveries and attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    /// Truncated to [`MAX_SNAPSHOT_BODY_BYTES`].
    pub body: String,
}

/// Snapshot of a receiver's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Truncated to [`MAX_SNAPSHOT_BODY_BYTES`].
    pub body: String,
}

/// Truncate a body for snapshot storage.
pub fn truncate_body(body: &[u8]) -> String {
    let slice = if body.len() > MAX_SNAPSHOT_BODY_BYTES {
        &body[..MAX_SNAPSHOT_BODY_BYTES]
    } else {
        body
    };
    String::from_utf8_lossy(slice).into_owned()
}

/// One attempt-tracked unit of work: push one event to one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub event_id: EventId,
    pub endpoint_id: EndpointId,
    pub status: DeliveryStatus,

    /// Attempts executed so far. Never exceeds `max_attempts`.
    pub attempt_count: u32,
    pub max_attempts: u32,

    pub scheduled_at: DateTime<Utc>,

    /// Next due time while retrying; cleared once terminal.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Worker claim lease. A delivery with an unexpired lease is owned by
    /// exactly one worker; expired leases make crashed work reclaimable.
    pub lease_until: Option<DateTime<Utc>>,

    pub last_request: Option<RequestSnapshot>,
    pub last_response: Option<ResponseSnapshot>,
    pub error_message: Option<String>,

    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn new(
        event_id: EventId,
        endpoint_id: EndpointId,
        max_attempts: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            event_id,
            endpoint_id,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            max_attempts,
            scheduled_at,
            next_retry_at: None,
            lease_until: None,
            last_request: None,
            last_response: None,
            error_message: None,
            delivered_at: None,
            created_at: scheduled_at,
        }
    }

    /// The instant this delivery becomes due.
    pub fn due_at(&self) -> DateTime<Utc> {
        self.next_retry_at.unwrap_or(self.scheduled_at)
    }
}

/// Timing breakdown of one HTTP attempt.
///
/// `total` is always measured; the phase timings are populated when the
/// transport can observe them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptTiming {
    pub dns: Option<Duration>,
    pub connect: Option<Duration>,
    pub tls: Option<Duration>,
    pub total: Duration,
}

impl AttemptTiming {
    pub fn total_only(total: Duration) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }
}

/// Append-only log row for a single HTTP try within a delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: AttemptId,
    pub delivery_id: DeliveryId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub timing: AttemptTiming,
    pub error: Option<crate::error::AttemptFailure>,
    pub success: bool,
}

/// Per-endpoint delivery counters for the operator stats surface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EndpointStats {
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
}
