//! HTTP transport seam.
//!
//! The engine talks to receivers through [`DeliverySender`], so tests can
//! script outcomes without a network and alternative transports can be
//! plugged in. [`HttpSender`] is the production implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::AttemptFailure;
use crate::types::{truncate_body, AttemptTiming, HttpMethod, ResponseSnapshot};

/// A fully built outgoing delivery request.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
    pub verify_tls: bool,
}

/// Outcome of one send: a response snapshot or a transport-level failure,
/// plus timing. Non-2xx responses are *not* transport failures; the engine
/// classifies status codes.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub result: Result<ResponseSnapshot, AttemptFailure>,
    pub timing: AttemptTiming,
}

#[async_trait]
pub trait DeliverySender: Send + Sync {
    async fn send(&self, request: &DeliveryRequest) -> SendOutcome;
}

/// reqwest-backed sender.
///
/// Holds two clients: one verifying TLS, one not, selected per request by
/// the endpoint's `verify_tls` flag.
pub struct HttpSender {
    verified: reqwest::Client,
    unverified: reqwest::Client,
}

impl HttpSender {
    pub fn new() -> Self {
        let verified = reqwest::Client::new();
        let unverified = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_else(|_| verified.clone());
        Self {
            verified,
            unverified,
        }
    }
}

impl Default for HttpSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliverySender for HttpSender {
    async fn send(&self, request: &DeliveryRequest) -> SendOutcome {
        let client = if request.verify_tls {
            &self.verified
        } else {
            &self.unverified
        };

        let method = match request.method {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
        };

        let mut builder = client
            .request(method, &request.url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let result = builder.send().await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.to_string(),
                            String::from_utf8_lossy(value.as_bytes()).into_owned(),
                        )
                    })
                    .collect();
                let body = response.bytes().await.unwrap_or_default();
                let timing = AttemptTiming::total_only(started.elapsed());
                SendOutcome {
                    result: Ok(ResponseSnapshot {
                        status,
                        headers,
                        body: truncate_body(&body),
                    }),
                    timing,
                }
            }
            Err(err) => {
                let timing = AttemptTiming::total_only(started.elapsed());
                SendOutcome {
                    result: Err(classify(&err)),
                    timing,
                }
            }
        }
    }
}

/// Map a reqwest error to the attempt failure taxonomy.
///
/// reqwest does not expose TLS/DNS failures as distinct variants, so those
/// classes are recovered from the error chain text.
fn classify(err: &reqwest::Error) -> AttemptFailure {
    if err.is_timeout() {
        return AttemptFailure::Timeout;
    }

    let chain = error_chain(err).to_ascii_lowercase();
    if chain.contains("certificate") || chain.contains("tls") || chain.contains("ssl") {
        AttemptFailure::Ssl
    } else if chain.contains("dns") || chain.contains("failed to lookup") {
        AttemptFailure::Dns
    } else {
        AttemptFailure::Connection
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
