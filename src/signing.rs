use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use crate::types::{EndpointConfig, SignatureAlgorithm, SignatureEncoding};

/// Signature headers attached to an outgoing delivery.
pub struct SignatureHeaders {
    pub signature_header: Option<(String, String)>,
    pub timestamp_header: Option<(String, String)>,
}

impl SignatureHeaders {
    pub fn empty() -> Self {
        Self {
            signature_header: None,
            timestamp_header: None,
        }
    }
}

/// Build the signature headers for an endpoint, using its first eligible
/// secret. Endpoints without an eligible secret deliver unsigned.
pub fn build_signature_headers(
    endpoint: &EndpointConfig,
    body: &[u8],
    now: DateTime<Utc>,
) -> SignatureHeaders {
    let Some(secret) = endpoint.signing_secret(now) else {
        return SignatureHeaders::empty();
    };

    let timestamp = now.timestamp().to_string();
    let signed_timestamp = endpoint.include_timestamp.then_some(timestamp.as_str());

    let signature = compute_signature(
        &secret.key,
        endpoint.signature_algorithm,
        endpoint.signature_encoding,
        body,
        signed_timestamp,
    );

    SignatureHeaders {
        signature_header: Some((endpoint.signature_header.clone(), signature)),
        timestamp_header: endpoint
            .include_timestamp
            .then(|| (endpoint.timestamp_header.clone(), timestamp)),
    }
}

fn mac_bytes(secret: &[u8], algorithm: SignatureAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        SignatureAlgorithm::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                .expect("hmac accepts keys of any length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        SignatureAlgorithm::HmacSha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret)
                .expect("hmac accepts keys of any length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        SignatureAlgorithm::HmacSha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret)
                .expect("hmac accepts keys of any length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn signed_input(payload: &[u8], timestamp: Option<&str>) -> Vec<u8> {
    match timestamp {
        Some(ts) => [ts.as_bytes(), payload].concat(),
        None => payload.to_vec(),
    }
}

/// Compute the HMAC signature sent with a delivery.
///
/// When a timestamp is supplied its bytes are prepended to the payload
/// before signing, binding the signature to the send time.
pub fn compute_signature(
    secret: &[u8],
    algorithm: SignatureAlgorithm,
    encoding: SignatureEncoding,
    payload: &[u8],
    timestamp: Option<&str>,
) -> String {
    let bytes = mac_bytes(secret, algorithm, &signed_input(payload, timestamp));
    match encoding {
        SignatureEncoding::Hex => hex::encode(bytes),
        SignatureEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
    }
}

/// Verify a received signature in constant time.
pub fn verify_signature(
    secret: &[u8],
    algorithm: SignatureAlgorithm,
    encoding: SignatureEncoding,
    payload: &[u8],
    timestamp: Option<&str>,
    signature: &str,
) -> bool {
    let decoded = match encoding {
        SignatureEncoding::Hex => hex::decode(signature).ok(),
        SignatureEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(signature)
            .ok(),
    };
    let Some(decoded) = decoded else {
        return false;
    };

    let data = signed_input(payload, timestamp);
    match algorithm {
        SignatureAlgorithm::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                .expect("hmac accepts keys of any length");
            mac.update(&data);
            mac.verify_slice(&decoded).is_ok()
        }
        SignatureAlgorithm::HmacSha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret)
                .expect("hmac accepts keys of any length");
            mac.update(&data);
            mac.verify_slice(&decoded).is_ok()
        }
        SignatureAlgorithm::HmacSha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret)
                .expect("hmac accepts keys of any length");
            mac.update(&data);
            mac.verify_slice(&decoded).is_ok()
        }
    }
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    if now_secs >= timestamp_secs {
        now_secs - timestamp_secs <= max_age_secs
    } else {
        false
    }
}

#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

/// Parse signature and timestamp headers from a list of headers.
pub fn parse_signature_headers<'a, I>(
    headers: I,
    signature_header: &str,
    timestamp_header: &str,
) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let sig_key = signature_header.to_ascii_lowercase();
    let ts_key = timestamp_header.to_ascii_lowercase();

    let mut signature = None;
    let mut timestamp = None;

    for (name, value) in headers {
        let key = name.to_ascii_lowercase();
        if key == sig_key {
            signature = Some(value.to_string());
        } else if key == ts_key {
            timestamp = Some(value.to_string());
        }
    }

    ParsedSignature { signature, timestamp }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MissingTimestamp,
    InvalidTimestamp,
    StaleTimestamp,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
///
/// Receiver-side helper for services consuming this crate's deliveries.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    algorithm: SignatureAlgorithm,
    encoding: SignatureEncoding,
    signature_header: &str,
    timestamp_header: &str,
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers, signature_header, timestamp_header);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp_str = parsed.timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = timestamp_str
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(
        secret,
        algorithm,
        encoding,
        payload,
        Some(&timestamp_str),
        &signature,
    ) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test_key";
    const PAYLOAD: &[u8] = br#"{"event_id":"abc","payload":{"id":42}}"#;

    #[test]
    fn round_trip_all_algorithms() {
        for algorithm in [
            SignatureAlgorithm::HmacSha256,
            SignatureAlgorithm::HmacSha512,
            SignatureAlgorithm::HmacSha1,
        ] {
            for encoding in [SignatureEncoding::Hex, SignatureEncoding::Base64] {
                let sig = compute_signature(SECRET, algorithm, encoding, PAYLOAD, Some("1700000000"));
                assert!(verify_signature(
                    SECRET,
                    algorithm,
                    encoding,
                    PAYLOAD,
                    Some("1700000000"),
                    &sig
                ));
            }
        }
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let sig = compute_signature(
            SECRET,
            SignatureAlgorithm::HmacSha256,
            SignatureEncoding::Hex,
            PAYLOAD,
            None,
        );
        assert!(!verify_signature(
            SECRET,
            SignatureAlgorithm::HmacSha256,
            SignatureEncoding::Hex,
            b"different body",
            None,
            &sig
        ));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let sig = compute_signature(
            SECRET,
            SignatureAlgorithm::HmacSha256,
            SignatureEncoding::Hex,
            PAYLOAD,
            None,
        );
        assert!(!verify_signature(
            b"other",
            SignatureAlgorithm::HmacSha256,
            SignatureEncoding::Hex,
            PAYLOAD,
            None,
            &sig
        ));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        assert!(!verify_signature(
            SECRET,
            SignatureAlgorithm::HmacSha256,
            SignatureEncoding::Hex,
            PAYLOAD,
            None,
            "not-hex!"
        ));
    }

    #[test]
    fn timestamp_freshness() {
        assert!(is_timestamp_fresh(1000, 1100, 300));
        assert!(!is_timestamp_fresh(1000, 1400, 300));
        // Timestamps from the future are never fresh.
        assert!(!is_timestamp_fresh(1100, 1000, 300));
    }

    #[test]
    fn full_request_verification() {
        let sig = compute_signature(
            SECRET,
            SignatureAlgorithm::HmacSha256,
            SignatureEncoding::Hex,
            PAYLOAD,
            Some("1000"),
        );
        let headers = [
            ("X-Webhook-Signature", sig.as_str()),
            ("X-Webhook-Timestamp", "1000"),
        ];

        assert_eq!(
            verify_webhook_request(
                headers,
                PAYLOAD,
                SECRET,
                SignatureAlgorithm::HmacSha256,
                SignatureEncoding::Hex,
                "X-Webhook-Signature",
                "X-Webhook-Timestamp",
                300,
                1100,
            ),
            Ok(())
        );

        assert_eq!(
            verify_webhook_request(
                headers,
                PAYLOAD,
                SECRET,
                SignatureAlgorithm::HmacSha256,
                SignatureEncoding::Hex,
                "X-Webhook-Signature",
                "X-Webhook-Timestamp",
                300,
                9999,
            ),
            Err(VerificationError::StaleTimestamp)
        );
    }
}
