use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::models::{GatewayEvent, GatewayEventKind, PaymentError};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_SCHEME: &str = "v1";

#[derive(Debug, Clone, PartialEq)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

/// Parses `t=<unix>,v1=<hex>[,v1=<hex>...]`. Unknown schemes are skipped.
fn parse_signature_header(header: &str) -> Result<SignatureHeader, PaymentError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };

        match key {
            "t" => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    PaymentError::SignatureVerification("Invalid timestamp in signature header".to_string())
                })?);
            }
            SIGNATURE_SCHEME => match hex::decode(value) {
                Ok(bytes) => signatures.push(bytes),
                Err(e) => debug!("Skipping undecodable signature: {}", e),
            },
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| PaymentError::SignatureVerification("Missing timestamp in signature header".to_string()))?;

    if signatures.is_empty() {
        return Err(PaymentError::SignatureVerification(
            "No v1 signature in signature header".to_string(),
        ));
    }

    Ok(SignatureHeader { timestamp, signatures })
}

/// Checks the processor's HMAC-SHA256 over `"{t}.{payload}"` and rejects
/// timestamps further than `tolerance_seconds` from `now`.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
    tolerance_seconds: i64,
) -> Result<(), PaymentError> {
    if secret.is_empty() {
        return Err(PaymentError::WebhookSecretMissing);
    }

    let parsed = parse_signature_header(header)?;

    if (now.timestamp() - parsed.timestamp).abs() > tolerance_seconds {
        return Err(PaymentError::SignatureVerification(
            "Timestamp outside the tolerance zone".to_string(),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PaymentError::WebhookSecretMissing)?;
    mac.update(parsed.timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    let matched = parsed
        .signatures
        .iter()
        .any(|signature| mac.clone().verify_slice(signature).is_ok());

    if !matched {
        debug!("No webhook signature matched the expected digest");
        return Err(PaymentError::SignatureVerification(
            "No signatures found matching the expected signature for payload".to_string(),
        ));
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

fn object_id(object: &Value) -> Option<String> {
    object.get("id").and_then(Value::as_str).map(str::to_string)
}

/// A charge may carry its intent either as an id or as an expanded object.
fn charge_intent(object: &Value) -> Option<String> {
    match object.get("payment_intent") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(expanded @ Value::Object(_)) => object_id(expanded),
        _ => None,
    }
}

/// Interprets a verified payload into the event kinds the reconciler acts on.
pub fn parse_event(payload: &[u8]) -> Result<GatewayEvent, PaymentError> {
    let raw: RawEvent = serde_json::from_slice(payload)
        .map_err(|e| PaymentError::MalformedEvent(e.to_string()))?;

    let intent_id = |object: &Value| {
        object_id(object).ok_or_else(|| PaymentError::MalformedEvent("Event object has no id".to_string()))
    };

    let kind = match raw.event_type.as_str() {
        "payment_intent.succeeded" => GatewayEventKind::PaymentIntentSucceeded {
            payment_intent_id: intent_id(&raw.data.object)?,
        },
        "charge.succeeded" => GatewayEventKind::ChargeSucceeded {
            charge_id: intent_id(&raw.data.object)?,
            payment_intent_id: charge_intent(&raw.data.object),
        },
        other => GatewayEventKind::Unhandled {
            event_type: other.to_string(),
        },
    };

    Ok(GatewayEvent { id: raw.id, kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use shared_utils::test_utils::{utc, WebhookTestUtils, TEST_WEBHOOK_SECRET};

    const TOLERANCE: i64 = 300;

    #[test]
    fn accepts_processor_signature() {
        let now = utc(2025, 6, 1, 10, 0);
        let payload = WebhookTestUtils::payment_intent_event("payment_intent.succeeded", "pi_123");
        let header = WebhookTestUtils::signature_header(&payload, TEST_WEBHOOK_SECRET, now.timestamp());

        assert!(verify_signature(payload.as_bytes(), &header, TEST_WEBHOOK_SECRET, now, TOLERANCE).is_ok());
    }

    #[test]
    fn any_matching_v1_signature_is_enough() {
        let now = utc(2025, 6, 1, 10, 0);
        let payload = "{}";
        let good = WebhookTestUtils::signature_header(payload, TEST_WEBHOOK_SECRET, now.timestamp());
        let good_sig = good.split(",v1=").nth(1).unwrap();
        let header = format!("t={},v0=abc,v1={},v1={}", now.timestamp(), "00".repeat(32), good_sig);

        assert!(verify_signature(payload.as_bytes(), &header, TEST_WEBHOOK_SECRET, now, TOLERANCE).is_ok());
    }

    #[test]
    fn rejects_tampered_payload_and_wrong_secret() {
        let now = utc(2025, 6, 1, 10, 0);
        let payload = WebhookTestUtils::payment_intent_event("payment_intent.succeeded", "pi_123");
        let header = WebhookTestUtils::signature_header(&payload, TEST_WEBHOOK_SECRET, now.timestamp());

        let tampered = payload.replace("pi_123", "pi_999");
        assert_matches!(
            verify_signature(tampered.as_bytes(), &header, TEST_WEBHOOK_SECRET, now, TOLERANCE),
            Err(PaymentError::SignatureVerification(_))
        );
        assert_matches!(
            verify_signature(payload.as_bytes(), &header, "whsec_other", now, TOLERANCE),
            Err(PaymentError::SignatureVerification(_))
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let now = utc(2025, 6, 1, 10, 0);
        let payload = "{}";
        let header = WebhookTestUtils::signature_header(payload, TEST_WEBHOOK_SECRET, now.timestamp() - 301);

        assert_matches!(
            verify_signature(payload.as_bytes(), &header, TEST_WEBHOOK_SECRET, now, TOLERANCE),
            Err(PaymentError::SignatureVerification(_))
        );
    }

    #[test]
    fn rejects_malformed_headers_and_missing_secret() {
        let now = utc(2025, 6, 1, 10, 0);

        assert_matches!(
            verify_signature(b"{}", "v1=abcd", TEST_WEBHOOK_SECRET, now, TOLERANCE),
            Err(PaymentError::SignatureVerification(_))
        );
        assert_matches!(
            verify_signature(b"{}", &format!("t={}", now.timestamp()), TEST_WEBHOOK_SECRET, now, TOLERANCE),
            Err(PaymentError::SignatureVerification(_))
        );
        assert_matches!(
            verify_signature(b"{}", "t=1,v1=00", "", now, TOLERANCE),
            Err(PaymentError::WebhookSecretMissing)
        );
    }

    #[test]
    fn parses_supported_event_kinds() {
        let event = parse_event(WebhookTestUtils::payment_intent_event("payment_intent.succeeded", "pi_9").as_bytes())
            .unwrap();
        assert_eq!(
            event.kind,
            GatewayEventKind::PaymentIntentSucceeded { payment_intent_id: "pi_9".to_string() }
        );

        // Declined intents remain retryable at the processor.
        let event = parse_event(WebhookTestUtils::payment_intent_event("payment_intent.payment_failed", "pi_9").as_bytes())
            .unwrap();
        assert_eq!(
            event.kind,
            GatewayEventKind::Unhandled { event_type: "payment_intent.payment_failed".to_string() }
        );

        let event = parse_event(WebhookTestUtils::charge_event("charge.succeeded", "ch_1", Some("pi_9")).as_bytes())
            .unwrap();
        assert_eq!(
            event.kind,
            GatewayEventKind::ChargeSucceeded {
                charge_id: "ch_1".to_string(),
                payment_intent_id: Some("pi_9".to_string())
            }
        );

        let event = parse_event(WebhookTestUtils::charge_event("charge.refunded", "ch_1", None).as_bytes()).unwrap();
        assert_eq!(
            event.kind,
            GatewayEventKind::Unhandled { event_type: "charge.refunded".to_string() }
        );
    }

    #[test]
    fn expanded_charge_intent_is_read() {
        let payload = br#"{"id":"evt_1","type":"charge.succeeded","data":{"object":{"id":"ch_1","payment_intent":{"id":"pi_7"}}}}"#;
        let event = parse_event(payload).unwrap();

        assert_matches!(
            event.kind,
            GatewayEventKind::ChargeSucceeded { payment_intent_id: Some(id), .. } if id == "pi_7"
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert_matches!(parse_event(b"not json"), Err(PaymentError::MalformedEvent(_)));
        assert_matches!(
            parse_event(br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{}}}"#),
            Err(PaymentError::MalformedEvent(_))
        );
    }
}
