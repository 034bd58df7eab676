//! Card payments through Stripe Checkout.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use super::{
    Charge, ChargeState, PaymentLookup, PaymentProvider, ProviderError, ProviderEvent,
    ProviderRefund, ProviderSession, RefundRequest, SessionRequest,
};
use crate::config::StripeConfig;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Clone)]
pub struct StripeClient {
    config: StripeConfig,
    tolerance_secs: i64,
    http: Client,
}

impl StripeClient {
    pub fn new(config: StripeConfig, tolerance_secs: i64, http: Client) -> Self {
        Self {
            config,
            tolerance_secs,
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn read<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_error(status, &body));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<ProviderSession, ProviderError> {
        let form = checkout_form(request);
        let response = self
            .http
            .post(self.url("/v1/checkout/sessions"))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", format!("checkout_{}", request.payment_id))
            .form(&form)
            .send()
            .await?;

        let session: CheckoutSession = Self::read(response).await?;
        let checkout_url = session
            .url
            .ok_or_else(|| ProviderError::Rejected("checkout session has no url".into()))?;

        Ok(ProviderSession {
            session_id: session.id,
            intent_id: session.payment_intent,
            checkout_url,
        })
    }

    async fn capture(&self, _session_id: &str) -> Result<Option<String>, ProviderError> {
        // Checkout sessions capture automatically.
        Ok(None)
    }

    async fn retrieve_charge(&self, reference: &str) -> Result<Charge, ProviderError> {
        let response = self
            .http
            .get(self.url(&format!("/v1/payment_intents/{reference}")))
            .bearer_auth(&self.config.secret_key)
            .query(&[
                ("expand[]", "latest_charge"),
                ("expand[]", "latest_charge.refunds"),
            ])
            .send()
            .await?;

        let intent: PaymentIntent = Self::read(response).await?;
        Ok(charge_from_intent(intent))
    }

    async fn refund(&self, request: &RefundRequest) -> Result<ProviderRefund, ProviderError> {
        let response = self
            .http
            .post(self.url("/v1/refunds"))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&[
                ("charge", request.charge_id.clone()),
                ("amount", request.amount.to_string()),
            ])
            .send()
            .await?;

        let refund: StripeRefund = Self::read(response).await?;
        Ok(ProviderRefund {
            refund_id: refund.id,
        })
    }

    async fn verify_webhook(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<ProviderEvent, ProviderError> {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProviderError::Signature("missing Stripe-Signature header".into()))?;

        verify_signature(
            payload,
            header,
            &self.config.webhook_secret,
            Utc::now().timestamp(),
            self.tolerance_secs,
        )?;

        parse_event(payload)
    }
}

fn checkout_form(request: &SessionRequest) -> Vec<(&'static str, String)> {
    vec![
        ("mode", "payment".to_string()),
        ("success_url", request.success_url.clone()),
        ("cancel_url", request.cancel_url.clone()),
        ("client_reference_id", request.order_id.to_string()),
        ("line_items[0][quantity]", "1".to_string()),
        (
            "line_items[0][price_data][currency]",
            request.currency.to_lowercase(),
        ),
        (
            "line_items[0][price_data][unit_amount]",
            request.amount.to_string(),
        ),
        (
            "line_items[0][price_data][product_data][name]",
            format!("Order {}", request.order_id),
        ),
        ("metadata[order_id]", request.order_id.to_string()),
        ("metadata[payment_id]", request.payment_id.to_string()),
        (
            "payment_intent_data[metadata][order_id]",
            request.order_id.to_string(),
        ),
        (
            "payment_intent_data[metadata][payment_id]",
            request.payment_id.to_string(),
        ),
    ]
}

/// Check a `Stripe-Signature` header (`t=<unix>,v1=<hex hmac>[,v1=...]`) against
/// the raw request body.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
    tolerance_secs: i64,
) -> Result<(), ProviderError> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| ProviderError::Signature("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(ProviderError::Signature("missing v1 signature".into()));
    }
    let issued_at: i64 = timestamp
        .parse()
        .map_err(|_| ProviderError::Signature("malformed timestamp".into()))?;
    if (now - issued_at).abs() > tolerance_secs {
        return Err(ProviderError::Signature(
            "timestamp outside tolerance".into(),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ProviderError::Signature("invalid signing secret".into()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);

    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });
    if matched {
        Ok(())
    } else {
        Err(ProviderError::Signature("signature mismatch".into()))
    }
}

pub fn parse_event(payload: &[u8]) -> Result<ProviderEvent, ProviderError> {
    let event: Event = serde_json::from_slice(payload)
        .map_err(|e| ProviderError::Rejected(format!("malformed event: {e}")))?;
    let object = event.data.object;
    let malformed = |e: serde_json::Error| {
        ProviderError::Rejected(format!("malformed {} object: {e}", event.kind))
    };

    let parsed = match event.kind.as_str() {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            let session: SessionObject = serde_json::from_value(object).map_err(malformed)?;
            ProviderEvent::SessionCompleted {
                paid: session.payment_status.as_deref() == Some("paid"),
                session_id: session.id,
                intent_id: session.payment_intent,
            }
        }
        "checkout.session.async_payment_failed" => {
            let session: SessionObject = serde_json::from_value(object).map_err(malformed)?;
            ProviderEvent::PaymentFailed {
                lookup: PaymentLookup::CardSession(session.id),
                reason: Some("asynchronous payment failed".into()),
            }
        }
        "payment_intent.succeeded" => {
            let intent: IntentObject = serde_json::from_value(object).map_err(malformed)?;
            ProviderEvent::PaymentSucceeded {
                lookup: intent.lookup(),
                capture_id: None,
            }
        }
        "payment_intent.processing" => {
            let intent: IntentObject = serde_json::from_value(object).map_err(malformed)?;
            ProviderEvent::PaymentProcessing {
                lookup: intent.lookup(),
            }
        }
        "payment_intent.payment_failed" => {
            let intent: IntentObject = serde_json::from_value(object).map_err(malformed)?;
            let reason = intent
                .last_payment_error
                .as_ref()
                .and_then(|e| e.message.clone());
            ProviderEvent::PaymentFailed {
                lookup: intent.lookup(),
                reason,
            }
        }
        other => ProviderEvent::Ignored {
            kind: other.to_string(),
        },
    };

    Ok(parsed)
}

fn charge_from_intent(intent: PaymentIntent) -> Charge {
    match intent.latest_charge {
        None => Charge {
            id: intent.id,
            state: ChargeState::Missing,
        },
        Some(charge) => {
            let state = if charge.refunded {
                ChargeState::AlreadyRefunded {
                    refund_id: charge
                        .refunds
                        .and_then(|list| list.data.into_iter().next())
                        .map(|r| r.id),
                }
            } else {
                ChargeState::Refundable
            };
            Charge {
                id: charge.id,
                state,
            }
        }
    }
}

fn map_error(status: StatusCode, body: &str) -> ProviderError {
    if status == StatusCode::UNAUTHORIZED {
        return ProviderError::Authentication;
    }
    let detail = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error)
        .unwrap_or_default();
    let message = detail
        .message
        .unwrap_or_else(|| format!("stripe responded with {status}"));

    match detail.code.as_deref() {
        Some("resource_missing") => ProviderError::NotFound(message),
        Some("charge_already_refunded") => ProviderError::AlreadyProcessed { reference: None },
        _ if status == StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        // Throttling and outages are retryable, never a verdict on the request.
        _ if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() => {
            ProviderError::Transport(message)
        }
        _ => ProviderError::Rejected(message),
    }
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    id: String,
    url: Option<String>,
    payment_intent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    latest_charge: Option<ChargeObject>,
}

#[derive(Debug, Deserialize)]
struct ChargeObject {
    id: String,
    #[serde(default)]
    refunded: bool,
    refunds: Option<RefundList>,
}

#[derive(Debug, Deserialize)]
struct RefundList {
    data: Vec<StripeRefund>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    kind: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SessionObject {
    id: String,
    payment_intent: Option<String>,
    payment_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntentObject {
    id: String,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
    last_payment_error: Option<LastPaymentError>,
}

impl IntentObject {
    fn lookup(&self) -> PaymentLookup {
        PaymentLookup::CardIntent {
            intent_id: self.id.clone(),
            payment_id: self
                .metadata
                .get("payment_id")
                .and_then(|v| Uuid::parse_str(v).ok()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LastPaymentError {
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let signature = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={signature}")
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign(payload, 1_700_000_000);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_010, 300).is_ok());
    }

    #[test]
    fn accepts_when_any_v1_signature_matches() {
        let payload = b"{}";
        let valid = sign(payload, 1_700_000_000);
        let header = format!("{},v1=deadbeef", valid);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_000, 300).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let header = sign(b"{\"amount\":100}", 1_700_000_000);
        let err = verify_signature(b"{\"amount\":999}", &header, SECRET, 1_700_000_000, 300)
            .unwrap_err();
        assert_eq!(err, ProviderError::Signature("signature mismatch".into()));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = b"{}";
        let header = sign(payload, 1_700_000_000);
        let err = verify_signature(payload, &header, SECRET, 1_700_001_000, 300).unwrap_err();
        assert!(matches!(err, ProviderError::Signature(_)));
    }

    #[test]
    fn rejects_header_without_signature() {
        let err = verify_signature(b"{}", "t=1700000000", SECRET, 1_700_000_000, 300).unwrap_err();
        assert_eq!(err, ProviderError::Signature("missing v1 signature".into()));
    }

    #[test]
    fn parses_checkout_completed() {
        let payload = br#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_1", "payment_intent": "pi_1", "payment_status": "paid"}}
        }"#;
        assert_eq!(
            parse_event(payload).unwrap(),
            ProviderEvent::SessionCompleted {
                session_id: "cs_1".into(),
                intent_id: Some("pi_1".into()),
                paid: true,
            }
        );
    }

    #[test]
    fn parses_intent_succeeded_with_payment_metadata() {
        let payment_id = Uuid::new_v4();
        let payload = format!(
            r#"{{"id":"evt_2","type":"payment_intent.succeeded",
                "data":{{"object":{{"id":"pi_9","metadata":{{"payment_id":"{payment_id}"}}}}}}}}"#
        );
        assert_eq!(
            parse_event(payload.as_bytes()).unwrap(),
            ProviderEvent::PaymentSucceeded {
                lookup: PaymentLookup::CardIntent {
                    intent_id: "pi_9".into(),
                    payment_id: Some(payment_id),
                },
                capture_id: None,
            }
        );
    }

    #[test]
    fn unknown_events_are_ignored() {
        let payload = br#"{"id":"evt_3","type":"customer.created","data":{"object":{}}}"#;
        assert_eq!(
            parse_event(payload).unwrap(),
            ProviderEvent::Ignored {
                kind: "customer.created".into()
            }
        );
    }

    #[test]
    fn maps_error_codes() {
        let missing = r#"{"error":{"code":"resource_missing","message":"No such payment_intent"}}"#;
        assert_eq!(
            map_error(StatusCode::NOT_FOUND, missing),
            ProviderError::NotFound("No such payment_intent".into())
        );

        let refunded = r#"{"error":{"code":"charge_already_refunded","message":"done"}}"#;
        assert_eq!(
            map_error(StatusCode::BAD_REQUEST, refunded),
            ProviderError::AlreadyProcessed { reference: None }
        );

        assert_eq!(
            map_error(StatusCode::UNAUTHORIZED, ""),
            ProviderError::Authentication
        );
        assert!(matches!(
            map_error(StatusCode::BAD_REQUEST, "not json"),
            ProviderError::Rejected(_)
        ));
    }

    #[test]
    fn throttling_and_outages_are_transient() {
        let body = r#"{"error":{"message":"try again"}}"#;
        assert_eq!(
            map_error(StatusCode::SERVICE_UNAVAILABLE, body),
            ProviderError::Transport("try again".into())
        );
        assert!(matches!(
            map_error(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::Transport(_)
        ));
        assert!(matches!(
            map_error(StatusCode::BAD_GATEWAY, "not json"),
            ProviderError::Transport(_)
        ));
    }

    #[test]
    fn refunded_charge_reports_existing_refund() {
        let intent: PaymentIntent = serde_json::from_str(
            r#"{"id":"pi_1","latest_charge":{"id":"ch_1","refunded":true,
                "refunds":{"data":[{"id":"re_1"}]}}}"#,
        )
        .unwrap();
        assert_eq!(
            charge_from_intent(intent),
            Charge {
                id: "ch_1".into(),
                state: ChargeState::AlreadyRefunded {
                    refund_id: Some("re_1".into())
                },
            }
        );

        let no_charge: PaymentIntent =
            serde_json::from_str(r#"{"id":"pi_2","latest_charge":null}"#).unwrap();
        assert_eq!(charge_from_intent(no_charge).state, ChargeState::Missing);
    }
}
