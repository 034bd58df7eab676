//! Wallet payments through PayPal Orders v2.

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{
    Charge, ChargeState, PaymentLookup, PaymentProvider, ProviderError, ProviderEvent,
    ProviderRefund, ProviderSession, RefundRequest, SessionRequest, format_amount,
};
use crate::config::PaypalConfig;

const TRANSMISSION_HEADERS: [&str; 5] = [
    "paypal-auth-algo",
    "paypal-cert-url",
    "paypal-transmission-id",
    "paypal-transmission-sig",
    "paypal-transmission-time",
];

#[derive(Debug, Clone)]
pub struct PaypalClient {
    config: PaypalConfig,
    http: Client,
}

impl PaypalClient {
    pub fn new(config: PaypalConfig, http: Client) -> Self {
        Self { config, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Authentication);
        }
        let token: AccessToken = read(response).await?;
        Ok(token.access_token)
    }
}

async fn read<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(map_error(status, &body));
    }
    Ok(response.json::<T>().await?)
}

#[async_trait]
impl PaymentProvider for PaypalClient {
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<ProviderSession, ProviderError> {
        let token = self.access_token().await?;
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_id.to_string(),
                "custom_id": request.payment_id.to_string(),
                "amount": {
                    "currency_code": request.currency.to_uppercase(),
                    "value": format_amount(request.amount, &request.currency),
                },
            }],
            "application_context": {
                "return_url": request.success_url,
                "cancel_url": request.cancel_url,
                "user_action": "PAY_NOW",
            },
        });

        let response = self
            .http
            .post(self.url("/v2/checkout/orders"))
            .bearer_auth(token)
            .header("PayPal-Request-Id", format!("checkout_{}", request.payment_id))
            .json(&body)
            .send()
            .await?;

        let order: WalletOrder = read(response).await?;
        let checkout_url = order
            .links
            .iter()
            .find(|link| link.rel == "approve" || link.rel == "payer-action")
            .map(|link| link.href.clone())
            .ok_or_else(|| ProviderError::Rejected("order has no approval link".into()))?;

        Ok(ProviderSession {
            session_id: order.id,
            intent_id: None,
            checkout_url,
        })
    }

    async fn capture(&self, session_id: &str) -> Result<Option<String>, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url(&format!("/v2/checkout/orders/{session_id}/capture")))
            .bearer_auth(token)
            .header("PayPal-Request-Id", format!("capture_{session_id}"))
            .json(&json!({}))
            .send()
            .await?;

        let order: CapturedOrder = read(response).await?;
        Ok(order
            .purchase_units
            .into_iter()
            .flat_map(|unit| unit.payments.captures)
            .map(|capture| capture.id)
            .next())
    }

    async fn retrieve_charge(&self, reference: &str) -> Result<Charge, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(self.url(&format!("/v2/payments/captures/{reference}")))
            .bearer_auth(token)
            .send()
            .await?;

        let capture: Capture = read(response).await?;
        let state = match capture.status.as_str() {
            "COMPLETED" => ChargeState::Refundable,
            "REFUNDED" => ChargeState::AlreadyRefunded { refund_id: None },
            other => ChargeState::NotRefundable(other.to_string()),
        };
        Ok(Charge {
            id: capture.id,
            state,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<ProviderRefund, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url(&format!(
                "/v2/payments/captures/{}/refund",
                request.charge_id
            )))
            .bearer_auth(token)
            .header("PayPal-Request-Id", &request.idempotency_key)
            .json(&json!({
                "amount": {
                    "value": format_amount(request.amount, &request.currency),
                    "currency_code": request.currency.to_uppercase(),
                }
            }))
            .send()
            .await?;

        let refund: WalletRefund = read(response).await?;
        Ok(ProviderRefund {
            refund_id: refund.id,
        })
    }

    async fn verify_webhook(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<ProviderEvent, ProviderError> {
        let [auth_algo, cert_url, transmission_id, transmission_sig, transmission_time] =
            transmission_headers(headers)?;
        let event: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| ProviderError::Signature(format!("malformed payload: {e}")))?;

        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url("/v1/notifications/verify-webhook-signature"))
            .bearer_auth(token)
            .json(&json!({
                "auth_algo": auth_algo,
                "cert_url": cert_url,
                "transmission_id": transmission_id,
                "transmission_sig": transmission_sig,
                "transmission_time": transmission_time,
                "webhook_id": self.config.webhook_id,
                "webhook_event": event,
            }))
            .send()
            .await?;

        let verification: Verification = read(response).await?;
        if verification.verification_status != "SUCCESS" {
            return Err(ProviderError::Signature(format!(
                "verification status {}",
                verification.verification_status
            )));
        }

        parse_event(payload)
    }
}

fn transmission_headers(headers: &HeaderMap) -> Result<[String; 5], ProviderError> {
    let mut values: [String; 5] = Default::default();
    for (slot, name) in values.iter_mut().zip(TRANSMISSION_HEADERS) {
        *slot = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProviderError::Signature(format!("missing {name} header")))?
            .to_string();
    }
    Ok(values)
}

pub fn parse_event(payload: &[u8]) -> Result<ProviderEvent, ProviderError> {
    let event: WebhookEvent = serde_json::from_slice(payload)
        .map_err(|e| ProviderError::Rejected(format!("malformed event: {e}")))?;
    let resource = event.resource;

    let related_order = resource
        .supplementary_data
        .as_ref()
        .and_then(|data| data.related_ids.order_id.clone());

    let parsed = match (event.event_type.as_str(), related_order) {
        ("CHECKOUT.ORDER.APPROVED", _) => ProviderEvent::WalletApproved {
            order_id: resource.id,
        },
        ("PAYMENT.CAPTURE.COMPLETED", Some(order_id)) => ProviderEvent::PaymentSucceeded {
            lookup: PaymentLookup::WalletOrder(order_id),
            capture_id: Some(resource.id),
        },
        ("PAYMENT.CAPTURE.PENDING", Some(order_id)) => ProviderEvent::PaymentProcessing {
            lookup: PaymentLookup::WalletOrder(order_id),
        },
        ("PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED", Some(order_id)) => {
            ProviderEvent::PaymentFailed {
                lookup: PaymentLookup::WalletOrder(order_id),
                reason: resource.status,
            }
        }
        (other, _) => ProviderEvent::Ignored {
            kind: other.to_string(),
        },
    };

    Ok(parsed)
}

fn map_error(status: StatusCode, body: &str) -> ProviderError {
    if status == StatusCode::UNAUTHORIZED {
        return ProviderError::Authentication;
    }
    let detail = serde_json::from_str::<ErrorBody>(body).unwrap_or_default();
    let issue = detail.details.first().map(|d| d.issue.as_str());
    let message = detail
        .message
        .clone()
        .unwrap_or_else(|| format!("paypal responded with {status}"));

    match (detail.name.as_deref(), issue) {
        (_, Some("CAPTURE_FULLY_REFUNDED" | "ORDER_ALREADY_CAPTURED")) => {
            ProviderError::AlreadyProcessed { reference: None }
        }
        (Some("RESOURCE_NOT_FOUND"), _) => ProviderError::NotFound(message),
        _ if status == StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        // Throttling and outages are retryable, never a verdict on the request.
        _ if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() => {
            ProviderError::Transport(message)
        }
        _ => ProviderError::Rejected(message),
    }
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct WalletOrder {
    id: String,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct CapturedOrder {
    #[serde(default)]
    purchase_units: Vec<CapturedUnit>,
}

#[derive(Debug, Deserialize)]
struct CapturedUnit {
    payments: CapturedPayments,
}

#[derive(Debug, Deserialize)]
struct CapturedPayments {
    #[serde(default)]
    captures: Vec<Capture>,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WalletRefund {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Verification {
    verification_status: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    name: Option<String>,
    message: Option<String>,
    #[serde(default)]
    details: Vec<ErrorIssue>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorIssue {
    issue: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event_type: String,
    resource: Resource,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: String,
    status: Option<String>,
    supplementary_data: Option<SupplementaryData>,
}

#[derive(Debug, Deserialize)]
struct SupplementaryData {
    related_ids: RelatedIds,
}

#[derive(Debug, Deserialize)]
struct RelatedIds {
    order_id: Option<String>,
}
