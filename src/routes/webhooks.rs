use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};

use crate::{
    dto::payments::WebhookAck,
    error::{AppError, AppResult},
    providers::PaymentProvider,
    response::ApiResponse,
    services::webhook_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(card_webhook))
        .route("/paypal", post(paypal_webhook))
}

#[utoipa::path(
    post,
    path = "/api/webhook/",
    params(("stripe-signature" = String, Header, description = "Stripe signature header")),
    request_body(content = String, description = "Raw Stripe event", content_type = "application/json"),
    responses(
        (status = 200, description = "Event accepted", body = ApiResponse<WebhookAck>),
        (status = 400, description = "Missing or invalid signature"),
    ),
    tag = "Webhooks"
)]
pub async fn card_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<ApiResponse<WebhookAck>>> {
    let provider = state.providers.card()?;
    receive(&state, provider, &headers, &body).await
}

#[utoipa::path(
    post,
    path = "/api/webhook/paypal",
    request_body(content = String, description = "Raw PayPal event", content_type = "application/json"),
    responses(
        (status = 200, description = "Event accepted", body = ApiResponse<WebhookAck>),
        (status = 400, description = "Missing transmission headers or failed verification"),
    ),
    tag = "Webhooks"
)]
pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<ApiResponse<WebhookAck>>> {
    let provider = state.providers.wallet()?;
    receive(&state, provider, &headers, &body).await
}

async fn receive(
    state: &AppState,
    provider: Arc<dyn PaymentProvider>,
    headers: &HeaderMap,
    body: &[u8],
) -> AppResult<Json<ApiResponse<WebhookAck>>> {
    let event = provider
        .verify_webhook(headers, body)
        .await
        .map_err(|err| {
            tracing::warn!(error = %err, "webhook rejected");
            AppError::Provider(err)
        })?;

    let outcome = webhook_service::reconcile(state, event).await?;
    tracing::debug!(outcome = ?outcome, "webhook processed");

    Ok(Json(ApiResponse::ok(
        "Webhook received",
        WebhookAck { received: true },
    )))
}
