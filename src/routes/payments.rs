use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use uuid::Uuid;

use crate::{
    dto::payments::{CheckoutSessionResponse, CreateCheckoutSessionRequest, PaymentDetail},
    error::AppResult,
    middleware::auth::AuthUser,
    response::ApiResponse,
    services::payment_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/create-checkout-session", post(create_checkout_session))
        .route("/create-checkout-session/", post(create_checkout_session))
        .route("/{id}", get(get_payment))
}

#[utoipa::path(
    post,
    path = "/api/payments/create-checkout-session",
    request_body = CreateCheckoutSessionRequest,
    responses(
        (status = 201, description = "Payment created; redirect the buyer to checkout_url", body = ApiResponse<CheckoutSessionResponse>),
        (status = 400, description = "Order not pending or provider failure"),
        (status = 403, description = "Payment method disabled"),
        (status = 409, description = "Order already has a payment"),
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn create_checkout_session(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateCheckoutSessionRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<CheckoutSessionResponse>>)> {
    let resp = payment_service::create_checkout_session(&state, &user, payload).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

#[utoipa::path(
    get,
    path = "/api/payments/{id}",
    params(("id" = Uuid, Path, description = "Payment id")),
    responses(
        (status = 200, description = "Payment with its log entries", body = ApiResponse<PaymentDetail>),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Payment not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn get_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<PaymentDetail>>> {
    let resp = payment_service::get_payment(&state, &user, id).await?;
    Ok(Json(resp))
}
