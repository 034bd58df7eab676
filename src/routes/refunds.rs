use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use uuid::Uuid;

use crate::{
    dto::refunds::{RefundList, RefundRequestBody},
    error::AppResult,
    middleware::auth::AuthUser,
    models::Refund,
    response::ApiResponse,
    routes::params::RefundListQuery,
    services::refund_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/request", post(request_refund))
        .route("/approve/{refund_id}", post(approve_refund))
        .route("/my-requests", get(list_refunds))
}

#[utoipa::path(
    post,
    path = "/api/refunds/request",
    request_body = RefundRequestBody,
    responses(
        (status = 201, description = "Refund requested", body = ApiResponse<Refund>),
        (status = 400, description = "Order not shipped or refund window expired"),
        (status = 409, description = "A refund already exists for the order"),
    ),
    security(("bearer_auth" = [])),
    tag = "Refunds"
)]
pub async fn request_refund(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<RefundRequestBody>,
) -> AppResult<(StatusCode, Json<ApiResponse<Refund>>)> {
    let resp = refund_service::request_refund(&state, &user, payload).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

#[utoipa::path(
    post,
    path = "/api/refunds/approve/{refund_id}",
    params(("refund_id" = Uuid, Path, description = "Refund id")),
    responses(
        (status = 200, description = "Refund approved (admin only)", body = ApiResponse<Refund>),
        (status = 400, description = "Payment not refundable or provider failure"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Refund already processed"),
    ),
    security(("bearer_auth" = [])),
    tag = "Refunds"
)]
pub async fn approve_refund(
    State(state): State<AppState>,
    user: AuthUser,
    Path(refund_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Refund>>> {
    let resp = refund_service::approve_refund(&state, &user, refund_id).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    get,
    path = "/api/refunds/my-requests",
    params(
        ("page" = Option<u64>, Query, description = "Page number, default 1"),
        ("per_page" = Option<u64>, Query, description = "Items per page, default 20"),
        ("status" = Option<String>, Query, description = "Filter by status: requested, approved, rejected")
    ),
    responses(
        (status = 200, description = "Refunds of the caller, or all refunds for admins", body = ApiResponse<RefundList>),
    ),
    security(("bearer_auth" = [])),
    tag = "Refunds"
)]
pub async fn list_refunds(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<RefundListQuery>,
) -> AppResult<Json<ApiResponse<RefundList>>> {
    let resp = refund_service::list_refunds(&state, &user, query).await?;
    Ok(Json(resp))
}
