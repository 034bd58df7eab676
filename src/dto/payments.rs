use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entity::sea_orm_active_enums::{PaymentMethod, PaymentStatus},
    models::{Payment, PaymentLog},
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateCheckoutSessionRequest {
    pub order_id: Uuid,
    /// ISO 4217 code, e.g. `usd`.
    pub currency: String,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutSessionResponse {
    pub payment_id: Uuid,
    /// Empty for cash on delivery.
    pub checkout_url: String,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentDetail {
    pub payment: Payment,
    pub logs: Vec<PaymentLog>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
}
