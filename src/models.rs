use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entity::{
    order_items, orders, payment_logs, payments, refunds,
    sea_orm_active_enums::{OrderStatus, PaymentMethod, PaymentStatus, RefundStatus, UserRole},
    shipping_details, users,
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

impl From<users::Model> for User {
    fn from(model: users::Model) -> Self {
        Self {
            id: model.id,
            email: model.email,
            name: model.name,
            role: model.role,
            created_at: model.created_at.with_timezone(&Utc),
        }
    }
}

/// Amounts are minor currency units.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_date: DateTime<Utc>,
    pub order_amount: i64,
    pub shipping_charge: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
    pub shipping_date: Option<DateTime<Utc>>,
    pub order_status: OrderStatus,
    pub cancel_reason: Option<String>,
    pub coupon_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<orders::Model> for Order {
    fn from(model: orders::Model) -> Self {
        Self {
            id: model.id,
            user_id: model.user_id,
            order_date: model.order_date.with_timezone(&Utc),
            order_amount: model.order_amount,
            shipping_charge: model.shipping_charge,
            discount_amount: model.discount_amount,
            final_amount: model.final_amount,
            shipping_date: model.shipping_date.map(|dt| dt.with_timezone(&Utc)),
            order_status: model.order_status,
            cancel_reason: model.cancel_reason,
            coupon_id: model.coupon_id,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub mrp: i64,
    pub discount_percent: i32,
    pub total_price: i64,
    pub created_at: DateTime<Utc>,
}

impl From<order_items::Model> for OrderItem {
    fn from(model: order_items::Model) -> Self {
        Self {
            id: model.id,
            order_id: model.order_id,
            product_id: model.product_id,
            variant_id: model.variant_id,
            quantity: model.quantity,
            mrp: model.mrp,
            discount_percent: model.discount_percent,
            total_price: model.total_price,
            created_at: model.created_at.with_timezone(&Utc),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ShippingDetails {
    pub full_name: String,
    pub address_line: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    pub phone: String,
}

impl From<shipping_details::Model> for ShippingDetails {
    fn from(model: shipping_details::Model) -> Self {
        Self {
            full_name: model.full_name,
            address_line: model.address_line,
            city: model.city,
            state: model.state,
            postal_code: model.postal_code,
            country: model.country,
            phone: model.phone,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub payment_method: PaymentMethod,
    pub currency: String,
    pub amount: i64,
    pub status: PaymentStatus,
    pub provider_reference: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<payments::Model> for Payment {
    fn from(model: payments::Model) -> Self {
        let provider_reference = model
            .stripe_payment_intent_id
            .clone()
            .or_else(|| model.stripe_session_id.clone())
            .or_else(|| model.paypal_capture_id.clone())
            .or_else(|| model.paypal_order_id.clone());
        Self {
            id: model.id,
            order_id: model.order_id,
            payment_method: model.payment_method,
            currency: model.currency,
            amount: model.amount,
            status: model.status,
            provider_reference,
            paid_at: model.paid_at.map(|dt| dt.with_timezone(&Utc)),
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentLog {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub status: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl From<payment_logs::Model> for PaymentLog {
    fn from(model: payment_logs::Model) -> Self {
        Self {
            id: model.id,
            payment_id: model.payment_id,
            status: model.status,
            message: model.message,
            created_at: model.created_at.with_timezone(&Utc),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Refund {
    pub id: Uuid,
    pub order_id: Uuid,
    pub payment_id: Uuid,
    pub provider_refund_id: Option<String>,
    pub amount: i64,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub refunded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<refunds::Model> for Refund {
    fn from(model: refunds::Model) -> Self {
        Self {
            id: model.id,
            order_id: model.order_id,
            payment_id: model.payment_id,
            provider_refund_id: model.provider_refund_id,
            amount: model.amount,
            reason: model.reason,
            status: model.status,
            refunded_by: model.refunded_by,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        }
    }
}
