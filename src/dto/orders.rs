use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entity::sea_orm_active_enums::OrderStatus,
    models::{Order, OrderItem, Payment, Refund, ShippingDetails},
};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct OrderItemInput {
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ShippingDetailsInput {
    pub full_name: String,
    pub address_line: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    pub phone: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateOrderRequest {
    pub order_items: Vec<OrderItemInput>,
    pub coupon_id: Option<Uuid>,
    pub shipping_details: ShippingDetailsInput,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

/// Either field identifies the coupon; `coupon_id` wins when both are set.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ApplyCouponRequest {
    pub coupon_id: Option<Uuid>,
    pub coupon_code: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderDetail {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub shipping_details: Option<ShippingDetails>,
    pub payment: Option<Payment>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderList {
    pub items: Vec<Order>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelOrderResponse {
    pub order: Order,
    pub refund: Option<Refund>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TrackingInfo {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub message: String,
    pub shipping_date: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<i64>,
}
