pub mod auth_service;
pub mod coupon_service;
pub mod order_service;
pub mod payment_service;
pub mod refund_service;
pub mod tracking;
pub mod webhook_service;
