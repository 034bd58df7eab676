use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        auth::{LoginRequest, LoginResponse, RegisterRequest},
        orders::{
            ApplyCouponRequest, CancelOrderRequest, CancelOrderResponse, CreateOrderRequest,
            OrderDetail, OrderItemInput, OrderList, ShippingDetailsInput, TrackingInfo,
            UpdateOrderStatusRequest,
        },
        payments::{CheckoutSessionResponse, CreateCheckoutSessionRequest, PaymentDetail, WebhookAck},
        refunds::{RefundList, RefundRequestBody},
    },
    entity::sea_orm_active_enums::{OrderStatus, PaymentMethod, PaymentStatus, RefundStatus, UserRole},
    models::{Order, OrderItem, Payment, PaymentLog, Refund, ShippingDetails, User},
    response::{ApiResponse, Meta},
    routes::{auth, health, orders, payments, refunds, webhooks},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        health::readiness,
        auth::login,
        auth::register,
        orders::create_order,
        orders::list_orders,
        orders::get_order,
        orders::cancel_order,
        orders::apply_coupon,
        orders::update_order_status,
        orders::track_order,
        payments::create_checkout_session,
        payments::get_payment,
        webhooks::card_webhook,
        webhooks::paypal_webhook,
        refunds::request_refund,
        refunds::approve_refund,
        refunds::list_refunds
    ),
    components(
        schemas(
            User,
            UserRole,
            Order,
            OrderItem,
            OrderStatus,
            ShippingDetails,
            Payment,
            PaymentLog,
            PaymentMethod,
            PaymentStatus,
            Refund,
            RefundStatus,
            RegisterRequest,
            LoginRequest,
            LoginResponse,
            CreateOrderRequest,
            OrderItemInput,
            ShippingDetailsInput,
            CancelOrderRequest,
            CancelOrderResponse,
            ApplyCouponRequest,
            UpdateOrderStatusRequest,
            OrderDetail,
            OrderList,
            TrackingInfo,
            CreateCheckoutSessionRequest,
            CheckoutSessionResponse,
            PaymentDetail,
            WebhookAck,
            RefundRequestBody,
            RefundList,
            health::HealthData,
            Meta,
            ApiResponse<OrderDetail>,
            ApiResponse<OrderList>,
            ApiResponse<CheckoutSessionResponse>,
            ApiResponse<PaymentDetail>,
            ApiResponse<Refund>,
            ApiResponse<RefundList>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Auth", description = "Authentication endpoints"),
        (name = "Orders", description = "Order lifecycle endpoints"),
        (name = "Payments", description = "Checkout and payment endpoints"),
        (name = "Webhooks", description = "Payment provider callbacks"),
        (name = "Refunds", description = "Refund request and approval endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
