mod common;

use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter,
    Set,
};
use uuid::Uuid;

use storefront_api::{
    dto::{
        orders::{ApplyCouponRequest, CreateOrderRequest, OrderItemInput, ShippingDetailsInput},
        payments::CreateCheckoutSessionRequest,
        refunds::RefundRequestBody,
    },
    entity::{
        coupons::ActiveModel as CouponActive,
        orders::{ActiveModel as OrderActive, Entity as Orders},
        payment_method_settings::{ActiveModel as MethodSettingActive, Entity as MethodSettings},
        payments::{Column as PaymentCol, Entity as Payments},
        products::ActiveModel as ProductActive,
        refunds::{Column as RefundCol, Entity as Refunds},
        sea_orm_active_enums::{
            DiscountType, OrderStatus, PaymentMethod, PaymentStatus, RefundStatus, UserRole,
        },
        users::ActiveModel as UserActive,
        variants::ActiveModel as VariantActive,
    },
    error::AppError,
    middleware::auth::AuthUser,
    providers::ProviderEvent,
    services::{
        order_service, payment_service, refund_service,
        webhook_service::{self, WebhookOutcome},
    },
    state::AppState,
};

struct Catalog {
    shirt: Uuid,
    mug: Uuid,
    coupon: Uuid,
}

async fn create_user(state: &AppState, role: UserRole) -> anyhow::Result<AuthUser> {
    let id = Uuid::new_v4();
    UserActive {
        id: Set(id),
        email: Set(format!("{}+{}@example.com", role.as_str(), id.simple())),
        name: Set(format!("Test {}", role.as_str())),
        password_hash: Set("not-a-real-hash".into()),
        role: Set(role),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(AuthUser { user_id: id, role })
}

// 2 x (100 less 10%) + 1 x 50 = 230, minus a fixed 30 coupon.
async fn seed_catalog(state: &AppState) -> anyhow::Result<Catalog> {
    let tag = Uuid::new_v4().simple().to_string();
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(format!("Flow product {tag}")),
        description: Set(None),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    let mut variant_ids = Vec::new();
    for (suffix, price, discount) in [("shirt", 100, 10), ("mug", 50, 0)] {
        let variant = VariantActive {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            sku: Set(format!("{suffix}-{tag}")),
            attributes: Set(Some(suffix.into())),
            price: Set(price),
            stock: Set(10),
            discount_percent: Set(discount),
            shipping_time_days: Set(Some(3)),
            created_at: NotSet,
        }
        .insert(&state.orm)
        .await?;
        variant_ids.push(variant.id);
    }

    let coupon = CouponActive {
        id: Set(Uuid::new_v4()),
        code: Set(format!("FLAT30-{tag}")),
        discount_type: Set(DiscountType::Fixed),
        discount_value: Set(30),
        is_active: Set(true),
        expiry_date: Set(None),
        usage_limit: Set(None),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(Catalog {
        shirt: variant_ids[0],
        mug: variant_ids[1],
        coupon: coupon.id,
    })
}

fn order_request(catalog: &Catalog, coupon: bool) -> CreateOrderRequest {
    CreateOrderRequest {
        order_items: vec![
            OrderItemInput {
                variant_id: catalog.shirt,
                quantity: 2,
            },
            OrderItemInput {
                variant_id: catalog.mug,
                quantity: 1,
            },
        ],
        coupon_id: coupon.then_some(catalog.coupon),
        shipping_details: ShippingDetailsInput {
            full_name: "Jane Doe".into(),
            address_line: "1 Crab Street".into(),
            city: "Portland".into(),
            state: "OR".into(),
            postal_code: "97201".into(),
            country: "US".into(),
            phone: "+15550100".into(),
        },
    }
}

async fn place_order(
    state: &AppState,
    user: &AuthUser,
    catalog: &Catalog,
    coupon: bool,
) -> anyhow::Result<Uuid> {
    let detail = order_service::create_order(state, user, order_request(catalog, coupon))
        .await?
        .data
        .expect("order detail");
    Ok(detail.order.id)
}

async fn checkout(
    state: &AppState,
    user: &AuthUser,
    order_id: Uuid,
    method: PaymentMethod,
) -> Result<storefront_api::dto::payments::CheckoutSessionResponse, AppError> {
    let resp = payment_service::create_checkout_session(
        state,
        user,
        CreateCheckoutSessionRequest {
            order_id,
            currency: "usd".into(),
            payment_method: method,
        },
    )
    .await?;
    Ok(resp.data.expect("checkout data"))
}

macro_rules! require_db {
    () => {
        match common::database_url() {
            Some(url) => url,
            None => {
                eprintln!("Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run flow tests.");
                return Ok(());
            }
        }
    };
}

#[tokio::test]
async fn card_order_is_confirmed_once_and_refunded_on_cancel() -> anyhow::Result<()> {
    let database_url = require_db!();
    let h = common::harness(&database_url).await?;
    let state = &h.state;

    let user = create_user(state, UserRole::User).await?;
    create_user(state, UserRole::Admin).await?;
    let catalog = seed_catalog(state).await?;

    let detail = order_service::create_order(state, &user, order_request(&catalog, true))
        .await?
        .data
        .expect("order detail");
    assert_eq!(detail.order.order_amount, 230);
    assert_eq!(detail.order.discount_amount, 30);
    assert_eq!(detail.order.final_amount, 200);
    assert_eq!(detail.items.len(), 2);
    assert!(detail.shipping_details.is_some());
    let order_id = detail.order.id;

    // Applying the same coupon again must not stack the discount.
    let reapplied = order_service::apply_coupon(
        state,
        &user,
        order_id,
        ApplyCouponRequest {
            coupon_id: Some(catalog.coupon),
            coupon_code: None,
        },
    )
    .await?
    .data
    .expect("order");
    assert_eq!(reapplied.discount_amount, 30);
    assert_eq!(reapplied.final_amount, 200);

    let session = checkout(state, &user, order_id, PaymentMethod::CreditCard).await?;
    assert_eq!(session.status, PaymentStatus::Created);
    assert_eq!(session.amount, 200);
    assert!(session.checkout_url.starts_with("https://checkout.test/"));

    let key = session.payment_id.simple();
    let completed = ProviderEvent::SessionCompleted {
        session_id: format!("cs_{key}"),
        intent_id: Some(format!("pi_{key}")),
        paid: true,
    };
    let first = webhook_service::reconcile(state, completed.clone()).await?;
    assert_eq!(
        first,
        WebhookOutcome::Applied {
            payment_id: session.payment_id,
            status: PaymentStatus::Succeeded,
        }
    );
    let second = webhook_service::reconcile(state, completed).await?;
    assert_eq!(
        second,
        WebhookOutcome::Unchanged {
            payment_id: session.payment_id
        }
    );

    common::drain_background_tasks().await;
    assert_eq!(h.notifier.count("payment_confirmed"), 1);
    assert!(h.notifier.count("order_placed") >= 1);

    let order = order_service::get_order(state, &user, order_id)
        .await?
        .data
        .expect("order detail");
    assert_eq!(order.order.order_status, OrderStatus::Confirmed);

    let cancelled = order_service::cancel_order(
        state,
        &user,
        order_id,
        Some("changed my mind".into()),
    )
    .await?
    .data
    .expect("cancel response");
    assert_eq!(cancelled.order.order_status, OrderStatus::Cancelled);
    let refund = cancelled.refund.expect("automatic refund");
    assert_eq!(refund.amount, 200);
    assert_eq!(refund.status, RefundStatus::Approved);

    let requests = h.card.refund_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].idempotency_key, format!("refund_{}", refund.id));
    assert_eq!(requests[0].charge_id, format!("ch_pi_{key}"));
    Ok(())
}

#[tokio::test]
async fn cash_on_delivery_is_collected_on_delivery_and_refunded_manually() -> anyhow::Result<()> {
    let database_url = require_db!();
    let h = common::harness(&database_url).await?;
    let state = &h.state;

    let user = create_user(state, UserRole::User).await?;
    let admin = create_user(state, UserRole::Admin).await?;
    let catalog = seed_catalog(state).await?;
    let order_id = place_order(state, &user, &catalog, false).await?;

    let session = checkout(state, &user, order_id, PaymentMethod::CashOnDelivery).await?;
    assert_eq!(session.status, PaymentStatus::Pending);
    assert!(session.checkout_url.is_empty());
    assert_eq!(session.amount, 230);

    let duplicate = checkout(state, &user, order_id, PaymentMethod::CreditCard).await;
    assert!(matches!(duplicate, Err(AppError::Conflict(_))));
    assert_eq!(h.card.sessions.load(Ordering::SeqCst), 0);

    // Customers cannot move their own orders along.
    let denied = order_service::update_status(state, &user, order_id, OrderStatus::Confirmed).await;
    assert!(matches!(denied, Err(AppError::Forbidden(_))));

    for next in [OrderStatus::Confirmed, OrderStatus::Shipped] {
        order_service::update_status(state, &admin, order_id, next).await?;
    }

    // Shipped but the cash has not been collected yet.
    let uncollected = refund_service::request_refund(
        state,
        &user,
        RefundRequestBody {
            order_id,
            reason: None,
        },
    )
    .await;
    assert!(matches!(uncollected, Err(AppError::InvalidState(_))));

    order_service::update_status(state, &admin, order_id, OrderStatus::Delivered).await?;

    let detail = order_service::get_order(state, &user, order_id)
        .await?
        .data
        .expect("order detail");
    let payment = detail.payment.expect("payment");
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert!(payment.paid_at.is_some());

    let refund = refund_service::request_refund(
        state,
        &user,
        RefundRequestBody {
            order_id,
            reason: Some("arrived broken".into()),
        },
    )
    .await?
    .data
    .expect("refund");
    assert_eq!(refund.status, RefundStatus::Requested);
    assert_eq!(refund.amount, 230);

    let again = refund_service::request_refund(
        state,
        &user,
        RefundRequestBody {
            order_id,
            reason: None,
        },
    )
    .await;
    assert!(matches!(again, Err(AppError::Conflict(_))));

    let forbidden = refund_service::approve_refund(state, &user, refund.id).await;
    assert!(matches!(forbidden, Err(AppError::Forbidden(_))));

    let approved = refund_service::approve_refund(state, &admin, refund.id)
        .await?
        .data
        .expect("refund");
    assert_eq!(approved.status, RefundStatus::Approved);
    assert_eq!(
        approved.provider_refund_id,
        Some(format!("manual_{}", refund.id))
    );
    assert_eq!(approved.refunded_by, Some(admin.user_id));
    assert!(h.card.refund_requests().is_empty());

    let replay = refund_service::approve_refund(state, &admin, refund.id).await;
    assert!(matches!(replay, Err(AppError::Conflict(_))));
    Ok(())
}

#[tokio::test]
async fn refund_request_outside_window_expires() -> anyhow::Result<()> {
    let database_url = require_db!();
    let h = common::harness(&database_url).await?;
    let state = &h.state;

    let user = create_user(state, UserRole::User).await?;
    let other = create_user(state, UserRole::User).await?;
    let catalog = seed_catalog(state).await?;
    let order_id = place_order(state, &user, &catalog, true).await?;

    let pending = refund_service::request_refund(
        state,
        &user,
        RefundRequestBody {
            order_id,
            reason: None,
        },
    )
    .await;
    assert!(matches!(pending, Err(AppError::InvalidState(_))));

    let order = Orders::find_by_id(order_id)
        .one(&state.orm)
        .await?
        .expect("order row");
    let mut active: OrderActive = order.into();
    active.order_status = Set(OrderStatus::Shipped);
    active.created_at = Set((Utc::now() - Duration::days(20)).into());
    active.update(&state.orm).await?;

    let stranger = refund_service::request_refund(
        state,
        &other,
        RefundRequestBody {
            order_id,
            reason: None,
        },
    )
    .await;
    assert!(matches!(stranger, Err(AppError::Forbidden(_))));

    let expired = refund_service::request_refund(
        state,
        &user,
        RefundRequestBody {
            order_id,
            reason: None,
        },
    )
    .await;
    assert!(matches!(expired, Err(AppError::Expired(_))));
    Ok(())
}

#[tokio::test]
async fn payment_completed_after_cancel_is_refunded_not_confirmed() -> anyhow::Result<()> {
    let database_url = require_db!();
    let h = common::harness(&database_url).await?;
    let state = &h.state;

    let user = create_user(state, UserRole::User).await?;
    let catalog = seed_catalog(state).await?;
    let order_id = place_order(state, &user, &catalog, true).await?;

    let session = checkout(state, &user, order_id, PaymentMethod::CreditCard).await?;
    let cancelled = order_service::cancel_order(state, &user, order_id, None)
        .await?
        .data
        .expect("cancel response");
    assert!(cancelled.refund.is_none());

    // The customer finishes the hosted checkout anyway.
    let key = session.payment_id.simple();
    let outcome = webhook_service::reconcile(
        state,
        ProviderEvent::SessionCompleted {
            session_id: format!("cs_{key}"),
            intent_id: Some(format!("pi_{key}")),
            paid: true,
        },
    )
    .await?;
    assert_eq!(
        outcome,
        WebhookOutcome::Applied {
            payment_id: session.payment_id,
            status: PaymentStatus::Succeeded,
        }
    );

    let detail = order_service::get_order(state, &user, order_id)
        .await?
        .data
        .expect("order detail");
    assert_eq!(detail.order.order_status, OrderStatus::Cancelled);

    let refunds = Refunds::find()
        .filter(RefundCol::OrderId.eq(order_id))
        .all(&state.orm)
        .await?;
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, 200);
    assert_eq!(refunds[0].status, RefundStatus::Approved);
    assert_eq!(h.card.refund_requests().len(), 1);

    common::drain_background_tasks().await;
    assert_eq!(h.notifier.count("payment_confirmed"), 0);
    Ok(())
}

#[tokio::test]
async fn order_without_items_is_rejected() -> anyhow::Result<()> {
    let database_url = require_db!();
    let h = common::harness(&database_url).await?;
    let state = &h.state;

    let user = create_user(state, UserRole::User).await?;
    let catalog = seed_catalog(state).await?;
    let mut request = order_request(&catalog, false);
    request.order_items.clear();

    let result = order_service::create_order(state, &user, request).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
    Ok(())
}

#[tokio::test]
async fn checkout_preconditions_are_enforced() -> anyhow::Result<()> {
    let database_url = require_db!();
    let h = common::harness(&database_url).await?;
    let state = &h.state;

    let user = create_user(state, UserRole::User).await?;
    let catalog = seed_catalog(state).await?;

    // Cancelled orders cannot be paid.
    let cancelled_id = place_order(state, &user, &catalog, false).await?;
    order_service::cancel_order(state, &user, cancelled_id, None).await?;
    let not_pending = checkout(state, &user, cancelled_id, PaymentMethod::CreditCard).await;
    assert!(matches!(not_pending, Err(AppError::InvalidState(_))));

    // Debit card is switched off for the duration of this check only.
    let order_id = place_order(state, &user, &catalog, false).await?;
    set_method_enabled(state, PaymentMethod::DebitCard, false).await?;
    let disabled = checkout(state, &user, order_id, PaymentMethod::DebitCard).await;
    set_method_enabled(state, PaymentMethod::DebitCard, true).await?;
    assert!(matches!(disabled, Err(AppError::Forbidden(_))));

    // A declined session leaves nothing behind, so the order can be paid later.
    h.card.decline_sessions.store(true, Ordering::SeqCst);
    let declined = checkout(state, &user, order_id, PaymentMethod::CreditCard).await;
    assert!(matches!(declined, Err(AppError::Provider(_))));
    let recorded = Payments::find()
        .filter(PaymentCol::OrderId.eq(order_id))
        .count(&state.orm)
        .await?;
    assert_eq!(recorded, 0);

    h.card.decline_sessions.store(false, Ordering::SeqCst);
    let session = checkout(state, &user, order_id, PaymentMethod::CreditCard).await?;
    assert_eq!(session.status, PaymentStatus::Created);
    assert_eq!(h.card.sessions.load(Ordering::SeqCst), 2);
    Ok(())
}

async fn set_method_enabled(
    state: &AppState,
    method: PaymentMethod,
    enabled: bool,
) -> anyhow::Result<()> {
    let setting = MethodSettings::find_by_id(method)
        .one(&state.orm)
        .await?
        .expect("seeded payment method setting");
    let mut active: MethodSettingActive = setting.into();
    active.is_enabled = Set(enabled);
    active.updated_at = Set(Utc::now().into());
    active.update(&state.orm).await?;
    Ok(())
}
