use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait, sea_query::LockType,
};
use uuid::Uuid;

use crate::{
    audit::{self, log_payment},
    dto::payments::{CheckoutSessionResponse, CreateCheckoutSessionRequest, PaymentDetail},
    entity::{
        orders::{Entity as Orders, Model as OrderModel},
        payment_logs::{Column as PaymentLogCol, Entity as PaymentLogs},
        payment_method_settings::Entity as PaymentMethodSettings,
        payments::{ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments},
        sea_orm_active_enums::{OrderStatus, PaymentMethod, PaymentStatus},
    },
    error::{AppError, AppResult},
    middleware::{auth::AuthUser, policy::Capability},
    models::{Payment, PaymentLog},
    providers::{Channel, ProviderSession, SessionRequest, format_amount},
    response::{ApiResponse, Meta},
    state::AppState,
};

const DUPLICATE_PAYMENT: &str = "A payment already exists for this order";

/// Lower-cased ISO 4217 code.
pub fn normalize_currency(currency: &str) -> AppResult<String> {
    let currency = currency.trim();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AppError::BadRequest(format!(
            "Invalid currency code: {currency}"
        )));
    }
    Ok(currency.to_ascii_lowercase())
}

pub fn redirect_urls(frontend_url: &str, order_id: Uuid) -> (String, String) {
    (
        format!("{frontend_url}/payment/success?order_id={order_id}"),
        format!("{frontend_url}/payment/cancel?order_id={order_id}"),
    )
}

pub async fn create_checkout_session(
    state: &AppState,
    user: &AuthUser,
    payload: CreateCheckoutSessionRequest,
) -> AppResult<ApiResponse<CheckoutSessionResponse>> {
    let currency = normalize_currency(&payload.currency)?;
    let method = payload.payment_method;

    let order = Orders::find_by_id(payload.order_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    user.require_owner_or(order.user_id, Capability::ManageOrders)?;

    let existing = Payments::find()
        .filter(PaymentCol::OrderId.eq(order.id))
        .one(&state.orm)
        .await?;
    if existing.is_some() {
        return Err(AppError::Conflict(DUPLICATE_PAYMENT.into()));
    }
    if order.order_status != OrderStatus::Pending {
        return Err(AppError::InvalidState(
            "Only pending orders can be paid".into(),
        ));
    }

    let enabled = PaymentMethodSettings::find_by_id(method)
        .one(&state.orm)
        .await?
        .is_some_and(|setting| setting.is_enabled);
    if !enabled {
        return Err(AppError::Forbidden(format!(
            "Payment method {} is disabled",
            method.as_str()
        )));
    }

    let channel = state.providers.channel(method)?;
    let payment_id = Uuid::new_v4();

    let (payment, checkout_url) = match channel {
        Channel::CashOnDelivery => {
            let payment = record_cash_on_delivery(state, &order, payment_id, &currency).await?;
            (payment, String::new())
        }
        Channel::Card(provider) | Channel::Wallet(provider) => {
            if order.final_amount <= 0 {
                return Err(AppError::InvalidState(
                    "Nothing to pay online for this order".into(),
                ));
            }
            let (success_url, cancel_url) = redirect_urls(&state.config.frontend_url, order.id);
            let request = SessionRequest {
                order_id: order.id,
                payment_id,
                amount: order.final_amount,
                currency: currency.clone(),
                success_url,
                cancel_url,
            };

            // Nothing is written locally until the provider accepted the session.
            let session = provider.create_session(&request).await.map_err(|err| {
                tracing::warn!(error = %err, order_id = %order.id, method = method.as_str(), "checkout session failed");
                AppError::Provider(err)
            })?;
            let checkout_url = session.checkout_url.clone();
            let payment = record_online(state, &order, payment_id, method, &currency, session).await?;
            (payment, checkout_url)
        }
    };

    Ok(ApiResponse::success(
        "Checkout session created",
        CheckoutSessionResponse {
            payment_id: payment.id,
            checkout_url,
            amount: payment.amount,
            currency: payment.currency.clone(),
            status: payment.status,
        },
        Some(Meta::empty()),
    ))
}

async fn record_online(
    state: &AppState,
    order: &OrderModel,
    payment_id: Uuid,
    method: PaymentMethod,
    currency: &str,
    session: ProviderSession,
) -> AppResult<Payment> {
    let txn = state.orm.begin().await?;
    let order = &lock_payable_order(&txn, order).await?;

    let mut active = new_payment(order, payment_id, method, currency, PaymentStatus::Created);
    if method == PaymentMethod::Paypal {
        active.paypal_order_id = Set(Some(session.session_id.clone()));
    } else {
        active.stripe_session_id = Set(Some(session.session_id.clone()));
        active.stripe_payment_intent_id = Set(session.intent_id.clone());
    }
    let payment = active
        .insert(&txn)
        .await
        .map_err(|err| AppError::conflict_on_unique(err, DUPLICATE_PAYMENT))?;

    log_payment(
        &txn,
        payment.id,
        audit::CHECKOUT_SESSION_CREATED,
        format!(
            "Session {} created for {} {}",
            session.session_id,
            format_amount(payment.amount, &payment.currency),
            payment.currency
        ),
    )
    .await?;

    txn.commit().await?;
    tracing::info!(order_id = %order.id, payment_id = %payment.id, method = method.as_str(), "checkout session created");
    Ok(payment.into())
}

async fn record_cash_on_delivery(
    state: &AppState,
    order: &OrderModel,
    payment_id: Uuid,
    currency: &str,
) -> AppResult<Payment> {
    let txn = state.orm.begin().await?;
    let order = &lock_payable_order(&txn, order).await?;

    let payment = new_payment(
        order,
        payment_id,
        PaymentMethod::CashOnDelivery,
        currency,
        PaymentStatus::Pending,
    )
    .insert(&txn)
    .await
    .map_err(|err| AppError::conflict_on_unique(err, DUPLICATE_PAYMENT))?;

    log_payment(
        &txn,
        payment.id,
        audit::CASH_ON_DELIVERY_CREATED,
        format!(
            "Cash on delivery for {} {}",
            format_amount(payment.amount, &payment.currency),
            payment.currency
        ),
    )
    .await?;

    txn.commit().await?;
    tracing::info!(order_id = %order.id, payment_id = %payment.id, "cash on delivery payment created");
    Ok(payment.into())
}

/// Check that the order can still be paid at the amount it was priced at.
pub fn ensure_payable(current: &OrderModel, priced_amount: i64) -> AppResult<()> {
    if current.order_status != OrderStatus::Pending {
        return Err(AppError::InvalidState(
            "Only pending orders can be paid".into(),
        ));
    }
    if current.final_amount != priced_amount {
        return Err(AppError::Conflict(
            "Order total changed during checkout, start the checkout again".into(),
        ));
    }
    Ok(())
}

/// Re-read the order under a row lock inside the payment transaction so a
/// concurrent coupon or cancellation cannot slip in before the insert.
async fn lock_payable_order<C: ConnectionTrait>(
    conn: &C,
    priced: &OrderModel,
) -> AppResult<OrderModel> {
    let current = Orders::find_by_id(priced.id)
        .lock(LockType::Update)
        .one(conn)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    ensure_payable(&current, priced.final_amount).map_err(|err| {
        tracing::warn!(order_id = %priced.id, error = %err, "order changed during checkout");
        err
    })?;
    Ok(current)
}

fn new_payment(
    order: &OrderModel,
    payment_id: Uuid,
    method: PaymentMethod,
    currency: &str,
    status: PaymentStatus,
) -> PaymentActive {
    PaymentActive {
        id: Set(payment_id),
        order_id: Set(order.id),
        payment_method: Set(method),
        currency: Set(currency.to_string()),
        amount: Set(order.final_amount),
        status: Set(status),
        stripe_session_id: Set(None),
        stripe_payment_intent_id: Set(None),
        paypal_order_id: Set(None),
        paypal_capture_id: Set(None),
        paid_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
}

pub async fn get_payment(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<PaymentDetail>> {
    let payment = Payments::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound("Payment"))?;
    let order = Orders::find_by_id(payment.order_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    user.require_owner_or(order.user_id, Capability::ViewAllPayments)?;

    let logs = PaymentLogs::find()
        .filter(PaymentLogCol::PaymentId.eq(payment.id))
        .order_by_asc(PaymentLogCol::CreatedAt)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(PaymentLog::from)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        PaymentDetail {
            payment: payment.into(),
            logs,
        },
        Some(Meta::empty()),
    ))
}
