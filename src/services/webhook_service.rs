//! Applies verified provider events to payments and orders.
//!
//! Providers deliver at least once and may race each other, so every change
//! is decided under a row lock on the payment and a status that does not
//! move forward is a no-op.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionTrait, sea_query::LockType,
};
use uuid::Uuid;

use crate::{
    audit::{self, log_payment},
    entity::{
        orders::{ActiveModel as OrderActive, Entity as Orders, Model as OrderModel},
        payments::{
            ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments,
            Model as PaymentModel,
        },
        sea_orm_active_enums::{OrderStatus, PaymentStatus},
        users::Entity as Users,
    },
    error::{AppError, AppResult},
    notify::{self, Notification, Recipient},
    providers::{PaymentLookup, ProviderError, ProviderEvent},
    services::refund_service,
    state::AppState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event type this service does not act on.
    Ignored,
    /// No local payment carries the provider reference.
    Unmatched,
    /// Duplicate or stale delivery.
    Unchanged { payment_id: Uuid },
    Applied {
        payment_id: Uuid,
        status: PaymentStatus,
    },
}

/// Changes one event makes to a payment row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub advance_to: Option<PaymentStatus>,
    pub intent_id: Option<String>,
    pub capture_id: Option<String>,
}

impl Transition {
    pub fn is_noop(&self) -> bool {
        self.advance_to.is_none() && self.intent_id.is_none() && self.capture_id.is_none()
    }
}

pub fn lookup_for(event: &ProviderEvent) -> Option<PaymentLookup> {
    match event {
        ProviderEvent::SessionCompleted { session_id, .. } => {
            Some(PaymentLookup::CardSession(session_id.clone()))
        }
        ProviderEvent::WalletApproved { order_id } => {
            Some(PaymentLookup::WalletOrder(order_id.clone()))
        }
        ProviderEvent::PaymentProcessing { lookup }
        | ProviderEvent::PaymentSucceeded { lookup, .. }
        | ProviderEvent::PaymentFailed { lookup, .. } => Some(lookup.clone()),
        ProviderEvent::Ignored { .. } => None,
    }
}

/// Decide what `event` changes on `payment`. A succeeded payment is final.
pub fn plan(payment: &PaymentModel, event: &ProviderEvent) -> Transition {
    if payment.status == PaymentStatus::Succeeded {
        return Transition::default();
    }

    let target = match event {
        ProviderEvent::SessionCompleted { paid: true, .. }
        | ProviderEvent::PaymentSucceeded { .. } => Some(PaymentStatus::Succeeded),
        ProviderEvent::SessionCompleted { paid: false, .. }
        | ProviderEvent::PaymentProcessing { .. } => Some(PaymentStatus::Processing),
        ProviderEvent::PaymentFailed { .. } => Some(PaymentStatus::Failed),
        ProviderEvent::WalletApproved { .. } | ProviderEvent::Ignored { .. } => None,
    };

    let reported_intent = match event {
        ProviderEvent::SessionCompleted { intent_id, .. } => intent_id.clone(),
        ProviderEvent::PaymentProcessing { lookup }
        | ProviderEvent::PaymentSucceeded { lookup, .. }
        | ProviderEvent::PaymentFailed { lookup, .. } => match lookup {
            PaymentLookup::CardIntent { intent_id, .. } => Some(intent_id.clone()),
            _ => None,
        },
        _ => None,
    };
    let reported_capture = match event {
        ProviderEvent::PaymentSucceeded {
            lookup: PaymentLookup::WalletOrder(_),
            capture_id,
        } => capture_id.clone(),
        _ => None,
    };

    Transition {
        advance_to: target.filter(|next| payment.status.can_advance_to(*next)),
        intent_id: reported_intent.filter(|_| payment.stripe_payment_intent_id.is_none()),
        capture_id: reported_capture.filter(|_| payment.paypal_capture_id.is_none()),
    }
}

pub async fn reconcile(state: &AppState, event: ProviderEvent) -> AppResult<WebhookOutcome> {
    match &event {
        ProviderEvent::Ignored { kind } => {
            tracing::debug!(kind = %kind, "webhook event ignored");
            Ok(WebhookOutcome::Ignored)
        }
        ProviderEvent::WalletApproved { order_id } => capture_wallet_order(state, order_id).await,
        _ => apply_event(state, &event).await,
    }
}

async fn find_payment<C: ConnectionTrait>(
    conn: &C,
    lookup: &PaymentLookup,
) -> AppResult<Option<PaymentModel>> {
    let by_column = |column: PaymentCol, value: &str| {
        Payments::find()
            .filter(column.eq(value.to_string()))
            .lock(LockType::Update)
    };

    let payment = match lookup {
        PaymentLookup::CardSession(session_id) => {
            by_column(PaymentCol::StripeSessionId, session_id)
                .one(conn)
                .await?
        }
        PaymentLookup::WalletOrder(order_id) => {
            by_column(PaymentCol::PaypalOrderId, order_id).one(conn).await?
        }
        PaymentLookup::CardIntent {
            intent_id,
            payment_id,
        } => {
            let found = by_column(PaymentCol::StripePaymentIntentId, intent_id)
                .one(conn)
                .await?;
            match (found, payment_id) {
                (Some(payment), _) => Some(payment),
                (None, Some(payment_id)) => {
                    Payments::find_by_id(*payment_id)
                        .lock(LockType::Update)
                        .one(conn)
                        .await?
                }
                (None, None) => None,
            }
        }
    };
    Ok(payment)
}

async fn apply_event(state: &AppState, event: &ProviderEvent) -> AppResult<WebhookOutcome> {
    let Some(lookup) = lookup_for(event) else {
        return Ok(WebhookOutcome::Ignored);
    };

    let txn = state.orm.begin().await?;

    let Some(payment) = find_payment(&txn, &lookup).await? else {
        tracing::info!(lookup = ?lookup, "webhook for unknown payment ignored");
        return Ok(WebhookOutcome::Unmatched);
    };

    let transition = plan(&payment, event);
    if transition.is_noop() {
        tracing::debug!(payment_id = %payment.id, "duplicate webhook delivery");
        return Ok(WebhookOutcome::Unchanged {
            payment_id: payment.id,
        });
    }

    let now = Utc::now();
    let payment_id = payment.id;
    let order_id = payment.order_id;
    let mut active: PaymentActive = payment.into();
    if let Some(status) = transition.advance_to {
        active.status = Set(status);
        if status == PaymentStatus::Succeeded {
            active.paid_at = Set(Some(now.into()));
        }
    }
    if let Some(intent_id) = &transition.intent_id {
        active.stripe_payment_intent_id = Set(Some(intent_id.clone()));
    }
    if let Some(capture_id) = &transition.capture_id {
        active.paypal_capture_id = Set(Some(capture_id.clone()));
    }
    active.updated_at = Set(now.into());
    let payment = active
        .update(&txn)
        .await
        .map_err(|err| AppError::conflict_on_unique(err, "Provider reference already recorded"))?;

    let (label, message) = match (transition.advance_to, event) {
        (Some(PaymentStatus::Succeeded), _) => {
            (audit::PAYMENT_SUCCEEDED, "Payment confirmed by provider".to_string())
        }
        (Some(PaymentStatus::Failed), ProviderEvent::PaymentFailed { reason, .. }) => (
            audit::PAYMENT_FAILED,
            format!(
                "Payment failed: {}",
                reason.as_deref().unwrap_or("no reason given")
            ),
        ),
        (Some(status), _) => (
            audit::PAYMENT_PROCESSING,
            format!("Payment is {}", status.as_str()),
        ),
        (None, _) => (
            audit::SESSION_COMPLETED,
            "Provider reference recorded".to_string(),
        ),
    };
    log_payment(&txn, payment.id, label, message).await?;

    let succeeded = transition.advance_to == Some(PaymentStatus::Succeeded);
    let order = if succeeded {
        Some(confirm_order(&txn, order_id).await?)
    } else {
        None
    };

    txn.commit().await?;
    tracing::info!(payment_id = %payment_id, status = payment.status.as_str(), "payment reconciled");

    match order {
        Some(order) if order.order_status == OrderStatus::Cancelled => {
            refund_late_payment(state, &order, &payment).await;
        }
        Some(_) => {
            if let Err(err) = notify_payment_confirmed(state, &payment).await {
                tracing::warn!(error = %err, payment_id = %payment_id, "payment notification skipped");
            }
        }
        None => {}
    }

    Ok(WebhookOutcome::Applied {
        payment_id,
        status: payment.status,
    })
}

/// Move a pending order to confirmed. Returns the order as it stands after
/// the payment succeeded.
async fn confirm_order<C: ConnectionTrait>(conn: &C, order_id: Uuid) -> AppResult<OrderModel> {
    let order = Orders::find_by_id(order_id)
        .lock(LockType::Update)
        .one(conn)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    if order.order_status != OrderStatus::Pending {
        return Ok(order);
    }

    let mut active: OrderActive = order.into();
    active.order_status = Set(OrderStatus::Confirmed);
    active.updated_at = Set(Utc::now().into());
    let order = active.update(conn).await?;
    tracing::info!(order_id = %order_id, "order confirmed");
    Ok(order)
}

/// The checkout completed after the order was cancelled. The money goes back
/// instead of a confirmation e-mail going out.
async fn refund_late_payment(state: &AppState, order: &OrderModel, payment: &PaymentModel) {
    tracing::warn!(order_id = %order.id, payment_id = %payment.id, "payment succeeded on a cancelled order");
    let reason = Some("Payment completed after the order was cancelled".to_string());
    match refund_service::refund_cancelled_order(state, order, payment, reason).await {
        Ok(refund) => {
            tracing::info!(refund_id = %refund.id, order_id = %order.id, status = ?refund.status, "late payment refund recorded");
        }
        Err(err) => {
            tracing::error!(error = %err, order_id = %order.id, payment_id = %payment.id, "late payment refund not recorded");
        }
    }
}

async fn notify_payment_confirmed(state: &AppState, payment: &PaymentModel) -> AppResult<()> {
    let order = Orders::find_by_id(payment.order_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    let owner = Users::find_by_id(order.user_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound("User"))?;

    notify::dispatch(
        state.notifier.clone(),
        Notification::PaymentConfirmed {
            to: Recipient {
                email: owner.email,
                name: owner.name,
            },
            order_id: order.id,
            amount: payment.amount,
            currency: payment.currency.clone(),
        },
    );
    Ok(())
}

/// The buyer approved a wallet order; collect the funds. Completion arrives
/// as a separate capture event.
async fn capture_wallet_order(state: &AppState, wallet_order_id: &str) -> AppResult<WebhookOutcome> {
    let lookup = PaymentLookup::WalletOrder(wallet_order_id.to_string());
    let Some(payment) = find_payment(&state.orm, &lookup).await? else {
        tracing::info!(wallet_order_id, "approval for unknown wallet order ignored");
        return Ok(WebhookOutcome::Unmatched);
    };
    if payment.paypal_capture_id.is_some()
        || !payment.status.can_advance_to(PaymentStatus::Processing)
    {
        return Ok(WebhookOutcome::Unchanged {
            payment_id: payment.id,
        });
    }

    let order = Orders::find_by_id(payment.order_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    if order.order_status == OrderStatus::Cancelled {
        tracing::info!(order_id = %order.id, payment_id = %payment.id, "approval for cancelled order not captured");
        return Ok(WebhookOutcome::Unchanged {
            payment_id: payment.id,
        });
    }

    let wallet = state.providers.wallet()?;
    let capture_id = match wallet.capture(wallet_order_id).await {
        Ok(capture_id) => capture_id,
        Err(ProviderError::AlreadyProcessed { reference }) => reference,
        Err(err) => {
            tracing::warn!(error = %err, payment_id = %payment.id, "wallet capture failed");
            return Err(err.into());
        }
    };

    let txn = state.orm.begin().await?;
    let Some(payment) = find_payment(&txn, &lookup).await? else {
        return Ok(WebhookOutcome::Unmatched);
    };
    if !payment.status.can_advance_to(PaymentStatus::Processing) {
        return Ok(WebhookOutcome::Unchanged {
            payment_id: payment.id,
        });
    }

    let payment_id = payment.id;
    let keep_capture = payment.paypal_capture_id.clone();
    let mut active: PaymentActive = payment.into();
    active.status = Set(PaymentStatus::Processing);
    active.paypal_capture_id = Set(keep_capture.or(capture_id.clone()));
    active.updated_at = Set(Utc::now().into());
    active.update(&txn).await?;

    log_payment(
        &txn,
        payment_id,
        audit::CAPTURE_REQUESTED,
        format!(
            "Capture requested for wallet order {wallet_order_id}{}",
            capture_id
                .as_deref()
                .map(|id| format!(" ({id})"))
                .unwrap_or_default()
        ),
    )
    .await?;

    txn.commit().await?;
    tracing::info!(payment_id = %payment_id, "wallet capture requested");

    Ok(WebhookOutcome::Applied {
        payment_id,
        status: PaymentStatus::Processing,
    })
}
