//! Refund requests and their approval against the payment provider.

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, Condition, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait, sea_query::LockType,
};
use uuid::Uuid;

use crate::{
    audit::{self, log_payment},
    dto::refunds::{RefundList, RefundRequestBody},
    entity::{
        orders::{Column as OrderCol, Entity as Orders, Model as OrderModel},
        payments::{Column as PaymentCol, Entity as Payments, Model as PaymentModel},
        refunds::{ActiveModel as RefundActive, Column as RefundCol, Entity as Refunds},
        sea_orm_active_enums::{OrderStatus, PaymentStatus, RefundStatus},
    },
    error::{AppError, AppResult},
    middleware::{auth::AuthUser, policy::Capability},
    models::Refund,
    providers::{Channel, ChargeState, ProviderError, RefundRequest, format_amount},
    response::{ApiResponse, Meta},
    routes::params::RefundListQuery,
    state::AppState,
};

pub const REFUND_WINDOW_DAYS: i64 = 15;

const DUPLICATE_REFUND: &str = "A refund already exists for this order";

/// Customers may ask for a refund once the order shipped, within the window.
pub fn check_eligibility(order: &OrderModel, now: DateTime<Utc>) -> AppResult<()> {
    if !matches!(
        order.order_status,
        OrderStatus::Shipped | OrderStatus::Delivered
    ) {
        return Err(AppError::InvalidState(
            "Refunds are allowed only after the order has shipped".into(),
        ));
    }
    let placed = order.created_at.with_timezone(&Utc);
    if placed < now - Duration::days(REFUND_WINDOW_DAYS) {
        return Err(AppError::Expired(format!(
            "{REFUND_WINDOW_DAYS}-day refund window expired"
        )));
    }
    Ok(())
}

pub async fn request_refund(
    state: &AppState,
    user: &AuthUser,
    payload: RefundRequestBody,
) -> AppResult<ApiResponse<Refund>> {
    let order = Orders::find_by_id(payload.order_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    if order.user_id != user.user_id {
        return Err(AppError::Forbidden(
            "Refunds can only be requested by the order owner".into(),
        ));
    }
    check_eligibility(&order, Utc::now())?;

    let existing = Refunds::find()
        .filter(RefundCol::OrderId.eq(order.id))
        .count(&state.orm)
        .await?;
    if existing > 0 {
        return Err(AppError::Conflict(DUPLICATE_REFUND.into()));
    }

    let payment = Payments::find()
        .filter(PaymentCol::OrderId.eq(order.id))
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::InvalidState("Order has no payment to refund".into()))?;
    if payment.status != PaymentStatus::Succeeded {
        return Err(AppError::InvalidState(
            "Payment has not been collected yet".into(),
        ));
    }

    let reason = payload
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    let refund = insert_requested(state, &order, &payment, reason).await?;

    tracing::info!(refund_id = %refund.id, order_id = %order.id, "refund requested");
    Ok(ApiResponse::success(
        "Refund requested",
        refund.into(),
        Some(Meta::empty()),
    ))
}

async fn insert_requested(
    state: &AppState,
    order: &OrderModel,
    payment: &PaymentModel,
    reason: Option<String>,
) -> AppResult<crate::entity::refunds::Model> {
    RefundActive {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        payment_id: Set(payment.id),
        provider_refund_id: Set(None),
        amount: Set(order.final_amount.min(payment.amount)),
        reason: Set(reason),
        status: Set(RefundStatus::Requested),
        refunded_by: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&state.orm)
    .await
    .map_err(|err| AppError::conflict_on_unique(err, DUPLICATE_REFUND))
}

pub async fn approve_refund(
    state: &AppState,
    user: &AuthUser,
    refund_id: Uuid,
) -> AppResult<ApiResponse<Refund>> {
    user.require(Capability::ApproveRefunds)?;
    let refund = process_refund(state, refund_id, Some(user.user_id)).await?;
    Ok(ApiResponse::success(
        "Refund approved",
        refund,
        Some(Meta::empty()),
    ))
}

/// What the payment channel reported for a refund attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    Issued { refund_id: String },
    AlreadyRefunded { refund_id: Option<String> },
    NotRefundable(String),
    NoCharge,
    Failed(ProviderError),
}

/// Refund `amount` of `payment` through `channel`. The provider is asked
/// about the charge first so an earlier refund is reconciled rather than
/// repeated.
pub async fn execute(
    channel: &Channel,
    payment: &PaymentModel,
    refund_id: Uuid,
    amount: i64,
) -> ProviderOutcome {
    let provider = match channel {
        Channel::CashOnDelivery => {
            return ProviderOutcome::Issued {
                refund_id: format!("manual_{refund_id}"),
            };
        }
        Channel::Card(provider) | Channel::Wallet(provider) => provider,
    };

    let Some(reference) = payment.charge_reference() else {
        return ProviderOutcome::NoCharge;
    };
    let charge = match provider.retrieve_charge(reference).await {
        Ok(charge) => charge,
        Err(err) => return ProviderOutcome::Failed(err),
    };

    match charge.state {
        ChargeState::Missing => ProviderOutcome::NoCharge,
        ChargeState::AlreadyRefunded { refund_id } => ProviderOutcome::AlreadyRefunded { refund_id },
        ChargeState::NotRefundable(status) => ProviderOutcome::NotRefundable(status),
        ChargeState::Refundable => {
            let request = RefundRequest {
                charge_id: charge.id,
                amount,
                currency: payment.currency.clone(),
                idempotency_key: format!("refund_{refund_id}"),
            };
            match provider.refund(&request).await {
                Ok(refund) => ProviderOutcome::Issued {
                    refund_id: refund.refund_id,
                },
                Err(err) => ProviderOutcome::Failed(err),
            }
        }
    }
}

#[derive(Debug)]
pub struct Settlement {
    pub status: RefundStatus,
    pub provider_refund_id: Option<String>,
    pub log_status: &'static str,
    pub message: String,
    pub error: Option<AppError>,
}

/// Map a provider outcome to the refund's final state.
///
/// Already-refunded charges count as approved. Missing or unrefundable
/// charges reject the refund. Transport, credential and configuration
/// problems leave it requested so it can be approved again; the idempotency
/// key keeps a retry from paying out twice.
pub fn settle(outcome: ProviderOutcome) -> Settlement {
    match outcome {
        ProviderOutcome::Issued { refund_id } => Settlement {
            status: RefundStatus::Approved,
            message: format!("Refund {refund_id} issued"),
            provider_refund_id: Some(refund_id),
            log_status: audit::REFUND_APPROVED,
            error: None,
        },
        ProviderOutcome::AlreadyRefunded { refund_id }
        | ProviderOutcome::Failed(ProviderError::AlreadyProcessed {
            reference: refund_id,
        }) => Settlement {
            status: RefundStatus::Approved,
            message: format!(
                "Charge was already refunded{}",
                refund_id
                    .as_deref()
                    .map(|id| format!(" ({id})"))
                    .unwrap_or_default()
            ),
            provider_refund_id: refund_id,
            log_status: audit::REFUND_RECONCILED,
            error: None,
        },
        ProviderOutcome::NoCharge | ProviderOutcome::Failed(ProviderError::NotFound(_)) => {
            Settlement {
                status: RefundStatus::Rejected,
                provider_refund_id: None,
                log_status: audit::REFUND_REJECTED,
                message: "No charge found at the provider".into(),
                error: Some(AppError::Provider(ProviderError::NotFound(
                    "charge".into(),
                ))),
            }
        }
        ProviderOutcome::NotRefundable(status) => Settlement {
            status: RefundStatus::Rejected,
            provider_refund_id: None,
            log_status: audit::REFUND_REJECTED,
            message: format!("Charge is not refundable ({status})"),
            error: Some(AppError::Provider(ProviderError::Rejected(format!(
                "charge is not refundable ({status})"
            )))),
        },
        ProviderOutcome::Failed(err @ ProviderError::Rejected(_)) => Settlement {
            status: RefundStatus::Rejected,
            provider_refund_id: None,
            log_status: audit::REFUND_REJECTED,
            message: format!("Provider refused the refund: {err}"),
            error: Some(AppError::Provider(err)),
        },
        ProviderOutcome::Failed(err) => Settlement {
            status: RefundStatus::Requested,
            provider_refund_id: None,
            log_status: audit::REFUND_FAILED,
            message: format!("Refund attempt failed: {err}"),
            error: Some(AppError::Provider(err)),
        },
    }
}

/// Run the approval protocol for a requested refund.
///
/// The refund row stays locked for the whole call. Writes go through a
/// savepoint and are committed even when the provider outcome is surfaced as
/// an error.
pub async fn process_refund(
    state: &AppState,
    refund_id: Uuid,
    approver: Option<Uuid>,
) -> AppResult<Refund> {
    let txn = state.orm.begin().await?;

    let refund = Refunds::find_by_id(refund_id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound("Refund"))?;
    if refund.status != RefundStatus::Requested {
        return Err(AppError::Conflict("Refund has already been processed".into()));
    }

    let payment = Payments::find_by_id(refund.payment_id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound("Payment"))?;
    if payment.status != PaymentStatus::Succeeded {
        return Err(AppError::InvalidState(
            "Only succeeded payments can be refunded".into(),
        ));
    }

    let outcome = match state.providers.channel(payment.payment_method) {
        Ok(channel) => execute(&channel, &payment, refund.id, refund.amount).await,
        Err(err) => ProviderOutcome::Failed(err),
    };
    let settlement = settle(outcome);

    let savepoint = txn.begin().await?;
    let mut active: RefundActive = refund.into();
    active.status = Set(settlement.status);
    if settlement.provider_refund_id.is_some() {
        active.provider_refund_id = Set(settlement.provider_refund_id.clone());
    }
    if settlement.status != RefundStatus::Requested {
        active.refunded_by = Set(approver);
    }
    active.updated_at = Set(Utc::now().into());
    let refund = active.update(&savepoint).await?;

    log_payment(
        &savepoint,
        payment.id,
        settlement.log_status,
        format!(
            "{} for {} {}",
            settlement.message,
            format_amount(refund.amount, &payment.currency),
            payment.currency
        ),
    )
    .await?;
    savepoint.commit().await?;
    txn.commit().await?;

    match settlement.error {
        Some(err) => {
            tracing::warn!(
                refund_id = %refund.id,
                payment_id = %payment.id,
                status = ?refund.status,
                error = %err,
                "refund not completed"
            );
            Err(err)
        }
        None => {
            tracing::info!(refund_id = %refund.id, payment_id = %payment.id, "refund approved");
            Ok(refund.into())
        }
    }
}

/// Refund an online payment of an order that was just cancelled.
///
/// Provider failures do not undo the cancellation; the refund is returned in
/// whatever state the attempt left it.
pub async fn refund_cancelled_order(
    state: &AppState,
    order: &OrderModel,
    payment: &PaymentModel,
    reason: Option<String>,
) -> AppResult<Refund> {
    let active = Refunds::find()
        .filter(
            Condition::all()
                .add(RefundCol::OrderId.eq(order.id))
                .add(RefundCol::Status.is_in([RefundStatus::Requested, RefundStatus::Approved])),
        )
        .one(&state.orm)
        .await?;
    let refund = match active {
        Some(refund) => refund,
        None => {
            let reason = reason.or_else(|| Some("Order cancelled".to_string()));
            insert_requested(state, order, payment, reason).await?
        }
    };
    if refund.status != RefundStatus::Requested {
        return Ok(refund.into());
    }

    match process_refund(state, refund.id, None).await {
        Ok(refund) => Ok(refund),
        Err(err) => {
            tracing::warn!(error = %err, refund_id = %refund.id, order_id = %order.id, "automatic refund did not complete");
            let current = Refunds::find_by_id(refund.id)
                .one(&state.orm)
                .await?
                .ok_or(AppError::NotFound("Refund"))?;
            Ok(current.into())
        }
    }
}

pub async fn list_refunds(
    state: &AppState,
    user: &AuthUser,
    query: RefundListQuery,
) -> AppResult<ApiResponse<RefundList>> {
    let page = query.page();

    let mut finder = Refunds::find();
    if !user.can(Capability::ViewAllRefunds) {
        finder = finder
            .inner_join(Orders)
            .filter(OrderCol::UserId.eq(user.user_id));
    }
    if let Some(status) = query.status {
        finder = finder.filter(RefundCol::Status.eq(status));
    }
    let finder = finder.order_by_desc(RefundCol::CreatedAt);

    let total = finder.clone().count(&state.orm).await?;
    let items = finder
        .limit(page.per_page)
        .offset(page.offset)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Refund::from)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        RefundList { items },
        Some(Meta::paged(&page, total)),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        entity::sea_orm_active_enums::PaymentMethod,
        providers::{Charge, MockPaymentProvider, PaymentProvider, ProviderRefund},
    };

    fn order(status: OrderStatus, age_days: i64) -> OrderModel {
        let created = Utc::now() - Duration::days(age_days);
        OrderModel {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            order_date: created.into(),
            order_amount: 200,
            shipping_charge: 0,
            discount_amount: 0,
            final_amount: 200,
            shipping_date: None,
            order_status: status,
            cancel_reason: None,
            coupon_id: None,
            created_at: created.into(),
            updated_at: created.into(),
        }
    }

    fn card_payment() -> PaymentModel {
        PaymentModel {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            payment_method: PaymentMethod::CreditCard,
            currency: "usd".into(),
            amount: 200,
            status: PaymentStatus::Succeeded,
            stripe_session_id: Some("cs_1".into()),
            stripe_payment_intent_id: Some("pi_1".into()),
            paypal_order_id: None,
            paypal_capture_id: None,
            paid_at: Some(Utc::now().into()),
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    fn card(provider: MockPaymentProvider) -> Channel {
        let provider: Arc<dyn PaymentProvider> = Arc::new(provider);
        Channel::Card(provider)
    }

    #[test]
    fn refund_window_is_fifteen_days() {
        let now = Utc::now();
        assert!(check_eligibility(&order(OrderStatus::Delivered, 3), now).is_ok());
        assert!(matches!(
            check_eligibility(&order(OrderStatus::Delivered, 20), now),
            Err(AppError::Expired(_))
        ));
        assert!(matches!(
            check_eligibility(&order(OrderStatus::Confirmed, 1), now),
            Err(AppError::InvalidState(_))
        ));
        assert!(check_eligibility(&order(OrderStatus::Shipped, 1), now).is_ok());
    }

    #[tokio::test]
    async fn already_refunded_charge_is_not_refunded_again() {
        let mut provider = MockPaymentProvider::new();
        provider
            .expect_retrieve_charge()
            .withf(|reference| reference == "pi_1")
            .times(1)
            .returning(|_| {
                Ok(Charge {
                    id: "ch_1".into(),
                    state: ChargeState::AlreadyRefunded {
                        refund_id: Some("re_old".into()),
                    },
                })
            });
        provider.expect_refund().times(0);

        let outcome = execute(&card(provider), &card_payment(), Uuid::new_v4(), 200).await;
        let settlement = settle(outcome);
        assert_eq!(settlement.status, RefundStatus::Approved);
        assert_eq!(settlement.provider_refund_id.as_deref(), Some("re_old"));
        assert!(settlement.error.is_none());
    }

    #[tokio::test]
    async fn refund_uses_idempotency_key_derived_from_refund() {
        let refund_id = Uuid::new_v4();
        let expected_key = format!("refund_{refund_id}");

        let mut provider = MockPaymentProvider::new();
        provider.expect_retrieve_charge().times(1).returning(|_| {
            Ok(Charge {
                id: "ch_1".into(),
                state: ChargeState::Refundable,
            })
        });
        provider
            .expect_refund()
            .withf(move |req| {
                req.idempotency_key == expected_key && req.charge_id == "ch_1" && req.amount == 200
            })
            .times(1)
            .returning(|_| {
                Ok(ProviderRefund {
                    refund_id: "re_new".into(),
                })
            });

        let outcome = execute(&card(provider), &card_payment(), refund_id, 200).await;
        assert_eq!(
            outcome,
            ProviderOutcome::Issued {
                refund_id: "re_new".into()
            }
        );
    }

    #[tokio::test]
    async fn cash_on_delivery_is_refunded_offline() {
        let refund_id = Uuid::new_v4();
        let mut payment = card_payment();
        payment.payment_method = PaymentMethod::CashOnDelivery;
        let outcome = execute(&Channel::CashOnDelivery, &payment, refund_id, 200).await;
        assert_eq!(
            outcome,
            ProviderOutcome::Issued {
                refund_id: format!("manual_{refund_id}")
            }
        );
    }

    #[tokio::test]
    async fn payment_without_charge_reference_has_no_charge() {
        let mut provider = MockPaymentProvider::new();
        provider.expect_retrieve_charge().times(0);
        let mut payment = card_payment();
        payment.stripe_payment_intent_id = None;
        let outcome = execute(&card(provider), &payment, Uuid::new_v4(), 200).await;
        assert_eq!(outcome, ProviderOutcome::NoCharge);
    }

    #[tokio::test]
    async fn provider_outage_leaves_refund_retryable() {
        let mut provider = MockPaymentProvider::new();
        provider.expect_retrieve_charge().times(1).returning(|_| {
            Ok(Charge {
                id: "ch_1".into(),
                state: ChargeState::Refundable,
            })
        });
        provider
            .expect_refund()
            .times(1)
            .returning(|_| Err(ProviderError::Transport("try again".into())));

        let outcome = execute(&card(provider), &card_payment(), Uuid::new_v4(), 200).await;
        let settlement = settle(outcome);
        assert_eq!(settlement.status, RefundStatus::Requested);
        assert_eq!(settlement.log_status, audit::REFUND_FAILED);
        assert!(settlement.provider_refund_id.is_none());
        assert!(matches!(
            settlement.error,
            Some(AppError::Provider(ProviderError::Transport(_)))
        ));
    }

    #[test]
    fn settlement_distinguishes_provider_errors() {
        let reconciled = settle(ProviderOutcome::Failed(ProviderError::AlreadyProcessed {
            reference: None,
        }));
        assert_eq!(reconciled.status, RefundStatus::Approved);
        assert!(reconciled.error.is_none());

        let missing = settle(ProviderOutcome::Failed(ProviderError::NotFound(
            "pi_1".into(),
        )));
        assert_eq!(missing.status, RefundStatus::Rejected);
        assert!(missing.error.is_some());

        let unreachable = settle(ProviderOutcome::Failed(ProviderError::Transport(
            "timeout".into(),
        )));
        assert_eq!(unreachable.status, RefundStatus::Requested);
        assert_eq!(unreachable.log_status, audit::REFUND_FAILED);
        assert!(unreachable.error.is_some());

        let refused = settle(ProviderOutcome::NotRefundable("PENDING".into()));
        assert_eq!(refused.status, RefundStatus::Rejected);
    }
}
