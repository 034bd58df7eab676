use std::collections::HashMap;

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    ModelTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
    sea_query::LockType,
};
use uuid::Uuid;

use crate::{
    audit::{self, log_payment},
    dto::orders::{
        ApplyCouponRequest, CancelOrderResponse, CreateOrderRequest, OrderDetail, OrderList,
        TrackingInfo,
    },
    entity::{
        order_items::{ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems},
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        payments::{ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments},
        products::{Column as ProductCol, Entity as Products},
        sea_orm_active_enums::{OrderStatus, PaymentMethod, PaymentStatus, UserRole},
        shipping_details::{ActiveModel as ShippingActive, Entity as ShippingDetailsEntity},
        users::{Column as UserCol, Entity as Users},
        variants::{Entity as Variants, Model as VariantModel},
    },
    error::{AppError, AppResult},
    middleware::{auth::AuthUser, policy::Capability},
    models::{Order, OrderItem, Payment, ShippingDetails},
    notify::{self, Notification, OrderedLine, Recipient},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    services::{
        coupon_service::{self, CouponRef},
        refund_service, tracking,
    },
    state::AppState,
};

/// One priced order line, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedLine {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub mrp: i64,
    pub discount_percent: i32,
    pub total_price: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub order_amount: i64,
    pub discount_amount: i64,
    pub shipping_charge: i64,
    pub final_amount: i64,
}

/// Unit price after the variant discount, rounded half-up.
pub fn discounted_unit_price(price: i64, discount_percent: i32) -> i64 {
    let percent = i64::from(discount_percent.clamp(0, 100));
    (price * (100 - percent) + 50) / 100
}

pub fn price_line(variant: &VariantModel, quantity: i32) -> AppResult<PricedLine> {
    if quantity <= 0 {
        return Err(AppError::BadRequest(format!(
            "Quantity for variant {} must be positive",
            variant.id
        )));
    }
    if variant.stock < quantity {
        return Err(AppError::BadRequest(format!(
            "Insufficient stock for variant {}",
            variant.sku
        )));
    }

    let unit = discounted_unit_price(variant.price, variant.discount_percent);
    Ok(PricedLine {
        variant_id: variant.id,
        product_id: variant.product_id,
        quantity,
        mrp: variant.price,
        discount_percent: variant.discount_percent,
        total_price: unit * i64::from(quantity),
    })
}

pub fn totals(order_amount: i64, discount_amount: i64, shipping_charge: i64) -> Totals {
    let discount_amount = discount_amount.clamp(0, order_amount.max(0));
    Totals {
        order_amount,
        discount_amount,
        shipping_charge,
        final_amount: (order_amount - discount_amount + shipping_charge).max(0),
    }
}

pub async fn create_order(
    state: &AppState,
    user: &AuthUser,
    payload: CreateOrderRequest,
) -> AppResult<ApiResponse<OrderDetail>> {
    let CreateOrderRequest {
        order_items,
        coupon_id,
        shipping_details,
    } = payload;

    if order_items.is_empty() {
        return Err(AppError::BadRequest(
            "Order must contain at least one item".into(),
        ));
    }

    let txn = state.orm.begin().await?;

    let mut lines = Vec::with_capacity(order_items.len());
    let mut variants = HashMap::new();
    let mut max_shipping_days = 0;
    for item in &order_items {
        let variant = Variants::find_by_id(item.variant_id)
            .one(&txn)
            .await?
            .ok_or(AppError::NotFound("Variant"))?;
        lines.push(price_line(&variant, item.quantity)?);
        max_shipping_days = max_shipping_days.max(variant.shipping_time_days.unwrap_or(0));
        variants.insert(variant.id, variant);
    }

    let order_amount: i64 = lines.iter().map(|line| line.total_price).sum();
    let discount_amount = match coupon_id {
        Some(id) => coupon_service::evaluate(&txn, CouponRef::Id(id), order_amount).await?.1,
        None => 0,
    };
    let totals = totals(order_amount, discount_amount, state.config.shipping_charge);

    let now = Utc::now();
    let order = OrderActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user.user_id),
        order_date: Set(now.into()),
        order_amount: Set(totals.order_amount),
        shipping_charge: Set(totals.shipping_charge),
        discount_amount: Set(totals.discount_amount),
        final_amount: Set(totals.final_amount),
        shipping_date: Set(Some((now + Duration::days(i64::from(max_shipping_days))).into())),
        order_status: Set(OrderStatus::Pending),
        cancel_reason: Set(None),
        coupon_id: Set(coupon_id),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut items = Vec::with_capacity(lines.len());
    for line in &lines {
        let item = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(line.product_id),
            variant_id: Set(line.variant_id),
            quantity: Set(line.quantity),
            mrp: Set(line.mrp),
            discount_percent: Set(line.discount_percent),
            total_price: Set(line.total_price),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
        items.push(OrderItem::from(item));
    }

    let shipping = ShippingActive {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        full_name: Set(shipping_details.full_name),
        address_line: Set(shipping_details.address_line),
        city: Set(shipping_details.city),
        state: Set(shipping_details.state),
        postal_code: Set(shipping_details.postal_code),
        country: Set(shipping_details.country),
        phone: Set(shipping_details.phone),
        created_at: NotSet,
    }
    .insert(&txn)
    .await?;

    txn.commit().await?;

    tracing::info!(
        order_id = %order.id,
        user_id = %user.user_id,
        final_amount = order.final_amount,
        "order created"
    );

    if let Err(err) = notify_order_placed(state, &order, &lines, &variants).await {
        tracing::warn!(error = %err, order_id = %order.id, "order notification skipped");
    }

    Ok(ApiResponse::success(
        "Order created",
        OrderDetail {
            order: order.into(),
            items,
            shipping_details: Some(shipping.into()),
            payment: None,
        },
        Some(Meta::empty()),
    ))
}

async fn notify_order_placed(
    state: &AppState,
    order: &OrderModel,
    lines: &[PricedLine],
    variants: &HashMap<Uuid, VariantModel>,
) -> AppResult<()> {
    let Some(admin) = Users::find()
        .filter(UserCol::Role.eq(UserRole::Admin))
        .order_by_asc(UserCol::CreatedAt)
        .one(&state.orm)
        .await?
    else {
        return Ok(());
    };
    let customer = Users::find_by_id(order.user_id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound("User"))?;

    let product_ids: Vec<Uuid> = lines.iter().map(|line| line.product_id).collect();
    let names: HashMap<Uuid, String> = Products::find()
        .filter(ProductCol::Id.is_in(product_ids))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(|product| (product.id, product.name))
        .collect();

    let lines = lines
        .iter()
        .map(|line| {
            let name = names
                .get(&line.product_id)
                .cloned()
                .unwrap_or_else(|| line.product_id.to_string());
            let label = match variants.get(&line.variant_id).and_then(|v| v.attributes.clone()) {
                Some(attributes) => format!("{name} - {attributes}"),
                None => name,
            };
            OrderedLine {
                label,
                quantity: line.quantity,
            }
        })
        .collect();

    notify::dispatch(
        state.notifier.clone(),
        Notification::OrderPlaced {
            to: Recipient {
                email: admin.email,
                name: admin.name,
            },
            customer: Recipient {
                email: customer.email,
                name: customer.name,
            },
            order_id: order.id,
            lines,
            final_amount: order.final_amount,
            shipping_date: order.shipping_date.map(|dt| dt.with_timezone(&Utc)),
        },
    );
    Ok(())
}

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let page = query.page();
    let mut condition = Condition::all();
    if !user.can(Capability::ViewAllOrders) {
        condition = condition.add(OrderCol::UserId.eq(user.user_id));
    }
    if let Some(status) = query.status {
        condition = condition.add(OrderCol::OrderStatus.eq(status));
    }

    let mut finder = Orders::find().filter(condition);
    finder = match query.sort_order.unwrap_or(SortOrder::Desc) {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await?;
    let orders = finder
        .limit(page.per_page)
        .offset(page.offset)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Order::from)
        .collect();

    Ok(ApiResponse::success(
        "Ok",
        OrderList { items: orders },
        Some(Meta::paged(&page, total)),
    ))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderDetail>> {
    let order = Orders::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    user.require_owner_or(order.user_id, Capability::ViewAllOrders)?;

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .order_by_asc(OrderItemCol::CreatedAt)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(OrderItem::from)
        .collect();
    let shipping_details = order
        .find_related(ShippingDetailsEntity)
        .one(&state.orm)
        .await?
        .map(ShippingDetails::from);
    let payment = order
        .find_related(Payments)
        .one(&state.orm)
        .await?
        .map(Payment::from);

    Ok(ApiResponse::success(
        "OK",
        OrderDetail {
            order: order.into(),
            items,
            shipping_details,
            payment,
        },
        Some(Meta::empty()),
    ))
}

/// Cancel an order. A succeeded online payment is refunded right away.
pub async fn cancel_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    reason: Option<String>,
) -> AppResult<ApiResponse<CancelOrderResponse>> {
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    user.require_owner_or(order.user_id, Capability::ManageOrders)?;

    if !order.order_status.can_transition_to(OrderStatus::Cancelled) {
        return Err(AppError::InvalidState(format!(
            "Order cannot be cancelled while {:?}",
            order.order_status
        )));
    }

    let payment = Payments::find()
        .filter(PaymentCol::OrderId.eq(order.id))
        .one(&txn)
        .await?;

    let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
    let mut active: OrderActive = order.into();
    active.order_status = Set(OrderStatus::Cancelled);
    active.cancel_reason = Set(reason.clone());
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;
    tracing::info!(order_id = %order.id, "order cancelled");

    let refund = match payment {
        Some(payment)
            if payment.status == PaymentStatus::Succeeded
                && payment.payment_method != PaymentMethod::CashOnDelivery =>
        {
            Some(refund_service::refund_cancelled_order(state, &order, &payment, reason).await?)
        }
        _ => None,
    };

    Ok(ApiResponse::success(
        "Order cancelled",
        CancelOrderResponse {
            order: order.into(),
            refund,
        },
        Some(Meta::empty()),
    ))
}

/// Price a coupon against the undiscounted amount. Reapplying the same coupon
/// gives the same totals.
pub async fn apply_coupon(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: ApplyCouponRequest,
) -> AppResult<ApiResponse<Order>> {
    let coupon_ref = match (&payload.coupon_id, payload.coupon_code.as_deref()) {
        (Some(coupon_id), _) => CouponRef::Id(*coupon_id),
        (None, Some(code)) if !code.trim().is_empty() => CouponRef::Code(code),
        _ => {
            return Err(AppError::BadRequest(
                "coupon_id or coupon_code is required".into(),
            ));
        }
    };

    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    user.require_owner_or(order.user_id, Capability::ManageOrders)?;

    if order.order_status != OrderStatus::Pending {
        return Err(AppError::InvalidState(
            "Coupons can only be applied to pending orders".into(),
        ));
    }
    let has_payment = Payments::find()
        .filter(PaymentCol::OrderId.eq(order.id))
        .count(&txn)
        .await?
        > 0;
    if has_payment {
        return Err(AppError::InvalidState(
            "Order already has a payment".into(),
        ));
    }

    let (coupon, discount) = coupon_service::evaluate(&txn, coupon_ref, order.order_amount).await?;
    let totals = totals(order.order_amount, discount, order.shipping_charge);

    let mut active: OrderActive = order.into();
    active.coupon_id = Set(Some(coupon.id));
    active.discount_amount = Set(totals.discount_amount);
    active.final_amount = Set(totals.final_amount);
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    Ok(ApiResponse::success(
        "Coupon applied",
        order.into(),
        Some(Meta::empty()),
    ))
}

pub async fn update_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    next: OrderStatus,
) -> AppResult<ApiResponse<Order>> {
    user.require(Capability::ManageOrders)?;

    if next == OrderStatus::Cancelled {
        let resp = cancel_order(state, user, id, None).await?;
        let data = resp
            .data
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("cancel returned no order")))?;
        return Ok(ApiResponse::success(
            "Order status updated",
            data.order,
            Some(Meta::empty()),
        ));
    }

    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound("Order"))?;

    if !order.order_status.can_transition_to(next) {
        return Err(AppError::InvalidState(format!(
            "Cannot move order from {:?} to {:?}",
            order.order_status, next
        )));
    }

    let mut active: OrderActive = order.into();
    active.order_status = Set(next);
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    if next == OrderStatus::Delivered {
        collect_cash(&txn, order.id).await?;
    }

    txn.commit().await?;
    tracing::info!(order_id = %order.id, status = ?next, "order status updated");

    Ok(ApiResponse::success(
        "Order status updated",
        order.into(),
        Some(Meta::empty()),
    ))
}

/// A delivered cash-on-delivery order has been paid at the door.
async fn collect_cash<C: ConnectionTrait>(conn: &C, order_id: Uuid) -> AppResult<()> {
    let payment = Payments::find()
        .filter(PaymentCol::OrderId.eq(order_id))
        .lock(LockType::Update)
        .one(conn)
        .await?;
    let Some(payment) = payment else {
        return Ok(());
    };
    if payment.payment_method != PaymentMethod::CashOnDelivery
        || !payment.status.can_advance_to(PaymentStatus::Succeeded)
    {
        return Ok(());
    }

    let now = Utc::now();
    let payment_id = payment.id;
    let mut active: PaymentActive = payment.into();
    active.status = Set(PaymentStatus::Succeeded);
    active.paid_at = Set(Some(now.into()));
    active.updated_at = Set(now.into());
    active.update(conn).await?;

    log_payment(conn, payment_id, audit::CASH_COLLECTED, "Cash collected on delivery").await?;
    tracing::info!(order_id = %order_id, payment_id = %payment_id, "cash collected");
    Ok(())
}

pub async fn track_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<TrackingInfo>> {
    let order = Orders::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    user.require_owner_or(order.user_id, Capability::ViewAllOrders)?;

    let info = tracking::track(&Order::from(order), Utc::now());
    Ok(ApiResponse::success("OK", info, Some(Meta::empty())))
}
