//! Tracking message derived from an order's status and shipping date.
//! Nothing is stored; every call works from the current clock.

use chrono::{DateTime, Duration, Utc};

use crate::{dto::orders::TrackingInfo, entity::sea_orm_active_enums::OrderStatus, models::Order};

const DELIVERY_WINDOW_DAYS: i64 = 2;

pub fn track(order: &Order, now: DateTime<Utc>) -> TrackingInfo {
    let (message, remaining) = describe(order, now);
    TrackingInfo {
        order_id: order.id,
        status: order.order_status,
        message,
        shipping_date: order.shipping_date,
        remaining_seconds: remaining.map(|d| d.num_seconds()),
    }
}

fn describe(order: &Order, now: DateTime<Utc>) -> (String, Option<Duration>) {
    match order.order_status {
        OrderStatus::Cancelled => {
            let reason = order
                .cancel_reason
                .as_deref()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or("not specified");
            return (format!("Order was cancelled. Reason: {reason}"), None);
        }
        OrderStatus::Delivered => return ("Order has been delivered".to_string(), None),
        _ => {}
    }

    let Some(shipping_date) = order.shipping_date else {
        return ("Order is being processed".to_string(), None);
    };

    if shipping_date > now {
        let left = shipping_date - now;
        return (format!("Order will ship in {}", humanize(left)), Some(left));
    }

    let deadline = shipping_date + Duration::days(DELIVERY_WINDOW_DAYS);
    if order.order_status == OrderStatus::Shipped && now < deadline {
        let left = deadline - now;
        return (
            format!("Order is on the way, expected within {}", humanize(left)),
            Some(left),
        );
    }

    ("Order is out for delivery".to_string(), None)
}

fn humanize(duration: Duration) -> String {
    let days = duration.num_days();
    let hours = duration.num_hours() % 24;
    let minutes = duration.num_minutes() % 60;
    if days > 0 {
        format!("{days} day(s) {hours} hour(s)")
    } else if hours > 0 {
        format!("{hours} hour(s) {minutes} minute(s)")
    } else {
        format!("{} minute(s)", minutes.max(1))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn order(status: OrderStatus, shipping_date: Option<DateTime<Utc>>) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            order_date: now,
            order_amount: 100,
            shipping_charge: 0,
            discount_amount: 0,
            final_amount: 100,
            shipping_date,
            order_status: status,
            cancel_reason: None,
            coupon_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn cancelled_reports_reason_or_placeholder() {
        let now = Utc::now();
        let mut cancelled = order(OrderStatus::Cancelled, Some(now));
        assert!(track(&cancelled, now).message.ends_with("not specified"));
        cancelled.cancel_reason = Some("changed my mind".into());
        let info = track(&cancelled, now);
        assert!(info.message.ends_with("changed my mind"));
        assert_eq!(info.remaining_seconds, None);
    }

    #[test]
    fn delivered_ignores_dates() {
        let now = Utc::now();
        let info = track(&order(OrderStatus::Delivered, None), now);
        assert_eq!(info.message, "Order has been delivered");
    }

    #[test]
    fn counts_down_to_shipping_date() {
        let now = Utc::now();
        let info = track(&order(OrderStatus::Confirmed, Some(now + Duration::days(3))), now);
        assert!(info.message.starts_with("Order will ship in 3 day(s)"));
        assert_eq!(info.remaining_seconds, Some(3 * 86_400));
    }

    #[test]
    fn shipped_orders_count_down_to_delivery_window() {
        let now = Utc::now();
        let shipped = order(OrderStatus::Shipped, Some(now - Duration::days(1)));
        let info = track(&shipped, now);
        assert!(info.message.starts_with("Order is on the way"));
        assert_eq!(info.remaining_seconds, Some(86_400));

        let late = order(OrderStatus::Shipped, Some(now - Duration::days(3)));
        assert_eq!(track(&late, now).message, "Order is out for delivery");
    }

    #[test]
    fn missing_shipping_date_is_processing() {
        let now = Utc::now();
        let info = track(&order(OrderStatus::Pending, None), now);
        assert_eq!(info.message, "Order is being processed");
    }
}
