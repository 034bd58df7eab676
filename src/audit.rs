//! Payment audit trail. Rows are only ever inserted.

use sea_orm::{ActiveModelTrait, ActiveValue::NotSet, ConnectionTrait, Set};
use uuid::Uuid;

use crate::{entity::payment_logs::ActiveModel as PaymentLogActive, error::AppResult};

pub const CHECKOUT_SESSION_CREATED: &str = "checkout_session_created";
pub const CASH_ON_DELIVERY_CREATED: &str = "cash_on_delivery_created";
pub const SESSION_COMPLETED: &str = "session_completed";
pub const CAPTURE_REQUESTED: &str = "capture_requested";
pub const PAYMENT_PROCESSING: &str = "payment_processing";
pub const PAYMENT_SUCCEEDED: &str = "payment_succeeded";
pub const PAYMENT_FAILED: &str = "payment_failed";
pub const CASH_COLLECTED: &str = "cash_collected";
pub const REFUND_APPROVED: &str = "refund_approved";
pub const REFUND_RECONCILED: &str = "refund_reconciled";
pub const REFUND_REJECTED: &str = "refund_rejected";
pub const REFUND_FAILED: &str = "refund_failed";

/// Append one entry to a payment's log. Accepts a transaction so the entry
/// commits together with the state change it describes.
pub async fn log_payment<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
    status: &str,
    message: impl Into<String>,
) -> AppResult<()> {
    PaymentLogActive {
        id: Set(Uuid::new_v4()),
        payment_id: Set(payment_id),
        status: Set(status.to_string()),
        message: Set(message.into()),
        created_at: NotSet,
    }
    .insert(conn)
    .await?;
    Ok(())
}
