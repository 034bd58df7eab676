use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use crate::{
    entity::{
        coupons::{Column as CouponCol, Entity as Coupons, Model as CouponModel},
        sea_orm_active_enums::DiscountType,
    },
    error::{AppError, AppResult},
};

#[derive(Debug, Clone, Copy)]
pub enum CouponRef<'a> {
    Id(Uuid),
    Code(&'a str),
}

/// Discount a coupon grants on `base`, in minor units.
///
/// Inactive coupons behave as missing. Percentages round half-up and the
/// result never exceeds `base`.
pub fn compute_discount(coupon: &CouponModel, base: i64, now: DateTime<Utc>) -> AppResult<i64> {
    if !coupon.is_active {
        return Err(AppError::NotFound("Coupon"));
    }
    if let Some(expiry) = coupon.expiry_date {
        if expiry.with_timezone(&Utc) < now {
            return Err(AppError::Expired(format!("Coupon {} has expired", coupon.code)));
        }
    }

    let base = base.max(0);
    let discount = match coupon.discount_type {
        DiscountType::Percentage => {
            let percent = coupon.discount_value.clamp(0, 100);
            (base * percent + 50) / 100
        }
        DiscountType::Fixed => coupon.discount_value.max(0),
    };
    Ok(discount.min(base))
}

pub async fn find_coupon<C: ConnectionTrait>(
    conn: &C,
    coupon: CouponRef<'_>,
) -> AppResult<CouponModel> {
    let found = match coupon {
        CouponRef::Id(id) => Coupons::find_by_id(id).one(conn).await?,
        CouponRef::Code(code) => {
            Coupons::find()
                .filter(CouponCol::Code.eq(code.trim()))
                .one(conn)
                .await?
        }
    };
    found.ok_or(AppError::NotFound("Coupon"))
}

/// Resolve a coupon and price it against `base`.
pub async fn evaluate<C: ConnectionTrait>(
    conn: &C,
    coupon: CouponRef<'_>,
    base: i64,
) -> AppResult<(CouponModel, i64)> {
    let coupon = find_coupon(conn, coupon).await?;
    let discount = compute_discount(&coupon, base, Utc::now())?;
    Ok((coupon, discount))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn coupon(discount_type: DiscountType, value: i64) -> CouponModel {
        CouponModel {
            id: Uuid::new_v4(),
            code: "SAVE".into(),
            discount_type,
            discount_value: value,
            is_active: true,
            expiry_date: None,
            usage_limit: None,
            created_at: Utc::now().into(),
        }
    }

    #[test]
    fn fixed_discount_is_capped_at_base() {
        let now = Utc::now();
        assert_eq!(compute_discount(&coupon(DiscountType::Fixed, 30), 230, now).unwrap(), 30);
        assert_eq!(compute_discount(&coupon(DiscountType::Fixed, 500), 230, now).unwrap(), 230);
    }

    #[test]
    fn percentage_rounds_half_up() {
        let now = Utc::now();
        let ten = coupon(DiscountType::Percentage, 10);
        assert_eq!(compute_discount(&ten, 230, now).unwrap(), 23);
        assert_eq!(compute_discount(&ten, 235, now).unwrap(), 24);
        let full = coupon(DiscountType::Percentage, 150);
        assert_eq!(compute_discount(&full, 999, now).unwrap(), 999);
    }

    #[test]
    fn inactive_and_expired_coupons_are_refused() {
        let now = Utc::now();
        let mut inactive = coupon(DiscountType::Fixed, 10);
        inactive.is_active = false;
        assert!(matches!(
            compute_discount(&inactive, 100, now),
            Err(AppError::NotFound("Coupon"))
        ));

        let mut expired = coupon(DiscountType::Fixed, 10);
        expired.expiry_date = Some((now - Duration::days(1)).into());
        assert!(matches!(
            compute_discount(&expired, 100, now),
            Err(AppError::Expired(_))
        ));

        let mut later = coupon(DiscountType::Fixed, 10);
        later.expiry_date = Some((now + Duration::days(1)).into());
        assert_eq!(compute_discount(&later, 100, now).unwrap(), 10);
    }
}
