use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use tracing::{info, instrument, warn};

use crate::entities::{coupon, gift_card, Coupon, GiftCard};
use crate::errors::{PromotionRejection, ServiceError};

/// Normalize a promotion code the way it is stored: trimmed, uppercase.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Evaluate the coupon rules against an order subtotal.
///
/// Rules run in a fixed order and the first failure wins: active flag,
/// start of validity, expiry, usage limit, minimum purchase. Pure so it
/// can be checked both at apply time and again at commit time.
pub fn check_coupon(
    coupon: &coupon::Model,
    subtotal: Decimal,
    now: DateTime<Utc>,
) -> Result<(), PromotionRejection> {
    if !coupon.active {
        return Err(PromotionRejection::Inactive);
    }
    if coupon.starts_at.is_some_and(|starts| now < starts) {
        return Err(PromotionRejection::NotStarted);
    }
    if coupon.expires_at.is_some_and(|expires| now >= expires) {
        return Err(PromotionRejection::Expired);
    }
    if coupon.used_count >= coupon.max_uses {
        return Err(PromotionRejection::UsageExceeded);
    }
    if subtotal < coupon.min_purchase {
        return Err(PromotionRejection::BelowMinimum);
    }
    Ok(())
}

/// Evaluate the gift card rules: active flag, expiry, remaining balance.
pub fn check_gift_card(
    card: &gift_card::Model,
    now: DateTime<Utc>,
) -> Result<(), PromotionRejection> {
    if !card.active {
        return Err(PromotionRejection::Inactive);
    }
    if card.expires_at.is_some_and(|expires| now >= expires) {
        return Err(PromotionRejection::Expired);
    }
    if card.balance <= Decimal::ZERO {
        return Err(PromotionRejection::Depleted);
    }
    Ok(())
}

/// Validates and redeems coupons and gift cards.
#[derive(Clone)]
pub struct PromotionService {
    db: Arc<DatabaseConnection>,
}

impl PromotionService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn find_coupon(&self, code: &str) -> Result<Option<coupon::Model>, ServiceError> {
        Ok(Coupon::find()
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .one(&*self.db)
            .await?)
    }

    async fn find_gift_card(&self, code: &str) -> Result<Option<gift_card::Model>, ServiceError> {
        Ok(GiftCard::find()
            .filter(gift_card::Column::Code.eq(normalize_code(code)))
            .one(&*self.db)
            .await?)
    }

    /// Look up a coupon and run the full rule chain against `subtotal`.
    #[instrument(skip(self))]
    pub async fn validate_coupon(
        &self,
        code: &str,
        subtotal: Decimal,
    ) -> Result<coupon::Model, ServiceError> {
        let coupon = self
            .find_coupon(code)
            .await?
            .ok_or(ServiceError::PromotionRejected(PromotionRejection::NotFound))?;

        check_coupon(&coupon, subtotal, Utc::now()).map_err(|reason| {
            info!(code = %coupon.code, %reason, "Coupon rejected");
            ServiceError::PromotionRejected(reason)
        })?;

        Ok(coupon)
    }

    /// Look up a gift card and check it is usable.
    #[instrument(skip(self))]
    pub async fn validate_gift_card(&self, code: &str) -> Result<gift_card::Model, ServiceError> {
        let card = self
            .find_gift_card(code)
            .await?
            .ok_or(ServiceError::PromotionRejected(PromotionRejection::NotFound))?;

        check_gift_card(&card, Utc::now()).map_err(|reason| {
            info!(code = %card.code, %reason, "Gift card rejected");
            ServiceError::PromotionRejected(reason)
        })?;

        Ok(card)
    }

    /// Consume one use of a coupon with a conditional increment.
    ///
    /// The usage limit is enforced in the UPDATE itself, so two orders
    /// racing for the last use cannot both win; the loser sees zero
    /// rows affected and gets a `Conflict`.
    #[instrument(skip(self, conn))]
    pub async fn redeem_coupon<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
    ) -> Result<(), ServiceError> {
        let code = normalize_code(code);
        let result = Coupon::update_many()
            .col_expr(
                coupon::Column::UsedCount,
                Expr::col(coupon::Column::UsedCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Code.eq(code.clone()))
            .filter(coupon::Column::Active.eq(true))
            .filter(Expr::col(coupon::Column::UsedCount).lt(Expr::col(coupon::Column::MaxUses)))
            .filter(
                Condition::any()
                    .add(coupon::Column::ExpiresAt.is_null())
                    .add(coupon::Column::ExpiresAt.gt(Utc::now())),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(code = %code, "Coupon redemption lost the race");
            return Err(ServiceError::Conflict(format!(
                "coupon {} is no longer redeemable",
                code
            )));
        }

        info!(code = %code, "Coupon redeemed");
        Ok(())
    }

    /// Deduct `amount` from a gift card with a conditional decrement
    /// guarded by `balance >= amount` and the expiry window. Zero rows
    /// affected means the card changed underneath us.
    #[instrument(skip(self, conn))]
    pub async fn redeem_gift_card<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
        amount: Decimal,
    ) -> Result<(), ServiceError> {
        if amount <= Decimal::ZERO {
            return Ok(());
        }

        let code = normalize_code(code);
        let result = GiftCard::update_many()
            .col_expr(
                gift_card::Column::Balance,
                Expr::col(gift_card::Column::Balance).sub(Expr::val(amount)),
            )
            .col_expr(gift_card::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(gift_card::Column::Code.eq(code.clone()))
            .filter(gift_card::Column::Active.eq(true))
            .filter(gift_card::Column::Balance.gte(amount))
            .filter(
                Condition::any()
                    .add(gift_card::Column::ExpiresAt.is_null())
                    .add(gift_card::Column::ExpiresAt.gt(Utc::now())),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(code = %code, %amount, "Gift card redemption lost the race");
            return Err(ServiceError::Conflict(format!(
                "gift card {} no longer covers {}",
                code, amount
            )));
        }

        info!(code = %code, %amount, "Gift card redeemed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::DiscountType;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn coupon() -> coupon::Model {
        coupon::Model {
            id: Uuid::new_v4(),
            code: "SAVE20".to_string(),
            discount_type: DiscountType::Percentage,
            discount_value: dec!(20),
            min_purchase: dec!(50.00),
            max_uses: 10,
            used_count: 0,
            active: true,
            starts_at: None,
            expires_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn card() -> gift_card::Model {
        gift_card::Model {
            id: Uuid::new_v4(),
            code: "GC-ABCD".to_string(),
            balance: dec!(30.00),
            initial_balance: dec!(50.00),
            active: true,
            expires_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn valid_coupon_passes() {
        assert_eq!(check_coupon(&coupon(), dec!(100.00), Utc::now()), Ok(()));
    }

    #[test]
    fn subtotal_below_minimum_is_rejected() {
        assert_eq!(
            check_coupon(&coupon(), dec!(49.99), Utc::now()),
            Err(PromotionRejection::BelowMinimum)
        );
    }

    #[test]
    fn inactive_wins_over_below_minimum() {
        // The rule chain is ordered; the earliest failing rule is the
        // one reported even when later rules would also fail.
        let mut c = coupon();
        c.active = false;
        assert_eq!(
            check_coupon(&c, dec!(1.00), Utc::now()),
            Err(PromotionRejection::Inactive)
        );
    }

    #[test]
    fn not_started_and_expired_windows() {
        let now = Utc::now();
        let mut c = coupon();
        c.starts_at = Some(now + Duration::hours(1));
        assert_eq!(
            check_coupon(&c, dec!(100.00), now),
            Err(PromotionRejection::NotStarted)
        );

        let mut c = coupon();
        c.expires_at = Some(now - Duration::hours(1));
        assert_eq!(
            check_coupon(&c, dec!(100.00), now),
            Err(PromotionRejection::Expired)
        );
    }

    #[test]
    fn exhausted_coupon_is_rejected() {
        let mut c = coupon();
        c.used_count = c.max_uses;
        assert_eq!(
            check_coupon(&c, dec!(100.00), Utc::now()),
            Err(PromotionRejection::UsageExceeded)
        );
    }

    #[test]
    fn depleted_gift_card_is_rejected() {
        let mut g = card();
        g.balance = Decimal::ZERO;
        assert_eq!(
            check_gift_card(&g, Utc::now()),
            Err(PromotionRejection::Depleted)
        );
    }

    #[test]
    fn usable_gift_card_passes() {
        assert_eq!(check_gift_card(&card(), Utc::now()), Ok(()));
    }

    #[test]
    fn codes_normalize_case_and_whitespace() {
        assert_eq!(normalize_code("  save20 "), "SAVE20");
        assert_eq!(normalize_code("Gc-AbCd"), "GC-ABCD");
    }
}
