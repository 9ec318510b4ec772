use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::entities::{cart_item, coupon, delivery_option, gift_card, DiscountType};

/// A cart line reduced to what pricing needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingLine {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl From<&cart_item::Model> for PricingLine {
    fn from(item: &cart_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            quantity: item.quantity,
            unit_price: item.unit_price,
        }
    }
}

impl PricingLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Fully computed price breakdown for an order. Every monetary figure
/// on an order comes from one of these; nothing downstream recomputes
/// or adjusts the numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedOrder {
    pub subtotal: Decimal,
    pub coupon_discount: Decimal,
    pub gift_card_applied: Decimal,
    pub shipping_cost: Decimal,
    pub total: Decimal,
}

impl PricedOrder {
    pub fn is_zero_total(&self) -> bool {
        self.total.is_zero()
    }
}

/// Fingerprint of every pricing input. Two quotes with equal
/// fingerprints are guaranteed to produce equal `PricedOrder`s, which
/// is what lets a committed quote be reused across payment retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingFingerprint(String);

impl PricingFingerprint {
    pub fn compute(
        lines: &[PricingLine],
        coupon_code: Option<&str>,
        gift_card_code: Option<&str>,
        delivery_id: Option<Uuid>,
    ) -> Self {
        let mut hasher = Sha256::new();
        for line in lines {
            hasher.update(line.product_id.as_bytes());
            hasher.update(line.quantity.to_le_bytes());
            hasher.update(line.unit_price.to_string().as_bytes());
            hasher.update(b"|");
        }
        hasher.update(b"coupon:");
        hasher.update(coupon_code.unwrap_or("").as_bytes());
        hasher.update(b"gift:");
        hasher.update(gift_card_code.unwrap_or("").as_bytes());
        hasher.update(b"delivery:");
        if let Some(id) = delivery_id {
            hasher.update(id.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }
}

/// Compute the price breakdown for a set of cart lines.
///
/// The order of application is fixed:
/// 1. subtotal = sum of unit_price * quantity
/// 2. coupon discount (fixed or percentage), clamped to the subtotal
/// 3. gift card applied against the remainder, clamped to its balance
/// 4. total = max(0, remainder) + shipping cost
///
/// The gift card never covers shipping beyond what its balance allows
/// against the goods remainder, and the total can never go negative.
/// Inputs are assumed already validated; this function only computes.
pub fn price(
    lines: &[PricingLine],
    coupon: Option<&coupon::Model>,
    gift_card: Option<&gift_card::Model>,
    delivery: Option<&delivery_option::Model>,
) -> PricedOrder {
    let subtotal: Decimal = lines.iter().map(PricingLine::line_total).sum();

    let coupon_discount = coupon
        .map(|c| {
            let raw = match c.discount_type {
                DiscountType::Fixed => c.discount_value,
                DiscountType::Percentage => {
                    subtotal * c.discount_value / Decimal::ONE_HUNDRED
                }
            };
            raw.min(subtotal).max(Decimal::ZERO)
        })
        .unwrap_or(Decimal::ZERO);

    let remaining = subtotal - coupon_discount;

    let gift_card_applied = gift_card
        .map(|g| g.balance.min(remaining).max(Decimal::ZERO))
        .unwrap_or(Decimal::ZERO);

    let shipping_cost = delivery.map(|d| d.cost).unwrap_or(Decimal::ZERO);

    let total = (remaining - gift_card_applied).max(Decimal::ZERO) + shipping_cost;

    PricedOrder {
        subtotal,
        coupon_discount,
        gift_card_applied,
        shipping_cost,
        total,
    }
}
