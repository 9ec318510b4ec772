use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::{
    order, order_item, Order, OrderItem, OrderStatus, PaymentStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::pricing::PricedOrder;

/// Pending orders whose payment never arrived are cancelled after this
/// long.
pub const STALE_PENDING_MAX_AGE_HOURS: i64 = 24;

/// Everything needed to persist an order at checkout commit.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer_id: Option<Uuid>,
    pub currency: String,
    pub payment_method: String,
    pub delivery_type: String,
    pub shipping_address: String,
    pub billing_address: String,
    pub coupon_code: Option<String>,
    pub gift_card_code: Option<String>,
    pub priced: PricedOrder,
    pub items: Vec<NewOrderItem>,
}

/// Immutable snapshot of one cart line at commit time.
#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub image_ref: Option<String>,
    pub customization: Option<serde_json::Value>,
}

fn generate_order_number() -> String {
    let id = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("ORD-{}", &id[..12])
}

/// Order with its line snapshots.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Persists orders and drives their status lifecycle.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Persist the order header and every line snapshot in one
    /// transaction. The order lands in `Pending`/`Pending` and is
    /// advanced by payment confirmation.
    #[instrument(skip(self, new_order), fields(customer_id = ?new_order.customer_id))]
    pub async fn create_order(&self, new_order: NewOrder) -> Result<order::Model, ServiceError> {
        if new_order.items.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Cannot create an order with no items".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let priced = &new_order.priced;

        let header = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number()),
            customer_id: Set(new_order.customer_id),
            currency: Set(new_order.currency),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            payment_method: Set(new_order.payment_method),
            delivery_type: Set(new_order.delivery_type),
            shipping_address: Set(new_order.shipping_address),
            billing_address: Set(new_order.billing_address),
            coupon_code: Set(new_order.coupon_code),
            gift_card_code: Set(new_order.gift_card_code),
            subtotal: Set(priced.subtotal),
            coupon_discount: Set(priced.coupon_discount),
            gift_card_applied: Set(priced.gift_card_applied),
            shipping_cost: Set(priced.shipping_cost),
            total_amount: Set(priced.total),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        };
        let order = header.insert(&txn).await?;

        for item in new_order.items {
            let line = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                name: Set(item.name),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                total_price: Set(item.unit_price * Decimal::from(item.quantity)),
                image_ref: Set(item.image_ref),
                customization: Set(item.customization),
                created_at: Set(now),
            };
            line.insert(&txn).await?;
        }

        txn.commit().await?;

        info!(order_id = %order.id, order_number = %order.order_number, "Order created");
        self.event_sender.send_or_log(Event::OrderCreated(order.id)).await;

        Ok(order)
    }

    /// Fetch an order with its line snapshots.
    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(OrderWithItems { order, items })
    }

    pub async fn get_by_order_number(
        &self,
        order_number: &str,
    ) -> Result<order::Model, ServiceError> {
        Order::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))
    }

    /// Record the outcome of a payment attempt, optionally advancing
    /// fulfillment in the same write (paid orders move to processing).
    #[instrument(skip(self))]
    pub async fn update_payment_status(
        &self,
        order_id: Uuid,
        payment_status: PaymentStatus,
    ) -> Result<order::Model, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        // A captured payment is never walked back by a late callback.
        if order.payment_status == PaymentStatus::Paid && payment_status != PaymentStatus::Paid {
            return Err(ServiceError::Conflict(format!(
                "Order {} is already paid",
                order_id
            )));
        }

        let old_status = order.status;
        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(payment_status);
        if payment_status == PaymentStatus::Paid && old_status == OrderStatus::Pending {
            active.status = Set(OrderStatus::Processing);
        }
        active.updated_at = Set(Utc::now());
        let order = active.update(&*self.db).await?;

        match payment_status {
            PaymentStatus::Paid => {
                self.event_sender.send_or_log(Event::PaymentCaptured(order_id)).await
            }
            PaymentStatus::Failed => {
                self.event_sender.send_or_log(Event::PaymentFailed(order_id)).await
            }
            PaymentStatus::Pending => {}
        }

        Ok(order)
    }

    /// Advance fulfillment status. Transitions are forward-only and the
    /// write is guarded by the version column, so concurrent updates
    /// cannot interleave into a backwards move.
    #[instrument(skip(self))]
    pub async fn update_fulfillment_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !order.status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot move order {} from {:?} to {:?}",
                order_id, order.status, new_status
            )));
        }

        let old_status = order.status;
        let expected_version = order.version;

        let result = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Version.eq(expected_version))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "Order {} was updated concurrently",
                order_id
            )));
        }

        info!(order_id = %order_id, from = ?old_status, to = ?new_status, "Order status changed");
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: format!("{:?}", old_status),
                new_status: format!("{:?}", new_status),
            })
            .await;

        Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Cancel pending orders whose payment never arrived. Orders that
    /// were paid, or that advanced past pending, are left alone.
    #[instrument(skip(self))]
    pub async fn expire_stale_pending(&self) -> Result<u64, ServiceError> {
        let cutoff = Utc::now() - Duration::hours(STALE_PENDING_MAX_AGE_HOURS);

        let stale = Order::find()
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .all(&*self.db)
            .await?;

        let mut expired = 0u64;
        for order in stale {
            let order_id = order.id;
            let mut active: order::ActiveModel = order.into();
            active.status = Set(OrderStatus::Cancelled);
            active.updated_at = Set(Utc::now());
            active.update(&*self.db).await?;

            warn!(order_id = %order_id, "Expired stale pending order");
            self.event_sender.send_or_log(Event::OrderExpired(order_id)).await;
            expired += 1;
        }

        Ok(expired)
    }
}
