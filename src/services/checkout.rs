use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::entities::{
    cart_item, delivery_option, CartStatus, DeliveryOption, Order, OrderStatus, PaymentStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::payments::{
    CallbackPayload, GatewayError, GatewayRegistry, PaymentInit, PaymentMethod, PaymentOutcome,
    PaymentRequest,
};
use crate::services::cart::CartService;
use crate::services::orders::{NewOrder, NewOrderItem, OrderService};
use crate::services::pricing::{self, PricedOrder, PricingFingerprint, PricingLine};
use crate::services::promotions::PromotionService;

/// Postal address collected during checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Address {
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    /// State, province or county.
    #[validate(length(min = 1, max = 100))]
    pub region: String,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    /// ISO 3166-1 alpha-2.
    #[validate(length(equal = 2))]
    pub country: String,
    /// Contact number for the courier; digits with an optional `+`.
    #[validate(length(min = 1, max = 32))]
    pub phone: String,
}

/// Where the checkout session currently stands. Input steps can be
/// revisited until submission; `Completed` is terminal, `Failed` admits
/// a payment retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutState {
    CollectingAddress,
    SelectingDelivery,
    SelectingPayment,
    Pricing,
    AwaitingGateway,
    Committing,
    Completed,
    Failed,
}

impl CheckoutState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// States in which the shopper may still edit inputs.
    fn accepts_input(self) -> bool {
        matches!(
            self,
            Self::CollectingAddress | Self::SelectingDelivery | Self::SelectingPayment | Self::Pricing
        )
    }
}

/// How the order will reach the shopper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryChoice {
    /// Courier delivery using a configured option.
    Ship { option: delivery_option::Model },
    /// Collected in store; no shipping cost.
    Pickup,
}

impl DeliveryChoice {
    fn option(&self) -> Option<&delivery_option::Model> {
        match self {
            Self::Ship { option } => Some(option),
            Self::Pickup => None,
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Ship { option } => option.name.clone(),
            Self::Pickup => "pickup".to_string(),
        }
    }
}

/// In-process checkout session. Sessions are working state, not
/// durable records; the durable outcome is the order.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub state: CheckoutState,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub delivery: Option<DeliveryChoice>,
    pub payment_method: Option<PaymentMethod>,
    pub coupon_code: Option<String>,
    pub gift_card_code: Option<String>,
    pub quote: Option<PricedOrder>,
    #[serde(skip)]
    pub fingerprint: Option<PricingFingerprint>,
    pub order_id: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutSession {
    fn new(cart_id: Uuid, customer_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cart_id,
            customer_id,
            state: CheckoutState::CollectingAddress,
            shipping_address: None,
            billing_address: None,
            delivery: None,
            payment_method: None,
            coupon_code: None,
            gift_card_code: None,
            quote: None,
            fingerprint: None,
            order_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Editing any pricing input voids the current quote; the next
    /// submission reprices from scratch.
    fn invalidate_quote(&mut self) {
        self.quote = None;
        self.fingerprint = None;
    }
}

/// What the client must do next after submitting.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Send the browser to the gateway-hosted payment page.
    Redirect {
        order_id: Uuid,
        redirect_url: String,
    },
    /// Wait for the shopper to approve the prompt on their phone.
    AwaitingApproval { order_id: Uuid },
    /// The order committed without a gateway round trip.
    Completed { order_id: Uuid },
}

/// Drives a cart through address, delivery, payment and commit.
///
/// Every monetary figure the shopper sees or is charged comes from one
/// `PricedOrder`, keyed by a fingerprint of the pricing inputs; the
/// amount sent to the gateway and the amount on the committed order
/// cannot drift apart.
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    sessions: DashMap<Uuid, CheckoutSession>,
    carts: CartService,
    orders: OrderService,
    promotions: PromotionService,
    gateways: Arc<GatewayRegistry>,
    event_sender: Arc<EventSender>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carts: CartService,
        orders: OrderService,
        promotions: PromotionService,
        gateways: Arc<GatewayRegistry>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            sessions: DashMap::new(),
            carts,
            orders,
            promotions,
            gateways,
            event_sender,
        }
    }

    fn session(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Checkout session {} not found", session_id))
            })
    }

    fn store(&self, mut session: CheckoutSession) -> CheckoutSession {
        session.updated_at = Utc::now();
        self.sessions.insert(session.id, session.clone());
        session
    }

    fn editable_session(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let session = self.session(session_id)?;
        if !session.state.accepts_input() {
            return Err(ServiceError::InvalidOperation(format!(
                "Checkout session {} no longer accepts changes ({:?})",
                session_id, session.state
            )));
        }
        Ok(session)
    }

    async fn cart_lines(&self, cart_id: Uuid) -> Result<Vec<cart_item::Model>, ServiceError> {
        let cart = self.carts.get_cart(cart_id).await?;
        if cart.cart.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} is not active",
                cart_id
            )));
        }
        Ok(cart.items)
    }

    /// Delivery options offered to the shopper, cheapest-first by
    /// configured position.
    pub async fn list_delivery_options(
        &self,
    ) -> Result<Vec<delivery_option::Model>, ServiceError> {
        Ok(DeliveryOption::find()
            .filter(delivery_option::Column::Active.eq(true))
            .order_by_asc(delivery_option::Column::Position)
            .all(&*self.db)
            .await?)
    }

    /// Open a checkout session for a cart. The cart must be active and
    /// non-empty.
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        cart_id: Uuid,
        customer_id: Option<Uuid>,
    ) -> Result<CheckoutSession, ServiceError> {
        let lines = self.cart_lines(cart_id).await?;
        if lines.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Cannot check out an empty cart".to_string(),
            ));
        }

        let session = self.store(CheckoutSession::new(cart_id, customer_id));
        info!(session_id = %session.id, cart_id = %cart_id, "Checkout started");
        self.event_sender
            .send_or_log(Event::CheckoutStarted {
                cart_id,
                session_id: session.id,
            })
            .await;
        Ok(session)
    }

    pub fn get(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        self.session(session_id)
    }

    /// Record the shipping (and optionally billing) address.
    #[instrument(skip(self, shipping, billing))]
    pub async fn set_address(
        &self,
        session_id: Uuid,
        shipping: Address,
        billing: Option<Address>,
    ) -> Result<CheckoutSession, ServiceError> {
        shipping.validate()?;
        validate_phone(&shipping.phone)?;
        if let Some(billing) = &billing {
            billing.validate()?;
            validate_phone(&billing.phone)?;
        }

        let mut session = self.editable_session(session_id)?;
        session.shipping_address = Some(shipping);
        session.billing_address = billing;
        if session.state == CheckoutState::CollectingAddress {
            session.state = CheckoutState::SelectingDelivery;
        }
        session.invalidate_quote();
        Ok(self.store(session))
    }

    /// Choose courier delivery or in-store pickup.
    #[instrument(skip(self))]
    pub async fn set_delivery(
        &self,
        session_id: Uuid,
        option_id: Option<Uuid>,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.editable_session(session_id)?;
        if session.shipping_address.is_none() {
            return Err(ServiceError::InvalidOperation(
                "Address must be set before choosing delivery".to_string(),
            ));
        }

        let choice = match option_id {
            Some(id) => {
                let option = DeliveryOption::find_by_id(id)
                    .filter(delivery_option::Column::Active.eq(true))
                    .one(&*self.db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Delivery option {} not found", id))
                    })?;
                DeliveryChoice::Ship { option }
            }
            None => DeliveryChoice::Pickup,
        };

        session.delivery = Some(choice);
        if session.state == CheckoutState::SelectingDelivery {
            session.state = CheckoutState::SelectingPayment;
        }
        session.invalidate_quote();
        Ok(self.store(session))
    }

    /// Choose how to pay. Wallet payments carry the phone that will
    /// receive the approval prompt.
    #[instrument(skip(self, method))]
    pub async fn set_payment_method(
        &self,
        session_id: Uuid,
        method: PaymentMethod,
    ) -> Result<CheckoutSession, ServiceError> {
        if let PaymentMethod::Wallet { phone } = &method {
            validate_phone(phone)?;
        }

        let mut session = self.editable_session(session_id)?;
        if session.delivery.is_none() {
            return Err(ServiceError::InvalidOperation(
                "Delivery must be chosen before payment".to_string(),
            ));
        }

        session.payment_method = Some(method);
        if session.state == CheckoutState::SelectingPayment {
            session.state = CheckoutState::Pricing;
        }
        Ok(self.store(session))
    }

    /// Attach a coupon to the session. The full rule chain runs against
    /// the cart's current subtotal and a rejection reports the first
    /// failing rule.
    #[instrument(skip(self))]
    pub async fn apply_coupon(
        &self,
        session_id: Uuid,
        code: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.editable_session(session_id)?;

        let lines = self.cart_lines(session.cart_id).await?;
        let subtotal = lines
            .iter()
            .map(|l| PricingLine::from(l).line_total())
            .sum();

        let coupon = self.promotions.validate_coupon(code, subtotal).await?;
        session.coupon_code = Some(coupon.code);
        session.invalidate_quote();
        Ok(self.store(session))
    }

    pub fn remove_coupon(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.editable_session(session_id)?;
        session.coupon_code = None;
        session.invalidate_quote();
        Ok(self.store(session))
    }

    /// Attach a gift card to the session.
    #[instrument(skip(self))]
    pub async fn apply_gift_card(
        &self,
        session_id: Uuid,
        code: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.editable_session(session_id)?;
        let card = self.promotions.validate_gift_card(code).await?;
        session.gift_card_code = Some(card.code);
        session.invalidate_quote();
        Ok(self.store(session))
    }

    pub fn remove_gift_card(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.editable_session(session_id)?;
        session.gift_card_code = None;
        session.invalidate_quote();
        Ok(self.store(session))
    }

    /// Price the session's current inputs and cache the quote under its
    /// fingerprint. Re-quoting with unchanged inputs returns the cached
    /// breakdown unchanged.
    #[instrument(skip(self))]
    pub async fn quote(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.editable_session(session_id)?;
        if session.delivery.is_none() {
            return Err(ServiceError::InvalidOperation(
                "Delivery must be chosen before pricing".to_string(),
            ));
        }

        let (priced, fingerprint) = self.price_session(&session).await?;
        session.quote = Some(priced);
        session.fingerprint = Some(fingerprint);
        if session.state == CheckoutState::SelectingPayment {
            session.state = CheckoutState::Pricing;
        }
        Ok(self.store(session))
    }

    async fn price_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<(PricedOrder, PricingFingerprint), ServiceError> {
        let lines: Vec<PricingLine> = self
            .cart_lines(session.cart_id)
            .await?
            .iter()
            .map(PricingLine::from)
            .collect();
        if lines.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Cannot price an empty cart".to_string(),
            ));
        }

        let subtotal: rust_decimal::Decimal = lines.iter().map(PricingLine::line_total).sum();

        let coupon = match &session.coupon_code {
            Some(code) => Some(self.promotions.validate_coupon(code, subtotal).await?),
            None => None,
        };
        let gift_card = match &session.gift_card_code {
            Some(code) => Some(self.promotions.validate_gift_card(code).await?),
            None => None,
        };
        let delivery = session.delivery.as_ref().and_then(DeliveryChoice::option);

        let priced = pricing::price(&lines, coupon.as_ref(), gift_card.as_ref(), delivery);
        let fingerprint = PricingFingerprint::compute(
            &lines,
            session.coupon_code.as_deref(),
            session.gift_card_code.as_deref(),
            delivery.map(|d| d.id),
        );
        Ok((priced, fingerprint))
    }

    /// Submit the checkout: freeze the quote into a pending order and
    /// initiate payment.
    ///
    /// Zero-total orders and pay-on-pickup commit without a gateway
    /// round trip. A resubmission with unchanged pricing inputs reuses
    /// the already-created pending order and its total; changed inputs
    /// cancel the stale order and reprice.
    #[instrument(skip(self))]
    pub async fn submit(&self, session_id: Uuid) -> Result<SubmitOutcome, ServiceError> {
        let mut session = self.session(session_id)?;
        if !matches!(
            session.state,
            CheckoutState::Pricing | CheckoutState::Failed
        ) {
            return Err(ServiceError::InvalidOperation(format!(
                "Checkout session {} cannot be submitted from {:?}",
                session_id, session.state
            )));
        }

        let (shipping, delivery, method) = match (
            session.shipping_address.clone(),
            session.delivery.clone(),
            session.payment_method.clone(),
        ) {
            (Some(s), Some(d), Some(m)) => (s, d, m),
            _ => {
                return Err(ServiceError::InvalidOperation(
                    "Address, delivery and payment method are required before submitting"
                        .to_string(),
                ))
            }
        };

        let (priced, fingerprint) = self.price_session(&session).await?;

        // Reuse the pending order when nothing priced has changed, so a
        // retried payment charges exactly the amount already quoted.
        let order = match (&session.order_id, &session.fingerprint) {
            (Some(order_id), Some(existing)) if *existing == fingerprint => {
                self.orders.get_order(*order_id).await?.order
            }
            _ => {
                if let Some(stale_id) = session.order_id.take() {
                    self.cancel_pending_order(stale_id).await?;
                }

                let items = self.cart_lines(session.cart_id).await?;
                let new_order = NewOrder {
                    customer_id: session.customer_id,
                    currency: "USD".to_string(),
                    payment_method: method.label().to_string(),
                    delivery_type: delivery.label(),
                    shipping_address: serde_json::to_string(&shipping)
                        .map_err(|e| ServiceError::InternalError(e.to_string()))?,
                    billing_address: serde_json::to_string(
                        session.billing_address.as_ref().unwrap_or(&shipping),
                    )
                    .map_err(|e| ServiceError::InternalError(e.to_string()))?,
                    coupon_code: session.coupon_code.clone(),
                    gift_card_code: session.gift_card_code.clone(),
                    priced: priced.clone(),
                    items: items
                        .into_iter()
                        .map(|item| NewOrderItem {
                            product_id: item.product_id,
                            name: item.name,
                            quantity: item.quantity,
                            unit_price: item.unit_price,
                            image_ref: item.image_ref,
                            customization: item.customization,
                        })
                        .collect(),
                };
                self.orders.create_order(new_order).await?
            }
        };

        session.quote = Some(priced.clone());
        session.fingerprint = Some(fingerprint);
        session.order_id = Some(order.id);
        session.failure_reason = None;

        let request = PaymentRequest {
            order_id: order.id,
            reference: order.order_number.clone(),
            amount: priced.total,
            currency: order.currency.clone(),
            phone: match &method {
                PaymentMethod::Wallet { phone } => Some(phone.clone()),
                _ => None,
            },
        };

        let gateway = if priced.is_zero_total() {
            self.gateways.zero_total()
        } else {
            self.gateways.for_method(&method)
        };

        self.event_sender
            .send_or_log(Event::PaymentInitiated {
                order_id: order.id,
                gateway: gateway.kind().label().to_string(),
            })
            .await;

        let init = match gateway.create_payment(&request).await {
            Ok(init) => init,
            Err(err) => {
                session.state = CheckoutState::Failed;
                session.failure_reason = Some(err.to_string());
                self.store(session);
                self.orders
                    .update_payment_status(order.id, PaymentStatus::Failed)
                    .await?;
                return Err(ServiceError::Gateway(err));
            }
        };

        match init {
            PaymentInit::Redirect { redirect_url, .. } => {
                session.state = CheckoutState::AwaitingGateway;
                self.store(session);
                Ok(SubmitOutcome::Redirect {
                    order_id: order.id,
                    redirect_url,
                })
            }
            PaymentInit::Pending { .. } => {
                session.state = CheckoutState::AwaitingGateway;
                self.store(session);
                Ok(SubmitOutcome::AwaitingApproval { order_id: order.id })
            }
            PaymentInit::Immediate { .. } => {
                // Settles right away: zero-total orders are marked paid,
                // pickup orders stay payment-pending until handover.
                let paid = priced.is_zero_total();
                session.state = CheckoutState::Committing;
                let session = self.store(session);
                let outcome = self.commit(session, &order.id, paid).await?;
                Ok(outcome)
            }
        }
    }

    /// Finalize a payment from a gateway callback. The payload's
    /// signature is verified by the gateway adapter before any state
    /// changes; an unverifiable payload changes nothing.
    #[instrument(skip(self, payload))]
    pub async fn confirm(
        &self,
        session_id: Uuid,
        payload: &CallbackPayload,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.session(session_id)?;
        if session.state != CheckoutState::AwaitingGateway {
            return Err(ServiceError::InvalidOperation(format!(
                "Checkout session {} is not awaiting a gateway callback",
                session_id
            )));
        }

        let method = session.payment_method.clone().ok_or_else(|| {
            ServiceError::InternalError("Session awaiting gateway has no payment method".to_string())
        })?;
        let order_id = session.order_id.ok_or_else(|| {
            ServiceError::InternalError("Session awaiting gateway has no order".to_string())
        })?;

        let order = self.orders.get_order(order_id).await?.order;

        let gateway = self.gateways.for_method(&method);
        let confirmation = gateway.confirm_payment(payload).await?;

        // A verifiable signature is not enough on its own: the callback
        // must reference this session's order, or a captured callback
        // for some other payment could settle this one.
        if confirmation.external_reference != order.order_number {
            warn!(
                session_id = %session_id,
                order_number = %order.order_number,
                external_reference = %confirmation.external_reference,
                "Callback references a different payment"
            );
            return Err(ServiceError::Gateway(GatewayError::InvalidCallback(
                "callback does not reference this order".to_string(),
            )));
        }

        match confirmation.outcome {
            PaymentOutcome::Succeeded => {
                session.state = CheckoutState::Committing;
                let session = self.store(session);
                self.commit(session, &order_id, true).await?;
                self.session(session_id)
            }
            PaymentOutcome::Pending => {
                // The gateway has not settled yet; stay put.
                Ok(session)
            }
            PaymentOutcome::Failed | PaymentOutcome::Cancelled => {
                let reason = format!("payment {:?}", confirmation.outcome);
                warn!(session_id = %session_id, order_id = %order_id, %reason, "Payment not captured");

                self.orders
                    .update_payment_status(order_id, PaymentStatus::Failed)
                    .await?;

                session.state = CheckoutState::Failed;
                session.failure_reason = Some(reason.clone());
                let session = self.store(session);

                self.event_sender
                    .send_or_log(Event::CheckoutFailed {
                        session_id,
                        reason,
                    })
                    .await;
                Ok(session)
            }
        }
    }

    /// Commit the order: redeem promotions and record the payment
    /// outcome in one transaction, then retire the cart.
    async fn commit(
        &self,
        mut session: CheckoutSession,
        order_id: &Uuid,
        paid: bool,
    ) -> Result<SubmitOutcome, ServiceError> {
        let order = self.orders.get_order(*order_id).await?.order;

        let txn = self.db.begin().await?;

        let redemption: Result<(), ServiceError> = async {
            if let Some(code) = &order.coupon_code {
                self.promotions.redeem_coupon(&txn, code).await?;
            }
            if let Some(code) = &order.gift_card_code {
                self.promotions
                    .redeem_gift_card(&txn, code, order.gift_card_applied)
                    .await?;
            }

            let mut active: crate::entities::order::ActiveModel = order.clone().into();
            active.payment_status = Set(if paid {
                PaymentStatus::Paid
            } else {
                PaymentStatus::Pending
            });
            active.status = Set(OrderStatus::Processing);
            active.updated_at = Set(Utc::now());
            active.update(&txn).await?;
            Ok(())
        }
        .await;

        if let Err(err) = redemption {
            txn.rollback().await?;
            return self.fail_commit(session, order_id, err).await;
        }

        txn.commit().await?;

        if let Some(code) = &order.coupon_code {
            self.event_sender
                .send_or_log(Event::CouponRedeemed {
                    code: code.clone(),
                    order_id: *order_id,
                })
                .await;
        }
        if let Some(code) = &order.gift_card_code {
            self.event_sender
                .send_or_log(Event::GiftCardRedeemed {
                    code: code.clone(),
                    order_id: *order_id,
                    amount: order.gift_card_applied,
                })
                .await;
        }
        if paid {
            self.event_sender.send_or_log(Event::PaymentCaptured(*order_id)).await;
        }

        self.carts.mark_converted(session.cart_id).await?;

        session.state = CheckoutState::Completed;
        let session = self.store(session);

        info!(session_id = %session.id, order_id = %order_id, "Checkout completed");
        self.event_sender
            .send_or_log(Event::CheckoutCompleted {
                session_id: session.id,
                order_id: *order_id,
            })
            .await;

        Ok(SubmitOutcome::Completed { order_id: *order_id })
    }

    /// A redemption lost its race at commit time. The transaction is
    /// rolled back, the order is closed out and the session fails; the
    /// shopper starts over with fresh promotions.
    async fn fail_commit(
        &self,
        mut session: CheckoutSession,
        order_id: &Uuid,
        err: ServiceError,
    ) -> Result<SubmitOutcome, ServiceError> {
        warn!(order_id = %order_id, error = %err, "Commit failed, closing order");

        self.orders
            .update_payment_status(*order_id, PaymentStatus::Failed)
            .await?;
        self.cancel_pending_order(*order_id).await?;

        session.state = CheckoutState::Failed;
        session.failure_reason = Some(err.to_string());
        session.order_id = None;
        session.invalidate_quote();
        let session = self.store(session);

        self.event_sender
            .send_or_log(Event::CheckoutFailed {
                session_id: session.id,
                reason: err.to_string(),
            })
            .await;

        Err(err)
    }

    async fn cancel_pending_order(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let order = Order::find_by_id(order_id).one(&*self.db).await?;
        if let Some(order) = order {
            if order.status == OrderStatus::Pending {
                let mut active: crate::entities::order::ActiveModel = order.into();
                active.status = Set(OrderStatus::Cancelled);
                active.updated_at = Set(Utc::now());
                active.update(&*self.db).await?;
            }
        }
        Ok(())
    }

    /// Retry payment after a failed attempt. Inputs are unchanged, so
    /// the committed quote (and therefore the charged amount) is reused
    /// verbatim.
    #[instrument(skip(self))]
    pub async fn retry_payment(&self, session_id: Uuid) -> Result<SubmitOutcome, ServiceError> {
        let session = self.session(session_id)?;
        if session.state != CheckoutState::Failed {
            return Err(ServiceError::InvalidOperation(format!(
                "Checkout session {} has no failed payment to retry",
                session_id
            )));
        }
        self.submit(session_id).await
    }

    /// Abandon the checkout. Any pending order is cancelled; the cart
    /// is left untouched for the shopper to come back to.
    #[instrument(skip(self))]
    pub async fn abandon(&self, session_id: Uuid) -> Result<(), ServiceError> {
        let session = self.session(session_id)?;
        if session.state.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "Checkout session {} is already complete",
                session_id
            )));
        }

        if let Some(order_id) = session.order_id {
            if session.state == CheckoutState::AwaitingGateway {
                // Best-effort: tell the processor to drop the in-flight
                // payment before the order is cancelled locally.
                if let (Some(method), Ok(order)) = (
                    &session.payment_method,
                    self.orders.get_order(order_id).await,
                ) {
                    let gateway = self.gateways.for_method(method);
                    if let Err(err) = gateway.cancel(&order.order.order_number).await {
                        warn!(order_id = %order_id, error = %err, "Gateway cancellation failed");
                    }
                }
            }
            self.cancel_pending_order(order_id).await?;
        }

        self.sessions.remove(&session_id);
        self.event_sender
            .send_or_log(Event::CheckoutAbandoned { session_id })
            .await;
        Ok(())
    }
}

fn validate_phone(phone: &str) -> Result<(), ServiceError> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if digits.len() < 7 || digits.len() > 15 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ServiceError::InvalidInput(format!(
            "{} is not a valid phone number",
            phone
        )));
    }
    Ok(())
}
