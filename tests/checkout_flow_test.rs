mod common;

use std::sync::Arc;

use common::{
    seed_cart_with_item, seed_coupon, seed_delivery_option, seed_gift_card, LoopbackGateway,
    TestApp,
};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};

use storefront_api::entities::{
    order, CartStatus, DiscountType, GiftCard, Order, OrderStatus, PaymentStatus,
};
use storefront_api::errors::ServiceError;
use storefront_api::payments::{CallbackPayload, GatewayError, PaymentMethod};
use storefront_api::services::checkout::{Address, CheckoutState, SubmitOutcome};

fn address() -> Address {
    Address {
        full_name: "Jordan Okafor".to_string(),
        line1: "12 Harbor Street".to_string(),
        line2: None,
        city: "Mombasa".to_string(),
        region: "Coast".to_string(),
        postal_code: "80100".to_string(),
        country: "KE".to_string(),
        phone: "+254700000000".to_string(),
    }
}

fn callback(reference: &str, status: &str) -> CallbackPayload {
    CallbackPayload {
        reference: reference.to_string(),
        status: status.to_string(),
        timestamp: chrono::Utc::now().timestamp(),
        // The loopback adapter skips signature verification.
        signature: String::new(),
    }
}

#[tokio::test]
async fn pickup_order_with_courier_delivery_commits_at_the_quoted_total() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();
    let orders = app.order_service();
    let carts = app.cart_service();

    // Two items at 25.00 plus 15.00 delivery.
    let (cart, _) = seed_cart_with_item(&app, "flow-1", dec!(25.00), 2).await;
    let delivery = seed_delivery_option(&app, dec!(15.00)).await;

    let session = checkout.start(cart.id, None).await.unwrap();
    checkout
        .set_address(session.id, address(), None)
        .await
        .unwrap();
    checkout
        .set_delivery(session.id, Some(delivery.id))
        .await
        .unwrap();
    checkout
        .set_payment_method(session.id, PaymentMethod::PayOnPickup)
        .await
        .unwrap();

    let quoted = checkout.quote(session.id).await.unwrap();
    let quote = quoted.quote.unwrap();
    assert_eq!(quote.subtotal, dec!(50.00));
    assert_eq!(quote.shipping_cost, dec!(15.00));
    assert_eq!(quote.total, dec!(65.00));

    let outcome = checkout.submit(session.id).await.unwrap();
    let SubmitOutcome::Completed { order_id } = outcome else {
        panic!("pay-on-pickup must commit without a gateway round trip");
    };

    let order = orders.get_order(order_id).await.unwrap();
    assert_eq!(order.order.total_amount, dec!(65.00));
    assert_eq!(order.order.status, OrderStatus::Processing);
    // Cash changes hands at the counter, not at commit.
    assert_eq!(order.order.payment_status, PaymentStatus::Pending);
    assert_eq!(order.items.len(), 1);
    assert_eq!(order.items[0].total_price, dec!(50.00));

    let session = checkout.get(session.id).unwrap();
    assert_eq!(session.state, CheckoutState::Completed);

    let cart = carts.get_cart(cart.id).await.unwrap();
    assert_eq!(cart.cart.status, CartStatus::Converted);
    assert!(cart.items.is_empty());
}

#[tokio::test]
async fn percentage_coupon_discounts_the_committed_order() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();
    let orders = app.order_service();

    let (cart, _) = seed_cart_with_item(&app, "flow-2", dec!(100.00), 1).await;
    seed_coupon(
        &app,
        "SAVE20",
        DiscountType::Percentage,
        dec!(20),
        dec!(0),
        5,
    )
    .await;

    let session = checkout.start(cart.id, None).await.unwrap();
    checkout
        .set_address(session.id, address(), None)
        .await
        .unwrap();
    checkout.set_delivery(session.id, None).await.unwrap();
    checkout
        .set_payment_method(session.id, PaymentMethod::PayOnPickup)
        .await
        .unwrap();
    checkout.apply_coupon(session.id, "save20").await.unwrap();

    let outcome = checkout.submit(session.id).await.unwrap();
    let SubmitOutcome::Completed { order_id } = outcome else {
        panic!("expected committed order");
    };

    let order = orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.subtotal, dec!(100.00));
    assert_eq!(order.coupon_discount, dec!(20.00));
    assert_eq!(order.total_amount, dec!(80.00));
    assert_eq!(order.coupon_code.as_deref(), Some("SAVE20"));
}

#[tokio::test]
async fn gift_card_is_clamped_and_only_the_applied_amount_is_deducted() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();
    let orders = app.order_service();

    // 40.00 of goods against a 100.00 card: the order is fully covered
    // and exactly 40.00 leaves the card.
    let (cart, _) = seed_cart_with_item(&app, "flow-3", dec!(40.00), 1).await;
    let card = seed_gift_card(&app, "GC-RICH", dec!(100.00)).await;

    let session = checkout.start(cart.id, None).await.unwrap();
    checkout
        .set_address(session.id, address(), None)
        .await
        .unwrap();
    checkout.set_delivery(session.id, None).await.unwrap();
    checkout
        .set_payment_method(session.id, PaymentMethod::Card)
        .await
        .unwrap();
    checkout.apply_gift_card(session.id, "GC-RICH").await.unwrap();

    let outcome = checkout.submit(session.id).await.unwrap();
    let SubmitOutcome::Completed { order_id } = outcome else {
        panic!("zero-total order must skip the gateway even for card payments");
    };

    let order = orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.gift_card_applied, dec!(40.00));
    assert_eq!(order.total_amount, dec!(0.00));
    // Zero-total orders commit already paid.
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.status, OrderStatus::Processing);

    let stored = GiftCard::find_by_id(card.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.balance, dec!(60.00));
}

#[tokio::test]
async fn card_payment_without_credentials_fails_closed() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();
    let orders = app.order_service();

    let (cart, _) = seed_cart_with_item(&app, "flow-4", dec!(30.00), 1).await;

    let session = checkout.start(cart.id, None).await.unwrap();
    checkout
        .set_address(session.id, address(), None)
        .await
        .unwrap();
    checkout.set_delivery(session.id, None).await.unwrap();
    checkout
        .set_payment_method(session.id, PaymentMethod::Card)
        .await
        .unwrap();

    let err = checkout.submit(session.id).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Gateway(GatewayError::ConfigurationMissing(_))
    ));

    let session = checkout.get(session.id).unwrap();
    assert_eq!(session.state, CheckoutState::Failed);
    let order_id = session.order_id.unwrap();
    let order = orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.payment_status, PaymentStatus::Failed);
}

#[tokio::test]
async fn retrying_with_unchanged_inputs_reuses_the_order_and_total() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();
    let orders = app.order_service();

    let (cart, _) = seed_cart_with_item(&app, "flow-5", dec!(30.00), 1).await;
    let delivery = seed_delivery_option(&app, dec!(5.00)).await;

    let session = checkout.start(cart.id, None).await.unwrap();
    checkout
        .set_address(session.id, address(), None)
        .await
        .unwrap();
    checkout
        .set_delivery(session.id, Some(delivery.id))
        .await
        .unwrap();
    checkout
        .set_payment_method(session.id, PaymentMethod::Card)
        .await
        .unwrap();

    // No card credentials configured: the attempt fails after the
    // pending order is created.
    checkout.submit(session.id).await.unwrap_err();
    let first_order_id = checkout.get(session.id).unwrap().order_id.unwrap();
    let first_total = orders
        .get_order(first_order_id)
        .await
        .unwrap()
        .order
        .total_amount;

    // Nothing priced has changed, so the retry must charge the same
    // order at the same total rather than repricing.
    checkout.retry_payment(session.id).await.unwrap_err();
    let second_order_id = checkout.get(session.id).unwrap().order_id.unwrap();

    assert_eq!(first_order_id, second_order_id);
    let order = orders.get_order(second_order_id).await.unwrap().order;
    assert_eq!(order.total_amount, first_total);
    assert_eq!(order.total_amount, dec!(35.00));
}

#[tokio::test]
async fn changing_the_cart_after_a_failed_attempt_reprices_into_a_fresh_order() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();
    let carts = app.cart_service();
    let orders = app.order_service();

    let (cart, line) = seed_cart_with_item(&app, "flow-6", dec!(30.00), 1).await;

    let session = checkout.start(cart.id, None).await.unwrap();
    checkout
        .set_address(session.id, address(), None)
        .await
        .unwrap();
    checkout.set_delivery(session.id, None).await.unwrap();
    checkout
        .set_payment_method(session.id, PaymentMethod::Card)
        .await
        .unwrap();

    checkout.submit(session.id).await.unwrap_err();
    let stale_order_id = checkout.get(session.id).unwrap().order_id.unwrap();

    // The shopper goes back and doubles the quantity.
    carts
        .update_item_quantity(cart.id, line.id, 2)
        .await
        .unwrap();

    checkout.submit(session.id).await.unwrap_err();
    let fresh_order_id = checkout.get(session.id).unwrap().order_id.unwrap();

    assert_ne!(stale_order_id, fresh_order_id);
    let stale = orders.get_order(stale_order_id).await.unwrap().order;
    assert_eq!(stale.status, OrderStatus::Cancelled);
    let fresh = orders.get_order(fresh_order_id).await.unwrap().order;
    assert_eq!(fresh.total_amount, dec!(60.00));
}

#[tokio::test]
async fn abandoning_a_checkout_cancels_its_pending_order_and_keeps_the_cart() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();
    let carts = app.cart_service();
    let orders = app.order_service();

    let (cart, _) = seed_cart_with_item(&app, "flow-7", dec!(30.00), 1).await;

    let session = checkout.start(cart.id, None).await.unwrap();
    checkout
        .set_address(session.id, address(), None)
        .await
        .unwrap();
    checkout.set_delivery(session.id, None).await.unwrap();
    checkout
        .set_payment_method(session.id, PaymentMethod::Card)
        .await
        .unwrap();
    checkout.submit(session.id).await.unwrap_err();
    let order_id = checkout.get(session.id).unwrap().order_id.unwrap();

    checkout.abandon(session.id).await.unwrap();

    assert!(matches!(
        checkout.get(session.id),
        Err(ServiceError::NotFound(_))
    ));
    let order = orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Cancelled);

    // The cart survives for the shopper to come back to.
    let cart = carts.get_cart(cart.id).await.unwrap();
    assert_eq!(cart.cart.status, CartStatus::Active);
    assert_eq!(cart.items.len(), 1);
}

#[tokio::test]
async fn empty_cart_cannot_start_checkout() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();
    let carts = app.cart_service();

    let cart = carts.get_or_create_for_session("flow-8").await.unwrap();
    let err = checkout.start(cart.id, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOperation(_)));
}

#[tokio::test]
async fn stale_pending_orders_are_swept_into_cancelled() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();
    let orders = app.order_service();

    let (cart, _) = seed_cart_with_item(&app, "flow-9", dec!(30.00), 1).await;

    let session = checkout.start(cart.id, None).await.unwrap();
    checkout
        .set_address(session.id, address(), None)
        .await
        .unwrap();
    checkout.set_delivery(session.id, None).await.unwrap();
    checkout
        .set_payment_method(session.id, PaymentMethod::Card)
        .await
        .unwrap();
    checkout.submit(session.id).await.unwrap_err();
    let order_id = checkout.get(session.id).unwrap().order_id.unwrap();

    // Reset to a pending payment that never resolved, two days ago.
    let stale = Order::find_by_id(order_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    let mut active: order::ActiveModel = stale.into();
    active.payment_status = Set(PaymentStatus::Pending);
    active.created_at = Set(chrono::Utc::now() - chrono::Duration::days(2));
    active.update(&*app.db).await.unwrap();

    let swept = orders.expire_stale_pending().await.unwrap();
    assert_eq!(swept, 1);

    let order = orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Cancelled);

    // A second sweep finds nothing.
    assert_eq!(orders.expire_stale_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn submitting_without_required_steps_is_rejected() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();

    let (cart, _) = seed_cart_with_item(&app, "flow-10", dec!(30.00), 1).await;
    let session = checkout.start(cart.id, None).await.unwrap();

    let err = checkout.submit(session.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOperation(_)));

    // Delivery before address is also out of order.
    let err = checkout.set_delivery(session.id, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOperation(_)));
}

#[tokio::test]
async fn wallet_method_requires_a_plausible_phone() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service();

    let (cart, _) = seed_cart_with_item(&app, "flow-11", dec!(30.00), 1).await;
    let session = checkout.start(cart.id, None).await.unwrap();
    checkout
        .set_address(session.id, address(), None)
        .await
        .unwrap();
    checkout.set_delivery(session.id, None).await.unwrap();

    let err = checkout
        .set_payment_method(
            session.id,
            PaymentMethod::Wallet {
                phone: "not-a-phone".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));

    let session = checkout
        .set_payment_method(
            session.id,
            PaymentMethod::Wallet {
                phone: "+254700000000".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(session.state, CheckoutState::Pricing);
}

/// Drive a card checkout through submission up to the gateway redirect.
async fn card_session_awaiting_gateway(
    app: &TestApp,
    checkout: &storefront_api::services::CheckoutService,
    session_key: &str,
) -> (uuid::Uuid, uuid::Uuid, uuid::Uuid) {
    let (cart, _) = seed_cart_with_item(app, session_key, dec!(80.00), 1).await;
    let session = checkout.start(cart.id, None).await.unwrap();
    checkout
        .set_address(session.id, address(), None)
        .await
        .unwrap();
    checkout.set_delivery(session.id, None).await.unwrap();
    checkout
        .set_payment_method(session.id, PaymentMethod::Card)
        .await
        .unwrap();

    let outcome = checkout.submit(session.id).await.unwrap();
    let SubmitOutcome::Redirect { order_id, .. } = outcome else {
        panic!("card payment must round-trip through the gateway");
    };
    assert_eq!(
        checkout.get(session.id).unwrap().state,
        CheckoutState::AwaitingGateway
    );
    (session.id, order_id, cart.id)
}

#[tokio::test]
async fn successful_gateway_callback_completes_the_checkout() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service_with_gateway(Arc::new(LoopbackGateway));
    let orders = app.order_service();
    let carts = app.cart_service();

    let (session_id, order_id, cart_id) =
        card_session_awaiting_gateway(&app, &checkout, "flow-12").await;

    let order = orders.get_order(order_id).await.unwrap().order;
    let session = checkout
        .confirm(session_id, &callback(&order.order_number, "succeeded"))
        .await
        .unwrap();
    assert_eq!(session.state, CheckoutState::Completed);

    let order = orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.status, OrderStatus::Processing);

    let cart = carts.get_cart(cart_id).await.unwrap();
    assert_eq!(cart.cart.status, CartStatus::Converted);
}

#[tokio::test]
async fn failed_gateway_callback_fails_the_session_and_the_payment() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service_with_gateway(Arc::new(LoopbackGateway));
    let orders = app.order_service();

    let (session_id, order_id, _) =
        card_session_awaiting_gateway(&app, &checkout, "flow-13").await;

    let order = orders.get_order(order_id).await.unwrap().order;
    let session = checkout
        .confirm(session_id, &callback(&order.order_number, "cancelled"))
        .await
        .unwrap();
    assert_eq!(session.state, CheckoutState::Failed);
    assert!(session.failure_reason.is_some());

    let order = orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.payment_status, PaymentStatus::Failed);
}

#[tokio::test]
async fn callback_for_a_different_order_changes_nothing() {
    let app = TestApp::new().await;
    let checkout = app.checkout_service_with_gateway(Arc::new(LoopbackGateway));
    let orders = app.order_service();

    let (session_id, order_id, _) =
        card_session_awaiting_gateway(&app, &checkout, "flow-14").await;

    // Validly confirmed by the gateway, but about some other payment:
    // it must not settle this session's order.
    let err = checkout
        .confirm(session_id, &callback("ORD-000000000000", "succeeded"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Gateway(GatewayError::InvalidCallback(_))
    ));

    let session = checkout.get(session_id).unwrap();
    assert_eq!(session.state, CheckoutState::AwaitingGateway);
    let order = orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert_eq!(order.status, OrderStatus::Pending);

    // The genuine callback still lands afterwards.
    let session = checkout
        .confirm(session_id, &callback(&order.order_number, "succeeded"))
        .await
        .unwrap();
    assert_eq!(session.state, CheckoutState::Completed);
}
