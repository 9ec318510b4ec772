use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    Schema, Set,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use storefront_api::config::AppConfig;
use storefront_api::entities::{
    self, cart, cart_item, coupon, delivery_option, gift_card, DiscountType,
};
use storefront_api::events::{self, EventSender};
use storefront_api::payments::{
    CallbackPayload, GatewayError, GatewayKind, GatewayRegistry, PaymentConfirmation,
    PaymentGateway, PaymentInit, PaymentOutcome, PaymentRequest,
};
use storefront_api::services::{
    CartService, CheckoutService, OrderService, PromotionService,
};

/// Harness backed by an in-memory SQLite database with the schema
/// derived from the entities.
pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub event_sender: Arc<EventSender>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        // A single connection keeps every query on the same in-memory
        // database.
        let mut options = ConnectOptions::new("sqlite::memory:".to_string());
        options.max_connections(1).sqlx_logging(false);
        let db = Database::connect(options)
            .await
            .expect("failed to open in-memory database");

        let schema = Schema::new(DbBackend::Sqlite);
        let backend = db.get_database_backend();
        let statements = [
            schema.create_table_from_entity(entities::Cart),
            schema.create_table_from_entity(entities::CartItem),
            schema.create_table_from_entity(entities::Coupon),
            schema.create_table_from_entity(entities::GiftCard),
            schema.create_table_from_entity(entities::DeliveryOption),
            schema.create_table_from_entity(entities::Order),
            schema.create_table_from_entity(entities::OrderItem),
        ];
        for statement in &statements {
            db.execute(backend.build(statement))
                .await
                .expect("failed to create table");
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));

        Self {
            db: Arc::new(db),
            event_sender: Arc::new(EventSender::new(event_tx)),
            _event_task: event_task,
        }
    }

    pub fn cart_service(&self) -> CartService {
        CartService::new(self.db.clone(), self.event_sender.clone())
    }

    pub fn order_service(&self) -> OrderService {
        OrderService::new(self.db.clone(), self.event_sender.clone())
    }

    pub fn promotion_service(&self) -> PromotionService {
        PromotionService::new(self.db.clone())
    }

    /// Checkout service with no gateway credentials configured: card
    /// and wallet payments fail closed, offline variants work.
    pub fn checkout_service(&self) -> CheckoutService {
        let gateways = Arc::new(GatewayRegistry::from_config(&test_config()));
        CheckoutService::new(
            self.db.clone(),
            self.cart_service(),
            self.order_service(),
            self.promotion_service(),
            gateways,
            self.event_sender.clone(),
        )
    }

    /// Checkout service whose card and wallet methods route to the
    /// given adapter, for driving the gateway round trip in-process.
    pub fn checkout_service_with_gateway(
        &self,
        gateway: Arc<dyn PaymentGateway>,
    ) -> CheckoutService {
        let gateways = Arc::new(GatewayRegistry::new(gateway.clone(), gateway));
        CheckoutService::new(
            self.db.clone(),
            self.cart_service(),
            self.order_service(),
            self.promotion_service(),
            gateways,
            self.event_sender.clone(),
        )
    }
}

/// Redirect-style gateway double that never touches the network:
/// payments are accepted immediately and callback payloads are taken
/// at face value, so tests can hand-build them without signing.
pub struct LoopbackGateway;

#[async_trait]
impl PaymentGateway for LoopbackGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::RedirectCard
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentInit, GatewayError> {
        Ok(PaymentInit::Redirect {
            redirect_url: format!("https://pay.loopback.test/{}", request.reference),
            reference: request.reference.clone(),
        })
    }

    async fn confirm_payment(
        &self,
        payload: &CallbackPayload,
    ) -> Result<PaymentConfirmation, GatewayError> {
        let outcome = match payload.status.as_str() {
            "succeeded" => PaymentOutcome::Succeeded,
            "cancelled" => PaymentOutcome::Cancelled,
            "pending" => PaymentOutcome::Pending,
            _ => PaymentOutcome::Failed,
        };
        Ok(PaymentConfirmation {
            external_reference: payload.reference.clone(),
            outcome,
        })
    }

    async fn cancel(&self, _external_reference: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        host: "127.0.0.1".to_string(),
        port: 18_080,
        environment: "test".to_string(),
        log_level: "debug".to_string(),
        log_json: false,
        cors_allowed_origins: None,
        event_channel_capacity: 256,
        stale_order_sweep_secs: 3600,
        redirect_gateway: None,
        wallet_gateway: None,
    }
}

/// Insert an active delivery option and return it.
pub async fn seed_delivery_option(app: &TestApp, cost: Decimal) -> delivery_option::Model {
    delivery_option::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set("Courier".to_string()),
        cost: Set(cost),
        eta_label: Set("1-2 days".to_string()),
        active: Set(true),
        position: Set(1),
    }
    .insert(&*app.db)
    .await
    .expect("failed to seed delivery option")
}

/// Insert a coupon and return it.
pub async fn seed_coupon(
    app: &TestApp,
    code: &str,
    discount_type: DiscountType,
    value: Decimal,
    min_purchase: Decimal,
    max_uses: i32,
) -> coupon::Model {
    let now = Utc::now();
    coupon::ActiveModel {
        id: Set(Uuid::new_v4()),
        code: Set(code.to_string()),
        discount_type: Set(discount_type),
        discount_value: Set(value),
        min_purchase: Set(min_purchase),
        max_uses: Set(max_uses),
        used_count: Set(0),
        active: Set(true),
        starts_at: Set(None),
        expires_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&*app.db)
    .await
    .expect("failed to seed coupon")
}

/// Insert a gift card and return it.
pub async fn seed_gift_card(app: &TestApp, code: &str, balance: Decimal) -> gift_card::Model {
    let now = Utc::now();
    gift_card::ActiveModel {
        id: Set(Uuid::new_v4()),
        code: Set(code.to_string()),
        balance: Set(balance),
        initial_balance: Set(balance),
        active: Set(true),
        expires_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&*app.db)
    .await
    .expect("failed to seed gift card")
}

/// Create a cart for a session and add one line to it.
pub async fn seed_cart_with_item(
    app: &TestApp,
    session_id: &str,
    unit_price: Decimal,
    quantity: i32,
) -> (cart::Model, cart_item::Model) {
    let carts = app.cart_service();
    let cart = carts
        .get_or_create_for_session(session_id)
        .await
        .expect("failed to create cart");
    let item = carts
        .add_item(
            cart.id,
            storefront_api::services::cart::NewCartItem {
                product_id: Uuid::new_v4(),
                name: "Ceramic Mug".to_string(),
                unit_price,
                quantity,
                image_ref: None,
                customization: None,
            },
        )
        .await
        .expect("failed to add item");
    (cart, item)
}
