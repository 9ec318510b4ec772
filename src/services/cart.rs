use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::entities::{cart, cart_item, Cart, CartItem, CartStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// How long an untouched cart stays active.
const CART_TTL_DAYS: i64 = 30;

/// A cart line to add, as submitted by the client.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewCartItem {
    pub product_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub unit_price: Decimal,
    #[validate(range(min = 1, max = 999))]
    pub quantity: i32,
    pub image_ref: Option<String>,
    /// Option selections (size, color, engraving text). Part of the
    /// line's identity: same product with different customization is a
    /// different line.
    pub customization: Option<BTreeMap<String, String>>,
}

/// Serialize a customization map in canonical form. `BTreeMap` orders
/// keys, so equal maps always produce equal JSON.
pub fn canonical_customization(
    customization: Option<&BTreeMap<String, String>>,
) -> Option<serde_json::Value> {
    customization.and_then(|map| {
        if map.is_empty() {
            None
        } else {
            serde_json::to_value(map).ok()
        }
    })
}

/// Cart with its lines, the shape every cart read returns.
#[derive(Debug, Clone, Serialize)]
pub struct CartWithItems {
    #[serde(flatten)]
    pub cart: cart::Model,
    pub items: Vec<cart_item::Model>,
}

/// Manages cart lifecycle and line mutation. All monetary totals are
/// left to the pricing engine; the cart only stores lines.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    fn new_cart(session_id: Option<String>, customer_id: Option<Uuid>) -> cart::ActiveModel {
        let now = Utc::now();
        cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            session_id: Set(session_id),
            customer_id: Set(customer_id),
            currency: Set("USD".to_string()),
            status: Set(CartStatus::Active),
            expires_at: Set(now + Duration::days(CART_TTL_DAYS)),
            created_at: Set(now),
            updated_at: Set(now),
        }
    }

    /// Find the active cart for an anonymous device session, creating
    /// one when none exists.
    #[instrument(skip(self))]
    pub async fn get_or_create_for_session(
        &self,
        session_id: &str,
    ) -> Result<cart::Model, ServiceError> {
        let existing = Cart::find()
            .filter(cart::Column::SessionId.eq(session_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .one(&*self.db)
            .await?;

        if let Some(cart) = existing {
            return Ok(cart);
        }

        let cart = Self::new_cart(Some(session_id.to_string()), None)
            .insert(&*self.db)
            .await?;

        info!(cart_id = %cart.id, "Cart created for session");
        self.event_sender.send_or_log(Event::CartCreated(cart.id)).await;
        Ok(cart)
    }

    /// Find the active cart for an authenticated customer, creating one
    /// when none exists.
    #[instrument(skip(self))]
    pub async fn get_or_create_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        let existing = Cart::find()
            .filter(cart::Column::CustomerId.eq(customer_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .one(&*self.db)
            .await?;

        if let Some(cart) = existing {
            return Ok(cart);
        }

        let cart = Self::new_cart(None, Some(customer_id))
            .insert(&*self.db)
            .await?;

        info!(cart_id = %cart.id, "Cart created for customer");
        self.event_sender.send_or_log(Event::CartCreated(cart.id)).await;
        Ok(cart)
    }

    /// Fetch a cart and its lines.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(CartWithItems { cart, items })
    }

    async fn active_cart(&self, cart_id: Uuid) -> Result<cart::Model, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} is not active",
                cart_id
            )));
        }
        Ok(cart)
    }

    async fn touch(&self, cart: &cart::Model) -> Result<(), ServiceError> {
        let now = Utc::now();
        let mut active: cart::ActiveModel = cart.clone().into();
        active.updated_at = Set(now);
        active.expires_at = Set(now + Duration::days(CART_TTL_DAYS));
        active.update(&*self.db).await?;
        Ok(())
    }

    /// Add a line to the cart, merging with an existing line when the
    /// identity `(product_id, customization)` matches. A merge adds
    /// quantities and refreshes the price snapshot; the cart never
    /// carries two lines with the same identity.
    #[instrument(skip(self, item), fields(product_id = %item.product_id))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        item: NewCartItem,
    ) -> Result<cart_item::Model, ServiceError> {
        item.validate()?;
        if item.unit_price < Decimal::ZERO {
            return Err(ServiceError::InvalidInput(
                "unit_price must not be negative".to_string(),
            ));
        }

        let cart = self.active_cart(cart_id).await?;
        let customization = canonical_customization(item.customization.as_ref());

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(item.product_id))
            .all(&*self.db)
            .await?
            .into_iter()
            .find(|line| line.customization == customization);

        let now = Utc::now();
        let (line, merged) = match existing {
            Some(line) => {
                let mut active: cart_item::ActiveModel = line.clone().into();
                active.quantity = Set(line.quantity + item.quantity);
                active.unit_price = Set(item.unit_price);
                active.updated_at = Set(now);
                (active.update(&*self.db).await?, true)
            }
            None => {
                let line = cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart_id),
                    product_id: Set(item.product_id),
                    name: Set(item.name),
                    unit_price: Set(item.unit_price),
                    quantity: Set(item.quantity),
                    image_ref: Set(item.image_ref),
                    customization: Set(customization),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                (line.insert(&*self.db).await?, false)
            }
        };

        self.touch(&cart).await?;

        let event = if merged {
            Event::CartItemUpdated {
                cart_id,
                item_id: line.id,
            }
        } else {
            Event::CartItemAdded {
                cart_id,
                item_id: line.id,
            }
        };
        self.event_sender.send_or_log(event).await;

        Ok(line)
    }

    /// Set a line's quantity. Zero or negative removes the line.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<Option<cart_item::Model>, ServiceError> {
        let cart = self.active_cart(cart_id).await?;

        let line = CartItem::find_by_id(item_id)
            .filter(cart_item::Column::CartId.eq(cart_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Item {} not found in cart {}", item_id, cart_id))
            })?;

        if quantity <= 0 {
            CartItem::delete_by_id(line.id).exec(&*self.db).await?;
            self.touch(&cart).await?;
            self.event_sender
                .send_or_log(Event::CartItemRemoved { cart_id, item_id })
                .await;
            return Ok(None);
        }

        let mut active: cart_item::ActiveModel = line.into();
        active.quantity = Set(quantity);
        active.updated_at = Set(Utc::now());
        let line = active.update(&*self.db).await?;

        self.touch(&cart).await?;
        self.event_sender
            .send_or_log(Event::CartItemUpdated { cart_id, item_id })
            .await;

        Ok(Some(line))
    }

    /// Remove a line from the cart.
    #[instrument(skip(self))]
    pub async fn remove_item(&self, cart_id: Uuid, item_id: Uuid) -> Result<(), ServiceError> {
        let cart = self.active_cart(cart_id).await?;

        let result = CartItem::delete_by_id(item_id).exec(&*self.db).await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Item {} not found in cart {}",
                item_id, cart_id
            )));
        }

        self.touch(&cart).await?;
        self.event_sender
            .send_or_log(Event::CartItemRemoved { cart_id, item_id })
            .await;
        Ok(())
    }

    /// Remove every line from the cart.
    #[instrument(skip(self))]
    pub async fn clear(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let cart = self.active_cart(cart_id).await?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&*self.db)
            .await?;

        self.touch(&cart).await?;
        self.event_sender.send_or_log(Event::CartCleared(cart_id)).await;
        Ok(())
    }

    /// Mark a cart converted after its order committed, dropping its
    /// lines so the session starts fresh.
    pub async fn mark_converted(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await?;

        let mut active = cart::ActiveModel {
            id: Set(cart_id),
            ..Default::default()
        };
        active.status = Set(CartStatus::Converted);
        active.updated_at = Set(Utc::now());
        Cart::update(active).exec(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    /// Fold an anonymous session cart into the customer's cart at
    /// login. The union of both carts survives: lines with the same
    /// identity merge by adding quantities, everything else carries
    /// over. The anonymous cart is marked merged, never deleted.
    #[instrument(skip(self))]
    pub async fn merge_on_login(
        &self,
        session_id: &str,
        customer_id: Uuid,
    ) -> Result<cart::Model, ServiceError> {
        let target = self.get_or_create_for_customer(customer_id).await?;

        let source = Cart::find()
            .filter(cart::Column::SessionId.eq(session_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .one(&*self.db)
            .await?;

        let Some(source) = source else {
            // Nothing anonymous to fold in.
            return Ok(target);
        };
        if source.id == target.id {
            return Ok(target);
        }

        let source_items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(source.id))
            .all(&*self.db)
            .await?;
        let target_items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(target.id))
            .all(&*self.db)
            .await?;

        let txn = self.db.begin().await?;
        let now = Utc::now();

        for item in source_items {
            let matching = target_items
                .iter()
                .find(|t| t.product_id == item.product_id && t.customization == item.customization);

            match matching {
                Some(existing) => {
                    let mut active: cart_item::ActiveModel = existing.clone().into();
                    active.quantity = Set(existing.quantity + item.quantity);
                    active.updated_at = Set(now);
                    active.update(&txn).await?;
                }
                None => {
                    let line = cart_item::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        cart_id: Set(target.id),
                        product_id: Set(item.product_id),
                        name: Set(item.name),
                        unit_price: Set(item.unit_price),
                        quantity: Set(item.quantity),
                        image_ref: Set(item.image_ref),
                        customization: Set(item.customization),
                        created_at: Set(now),
                        updated_at: Set(now),
                    };
                    line.insert(&txn).await?;
                }
            }
        }

        let mut source_active: cart::ActiveModel = source.clone().into();
        source_active.status = Set(CartStatus::Merged);
        source_active.updated_at = Set(now);
        source_active.update(&txn).await?;

        txn.commit().await?;

        info!(source = %source.id, target = %target.id, "Carts merged at login");
        self.event_sender
            .send_or_log(Event::CartsMerged {
                source_cart_id: source.id,
                target_cart_id: target.id,
            })
            .await;

        self.get_cart(target.id).await.map(|c| c.cart)
    }
}
