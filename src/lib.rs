//! Storefront API Library
//!
//! Cart, pricing, promotion and checkout services for the storefront.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod payments;
pub mod services;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub cart_service: Arc<services::CartService>,
    pub order_service: Arc<services::OrderService>,
    pub promotion_service: Arc<services::PromotionService>,
    pub checkout_service: Arc<services::CheckoutService>,
}

// Common response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<axum::Json<ApiResponse<T>>, errors::ServiceError>;

// API routes function
pub fn api_v1_routes() -> Router<AppState> {
    let carts = Router::new()
        .route("/carts", post(handlers::carts::open_cart))
        .route("/carts/merge", post(handlers::carts::merge_carts))
        .route("/carts/:id", get(handlers::carts::get_cart))
        .route("/carts/:id/items", post(handlers::carts::add_item))
        .route("/carts/:id/items", delete(handlers::carts::clear_cart))
        .route(
            "/carts/:id/items/:item_id",
            put(handlers::carts::update_item_quantity),
        )
        .route(
            "/carts/:id/items/:item_id",
            delete(handlers::carts::remove_item),
        );

    let checkout = Router::new()
        .route(
            "/delivery-options",
            get(handlers::checkout::list_delivery_options),
        )
        .route("/checkout", post(handlers::checkout::start_checkout))
        .route("/checkout/:id", get(handlers::checkout::get_session))
        .route("/checkout/:id", delete(handlers::checkout::abandon))
        .route("/checkout/:id/address", put(handlers::checkout::set_address))
        .route(
            "/checkout/:id/delivery",
            put(handlers::checkout::set_delivery),
        )
        .route(
            "/checkout/:id/payment",
            put(handlers::checkout::set_payment_method),
        )
        .route("/checkout/:id/coupon", post(handlers::checkout::apply_coupon))
        .route(
            "/checkout/:id/coupon",
            delete(handlers::checkout::remove_coupon),
        )
        .route(
            "/checkout/:id/gift-card",
            post(handlers::checkout::apply_gift_card),
        )
        .route(
            "/checkout/:id/gift-card",
            delete(handlers::checkout::remove_gift_card),
        )
        .route("/checkout/:id/quote", post(handlers::checkout::quote))
        .route("/checkout/:id/submit", post(handlers::checkout::submit))
        .route(
            "/checkout/:id/callback",
            post(handlers::checkout::payment_callback),
        )
        .route(
            "/checkout/:id/retry",
            post(handlers::checkout::retry_payment),
        );

    let orders = Router::new()
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/by-number/:order_number",
            get(handlers::orders::get_order_by_number),
        )
        .route(
            "/orders/:id/status",
            put(handlers::orders::update_order_status),
        );

    Router::new().merge(carts).merge(checkout).merge(orders)
}
