use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::entities::cart_item;
use crate::errors::ServiceError;
use crate::services::cart::{CartWithItems, NewCartItem};
use crate::{ApiResponse, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct OpenCartRequest {
    pub session_id: Option<String>,
    pub customer_id: Option<Uuid>,
}

/// Open (or return) the active cart for a session or customer.
pub async fn open_cart(
    State(state): State<AppState>,
    Json(payload): Json<OpenCartRequest>,
) -> ApiResult<CartWithItems> {
    let cart = match (payload.session_id, payload.customer_id) {
        (_, Some(customer_id)) => {
            state
                .cart_service
                .get_or_create_for_customer(customer_id)
                .await?
        }
        (Some(session_id), None) => {
            state
                .cart_service
                .get_or_create_for_session(&session_id)
                .await?
        }
        (None, None) => {
            return Err(ServiceError::InvalidInput(
                "Either session_id or customer_id is required".to_string(),
            ))
        }
    };

    let cart = state.cart_service.get_cart(cart.id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

pub async fn get_cart(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
) -> ApiResult<CartWithItems> {
    let cart = state.cart_service.get_cart(cart_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

/// Add a line, merging quantities when the same product and
/// customization are already in the cart.
pub async fn add_item(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<NewCartItem>,
) -> Result<(StatusCode, Json<ApiResponse<cart_item::Model>>), ServiceError> {
    let line = state.cart_service.add_item(cart_id, payload).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(line))))
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuantityRequest {
    pub quantity: i32,
}

/// Set a line's quantity; zero or below removes the line.
pub async fn update_item_quantity(
    State(state): State<AppState>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> ApiResult<Option<cart_item::Model>> {
    let line = state
        .cart_service
        .update_item_quantity(cart_id, item_id, payload.quantity)
        .await?;
    Ok(Json(ApiResponse::success(line)))
}

pub async fn remove_item(
    State(state): State<AppState>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ServiceError> {
    state.cart_service.remove_item(cart_id, item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_cart(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.cart_service.clear(cart_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MergeCartsRequest {
    pub session_id: String,
    pub customer_id: Uuid,
}

/// Fold the anonymous session cart into the customer's cart at login.
pub async fn merge_carts(
    State(state): State<AppState>,
    Json(payload): Json<MergeCartsRequest>,
) -> ApiResult<CartWithItems> {
    let cart = state
        .cart_service
        .merge_on_login(&payload.session_id, payload.customer_id)
        .await?;
    let cart = state.cart_service.get_cart(cart.id).await?;
    Ok(Json(ApiResponse::success(cart)))
}
