use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::entities::{order, OrderStatus};
use crate::errors::ServiceError;
use crate::services::orders::OrderWithItems;
use crate::{ApiResponse, ApiResult, AppState};

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderWithItems> {
    let order = state.order_service.get_order(order_id).await?;
    Ok(Json(ApiResponse::success(order)))
}

pub async fn get_order_by_number(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> ApiResult<OrderWithItems> {
    let order = state.order_service.get_by_order_number(&order_number).await?;
    let order = state.order_service.get_order(order.id).await?;
    Ok(Json(ApiResponse::success(order)))
}

fn map_status_str(status: &str) -> Result<OrderStatus, ServiceError> {
    match status.to_ascii_lowercase().as_str() {
        "pending" => Ok(OrderStatus::Pending),
        "processing" => Ok(OrderStatus::Processing),
        "shipped" => Ok(OrderStatus::Shipped),
        "delivered" => Ok(OrderStatus::Delivered),
        "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
        other => Err(ServiceError::InvalidInput(format!(
            "Unknown order status: {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

/// Advance fulfillment status; transitions are forward-only.
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> ApiResult<order::Model> {
    let status = map_status_str(&payload.status)?;
    let order = state
        .order_service
        .update_fulfillment_status(order_id, status)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}
