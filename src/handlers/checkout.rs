use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::entities::delivery_option;
use crate::errors::ServiceError;
use crate::payments::{CallbackPayload, PaymentMethod};
use crate::services::checkout::{Address, CheckoutSession, SubmitOutcome};
use crate::{ApiResponse, ApiResult, AppState};

/// Delivery options to offer at the delivery step.
pub async fn list_delivery_options(
    State(state): State<AppState>,
) -> ApiResult<Vec<delivery_option::Model>> {
    let options = state.checkout_service.list_delivery_options().await?;
    Ok(Json(ApiResponse::success(options)))
}

#[derive(Debug, Deserialize)]
pub struct StartCheckoutRequest {
    pub cart_id: Uuid,
    pub customer_id: Option<Uuid>,
}

pub async fn start_checkout(
    State(state): State<AppState>,
    Json(payload): Json<StartCheckoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutSession>>), ServiceError> {
    let session = state
        .checkout_service
        .start(payload.cart_id, payload.customer_id)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(session))))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<CheckoutSession> {
    let session = state.checkout_service.get(session_id)?;
    Ok(Json(ApiResponse::success(session)))
}

#[derive(Debug, Deserialize)]
pub struct SetAddressRequest {
    pub shipping: Address,
    pub billing: Option<Address>,
}

pub async fn set_address(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SetAddressRequest>,
) -> ApiResult<CheckoutSession> {
    let session = state
        .checkout_service
        .set_address(session_id, payload.shipping, payload.billing)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

#[derive(Debug, Deserialize)]
pub struct SetDeliveryRequest {
    /// Absent means in-store pickup.
    pub option_id: Option<Uuid>,
}

pub async fn set_delivery(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SetDeliveryRequest>,
) -> ApiResult<CheckoutSession> {
    let session = state
        .checkout_service
        .set_delivery(session_id, payload.option_id)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

#[derive(Debug, Deserialize)]
pub struct SetPaymentMethodRequest {
    pub method: PaymentMethod,
}

pub async fn set_payment_method(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SetPaymentMethodRequest>,
) -> ApiResult<CheckoutSession> {
    let session = state
        .checkout_service
        .set_payment_method(session_id, payload.method)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

#[derive(Debug, Deserialize)]
pub struct PromotionCodeRequest {
    pub code: String,
}

pub async fn apply_coupon(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<PromotionCodeRequest>,
) -> ApiResult<CheckoutSession> {
    let session = state
        .checkout_service
        .apply_coupon(session_id, &payload.code)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn remove_coupon(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<CheckoutSession> {
    let session = state.checkout_service.remove_coupon(session_id)?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn apply_gift_card(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<PromotionCodeRequest>,
) -> ApiResult<CheckoutSession> {
    let session = state
        .checkout_service
        .apply_gift_card(session_id, &payload.code)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn remove_gift_card(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<CheckoutSession> {
    let session = state.checkout_service.remove_gift_card(session_id)?;
    Ok(Json(ApiResponse::success(session)))
}

/// Price the session and return the quoted breakdown.
pub async fn quote(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<CheckoutSession> {
    let session = state.checkout_service.quote(session_id).await?;
    Ok(Json(ApiResponse::success(session)))
}

/// Freeze the quote into an order and initiate payment.
pub async fn submit(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SubmitOutcome> {
    let outcome = state.checkout_service.submit(session_id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// Signed gateway callback finalizing a payment attempt.
pub async fn payment_callback(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<CallbackPayload>,
) -> ApiResult<CheckoutSession> {
    let session = state.checkout_service.confirm(session_id, &payload).await?;
    Ok(Json(ApiResponse::success(session)))
}

/// Retry payment after a failed attempt; the quoted total is reused.
pub async fn retry_payment(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SubmitOutcome> {
    let outcome = state.checkout_service.retry_payment(session_id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn abandon(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.checkout_service.abandon(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
