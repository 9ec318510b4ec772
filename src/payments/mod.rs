use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::AppConfig;

pub mod offline;
pub mod redirect;
pub mod wallet;

pub use offline::OfflineGateway;
pub use redirect::RedirectGateway;
pub use wallet::WalletGateway;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance for callback timestamps, in seconds.
pub const CALLBACK_TOLERANCE_SECS: i64 = 300;

/// Failure taxonomy for external payment processors.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum GatewayError {
    /// Server-held credentials are absent. The gateway fails closed:
    /// it never proceeds without them.
    #[error("credentials missing for {0}")]
    ConfigurationMissing(String),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("payment rejected: {0}")]
    Rejected(String),
    #[error("invalid callback: {0}")]
    InvalidCallback(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    RedirectCard,
    Wallet,
    Offline,
}

impl GatewayKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::RedirectCard => "redirect_card",
            Self::Wallet => "wallet",
            Self::Offline => "offline",
        }
    }
}

/// Payment method selected by the shopper at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Wallet { phone: String },
    PayOnPickup,
}

impl PaymentMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Wallet { .. } => "wallet",
            Self::PayOnPickup => "pay_on_pickup",
        }
    }

    pub fn gateway_kind(&self) -> GatewayKind {
        match self {
            Self::Card => GatewayKind::RedirectCard,
            Self::Wallet { .. } => GatewayKind::Wallet,
            Self::PayOnPickup => GatewayKind::Offline,
        }
    }

    /// Pay-on-pickup settles without any external round trip.
    pub fn requires_gateway_round_trip(&self) -> bool {
        !matches!(self, Self::PayOnPickup)
    }
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_id: Uuid,
    /// Order number used as the merchant reference.
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub phone: Option<String>,
}

/// What the shopper's client needs to continue the payment.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentInit {
    /// Browser must be sent to the gateway-hosted page.
    Redirect {
        redirect_url: String,
        reference: String,
    },
    /// Asynchronous push (e.g. wallet prompt on the shopper's phone).
    Pending { reference: String },
    /// Settled synchronously, no round trip required.
    Immediate { reference: String },
}

impl PaymentInit {
    pub fn reference(&self) -> &str {
        match self {
            Self::Redirect { reference, .. }
            | Self::Pending { reference }
            | Self::Immediate { reference } => reference,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

/// Signed payload a gateway posts back (or that the server fetches)
/// to finalize a payment. A browser redirect alone is never trusted;
/// the signature is verified against the server-held secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub reference: String,
    pub status: String,
    /// Unix timestamp (seconds) the gateway signed the payload at.
    pub timestamp: i64,
    /// Hex-encoded HMAC-SHA256 over `timestamp.reference.status`.
    pub signature: String,
}

#[derive(Debug, Clone)]
pub struct PaymentConfirmation {
    pub external_reference: String,
    pub outcome: PaymentOutcome,
}

/// Capability interface over an external payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Initiate a payment for `request.amount`. Suspends on the network
    /// for external gateways; fails closed with `ConfigurationMissing`
    /// when credentials are absent.
    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentInit, GatewayError>;

    /// Validate and finalize a payment outcome from a callback payload.
    async fn confirm_payment(
        &self,
        payload: &CallbackPayload,
    ) -> Result<PaymentConfirmation, GatewayError>;

    /// Best-effort cancellation of an in-flight payment.
    async fn cancel(&self, external_reference: &str) -> Result<(), GatewayError>;
}

/// Maps payment methods to their gateway adapters. All variants are
/// always registered; unconfigured external adapters fail closed at
/// `create_payment` time.
pub struct GatewayRegistry {
    redirect: Arc<dyn PaymentGateway>,
    wallet: Arc<dyn PaymentGateway>,
    pickup: Arc<dyn PaymentGateway>,
    zero_total: Arc<dyn PaymentGateway>,
}

impl GatewayRegistry {
    /// Registry over explicit external adapters. The offline variants
    /// carry no credentials and are always the built-in ones.
    pub fn new(redirect: Arc<dyn PaymentGateway>, wallet: Arc<dyn PaymentGateway>) -> Self {
        Self {
            redirect,
            wallet,
            pickup: Arc::new(OfflineGateway::pay_on_pickup()),
            zero_total: Arc::new(OfflineGateway::zero_total()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Arc::new(RedirectGateway::new(config.redirect_gateway.clone())),
            Arc::new(WalletGateway::new(config.wallet_gateway.clone())),
        )
    }

    pub fn for_method(&self, method: &PaymentMethod) -> Arc<dyn PaymentGateway> {
        match method {
            PaymentMethod::Card => self.redirect.clone(),
            PaymentMethod::Wallet { .. } => self.wallet.clone(),
            PaymentMethod::PayOnPickup => self.pickup.clone(),
        }
    }

    /// No-op variant used when the priced total is zero.
    pub fn zero_total(&self) -> Arc<dyn PaymentGateway> {
        self.zero_total.clone()
    }
}

/// Compute the hex HMAC-SHA256 signature a gateway is expected to send
/// for a callback. Exposed for building fixtures in tests.
pub fn sign_callback(secret: &str, timestamp: i64, reference: &str, status: &str) -> String {
    let message = format!("{}.{}.{}", timestamp, reference, status);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a callback payload against the shared secret and timestamp
/// tolerance window.
pub(crate) fn verify_callback(
    secret: &str,
    payload: &CallbackPayload,
    tolerance_secs: i64,
) -> Result<(), GatewayError> {
    let now = Utc::now().timestamp();
    if (now - payload.timestamp).abs() > tolerance_secs {
        return Err(GatewayError::InvalidCallback(
            "timestamp outside tolerance window".to_string(),
        ));
    }

    let signature = hex::decode(&payload.signature)
        .map_err(|_| GatewayError::InvalidCallback("signature is not hex".to_string()))?;

    let message = format!("{}.{}.{}", payload.timestamp, payload.reference, payload.status);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::InvalidCallback("invalid secret".to_string()))?;
    mac.update(message.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| GatewayError::InvalidCallback("signature mismatch".to_string()))
}

/// Map a gateway-reported status string onto the outcome taxonomy.
pub(crate) fn parse_outcome(status: &str) -> PaymentOutcome {
    match status {
        "succeeded" | "paid" | "completed" => PaymentOutcome::Succeeded,
        "cancelled" | "canceled" => PaymentOutcome::Cancelled,
        "pending" => PaymentOutcome::Pending,
        _ => PaymentOutcome::Failed,
    }
}
