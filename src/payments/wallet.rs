use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::config::WalletGatewayConfig;

use super::{
    parse_outcome, verify_callback, CallbackPayload, GatewayError, GatewayKind,
    PaymentConfirmation, PaymentGateway, PaymentInit, PaymentRequest, CALLBACK_TOLERANCE_SECS,
};

/// Adapter for the phone-wallet processor. Charges are pushed to the
/// shopper's phone; the processor settles in the regional currency and
/// expects amounts in minor units (cents).
pub struct WalletGateway {
    config: Option<WalletGatewayConfig>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    reference: &'a str,
    phone: &'a str,
    /// Minor units of the regional currency.
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    transaction_id: String,
}

impl WalletGateway {
    pub fn new(config: Option<WalletGatewayConfig>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn config(&self) -> Result<&WalletGatewayConfig, GatewayError> {
        self.config
            .as_ref()
            .ok_or_else(|| GatewayError::ConfigurationMissing("phone wallet gateway".to_string()))
    }

    /// Convert a major-unit order amount into minor units of the
    /// regional currency, rounding at the cent.
    fn to_minor_units(amount: Decimal, exchange_rate: Decimal) -> Result<i64, GatewayError> {
        let minor = (amount * exchange_rate * dec!(100)).round();
        minor
            .to_i64()
            .ok_or_else(|| GatewayError::Rejected(format!("amount {} out of range", amount)))
    }
}

#[async_trait]
impl PaymentGateway for WalletGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Wallet
    }

    #[instrument(skip(self, request), fields(reference = %request.reference))]
    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentInit, GatewayError> {
        let config = self.config()?;

        let phone = request.phone.as_deref().ok_or_else(|| {
            GatewayError::Rejected("phone number required for wallet payments".to_string())
        })?;

        let amount = Self::to_minor_units(request.amount, config.exchange_rate)?;

        let response = self
            .client
            .post(format!("{}/charges", config.endpoint))
            .bearer_auth(&config.api_key)
            .json(&ChargeRequest {
                reference: &request.reference,
                phone,
                amount,
            })
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Wallet gateway unreachable");
                GatewayError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Rejected(format!(
                "gateway returned {}",
                status
            )));
        }

        let charge: ChargeResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("malformed gateway response: {}", e)))?;

        info!(transaction_id = %charge.transaction_id, "Wallet charge initiated");
        // Settlement is asynchronous: the shopper approves the prompt on
        // their phone and the processor posts a signed callback.
        Ok(PaymentInit::Pending {
            reference: request.reference.clone(),
        })
    }

    #[instrument(skip(self, payload), fields(reference = %payload.reference))]
    async fn confirm_payment(
        &self,
        payload: &CallbackPayload,
    ) -> Result<PaymentConfirmation, GatewayError> {
        let config = self.config()?;
        verify_callback(&config.callback_secret, payload, CALLBACK_TOLERANCE_SECS)?;

        Ok(PaymentConfirmation {
            external_reference: payload.reference.clone(),
            outcome: parse_outcome(&payload.status),
        })
    }

    async fn cancel(&self, _external_reference: &str) -> Result<(), GatewayError> {
        // The wallet processor offers no cancellation API; prompts
        // expire on their own.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use uuid::Uuid;

    #[test]
    fn minor_unit_conversion_rounds_at_the_cent() {
        // 65.00 at rate 129.53 -> 8419.45 -> 841945 cents
        assert_eq!(
            WalletGateway::to_minor_units(dec!(65.00), dec!(129.53)).unwrap(),
            841945
        );
        // `round()` is banker's rounding: 12.5 cents goes to 12.
        assert_eq!(WalletGateway::to_minor_units(dec!(0.125), dec!(1)).unwrap(), 12);
        assert_eq!(WalletGateway::to_minor_units(dec!(10), dec!(1)).unwrap(), 1000);
    }

    #[tokio::test]
    async fn unconfigured_gateway_fails_closed() {
        let gateway = WalletGateway::new(None);
        let request = PaymentRequest {
            order_id: Uuid::new_v4(),
            reference: "ORD-WALLET01".to_string(),
            amount: dec!(10.00),
            currency: "USD".to_string(),
            phone: Some("+254700000000".to_string()),
        };
        assert_matches!(
            gateway.create_payment(&request).await,
            Err(GatewayError::ConfigurationMissing(_))
        );
    }

    #[tokio::test]
    async fn missing_phone_is_rejected() {
        let gateway = WalletGateway::new(Some(WalletGatewayConfig {
            endpoint: "https://wallet.example.com".to_string(),
            api_key: "key".to_string(),
            callback_secret: "s3cret".to_string(),
            exchange_rate: dec!(129.53),
        }));
        let request = PaymentRequest {
            order_id: Uuid::new_v4(),
            reference: "ORD-WALLET01".to_string(),
            amount: dec!(10.00),
            currency: "USD".to_string(),
            phone: None,
        };
        assert_matches!(
            gateway.create_payment(&request).await,
            Err(GatewayError::Rejected(_))
        );
    }
}
