use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::config::RedirectGatewayConfig;

use super::{
    parse_outcome, verify_callback, CallbackPayload, GatewayError, GatewayKind,
    PaymentConfirmation, PaymentGateway, PaymentInit, PaymentRequest, CALLBACK_TOLERANCE_SECS,
};

/// Adapter for the hosted-page card processor. The shopper's browser is
/// redirected to a gateway-hosted payment page; the outcome comes back
/// as a signed callback.
pub struct RedirectGateway {
    config: Option<RedirectGatewayConfig>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    reference: &'a str,
    amount: String,
    currency: &'a str,
    return_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    redirect_url: String,
}

impl RedirectGateway {
    pub fn new(config: Option<RedirectGatewayConfig>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn config(&self) -> Result<&RedirectGatewayConfig, GatewayError> {
        self.config
            .as_ref()
            .ok_or_else(|| GatewayError::ConfigurationMissing("redirect card gateway".to_string()))
    }
}

#[async_trait]
impl PaymentGateway for RedirectGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::RedirectCard
    }

    #[instrument(skip(self, request), fields(reference = %request.reference))]
    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentInit, GatewayError> {
        let config = self.config()?;

        let body = CreateSessionRequest {
            reference: &request.reference,
            // Major units as a decimal string, e.g. "65.00".
            amount: request.amount.to_string(),
            currency: &request.currency,
            return_url: &config.return_url,
        };

        let response = self
            .client
            .post(format!("{}/sessions", config.endpoint))
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Card gateway unreachable");
                GatewayError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Card gateway refused the session");
            return Err(GatewayError::Rejected(format!(
                "gateway returned {}",
                status
            )));
        }

        let session: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("malformed gateway response: {}", e)))?;

        info!("Card payment session created");
        Ok(PaymentInit::Redirect {
            redirect_url: session.redirect_url,
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

    async fn cancel(&self, external_reference: &str) -> Result<(), GatewayError> {
        let config = self.config()?;

        self.client
            .post(format!(
                "{}/sessions/{}/cancel",
                config.endpoint, external_reference
            ))
            .bearer_auth(&config.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(())
    }
}
