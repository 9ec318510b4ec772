use async_trait::async_trait;
use tracing::{info, instrument};

use super::{
    CallbackPayload, GatewayError, GatewayKind, PaymentConfirmation, PaymentGateway, PaymentInit,
    PaymentOutcome, PaymentRequest,
};

/// Adapter for payments that settle without an external processor:
/// pay-on-pickup (cash or card at the counter) and zero-amount orders
/// where promotions covered the whole total.
pub struct OfflineGateway {
    variant: Variant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    PayOnPickup,
    ZeroTotal,
}

impl OfflineGateway {
    pub fn pay_on_pickup() -> Self {
        Self {
            variant: Variant::PayOnPickup,
        }
    }

    pub fn zero_total() -> Self {
        Self {
            variant: Variant::ZeroTotal,
        }
    }
}

#[async_trait]
impl PaymentGateway for OfflineGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Offline
    }

    #[instrument(skip(self, request), fields(reference = %request.reference))]
    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentInit, GatewayError> {
        match self.variant {
            Variant::ZeroTotal if !request.amount.is_zero() => Err(GatewayError::Rejected(
                format!("non-zero amount {} for a zero-total payment", request.amount),
            )),
            _ => {
                info!(amount = %request.amount, "Offline payment accepted");
                Ok(PaymentInit::Immediate {
                    reference: request.reference.clone(),
                })
            }
        }
    }

    async fn confirm_payment(
        &self,
        payload: &CallbackPayload,
    ) -> Result<PaymentConfirmation, GatewayError> {
        // No external processor is involved, so there is nothing to
        // verify; the reference is echoed back as settled.
        Ok(PaymentConfirmation {
            external_reference: payload.reference.clone(),
            outcome: PaymentOutcome::Succeeded,
        })
    }

    async fn cancel(&self, _external_reference: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}
