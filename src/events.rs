use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is
    /// closed. Used after commits where the write must not be rolled
    /// back because of a telemetry failure.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping event");
        }
    }
}

// The events that can occur in the storefront.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartItemAdded { cart_id: Uuid, item_id: Uuid },
    CartItemUpdated { cart_id: Uuid, item_id: Uuid },
    CartItemRemoved { cart_id: Uuid, item_id: Uuid },
    CartCleared(Uuid),
    CartsMerged { source_cart_id: Uuid, target_cart_id: Uuid },

    // Checkout events
    CheckoutStarted { cart_id: Uuid, session_id: Uuid },
    CheckoutCompleted { session_id: Uuid, order_id: Uuid },
    CheckoutFailed { session_id: Uuid, reason: String },
    CheckoutAbandoned { session_id: Uuid },

    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderExpired(Uuid),

    // Payment events
    PaymentInitiated { order_id: Uuid, gateway: String },
    PaymentCaptured(Uuid),
    PaymentFailed(Uuid),

    // Promotion events
    CouponRedeemed { code: String, order_id: Uuid },
    GiftCardRedeemed {
        code: String,
        order_id: Uuid,
        amount: Decimal,
    },
}

/// Process incoming events. Today this is a structured-logging sink;
/// downstream consumers (webhooks, analytics) attach here.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentFailed(order_id) => {
                warn!(order_id = %order_id, "Payment failed");
            }
            Event::CheckoutFailed { session_id, reason } => {
                warn!(session_id = %session_id, reason = %reason, "Checkout failed");
            }
            Event::OrderExpired(order_id) => {
                warn!(order_id = %order_id, "Stale pending order expired");
            }
            other => {
                info!(event = ?other, "Event");
            }
        }
    }

    warn!("Event processing loop has ended");
}
