use std::sync::Arc;

use tracing::{debug, info, warn};

use billing_cell::models::PaymentStatus;
use billing_cell::store::BillingStore;
use shared_utils::clock::Clock;

use crate::models::{GatewayEventKind, PaymentError, ReconcileOutcome};
use crate::services::gateway::PaymentGateway;

/// Applies processor notifications to local payments. Every transition is a
/// compare-and-set out of `Pending`, so redeliveries and concurrent
/// deliveries of the same event change nothing the second time.
pub struct PaymentReconciler {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    webhook_secret: String,
}

impl PaymentReconciler {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            store,
            clock,
            webhook_secret: webhook_secret.into(),
        }
    }

    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<ReconcileOutcome, PaymentError> {
        if payload.is_empty() {
            return Err(PaymentError::ValidationError("Webhook payload is empty".to_string()));
        }
        if signature_header.trim().is_empty() {
            return Err(PaymentError::ValidationError("Missing Stripe-Signature header".to_string()));
        }
        if self.webhook_secret.is_empty() {
            return Err(PaymentError::WebhookSecretMissing);
        }

        let event = self
            .gateway
            .verify_and_parse_event(payload, signature_header, &self.webhook_secret)?;
        debug!("Verified webhook event {}", event.id);

        match event.kind {
            GatewayEventKind::PaymentIntentSucceeded { payment_intent_id } => {
                self.settle(&payment_intent_id).await
            }
            GatewayEventKind::ChargeSucceeded {
                charge_id,
                payment_intent_id: Some(payment_intent_id),
            } => {
                debug!("Charge {} settles intent {}", charge_id, payment_intent_id);
                self.settle(&payment_intent_id).await
            }
            GatewayEventKind::ChargeSucceeded {
                charge_id,
                payment_intent_id: None,
            } => {
                warn!("Charge {} has no payment intent, ignoring", charge_id);
                Ok(ReconcileOutcome::Ignored {
                    event_type: "charge.succeeded".to_string(),
                })
            }
            GatewayEventKind::Unhandled { event_type } => {
                debug!("Ignoring webhook event type {}", event_type);
                Ok(ReconcileOutcome::Ignored { event_type })
            }
        }
    }

    /// Moves the payment for `payment_intent_id` from `Pending` to `Success`.
    async fn settle(&self, payment_intent_id: &str) -> Result<ReconcileOutcome, PaymentError> {
        let Some(payment) = self.store.find_payment_by_intent(payment_intent_id).await? else {
            warn!("No payment recorded for intent {}", payment_intent_id);
            return Ok(ReconcileOutcome::Unmatched {
                payment_intent_id: payment_intent_id.to_string(),
            });
        };

        if !payment.status.is_pending() {
            info!(
                "Payment {} already {}, skipping redelivered event",
                payment.id, payment.status
            );
            return Ok(ReconcileOutcome::Duplicate {
                payment_intent_id: payment_intent_id.to_string(),
                status: payment.status,
            });
        }

        let now = self.clock.now();
        match self
            .store
            .transition_payment(payment_intent_id, PaymentStatus::Pending, PaymentStatus::Success, now)
            .await?
        {
            Some(updated) => {
                info!("Payment {} reconciled to {}", updated.id, updated.status);
                Ok(ReconcileOutcome::Applied {
                    payment_intent_id: payment_intent_id.to_string(),
                    status: updated.status,
                })
            }
            None => {
                // Another delivery won the compare-and-set.
                let current = self
                    .store
                    .find_payment_by_intent(payment_intent_id)
                    .await?
                    .map(|p| p.status)
                    .unwrap_or(PaymentStatus::Success);
                info!("Payment for intent {} was settled concurrently", payment_intent_id);
                Ok(ReconcileOutcome::Duplicate {
                    payment_intent_id: payment_intent_id.to_string(),
                    status: current,
                })
            }
        }
    }
}
