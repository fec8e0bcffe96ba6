use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use billing_cell::models::PaymentStatus;
use billing_cell::services::ledger::BillingLedgerService;
use shared_utils::clock::Clock;

use crate::models::{PaymentError, RefundRequest, RefundResult};
use crate::services::gateway::{from_minor_units, PaymentGateway};

const REFUND_SUCCEEDED: &str = "succeeded";

pub struct RefundService {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<BillingLedgerService>,
    clock: Arc<dyn Clock>,
}

impl RefundService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, ledger: Arc<BillingLedgerService>, clock: Arc<dyn Clock>) -> Self {
        Self { gateway, ledger, clock }
    }

    /// Refunds the settled payment of an appointment. The local payment only
    /// moves to `Refunded` once the processor reports the refund succeeded.
    pub async fn request_refund(&self, request: RefundRequest) -> Result<RefundResult, PaymentError> {
        debug!("Refund requested for appointment {}", request.appointment_id);

        let billing = self.ledger.get_billing_for_appointment(request.appointment_id).await?;
        let payment = billing.settled_payment().cloned().ok_or(PaymentError::NothingToRefund)?;

        let refund = self
            .gateway
            .request_refund(&payment.payment_intent_id, request.reason.clone())
            .await?;

        if refund.status == REFUND_SUCCEEDED {
            let moved = self
                .ledger
                .store()
                .transition_payment(
                    &payment.payment_intent_id,
                    PaymentStatus::Success,
                    PaymentStatus::Refunded,
                    self.clock.now(),
                )
                .await?;

            if moved.is_none() {
                warn!("Payment {} was no longer settled when its refund completed", payment.id);
            }

            self.ledger.reflect_refund(request.appointment_id).await?;
            info!("Payment {} refunded via {}", payment.id, refund.id);
        } else {
            info!("Refund {} for payment {} is {}", refund.id, payment.id, refund.status);
        }

        Ok(RefundResult {
            refund_id: refund.id,
            payment_intent_id: payment.payment_intent_id,
            appointment_id: request.appointment_id,
            amount_refunded: from_minor_units(refund.amount),
            currency: refund.currency,
            status: refund.status,
            reason: request.reason,
            created: DateTime::<Utc>::from_timestamp(refund.created, 0).unwrap_or_else(|| self.clock.now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use mockall::predicate::{always, eq};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use billing_cell::models::{Billing, BillingStatus, Payment, PaymentMethod};
    use billing_cell::store::{BillingStore, InMemoryBillingStore};
    use shared_utils::test_utils::FixedClock;

    use crate::models::GatewayRefund;
    use crate::services::gateway::MockPaymentGateway;

    async fn paid_billing(store: &InMemoryBillingStore) -> Billing {
        let billing = Billing::new_pending(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        store.insert_billing(billing.clone()).await.unwrap();

        let payment = Payment::pending(billing.id, Decimal::new(150, 0), "usd", PaymentMethod::Card, "pi_paid", Utc::now());
        store.insert_payment(&payment).await.unwrap();
        store
            .transition_payment("pi_paid", PaymentStatus::Pending, PaymentStatus::Success, Utc::now())
            .await
            .unwrap();
        billing
    }

    fn refund(status: &str) -> GatewayRefund {
        GatewayRefund {
            id: "re_1".to_string(),
            amount: 15_000,
            currency: "usd".to_string(),
            status: status.to_string(),
            created: 1_748_768_400,
        }
    }

    fn service(gateway: MockPaymentGateway, store: Arc<InMemoryBillingStore>) -> (RefundService, Arc<BillingLedgerService>) {
        let ledger = Arc::new(BillingLedgerService::new(store));
        let service = RefundService::new(
            Arc::new(gateway),
            Arc::clone(&ledger),
            Arc::new(FixedClock::ymd_hm(2025, 6, 1, 9, 0)),
        );
        (service, ledger)
    }

    #[tokio::test]
    async fn succeeded_refund_marks_payment_and_billing() {
        let store = Arc::new(InMemoryBillingStore::new());
        let billing = paid_billing(&store).await;

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_request_refund()
            .with(eq("pi_paid"), always())
            .times(1)
            .returning(|_, _| Ok(refund("succeeded")));

        let (service, ledger) = service(gateway, store.clone());
        let result = service
            .request_refund(RefundRequest {
                appointment_id: billing.appointment_id,
                reason: Some("Doctor unavailable".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(result.amount_refunded, Decimal::new(150, 0));
        assert_eq!(result.payment_intent_id, "pi_paid");
        assert_eq!(result.reason.as_deref(), Some("Doctor unavailable"));

        let payment = store.find_payment_by_intent("pi_paid").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);

        let billing = ledger.get_billing_for_appointment(billing.appointment_id).await.unwrap();
        assert_eq!(billing.status, BillingStatus::Refunded);
        assert_eq!(billing.total_cost(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn pending_refund_leaves_payment_settled() {
        let store = Arc::new(InMemoryBillingStore::new());
        let billing = paid_billing(&store).await;

        let mut gateway = MockPaymentGateway::new();
        gateway.expect_request_refund().returning(|_, _| Ok(refund("pending")));

        let (service, _) = service(gateway, store.clone());
        let result = service
            .request_refund(RefundRequest { appointment_id: billing.appointment_id, reason: None })
            .await
            .unwrap();

        assert_eq!(result.status, "pending");
        let payment = store.find_payment_by_intent("pi_paid").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Success);
    }

    #[tokio::test]
    async fn unpaid_billing_has_nothing_to_refund() {
        let store = Arc::new(InMemoryBillingStore::new());
        let billing = Billing::new_pending(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        store.insert_billing(billing.clone()).await.unwrap();

        let mut gateway = MockPaymentGateway::new();
        gateway.expect_request_refund().never();

        let (service, _) = service(gateway, store);
        assert_matches!(
            service
                .request_refund(RefundRequest { appointment_id: billing.appointment_id, reason: None })
                .await,
            Err(PaymentError::NothingToRefund)
        );
        assert_matches!(
            service
                .request_refund(RefundRequest { appointment_id: Uuid::new_v4(), reason: None })
                .await,
            Err(PaymentError::BillingNotFound)
        );
    }
}
