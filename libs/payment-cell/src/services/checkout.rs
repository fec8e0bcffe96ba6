use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use billing_cell::models::Payment;
use billing_cell::store::BillingStore;
use shared_models::auth::User;
use shared_utils::clock::Clock;

use crate::models::{CheckoutResponse, PayForSessionRequest, PaymentError};
use crate::services::gateway::{to_minor_units, PaymentGateway};

/// Starts a card payment for an appointment's billing: one remote intent,
/// one local `Pending` payment row tied to it.
pub struct CheckoutService {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
}

impl CheckoutService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { gateway, store, clock }
    }

    pub async fn pay_for_session(
        &self,
        request: PayForSessionRequest,
        caller: &User,
    ) -> Result<CheckoutResponse, PaymentError> {
        debug!("Checkout requested for appointment {}", request.appointment_id);

        let currency = validate_request(&request)?;

        let billing = self
            .store
            .find_by_appointment(request.appointment_id)
            .await?
            .ok_or(PaymentError::BillingNotFound)?;

        if !caller.is(billing.patient_id) && !caller.is_admin() {
            return Err(PaymentError::Forbidden);
        }

        if billing.is_paid() || billing.needs_settlement() {
            return Err(PaymentError::AlreadyPaid);
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("appointment_id".to_string(), request.appointment_id.to_string());
        metadata.insert("billing_id".to_string(), billing.id.to_string());
        metadata.insert("user_id".to_string(), caller.id.clone());

        let intent = self
            .gateway
            .create_payment_intent(request.amount, &currency, metadata)
            .await?;

        let payment = Payment::pending(
            billing.id,
            request.amount,
            &currency,
            request.payment_method,
            &intent.id,
            self.clock.now(),
        );

        let saved = match self.store.insert_payment(&payment).await {
            Ok(saved) => saved,
            Err(store_err) => {
                error!("Failed to record payment for intent {}: {}", intent.id, store_err);
                if let Err(cancel_err) = self.gateway.cancel_payment_intent(&intent.id).await {
                    warn!("Payment intent {} left open after failed insert: {}", intent.id, cancel_err);
                }
                return Err(store_err.into());
            }
        };

        info!(
            "Payment {} pending for billing {} via intent {}",
            saved.id, billing.id, saved.payment_intent_id
        );

        Ok(CheckoutResponse {
            payment_id: saved.id,
            billing_id: saved.billing_id,
            payment_intent_id: saved.payment_intent_id,
            client_secret: intent.client_secret,
            amount: saved.amount,
            currency: saved.currency,
            status: saved.status,
        })
    }
}

/// Returns the normalized (lowercase) currency code.
fn validate_request(request: &PayForSessionRequest) -> Result<String, PaymentError> {
    if request.amount <= Decimal::ZERO {
        return Err(PaymentError::ValidationError("Amount must be greater than zero".to_string()));
    }

    if to_minor_units(request.amount)? < 1 {
        return Err(PaymentError::ValidationError(
            "Amount is smaller than the currency's minor unit".to_string(),
        ));
    }

    let currency = request.currency.trim();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(PaymentError::ValidationError(format!(
            "Invalid currency code: {}",
            request.currency
        )));
    }

    Ok(currency.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use mockall::predicate::eq;
    use uuid::Uuid;

    use billing_cell::models::{Billing, PaymentMethod, PaymentStatus};
    use billing_cell::store::InMemoryBillingStore;
    use shared_utils::test_utils::{FixedClock, TestUser};

    use crate::models::PaymentIntent;
    use crate::services::gateway::MockPaymentGateway;

    async fn seeded(patient: &TestUser) -> (Arc<InMemoryBillingStore>, Billing) {
        let store = Arc::new(InMemoryBillingStore::new());
        let billing = Billing::new_pending(Uuid::new_v4(), patient.uuid(), Utc::now());
        store.insert_billing(billing.clone()).await.unwrap();
        (store, billing)
    }

    fn request(appointment_id: Uuid, amount: Decimal, currency: &str) -> PayForSessionRequest {
        PayForSessionRequest {
            appointment_id,
            amount,
            currency: currency.to_string(),
            payment_method: PaymentMethod::Card,
        }
    }

    fn service(gateway: MockPaymentGateway, store: Arc<InMemoryBillingStore>) -> CheckoutService {
        CheckoutService::new(
            Arc::new(gateway),
            store,
            Arc::new(FixedClock::ymd_hm(2025, 6, 1, 9, 0)),
        )
    }

    #[tokio::test]
    async fn creates_intent_and_pending_row() {
        let patient = TestUser::patient("patient@example.com");
        let (store, billing) = seeded(&patient).await;

        let mut gateway = MockPaymentGateway::new();
        let billing_id = billing.id.to_string();
        gateway
            .expect_create_payment_intent()
            .withf(move |amount, currency, metadata| {
                *amount == Decimal::new(150, 0)
                    && currency == "usd"
                    && metadata.get("billing_id") == Some(&billing_id)
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(PaymentIntent {
                    id: "pi_123".to_string(),
                    client_secret: "pi_123_secret".to_string(),
                })
            });
        gateway.expect_cancel_payment_intent().never();

        let response = service(gateway, store.clone())
            .pay_for_session(request(billing.appointment_id, Decimal::new(150, 0), "USD"), &patient.to_user())
            .await
            .unwrap();

        assert_eq!(response.status, PaymentStatus::Pending);
        assert_eq!(response.client_secret, "pi_123_secret");
        assert_eq!(response.currency, "usd");

        let stored = store.find_payment_by_intent("pi_123").await.unwrap().unwrap();
        assert_eq!(stored.billing_id, billing.id);
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_gateway() {
        let patient = TestUser::patient("patient@example.com");
        let (store, billing) = seeded(&patient).await;

        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_payment_intent().never();
        let service = service(gateway, store);
        let user = patient.to_user();

        for (amount, currency) in [
            (Decimal::ZERO, "usd"),
            (Decimal::new(-5, 0), "usd"),
            (Decimal::new(1, 3), "usd"),
            (Decimal::new(150, 0), "us"),
            (Decimal::new(150, 0), "u5d"),
        ] {
            assert_matches!(
                service.pay_for_session(request(billing.appointment_id, amount, currency), &user).await,
                Err(PaymentError::ValidationError(_))
            );
        }

        assert_matches!(
            service.pay_for_session(request(Uuid::new_v4(), Decimal::new(150, 0), "usd"), &user).await,
            Err(PaymentError::BillingNotFound)
        );

        let stranger = TestUser::patient("stranger@example.com").to_user();
        assert_matches!(
            service.pay_for_session(request(billing.appointment_id, Decimal::new(150, 0), "usd"), &stranger).await,
            Err(PaymentError::Forbidden)
        );
    }

    #[tokio::test]
    async fn settled_billing_is_already_paid() {
        let patient = TestUser::patient("patient@example.com");
        let (store, billing) = seeded(&patient).await;

        let payment = Payment::pending(billing.id, Decimal::new(150, 0), "usd", PaymentMethod::Card, "pi_old", Utc::now());
        store.insert_payment(&payment).await.unwrap();
        store
            .transition_payment("pi_old", PaymentStatus::Pending, PaymentStatus::Success, Utc::now())
            .await
            .unwrap();

        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_payment_intent().never();

        assert_matches!(
            service(gateway, store)
                .pay_for_session(request(billing.appointment_id, Decimal::new(150, 0), "usd"), &patient.to_user())
                .await,
            Err(PaymentError::AlreadyPaid)
        );
    }

    #[tokio::test]
    async fn duplicate_intent_cancels_remote_intent() {
        let patient = TestUser::patient("patient@example.com");
        let (store, billing) = seeded(&patient).await;

        let existing = Payment::pending(billing.id, Decimal::new(10, 0), "usd", PaymentMethod::Card, "pi_dup", Utc::now());
        store.insert_payment(&existing).await.unwrap();

        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_payment_intent().returning(|_, _, _| {
            Ok(PaymentIntent {
                id: "pi_dup".to_string(),
                client_secret: "secret".to_string(),
            })
        });
        gateway
            .expect_cancel_payment_intent()
            .with(eq("pi_dup"))
            .times(1)
            .returning(|_| Ok(()));

        let result = service(gateway, store.clone())
            .pay_for_session(request(billing.appointment_id, Decimal::new(150, 0), "usd"), &patient.to_user())
            .await;

        assert_matches!(result, Err(PaymentError::DatabaseError(_)));
        assert_eq!(store.payment_count().await, 1);
    }

    #[tokio::test]
    async fn gateway_failure_leaves_no_row() {
        let patient = TestUser::patient("patient@example.com");
        let (store, billing) = seeded(&patient).await;

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_create_payment_intent()
            .returning(|_, _, _| Err(PaymentError::GatewayError("card_declined".to_string())));

        let result = service(gateway, store.clone())
            .pay_for_session(request(billing.appointment_id, Decimal::new(150, 0), "usd"), &patient.to_user())
            .await;

        assert_matches!(result, Err(PaymentError::GatewayError(_)));
        assert_eq!(store.payment_count().await, 0);
    }
}
