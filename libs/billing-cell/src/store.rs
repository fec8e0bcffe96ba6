// libs/billing-cell/src/store.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use shared_database::{StoreError, SupabaseClient};

use crate::models::{Billing, BillingStatus, Payment, PaymentStatus};

/// Persistence seam for billing records and their payments.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Billing for an appointment, with its payments attached.
    async fn find_by_appointment(&self, appointment_id: Uuid) -> Result<Option<Billing>, StoreError>;

    async fn insert_payment(&self, payment: &Payment) -> Result<Payment, StoreError>;

    async fn find_payment_by_intent(&self, payment_intent_id: &str) -> Result<Option<Payment>, StoreError>;

    /// Atomically moves the payment from `from` to `to`. Returns `None` when
    /// the row was not in `from` (or does not exist) and nothing changed.
    async fn transition_payment(
        &self,
        payment_intent_id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Payment>, StoreError>;

    async fn update_billing_status(&self, billing_id: Uuid, status: BillingStatus) -> Result<(), StoreError>;
}

// ==============================================================================
// SUPABASE
// ==============================================================================

pub struct SupabaseBillingStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseBillingStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

#[async_trait]
impl BillingStore for SupabaseBillingStore {
    async fn find_by_appointment(&self, appointment_id: Uuid) -> Result<Option<Billing>, StoreError> {
        debug!("Fetching billing for appointment {}", appointment_id);

        let path = format!(
            "/rest/v1/billings?appointment_id=eq.{}&select=*,payments(*)",
            appointment_id
        );
        let rows: Vec<Billing> = self.supabase
            .request(Method::GET, &path, Some(self.supabase.service_token()), None)
            .await?;

        Ok(rows.into_iter().next())
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<Payment, StoreError> {
        debug!("Inserting payment for intent {}", payment.payment_intent_id);

        let body = serde_json::to_value(payment)?;
        let rows: Vec<Payment> = self.supabase
            .request_returning(Method::POST, "/rest/v1/payments", Some(self.supabase.service_token()), body)
            .await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Unavailable("payment insert returned no rows".to_string()))
    }

    async fn find_payment_by_intent(&self, payment_intent_id: &str) -> Result<Option<Payment>, StoreError> {
        let path = format!(
            "/rest/v1/payments?payment_intent_id=eq.{}",
            urlencoding::encode(payment_intent_id)
        );
        let rows: Vec<Payment> = self.supabase
            .request(Method::GET, &path, Some(self.supabase.service_token()), None)
            .await?;

        Ok(rows.into_iter().next())
    }

    async fn transition_payment(
        &self,
        payment_intent_id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Payment>, StoreError> {
        debug!("Transitioning payment {} from {} to {}", payment_intent_id, from, to);

        // The status filter makes the PATCH a compare-and-set on the row.
        let path = format!(
            "/rest/v1/payments?payment_intent_id=eq.{}&status=eq.{}",
            urlencoding::encode(payment_intent_id),
            from
        );
        let body = if to == PaymentStatus::Success {
            json!({ "status": to, "payment_date": at })
        } else {
            json!({ "status": to })
        };

        let rows: Vec<Payment> = self.supabase
            .request_returning(Method::PATCH, &path, Some(self.supabase.service_token()), body)
            .await?;

        Ok(rows.into_iter().next())
    }

    async fn update_billing_status(&self, billing_id: Uuid, status: BillingStatus) -> Result<(), StoreError> {
        let path = format!("/rest/v1/billings?id=eq.{}", billing_id);
        let rows: Vec<serde_json::Value> = self.supabase
            .request_returning(
                Method::PATCH,
                &path,
                Some(self.supabase.service_token()),
                json!({ "status": status }),
            )
            .await?;

        if rows.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

// ==============================================================================
// IN-MEMORY
// ==============================================================================

#[derive(Default)]
struct Ledger {
    billings: HashMap<Uuid, Billing>,
    payments: Vec<Payment>,
}

/// Process-local store with the same atomicity guarantees as the database:
/// every operation runs under one lock.
#[derive(Default)]
pub struct InMemoryBillingStore {
    ledger: RwLock<Ledger>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a billing row; fails when the appointment already has one.
    pub async fn insert_billing(&self, billing: Billing) -> Result<(), StoreError> {
        let mut ledger = self.ledger.write().await;
        if ledger.billings.values().any(|b| b.appointment_id == billing.appointment_id) {
            return Err(StoreError::Duplicate(format!(
                "billing for appointment {}",
                billing.appointment_id
            )));
        }

        let mut billing = billing;
        billing.payments.clear();
        ledger.billings.insert(billing.id, billing);
        Ok(())
    }

    pub async fn payment_count(&self) -> usize {
        self.ledger.read().await.payments.len()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn find_by_appointment(&self, appointment_id: Uuid) -> Result<Option<Billing>, StoreError> {
        let ledger = self.ledger.read().await;

        Ok(ledger
            .billings
            .values()
            .find(|billing| billing.appointment_id == appointment_id)
            .map(|billing| {
                let mut billing = billing.clone();
                billing.payments = ledger
                    .payments
                    .iter()
                    .filter(|payment| payment.billing_id == billing.id)
                    .cloned()
                    .collect();
                billing
            }))
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<Payment, StoreError> {
        let mut ledger = self.ledger.write().await;

        if !ledger.billings.contains_key(&payment.billing_id) {
            return Err(StoreError::NotFound);
        }
        if ledger.payments.iter().any(|p| p.payment_intent_id == payment.payment_intent_id) {
            return Err(StoreError::Duplicate(payment.payment_intent_id.clone()));
        }

        ledger.payments.push(payment.clone());
        Ok(payment.clone())
    }

    async fn find_payment_by_intent(&self, payment_intent_id: &str) -> Result<Option<Payment>, StoreError> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .payments
            .iter()
            .find(|payment| payment.payment_intent_id == payment_intent_id)
            .cloned())
    }

    async fn transition_payment(
        &self,
        payment_intent_id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Payment>, StoreError> {
        let mut ledger = self.ledger.write().await;

        let Some(payment) = ledger
            .payments
            .iter_mut()
            .find(|payment| payment.payment_intent_id == payment_intent_id && payment.status == from)
        else {
            return Ok(None);
        };

        payment.status = to;
        if to == PaymentStatus::Success {
            payment.payment_date = Some(at);
        }
        Ok(Some(payment.clone()))
    }

    async fn update_billing_status(&self, billing_id: Uuid, status: BillingStatus) -> Result<(), StoreError> {
        let mut ledger = self.ledger.write().await;
        let billing = ledger.billings.get_mut(&billing_id).ok_or(StoreError::NotFound)?;
        billing.status = status;
        Ok(())
    }
}
