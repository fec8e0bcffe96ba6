use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Billing, BillingError, BillingStatus};
use crate::store::BillingStore;

/// Read side of the ledger. Totals are always derived from the payments; the
/// stored status is brought in line with them when a billing is read.
pub struct BillingLedgerService {
    store: Arc<dyn BillingStore>,
}

impl BillingLedgerService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn BillingStore> {
        Arc::clone(&self.store)
    }

    /// Loads the billing as stored, without settling it.
    pub async fn find_billing_for_appointment(&self, appointment_id: Uuid) -> Result<Billing, BillingError> {
        debug!("Loading billing for appointment {}", appointment_id);

        self.store
            .find_by_appointment(appointment_id)
            .await?
            .ok_or(BillingError::NotFound)
    }

    pub async fn get_billing_for_appointment(&self, appointment_id: Uuid) -> Result<Billing, BillingError> {
        let mut billing = self.find_billing_for_appointment(appointment_id).await?;
        self.settle(&mut billing).await?;
        Ok(billing)
    }

    /// Applies `mark_as_paid` once a reconciled payment has landed.
    pub async fn settle(&self, billing: &mut Billing) -> Result<(), BillingError> {
        if !billing.needs_settlement() {
            return Ok(());
        }

        billing.mark_as_paid();
        self.store.update_billing_status(billing.id, billing.status).await?;

        info!("Billing {} settled with total {}", billing.id, billing.total_cost());
        Ok(())
    }

    /// Called after a refund went through. Marks the billing refunded once
    /// nothing paid remains on it.
    pub async fn reflect_refund(&self, appointment_id: Uuid) -> Result<Billing, BillingError> {
        let mut billing = self.find_billing_for_appointment(appointment_id).await?;

        if billing.total_cost() == Decimal::ZERO && billing.status != BillingStatus::Refunded {
            billing.status = BillingStatus::Refunded;
            self.store.update_billing_status(billing.id, billing.status).await?;
            info!("Billing {} marked refunded", billing.id);
        } else if billing.total_cost() > Decimal::ZERO {
            warn!(
                "Billing {} still holds {} after refund",
                billing.id,
                billing.total_cost()
            );
        }

        Ok(billing)
    }
}
