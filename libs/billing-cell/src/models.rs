// libs/billing-cell/src/models.rs
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use shared_database::StoreError;
use shared_models::error::AppError;

// ==============================================================================
// STATUS ENUMS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    #[serde(alias = "succeeded", alias = "paid")]
    Success,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Success => write!(f, "success"),
            PaymentStatus::Failed => write!(f, "failed"),
            PaymentStatus::Refunded => write!(f, "refunded"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Pending,
    #[serde(alias = "paid")]
    Success,
    Failed,
    Refunded,
}

impl fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingStatus::Pending => write!(f, "pending"),
            BillingStatus::Success => write!(f, "success"),
            BillingStatus::Failed => write!(f, "failed"),
            BillingStatus::Refunded => write!(f, "refunded"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[serde(alias = "credit_card", alias = "stripe", alias = "Card")]
    Card,
    #[serde(alias = "Cash")]
    Cash,
    #[serde(alias = "Insurance")]
    Insurance,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentMethod::Card => write!(f, "card"),
            PaymentMethod::Cash => write!(f, "cash"),
            PaymentMethod::Insurance => write!(f, "insurance"),
        }
    }
}

// ==============================================================================
// LEDGER ENTITIES
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub billing_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub payment_intent_id: String,
    pub payment_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    /// New row for a checkout that has just created a remote intent.
    pub fn pending(
        billing_id: Uuid,
        amount: Decimal,
        currency: &str,
        payment_method: PaymentMethod,
        payment_intent_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            billing_id,
            amount,
            currency: currency.to_lowercase(),
            payment_method,
            status: PaymentStatus::Pending,
            payment_intent_id: payment_intent_id.to_string(),
            payment_date: None,
            created_at: now,
        }
    }
}

/// Per-appointment invoice. `status` is a cached settlement flag; the amount
/// owed is always recomputed from `payments`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Billing {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub invoice_date: DateTime<Utc>,
    pub status: BillingStatus,
    #[serde(default)]
    pub payments: Vec<Payment>,
}

impl Billing {
    pub fn new_pending(appointment_id: Uuid, patient_id: Uuid, invoice_date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            appointment_id,
            patient_id,
            invoice_date,
            status: BillingStatus::Pending,
            payments: Vec::new(),
        }
    }

    /// Sum of every successful payment under this billing.
    pub fn total_cost(&self) -> Decimal {
        self.payments
            .iter()
            .filter(|payment| payment.status == PaymentStatus::Success)
            .map(|payment| payment.amount)
            .sum()
    }

    pub fn is_paid(&self) -> bool {
        self.status == BillingStatus::Success
    }

    pub fn mark_as_paid(&mut self) {
        self.status = if self.total_cost() > Decimal::ZERO {
            BillingStatus::Success
        } else {
            BillingStatus::Failed
        };
    }

    /// Whether the cached status lags behind a reconciled payment.
    pub fn needs_settlement(&self) -> bool {
        !self.is_paid() && self.total_cost() > Decimal::ZERO
    }

    /// Most recent successful payment, the one a refund applies to.
    pub fn settled_payment(&self) -> Option<&Payment> {
        self.payments
            .iter()
            .filter(|payment| payment.status == PaymentStatus::Success)
            .max_by_key(|payment| payment.payment_date.unwrap_or(payment.created_at))
    }

    pub fn into_view(self) -> BillingView {
        BillingView {
            total_cost: self.total_cost(),
            is_paid: self.is_paid(),
            billing: self,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingView {
    #[serde(flatten)]
    pub billing: Billing,
    pub total_cost: Decimal,
    pub is_paid: bool,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BillingError {
    #[error("Billing record not found")]
    NotFound,

    #[error("Payment not found")]
    PaymentNotFound,

    #[error("A payment already exists for intent {0}")]
    DuplicateIntent(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => BillingError::NotFound,
            StoreError::Duplicate(detail) => BillingError::DuplicateIntent(detail),
            other => BillingError::DatabaseError(other.to_string()),
        }
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound | BillingError::PaymentNotFound => AppError::NotFound(err.to_string()),
            BillingError::DuplicateIntent(_) => AppError::Conflict(err.to_string()),
            BillingError::DatabaseError(msg) => AppError::Database(msg),
        }
    }
}
