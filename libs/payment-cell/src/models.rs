// libs/payment-cell/src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use billing_cell::models::{BillingError, PaymentMethod, PaymentStatus};
use shared_database::StoreError;
use shared_models::error::AppError;

// ==============================================================================
// CHECKOUT / REFUND
// ==============================================================================

fn default_payment_method() -> PaymentMethod {
    PaymentMethod::Card
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayForSessionRequest {
    #[serde(alias = "session_id")]
    pub appointment_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default = "default_payment_method")]
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub payment_id: Uuid,
    pub billing_id: Uuid,
    pub payment_intent_id: String,
    /// Handed to the payer's client once; never stored.
    pub client_secret: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub appointment_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefundResult {
    pub refund_id: String,
    pub payment_intent_id: String,
    pub appointment_id: Uuid,
    pub amount_refunded: Decimal,
    pub currency: String,
    pub status: String,
    pub reason: Option<String>,
    pub created: DateTime<Utc>,
}

// ==============================================================================
// GATEWAY TYPES
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

/// Refund as reported by the processor, amounts in minor units.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    pub id: String,
    pub kind: GatewayEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEventKind {
    PaymentIntentSucceeded { payment_intent_id: String },
    /// Charge-level success; the parent intent may be absent on the payload.
    ChargeSucceeded {
        charge_id: String,
        payment_intent_id: Option<String>,
    },
    Unhandled { event_type: String },
}

// ==============================================================================
// RECONCILIATION
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        payment_intent_id: String,
        status: PaymentStatus,
    },
    Duplicate {
        payment_intent_id: String,
        status: PaymentStatus,
    },
    Unmatched {
        payment_intent_id: String,
    },
    Ignored {
        event_type: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(flatten)]
    pub outcome: ReconcileOutcome,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PaymentError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Webhook secret is not configured")]
    WebhookSecretMissing,

    #[error("Webhook signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),

    #[error("Billing record not found for appointment")]
    BillingNotFound,

    #[error("Not authorized to pay for this appointment")]
    Forbidden,

    #[error("Appointment has already been paid")]
    AlreadyPaid,

    #[error("No settled payment to refund")]
    NothingToRefund,

    #[error("Payment gateway error: {0}")]
    GatewayError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<StoreError> for PaymentError {
    fn from(err: StoreError) -> Self {
        PaymentError::DatabaseError(err.to_string())
    }
}

impl From<BillingError> for PaymentError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound => PaymentError::BillingNotFound,
            other => PaymentError::DatabaseError(other.to_string()),
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::ValidationError(msg) => AppError::ValidationError(msg),
            PaymentError::MalformedEvent(_) => AppError::BadRequest(err.to_string()),
            PaymentError::WebhookSecretMissing | PaymentError::SignatureVerification(_) => {
                AppError::Auth(err.to_string())
            }
            PaymentError::BillingNotFound => AppError::NotFound(err.to_string()),
            PaymentError::Forbidden => AppError::Forbidden(err.to_string()),
            PaymentError::AlreadyPaid | PaymentError::NothingToRefund => AppError::Conflict(err.to_string()),
            PaymentError::GatewayError(msg) => AppError::ExternalService(msg),
            PaymentError::DatabaseError(msg) => AppError::Database(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_models::error::ErrorSource;

    #[test]
    fn ack_flattens_outcome() {
        let ack = WebhookAck {
            received: true,
            outcome: ReconcileOutcome::Applied {
                payment_intent_id: "pi_1".to_string(),
                status: PaymentStatus::Success,
            },
        };

        assert_eq!(
            serde_json::to_value(ack).unwrap(),
            json!({ "received": true, "outcome": "applied", "payment_intent_id": "pi_1", "status": "success" })
        );
    }

    #[test]
    fn signature_problems_are_authentication_errors() {
        let err: AppError = PaymentError::SignatureVerification("mismatch".to_string()).into();
        assert_eq!(err.error_source(), ErrorSource::Authentication);

        let err: AppError = PaymentError::WebhookSecretMissing.into();
        assert_eq!(err.error_source(), ErrorSource::Authentication);

        let err: AppError = PaymentError::GatewayError("card_declined".to_string()).into();
        assert_eq!(err.error_source(), ErrorSource::ExternalService);
    }

    #[test]
    fn session_id_is_accepted_for_checkout() {
        let request: PayForSessionRequest = serde_json::from_value(json!({
            "session_id": Uuid::nil(),
            "amount": "150.00",
            "currency": "USD"
        }))
        .unwrap();

        assert_eq!(request.payment_method, PaymentMethod::Card);
        assert_eq!(request.amount, Decimal::new(15_000, 2));
    }
}
