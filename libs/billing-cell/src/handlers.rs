// libs/billing-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_models::auth::{User, UserRole};
use shared_models::error::AppError;

use crate::services::ledger::BillingLedgerService;

#[axum::debug_handler]
pub async fn get_appointment_billing(
    State(ledger): State<Arc<BillingLedgerService>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let mut billing = ledger.find_billing_for_appointment(appointment_id).await?;

    // Patients only see their own invoices; clinic staff see all of them.
    let is_patient = user.is(billing.patient_id);
    let is_staff = user.is_admin() || user.has_role(UserRole::Doctor);

    if !is_patient && !is_staff {
        return Err(AppError::Forbidden("Not authorized to view this billing record".to_string()));
    }

    ledger.settle(&mut billing).await?;

    Ok(Json(json!({
        "success": true,
        "billing": billing.into_view(),
    })))
}
