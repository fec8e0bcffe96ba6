// libs/billing-cell/src/router.rs
use std::sync::Arc;

use axum::{middleware, routing::get, Router};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::services::ledger::BillingLedgerService;

pub fn billing_routes(config: Arc<AppConfig>, ledger: Arc<BillingLedgerService>) -> Router {
    Router::new()
        .route("/appointments/{appointment_id}", get(handlers::get_appointment_billing))
        .layer(middleware::from_fn_with_state(config, auth_middleware))
        .with_state(ledger)
}
