// libs/appointment-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::services::booking::AppointmentBookingService;

pub fn appointment_routes(config: Arc<AppConfig>, service: Arc<AppointmentBookingService>) -> Router {
    // All appointment operations require authentication
    Router::new()
        .route("/", post(handlers::book_appointment).get(handlers::list_appointments))
        .route(
            "/{appointment_id}",
            get(handlers::get_appointment)
                .put(handlers::update_appointment)
                .delete(handlers::delete_appointment),
        )
        .route("/{appointment_id}/status", patch(handlers::update_status))
        .route("/{appointment_id}/reschedule", patch(handlers::reschedule_appointment))
        .route("/{appointment_id}/cancel", post(handlers::cancel_appointment))
        .route("/patients/{patient_id}", get(handlers::get_patient_appointments))
        .route("/doctors/{doctor_id}", get(handlers::get_doctor_appointments))
        .layer(middleware::from_fn_with_state(config, auth_middleware))
        .with_state(service)
}
