// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_models::auth::{User, UserRole};
use shared_models::error::AppError;

use crate::models::{
    Appointment, CreateAppointmentRequest, RescheduleAppointmentRequest,
    UpdateAppointmentRequest, UpdateStatusRequest,
};
use crate::services::booking::AppointmentBookingService;

/// Only the patient, the doctor involved, or an admin may touch an appointment.
fn ensure_participant(user: &User, appointment: &Appointment, action: &str) -> Result<(), AppError> {
    let is_patient = user.is(appointment.patient_id);
    let is_doctor = user.is(appointment.doctor_id);

    if !is_patient && !is_doctor && !user.is_admin() {
        return Err(AppError::Forbidden(format!("Not authorized to {} this appointment", action)));
    }
    Ok(())
}

#[axum::debug_handler]
pub async fn book_appointment(
    State(service): State<Arc<AppointmentBookingService>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    // Patients book for themselves; doctors and admins may book on their behalf.
    let is_patient = user.is(request.patient_id);
    let is_staff = user.is_admin() || user.has_role(UserRole::Doctor);

    if !is_patient && !is_staff {
        return Err(AppError::Forbidden("Not authorized to book appointment for this patient".to_string()));
    }

    let appointment = service.book_appointment(request).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment booked successfully"
    })))
}

#[axum::debug_handler]
pub async fn list_appointments(
    State(service): State<Arc<AppointmentBookingService>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    if !user.is_admin() && !user.has_role(UserRole::Doctor) {
        return Err(AppError::Forbidden("Only doctors can list all appointments".to_string()));
    }

    let list = service.list_appointments().await?;

    Ok(Json(json!({
        "success": true,
        "appointments": list.appointments,
        "total_count": list.total_count
    })))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(service): State<Arc<AppointmentBookingService>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let appointment = service.get_appointment(appointment_id).await?;
    ensure_participant(&user, &appointment.appointment, "view")?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

#[axum::debug_handler]
pub async fn update_appointment(
    State(service): State<Arc<AppointmentBookingService>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<UpdateAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let existing = service.find_appointment(appointment_id).await?;
    ensure_participant(&user, &existing, "update")?;

    let appointment = service.update_appointment(appointment_id, request).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment updated successfully"
    })))
}

#[axum::debug_handler]
pub async fn update_status(
    State(service): State<Arc<AppointmentBookingService>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<Value>, AppError> {
    let existing = service.find_appointment(appointment_id).await?;
    ensure_participant(&user, &existing, "update")?;

    let appointment = service.update_status(appointment_id, request.status).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": format!("Appointment status is {}", appointment.appointment.status)
    })))
}

#[axum::debug_handler]
pub async fn reschedule_appointment(
    State(service): State<Arc<AppointmentBookingService>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<RescheduleAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let existing = service.find_appointment(appointment_id).await?;
    ensure_participant(&user, &existing, "reschedule")?;

    let appointment = service.reschedule_appointment(appointment_id, request.new_date_time).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment rescheduled successfully"
    })))
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(service): State<Arc<AppointmentBookingService>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let existing = service.find_appointment(appointment_id).await?;
    ensure_participant(&user, &existing, "cancel")?;

    let appointment = service.cancel_appointment(appointment_id).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment cancelled successfully"
    })))
}

#[axum::debug_handler]
pub async fn delete_appointment(
    State(service): State<Arc<AppointmentBookingService>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    if !user.is_admin() {
        return Err(AppError::Forbidden("Only admins can delete appointments".to_string()));
    }

    service.delete_appointment(appointment_id).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Appointment deleted successfully"
    })))
}

#[axum::debug_handler]
pub async fn get_patient_appointments(
    State(service): State<Arc<AppointmentBookingService>>,
    Path(patient_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let is_self = user.is(patient_id);
    let is_staff = user.is_admin() || user.has_role(UserRole::Doctor);

    if !is_self && !is_staff {
        return Err(AppError::Forbidden("Not authorized to view these appointments".to_string()));
    }

    let list = service.get_patient_appointments(patient_id).await?;

    Ok(Json(json!({
        "success": true,
        "appointments": list.appointments,
        "total_count": list.total_count
    })))
}

#[axum::debug_handler]
pub async fn get_doctor_appointments(
    State(service): State<Arc<AppointmentBookingService>>,
    Path(doctor_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    if !user.is(doctor_id) && !user.is_admin() {
        return Err(AppError::Forbidden("Not authorized to view these appointments".to_string()));
    }

    let list = service.get_doctor_appointments(doctor_id).await?;

    Ok(Json(json!({
        "success": true,
        "appointments": list.appointments,
        "total_count": list.total_count
    })))
}
