// libs/appointment-cell/src/services/booking.rs
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use billing_cell::models::Billing;
use shared_database::StoreError;
use shared_models::auth::UserRole;
use shared_utils::clock::Clock;

use crate::models::{
    Appointment, AppointmentError, AppointmentListResponse, AppointmentResponse,
    AppointmentStatus, CreateAppointmentRequest, StatusHistoryEntry, UpdateAppointmentRequest,
    MAX_NOTES_LENGTH,
};
use crate::services::conflict::ConflictDetectionService;
use crate::services::directory::UserDirectory;
use crate::services::lifecycle::AppointmentLifecycleService;
use crate::services::store::AppointmentStore;

/// Attempts made for one mutation before contention is surfaced.
const MAX_UPDATE_ATTEMPTS: usize = 3;

const UNKNOWN_NAME: &str = "Unknown";

/// A change to an existing appointment, re-applied on every retry against
/// the freshly loaded row.
#[derive(Debug, Clone)]
enum Mutation {
    Reschedule(DateTime<Utc>),
    Status(AppointmentStatus),
    Cancel,
    Update(UpdateAppointmentRequest),
}

pub struct AppointmentBookingService {
    store: Arc<dyn AppointmentStore>,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    conflict_service: ConflictDetectionService,
    lifecycle_service: AppointmentLifecycleService,
}

impl AppointmentBookingService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conflict_service: ConflictDetectionService::new(Arc::clone(&store)),
            lifecycle_service: AppointmentLifecycleService::new(),
            store,
            directory,
            clock,
        }
    }

    /// Book a new appointment together with its pending billing record.
    pub async fn book_appointment(
        &self,
        request: CreateAppointmentRequest,
    ) -> Result<AppointmentResponse, AppointmentError> {
        info!("Booking appointment for patient {} with doctor {}", request.patient_id, request.doctor_id);

        let now = self.clock.now();
        validate_notes(request.notes.as_deref())?;
        self.lifecycle_service.validate_appointment_timing(request.appointment_date, now)?;

        let doctor_name = self
            .require_user(request.doctor_id, UserRole::Doctor)
            .await?
            .ok_or(AppointmentError::DoctorNotFound)?;
        let patient_name = self
            .require_user(request.patient_id, UserRole::Patient)
            .await?
            .ok_or(AppointmentError::PatientNotFound)?;

        self.conflict_service
            .ensure_no_conflict(request.doctor_id, request.appointment_date, None)
            .await?;

        let appointment = Appointment::new_scheduled(
            request.patient_id,
            request.doctor_id,
            request.appointment_date,
            request.visit_type,
            request.notes,
            now,
        );
        let billing = Billing::new_pending(appointment.id, appointment.patient_id, now);

        let created = self
            .store
            .create_with_billing(&appointment, &billing)
            .await
            .map_err(map_write_error)?;

        info!("Appointment {} booked successfully with doctor {}", created.id, created.doctor_id);

        Ok(AppointmentResponse {
            appointment: created,
            doctor_name,
            patient_name,
        })
    }

    /// Raw appointment, used by handlers for ownership checks.
    pub async fn find_appointment(&self, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        self.store
            .find(appointment_id)
            .await?
            .ok_or(AppointmentError::NotFound)
    }

    pub async fn get_appointment(&self, appointment_id: Uuid) -> Result<AppointmentResponse, AppointmentError> {
        debug!("Fetching appointment {}", appointment_id);
        let appointment = self.find_appointment(appointment_id).await?;
        Ok(self.decorate_one(appointment).await)
    }

    pub async fn get_patient_appointments(&self, patient_id: Uuid) -> Result<AppointmentListResponse, AppointmentError> {
        let appointments = self.store.list_by_patient(patient_id).await?;
        Ok(self.decorate_many(appointments).await)
    }

    pub async fn get_doctor_appointments(&self, doctor_id: Uuid) -> Result<AppointmentListResponse, AppointmentError> {
        let appointments = self.store.list_by_doctor(doctor_id).await?;
        Ok(self.decorate_many(appointments).await)
    }

    pub async fn list_appointments(&self) -> Result<AppointmentListResponse, AppointmentError> {
        let appointments = self.store.list_all().await?;
        Ok(self.decorate_many(appointments).await)
    }

    /// Moves the appointment to a new time. Status and history are untouched.
    pub async fn reschedule_appointment(
        &self,
        appointment_id: Uuid,
        new_date_time: DateTime<Utc>,
    ) -> Result<AppointmentResponse, AppointmentError> {
        info!("Rescheduling appointment {} to {}", appointment_id, new_date_time);
        let updated = self.mutate(appointment_id, Mutation::Reschedule(new_date_time)).await?;
        Ok(self.decorate_one(updated).await)
    }

    pub async fn update_status(
        &self,
        appointment_id: Uuid,
        new_status: AppointmentStatus,
    ) -> Result<AppointmentResponse, AppointmentError> {
        info!("Updating appointment {} status to {}", appointment_id, new_status);
        let updated = self.mutate(appointment_id, Mutation::Status(new_status)).await?;
        Ok(self.decorate_one(updated).await)
    }

    pub async fn cancel_appointment(&self, appointment_id: Uuid) -> Result<AppointmentResponse, AppointmentError> {
        info!("Cancelling appointment {}", appointment_id);
        let updated = self.mutate(appointment_id, Mutation::Cancel).await?;
        Ok(self.decorate_one(updated).await)
    }

    pub async fn update_appointment(
        &self,
        appointment_id: Uuid,
        request: UpdateAppointmentRequest,
    ) -> Result<AppointmentResponse, AppointmentError> {
        info!("Updating appointment {}", appointment_id);
        validate_notes(request.notes.as_deref())?;
        let updated = self.mutate(appointment_id, Mutation::Update(request)).await?;
        Ok(self.decorate_one(updated).await)
    }

    /// Hides the appointment from every lookup. History stays stored.
    pub async fn delete_appointment(&self, appointment_id: Uuid) -> Result<(), AppointmentError> {
        self.store.soft_delete(appointment_id, self.clock.now()).await?;
        info!("Appointment {} soft-deleted", appointment_id);
        Ok(())
    }

    // ==============================================================================
    // MUTATION PIPELINE
    // ==============================================================================

    /// Load, validate, apply and persist under the row's version. A lost
    /// race re-runs the whole sequence against the new row.
    async fn mutate(&self, appointment_id: Uuid, mutation: Mutation) -> Result<Appointment, AppointmentError> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut appointment = self.find_appointment(appointment_id).await?;
            let expected_version = appointment.version;
            let now = self.clock.now();

            let (changed, history) = self.apply(&mut appointment, &mutation, now).await?;
            if !changed {
                debug!("Appointment {} unchanged, skipping write", appointment_id);
                return Ok(appointment);
            }

            match self.store.update(&appointment, &history, expected_version).await {
                Ok(saved) => {
                    info!("Appointment {} saved at version {}", saved.id, saved.version);
                    return Ok(saved);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Version conflict on appointment {} (attempt {}/{})",
                        appointment_id, attempt, MAX_UPDATE_ATTEMPTS
                    );
                }
                Err(e) => return Err(map_write_error(e)),
            }
        }

        Err(AppointmentError::ConcurrentModification)
    }

    async fn apply(
        &self,
        appointment: &mut Appointment,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> Result<(bool, Vec<StatusHistoryEntry>), AppointmentError> {
        match mutation {
            Mutation::Reschedule(new_date_time) => {
                self.move_to(appointment, *new_date_time, now).await?;
                Ok((true, Vec::new()))
            }
            Mutation::Status(new_status) => {
                self.guard_reentry(appointment, *new_status).await?;
                let entry = self.lifecycle_service.apply_status_change(appointment, *new_status, now)?;
                Ok((entry.is_some(), entry.into_iter().collect()))
            }
            Mutation::Cancel => {
                let entry = self.lifecycle_service.cancel(appointment, now)?;
                Ok((true, vec![entry]))
            }
            Mutation::Update(request) => {
                let mut changed = false;

                if let Some(new_date_time) = request.appointment_date {
                    if new_date_time != appointment.appointment_date {
                        self.move_to(appointment, new_date_time, now).await?;
                        changed = true;
                    }
                }
                if let Some(visit_type) = request.visit_type {
                    changed |= appointment.visit_type != visit_type;
                    appointment.visit_type = visit_type;
                }
                if let Some(notes) = &request.notes {
                    changed |= appointment.notes.as_ref() != Some(notes);
                    appointment.notes = Some(notes.clone());
                }

                let mut history = Vec::new();
                if let Some(new_status) = request.status {
                    self.guard_reentry(appointment, new_status).await?;
                    if let Some(entry) = self.lifecycle_service.apply_status_change(appointment, new_status, now)? {
                        history.push(entry);
                        changed = true;
                    }
                }

                Ok((changed, history))
            }
        }
    }

    async fn move_to(
        &self,
        appointment: &mut Appointment,
        new_date_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        if appointment.status == AppointmentStatus::Completed {
            return Err(AppointmentError::CompletedImmutable);
        }
        self.lifecycle_service.validate_appointment_timing(new_date_time, now)?;
        self.conflict_service
            .ensure_no_conflict(appointment.doctor_id, new_date_time, Some(appointment.id))
            .await?;

        appointment.appointment_date = new_date_time;
        Ok(())
    }

    /// Un-cancelling puts the appointment back on the doctor's calendar, so
    /// its slot has to be free again.
    async fn guard_reentry(
        &self,
        appointment: &Appointment,
        new_status: AppointmentStatus,
    ) -> Result<(), AppointmentError> {
        if appointment.status == AppointmentStatus::Cancelled && new_status == AppointmentStatus::Scheduled {
            self.conflict_service
                .ensure_no_conflict(appointment.doctor_id, appointment.appointment_date, Some(appointment.id))
                .await?;
        }
        Ok(())
    }

    // ==============================================================================
    // DIRECTORY LOOKUPS
    // ==============================================================================

    /// Display name of `id` when it resolves to a user with `role`.
    async fn require_user(&self, id: Uuid, role: UserRole) -> Result<Option<String>, AppointmentError> {
        let user = self.directory.find_user_by_id(id).await?;
        Ok(user.filter(|u| u.role == role).map(|u| u.full_name))
    }

    async fn display_name(&self, id: Uuid) -> String {
        match self.directory.find_user_by_id(id).await {
            Ok(Some(user)) => user.full_name,
            Ok(None) => UNKNOWN_NAME.to_string(),
            Err(e) => {
                warn!("Could not resolve display name for {}: {}", id, e);
                UNKNOWN_NAME.to_string()
            }
        }
    }

    async fn decorate_one(&self, appointment: Appointment) -> AppointmentResponse {
        let (doctor_name, patient_name) = futures::join!(
            self.display_name(appointment.doctor_id),
            self.display_name(appointment.patient_id)
        );

        AppointmentResponse {
            appointment,
            doctor_name,
            patient_name,
        }
    }

    async fn decorate_many(&self, appointments: Vec<Appointment>) -> AppointmentListResponse {
        let ids: HashSet<Uuid> = appointments
            .iter()
            .flat_map(|a| [a.doctor_id, a.patient_id])
            .collect();

        let names: HashMap<Uuid, String> = join_all(ids.into_iter().map(|id| async move {
            (id, self.display_name(id).await)
        }))
        .await
        .into_iter()
        .collect();

        let name_of = |id: &Uuid| names.get(id).cloned().unwrap_or_else(|| UNKNOWN_NAME.to_string());

        let appointments: Vec<AppointmentResponse> = appointments
            .into_iter()
            .map(|appointment| AppointmentResponse {
                doctor_name: name_of(&appointment.doctor_id),
                patient_name: name_of(&appointment.patient_id),
                appointment,
            })
            .collect();

        AppointmentListResponse {
            total_count: appointments.len(),
            appointments,
        }
    }
}

fn validate_notes(notes: Option<&str>) -> Result<(), AppointmentError> {
    match notes {
        Some(notes) if notes.chars().count() > MAX_NOTES_LENGTH => Err(AppointmentError::ValidationError(
            format!("Notes cannot exceed {} characters", MAX_NOTES_LENGTH),
        )),
        _ => Ok(()),
    }
}

/// The store reports an overlapping write as a duplicate.
fn map_write_error(err: StoreError) -> AppointmentError {
    match err {
        StoreError::Duplicate(_) => AppointmentError::ConflictDetected,
        other => other.into(),
    }
}
