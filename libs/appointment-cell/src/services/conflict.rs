use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Appointment, AppointmentError, OVERLAP_WINDOW_MINUTES};
use crate::services::store::AppointmentStore;

pub struct ConflictDetectionService {
    store: Arc<dyn AppointmentStore>,
}

impl ConflictDetectionService {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    /// Calendar days that can hold a conflicting appointment. The window may
    /// cross midnight, so this is not always a single day.
    pub fn candidate_days(requested: DateTime<Utc>) -> Result<(NaiveDate, NaiveDate), AppointmentError> {
        let window = Duration::minutes(OVERLAP_WINDOW_MINUTES);
        let out_of_range = || AppointmentError::InvalidTime(format!("Appointment time {} is out of range", requested));

        let earliest = requested.checked_sub_signed(window).ok_or_else(out_of_range)?;
        let latest = requested.checked_add_signed(window).ok_or_else(out_of_range)?;
        Ok((earliest.date_naive(), latest.date_naive()))
    }

    /// Active appointments of `doctor_id` that sit inside the overlap window
    /// around `requested`, ignoring `exclude_appointment_id`.
    pub async fn check_conflicts(
        &self,
        doctor_id: Uuid,
        requested: DateTime<Utc>,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        let (from, to) = Self::candidate_days(requested)?;
        debug!("Checking conflicts for doctor {} at {} (days {}..={})", doctor_id, requested, from, to);

        let candidates = self.store.find_active_for_doctor(doctor_id, from, to).await?;

        Ok(candidates
            .into_iter()
            .filter(|appointment| Some(appointment.id) != exclude_appointment_id)
            .filter(|appointment| appointment.is_active() && appointment.overlaps(requested))
            .collect())
    }

    pub async fn ensure_no_conflict(
        &self,
        doctor_id: Uuid,
        requested: DateTime<Utc>,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<(), AppointmentError> {
        let conflicts = self.check_conflicts(doctor_id, requested, exclude_appointment_id).await?;

        if !conflicts.is_empty() {
            warn!("Conflict detected for doctor {} - {} conflicting appointments", doctor_id, conflicts.len());
            return Err(AppointmentError::ConflictDetected);
        }
        Ok(())
    }
}
