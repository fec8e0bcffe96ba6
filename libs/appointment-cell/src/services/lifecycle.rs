// libs/appointment-cell/src/services/lifecycle.rs
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::models::{Appointment, AppointmentError, AppointmentStatus, StatusHistoryEntry};

/// Status state machine for appointments.
///
/// Scheduled may move to Completed or Cancelled. Completed is terminal.
/// Cancelled may only return to Scheduled.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppointmentLifecycleService;

impl AppointmentLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// Validate that a status transition is allowed
    pub fn validate_status_transition(
        &self,
        current_status: AppointmentStatus,
        new_status: AppointmentStatus,
    ) -> Result<(), AppointmentError> {
        debug!("Validating status transition from {} to {}", current_status, new_status);

        if current_status == AppointmentStatus::Completed {
            warn!("Rejected status change on completed appointment (target {})", new_status);
            return Err(AppointmentError::CompletedImmutable);
        }

        if current_status == new_status && current_status == AppointmentStatus::Scheduled {
            return Ok(());
        }

        if !self.get_valid_transitions(current_status).contains(&new_status) {
            warn!("Invalid status transition attempted: {} -> {}", current_status, new_status);
            return Err(AppointmentError::InvalidStatusTransition {
                from: current_status,
                to: new_status,
            });
        }

        Ok(())
    }

    /// Get all valid next statuses for a given current status
    pub fn get_valid_transitions(&self, current_status: AppointmentStatus) -> Vec<AppointmentStatus> {
        match current_status {
            AppointmentStatus::Scheduled => vec![
                AppointmentStatus::Completed,
                AppointmentStatus::Cancelled,
            ],
            AppointmentStatus::Cancelled => vec![AppointmentStatus::Scheduled],
            AppointmentStatus::Completed => vec![],
        }
    }

    /// Moves the appointment to `new_status`. Returns the history entry that
    /// was appended, or `None` when the status already matched.
    pub fn apply_status_change(
        &self,
        appointment: &mut Appointment,
        new_status: AppointmentStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusHistoryEntry>, AppointmentError> {
        self.validate_status_transition(appointment.status, new_status)?;

        if appointment.status == new_status {
            debug!("Appointment {} already {}, nothing to record", appointment.id, new_status);
            return Ok(None);
        }

        let entry = StatusHistoryEntry {
            old_status: appointment.status,
            new_status,
            changed_at: now,
            sequence: appointment.next_history_sequence(),
        };

        appointment.status = new_status;
        appointment.status_updated_at = now;
        appointment.status_history.push(entry.clone());

        info!("Appointment {} status {} -> {}", appointment.id, entry.old_status, new_status);
        Ok(Some(entry))
    }

    /// Cancellation is only offered while the appointment is still scheduled.
    pub fn cancel(
        &self,
        appointment: &mut Appointment,
        now: DateTime<Utc>,
    ) -> Result<StatusHistoryEntry, AppointmentError> {
        if !appointment.is_cancellable() {
            warn!("Appointment {} is {} and cannot be cancelled", appointment.id, appointment.status);
            return Err(AppointmentError::NotCancellable);
        }

        self.apply_status_change(appointment, AppointmentStatus::Cancelled, now)?
            .ok_or(AppointmentError::NotCancellable)
    }

    /// Validate appointment timing constraints
    pub fn validate_appointment_timing(
        &self,
        appointment_date: DateTime<Utc>,
        current_time: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        if appointment_date <= current_time {
            return Err(AppointmentError::InvalidTime(
                "Appointment date must be in the future".to_string(),
            ));
        }
        Ok(())
    }
}
