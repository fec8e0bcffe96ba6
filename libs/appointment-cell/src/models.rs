// libs/appointment-cell/src/models.rs
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use shared_database::StoreError;
use shared_models::error::AppError;

/// Two active appointments for one doctor must be at least this far apart.
pub const OVERLAP_WINDOW_MINUTES: i64 = 60;

pub const MAX_NOTES_LENGTH: usize = 500;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub appointment_date: DateTime<Utc>,
    pub visit_type: VisitType,
    pub status: AppointmentStatus,
    pub status_updated_at: DateTime<Utc>,
    pub notes: Option<String>,
    #[serde(default)]
    pub status_history: Vec<StatusHistoryEntry>,
    /// Optimistic concurrency token, bumped by every persisted mutation.
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Appointment {
    pub fn new_scheduled(
        patient_id: Uuid,
        doctor_id: Uuid,
        appointment_date: DateTime<Utc>,
        visit_type: VisitType,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            doctor_id,
            appointment_date,
            visit_type,
            status: AppointmentStatus::Scheduled,
            status_updated_at: now,
            notes,
            status_history: Vec::new(),
            version: 0,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
        }
    }

    pub fn is_cancellable(&self) -> bool {
        self.status == AppointmentStatus::Scheduled
    }

    /// Whether this appointment blocks the doctor's calendar.
    pub fn is_active(&self) -> bool {
        !self.is_deleted && self.status != AppointmentStatus::Cancelled
    }

    /// True when `at` falls strictly inside the overlap window around this
    /// appointment. Exactly one window apart is not an overlap.
    pub fn overlaps(&self, at: DateTime<Utc>) -> bool {
        let gap = (self.appointment_date - at).num_milliseconds().abs();
        gap < Duration::minutes(OVERLAP_WINDOW_MINUTES).num_milliseconds()
    }

    pub fn next_history_sequence(&self) -> i32 {
        self.status_history
            .iter()
            .map(|entry| entry.sequence)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Embedded history may arrive in any order from the store.
    pub fn normalize(mut self) -> Self {
        self.status_history.sort_by_key(|entry| entry.sequence);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    #[serde(alias = "Scheduled")]
    Scheduled,
    #[serde(alias = "Completed")]
    Completed,
    #[serde(alias = "Cancelled", alias = "canceled")]
    Cancelled,
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentStatus::Scheduled => write!(f, "scheduled"),
            AppointmentStatus::Completed => write!(f, "completed"),
            AppointmentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum VisitType {
    #[serde(alias = "consultation", alias = "CONSULTATION")]
    Consultation,
    #[serde(alias = "follow_up", alias = "followup", alias = "follow-up", alias = "Follow-Up", alias = "FOLLOWUP")]
    FollowUp,
    #[serde(alias = "emergency", alias = "EMERGENCY")]
    Emergency,
}

impl fmt::Display for VisitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisitType::Consultation => write!(f, "Consultation"),
            VisitType::FollowUp => write!(f, "FollowUp"),
            VisitType::Emergency => write!(f, "Emergency"),
        }
    }
}

/// One executed status change. Rows are only ever appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusHistoryEntry {
    pub old_status: AppointmentStatus,
    pub new_status: AppointmentStatus,
    pub changed_at: DateTime<Utc>,
    pub sequence: i32,
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppointmentRequest {
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    #[serde(alias = "date_time")]
    pub appointment_date: DateTime<Utc>,
    pub visit_type: VisitType,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAppointmentRequest {
    #[serde(alias = "date_time")]
    pub appointment_date: Option<DateTime<Utc>>,
    pub visit_type: Option<VisitType>,
    pub status: Option<AppointmentStatus>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleAppointmentRequest {
    pub new_date_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppointmentResponse {
    #[serde(flatten)]
    pub appointment: Appointment,
    pub doctor_name: String,
    pub patient_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppointmentListResponse {
    pub appointments: Vec<AppointmentResponse>,
    pub total_count: usize,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppointmentError {
    #[error("Appointment not found")]
    NotFound,

    #[error("Doctor not found")]
    DoctorNotFound,

    #[error("Patient not found")]
    PatientNotFound,

    #[error("Invalid appointment time: {0}")]
    InvalidTime(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Doctor has a conflicting appointment at this time")]
    ConflictDetected,

    #[error("Appointment cannot be cancelled")]
    NotCancellable,

    #[error("Cannot change status of a completed appointment")]
    CompletedImmutable,

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("Appointment was modified concurrently, please retry")]
    ConcurrentModification,

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("User directory error: {0}")]
    DirectoryError(String),
}

impl From<StoreError> for AppointmentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AppointmentError::NotFound,
            StoreError::VersionConflict => AppointmentError::ConcurrentModification,
            other => AppointmentError::DatabaseError(other.to_string()),
        }
    }
}

impl From<AppointmentError> for AppError {
    fn from(err: AppointmentError) -> Self {
        match err {
            AppointmentError::NotFound
            | AppointmentError::DoctorNotFound
            | AppointmentError::PatientNotFound => AppError::NotFound(err.to_string()),
            AppointmentError::InvalidTime(msg) => AppError::ValidationError(msg),
            AppointmentError::ValidationError(msg) => AppError::ValidationError(msg),
            AppointmentError::ConflictDetected
            | AppointmentError::NotCancellable
            | AppointmentError::CompletedImmutable
            | AppointmentError::InvalidStatusTransition { .. } => AppError::Conflict(err.to_string()),
            AppointmentError::ConcurrentModification => AppError::Database(err.to_string()),
            AppointmentError::DatabaseError(msg) => AppError::Database(msg),
            AppointmentError::DirectoryError(msg) => AppError::ExternalService(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shared_models::error::ErrorSource;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn overlap_boundary_is_exclusive() {
        let existing = Appointment::new_scheduled(
            Uuid::new_v4(),
            Uuid::new_v4(),
            at(10, 0),
            VisitType::Consultation,
            None,
            at(8, 0),
        );

        assert!(existing.overlaps(at(10, 45)));
        assert!(existing.overlaps(at(9, 1)));
        assert!(!existing.overlaps(at(11, 0)));
        assert!(!existing.overlaps(at(9, 0)));
        assert!(existing.overlaps(at(10, 59) + Duration::seconds(59)));
    }

    #[test]
    fn visit_type_accepts_aliases() {
        for raw in ["\"FollowUp\"", "\"follow_up\"", "\"followup\""] {
            let parsed: VisitType = serde_json::from_str(raw).unwrap();
            assert_eq!(parsed, VisitType::FollowUp);
        }
        assert!(serde_json::from_str::<VisitType>("\"Surgery\"").is_err());
    }

    #[test]
    fn errors_keep_their_classification() {
        let conflict: AppError = AppointmentError::ConflictDetected.into();
        assert_eq!(conflict.error_source(), ErrorSource::Conflict);

        let invalid: AppError = AppointmentError::InvalidTime("in the past".to_string()).into();
        assert_eq!(invalid.error_source(), ErrorSource::Validation);

        let store: AppError = AppointmentError::from(StoreError::Unavailable("down".to_string())).into();
        assert_eq!(store.error_source(), ErrorSource::Persistence);

        let missing: AppError = AppointmentError::DoctorNotFound.into();
        assert_eq!(missing.error_source(), ErrorSource::NotFound);
    }

    #[test]
    fn history_sequence_continues_from_max() {
        let mut appointment = Appointment::new_scheduled(
            Uuid::new_v4(),
            Uuid::new_v4(),
            at(10, 0),
            VisitType::Emergency,
            None,
            at(8, 0),
        );
        assert_eq!(appointment.next_history_sequence(), 1);

        appointment.status_history.push(StatusHistoryEntry {
            old_status: AppointmentStatus::Scheduled,
            new_status: AppointmentStatus::Cancelled,
            changed_at: at(9, 0),
            sequence: 1,
        });
        assert_eq!(appointment.next_history_sequence(), 2);
    }
}
