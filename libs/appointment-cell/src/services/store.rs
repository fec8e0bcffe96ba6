use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use reqwest::Method;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use billing_cell::models::Billing;
use billing_cell::store::InMemoryBillingStore;
use shared_database::{StoreError, SupabaseClient};

use crate::models::{Appointment, StatusHistoryEntry};

const APPOINTMENT_SELECT: &str = "*,status_history:appointment_status_history(old_status,new_status,changed_at,sequence)";

/// Persistence seam for appointments. Implementations must make
/// `create_with_billing` and `update` all-or-nothing, and must refuse a write
/// that would leave two active appointments of one doctor inside the overlap
/// window (reported as `StoreError::Duplicate`).
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn create_with_billing(&self, appointment: &Appointment, billing: &Billing) -> Result<Appointment, StoreError>;

    /// Non-deleted appointment by id.
    async fn find(&self, id: Uuid) -> Result<Option<Appointment>, StoreError>;

    /// Non-cancelled, non-deleted appointments of a doctor whose date falls
    /// on any calendar day in `from..=to`.
    async fn find_active_for_doctor(
        &self,
        doctor_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Appointment>, StoreError>;

    async fn list_by_patient(&self, patient_id: Uuid) -> Result<Vec<Appointment>, StoreError>;

    async fn list_by_doctor(&self, doctor_id: Uuid) -> Result<Vec<Appointment>, StoreError>;

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError>;

    /// Persists the scalar fields of `appointment` and appends `new_history`,
    /// provided the stored version still equals `expected_version`.
    async fn update(
        &self,
        appointment: &Appointment,
        new_history: &[StatusHistoryEntry],
        expected_version: i64,
    ) -> Result<Appointment, StoreError>;

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
}

fn day_start(day: NaiveDate) -> String {
    format!("{}T00:00:00Z", day)
}

// ==============================================================================
// SUPABASE
// ==============================================================================

pub struct SupabaseAppointmentStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseAppointmentStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    async fn select(&self, filters: &str) -> Result<Vec<Appointment>, StoreError> {
        let path = format!("/rest/v1/appointments?{}&select={}", filters, APPOINTMENT_SELECT);
        let rows: Vec<Appointment> = self.supabase
            .request(Method::GET, &path, Some(self.supabase.service_token()), None)
            .await?;

        Ok(rows.into_iter().map(Appointment::normalize).collect())
    }
}

#[async_trait]
impl AppointmentStore for SupabaseAppointmentStore {
    async fn create_with_billing(&self, appointment: &Appointment, billing: &Billing) -> Result<Appointment, StoreError> {
        debug!("Creating appointment {} with billing {}", appointment.id, billing.id);

        let rows: Vec<Appointment> = self.supabase
            .rpc(
                "create_appointment_with_billing",
                Some(self.supabase.service_token()),
                json!({
                    "p_appointment": appointment,
                    "p_billing": billing,
                }),
            )
            .await?;

        rows.into_iter()
            .next()
            .map(Appointment::normalize)
            .ok_or_else(|| StoreError::Unavailable("appointment insert returned no rows".to_string()))
    }

    async fn find(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let rows = self.select(&format!("id=eq.{}&is_deleted=eq.false", id)).await?;
        Ok(rows.into_iter().next())
    }

    async fn find_active_for_doctor(
        &self,
        doctor_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Appointment>, StoreError> {
        let end = to
            .checked_add_days(Days::new(1))
            .ok_or_else(|| StoreError::Unavailable(format!("date out of range: {}", to)))?;

        self.select(&format!(
            "doctor_id=eq.{}&status=neq.cancelled&is_deleted=eq.false&appointment_date=gte.{}&appointment_date=lt.{}",
            doctor_id,
            day_start(from),
            day_start(end)
        ))
        .await
    }

    async fn list_by_patient(&self, patient_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        self.select(&format!(
            "patient_id=eq.{}&is_deleted=eq.false&order=appointment_date.asc",
            patient_id
        ))
        .await
    }

    async fn list_by_doctor(&self, doctor_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        self.select(&format!(
            "doctor_id=eq.{}&is_deleted=eq.false&order=appointment_date.asc",
            doctor_id
        ))
        .await
    }

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        self.select("is_deleted=eq.false&order=appointment_date.asc").await
    }

    async fn update(
        &self,
        appointment: &Appointment,
        new_history: &[StatusHistoryEntry],
        expected_version: i64,
    ) -> Result<Appointment, StoreError> {
        debug!("Updating appointment {} at version {}", appointment.id, expected_version);

        let rows: Vec<Appointment> = self.supabase
            .rpc(
                "update_appointment_versioned",
                Some(self.supabase.service_token()),
                json!({
                    "p_id": appointment.id,
                    "p_expected_version": expected_version,
                    "p_appointment_date": appointment.appointment_date,
                    "p_visit_type": appointment.visit_type,
                    "p_status": appointment.status,
                    "p_status_updated_at": appointment.status_updated_at,
                    "p_notes": appointment.notes,
                    "p_history": new_history,
                }),
            )
            .await?;

        // The function returns nothing when the version filter did not match.
        let mut saved = rows.into_iter().next().ok_or(StoreError::VersionConflict)?;
        // The returned row carries no embedded history; the caller's copy
        // already has the new entries appended.
        saved.status_history = appointment.status_history.clone();
        Ok(saved.normalize())
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let path = format!("/rest/v1/appointments?id=eq.{}&is_deleted=eq.false", id);
        let rows: Vec<serde_json::Value> = self.supabase
            .request_returning(
                Method::PATCH,
                &path,
                Some(self.supabase.service_token()),
                json!({ "is_deleted": true, "deleted_at": at }),
            )
            .await?;

        if rows.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

// ==============================================================================
// IN-MEMORY
// ==============================================================================

/// Appointment store for local development and tests. Billing rows are
/// written to the paired `InMemoryBillingStore` under the same lock.
pub struct InMemoryAppointmentStore {
    appointments: RwLock<HashMap<Uuid, Appointment>>,
    billing: Arc<InMemoryBillingStore>,
}

impl InMemoryAppointmentStore {
    pub fn new(billing: Arc<InMemoryBillingStore>) -> Self {
        Self {
            appointments: RwLock::new(HashMap::new()),
            billing,
        }
    }

    fn overlapping(
        appointments: &HashMap<Uuid, Appointment>,
        candidate: &Appointment,
    ) -> bool {
        appointments.values().any(|existing| {
            existing.id != candidate.id
                && existing.doctor_id == candidate.doctor_id
                && existing.is_active()
                && existing.overlaps(candidate.appointment_date)
        })
    }

    fn sorted(mut rows: Vec<Appointment>) -> Vec<Appointment> {
        rows.sort_by_key(|appointment| appointment.appointment_date);
        rows
    }
}

#[async_trait]
impl AppointmentStore for InMemoryAppointmentStore {
    async fn create_with_billing(&self, appointment: &Appointment, billing: &Billing) -> Result<Appointment, StoreError> {
        let mut appointments = self.appointments.write().await;

        if appointments.contains_key(&appointment.id) {
            return Err(StoreError::Duplicate(format!("appointment {}", appointment.id)));
        }
        if Self::overlapping(&appointments, appointment) {
            warn!("Refusing overlapping appointment for doctor {}", appointment.doctor_id);
            return Err(StoreError::Duplicate("overlapping appointment".to_string()));
        }

        self.billing.insert_billing(billing.clone()).await?;
        appointments.insert(appointment.id, appointment.clone());

        Ok(appointment.clone())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let appointments = self.appointments.read().await;
        Ok(appointments.get(&id).filter(|a| !a.is_deleted).cloned())
    }

    async fn find_active_for_doctor(
        &self,
        doctor_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Appointment>, StoreError> {
        let appointments = self.appointments.read().await;
        let rows = appointments
            .values()
            .filter(|a| a.doctor_id == doctor_id && a.is_active())
            .filter(|a| {
                let day = a.appointment_date.date_naive();
                day >= from && day <= to
            })
            .cloned()
            .collect();

        Ok(Self::sorted(rows))
    }

    async fn list_by_patient(&self, patient_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        let appointments = self.appointments.read().await;
        let rows = appointments
            .values()
            .filter(|a| a.patient_id == patient_id && !a.is_deleted)
            .cloned()
            .collect();

        Ok(Self::sorted(rows))
    }

    async fn list_by_doctor(&self, doctor_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        let appointments = self.appointments.read().await;
        let rows = appointments
            .values()
            .filter(|a| a.doctor_id == doctor_id && !a.is_deleted)
            .cloned()
            .collect();

        Ok(Self::sorted(rows))
    }

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        let appointments = self.appointments.read().await;
        let rows = appointments.values().filter(|a| !a.is_deleted).cloned().collect();
        Ok(Self::sorted(rows))
    }

    async fn update(
        &self,
        appointment: &Appointment,
        new_history: &[StatusHistoryEntry],
        expected_version: i64,
    ) -> Result<Appointment, StoreError> {
        let mut appointments = self.appointments.write().await;

        let stored = appointments
            .get(&appointment.id)
            .filter(|a| !a.is_deleted)
            .ok_or(StoreError::NotFound)?;

        if stored.version != expected_version {
            return Err(StoreError::VersionConflict);
        }

        let moves_onto_calendar = appointment.appointment_date != stored.appointment_date
            || (appointment.is_active() && !stored.is_active());
        if moves_onto_calendar && appointment.is_active() && Self::overlapping(&appointments, appointment) {
            warn!("Refusing overlapping update for appointment {}", appointment.id);
            return Err(StoreError::Duplicate("overlapping appointment".to_string()));
        }

        let mut history = stored.status_history.clone();
        history.extend_from_slice(new_history);

        let mut updated = appointment.clone();
        updated.status_history = history;
        updated.version = expected_version + 1;
        appointments.insert(updated.id, updated.clone());

        Ok(updated)
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut appointments = self.appointments.write().await;
        let appointment = appointments
            .get_mut(&id)
            .filter(|a| !a.is_deleted)
            .ok_or(StoreError::NotFound)?;

        appointment.is_deleted = true;
        appointment.deleted_at = Some(at);
        appointment.version += 1;
        Ok(())
    }
}
