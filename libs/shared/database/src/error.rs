use thiserror::Error;

/// Non-2xx response from PostgREST, carried inside `anyhow::Error` so that
/// stores can recover the status with `downcast_ref`.
#[derive(Error, Debug, Clone)]
#[error("API error ({status}): {message}")]
pub struct SupabaseApiError {
    pub status: u16,
    pub message: String,
}

impl SupabaseApiError {
    pub fn is_unique_violation(&self) -> bool {
        self.status == 409
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

/// Failure modes shared by every store implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Record was modified concurrently")]
    VersionConflict,

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to decode stored record: {0}")]
    Decode(String),
}

impl StoreError {
    /// Contention that the caller may resolve by re-reading and retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::VersionConflict)
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(api_error) = err.downcast_ref::<SupabaseApiError>() {
            if api_error.is_unique_violation() {
                return StoreError::Duplicate(api_error.message.clone());
            }
            if api_error.is_not_found() {
                return StoreError::NotFound;
            }
        }
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}
