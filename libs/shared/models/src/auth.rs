use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<i64>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub app_metadata: Option<serde_json::Value>,
    pub user_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<i64>,
}

impl JwtClaims {
    /// Clinic role: `app_metadata.role` wins over the top-level claim, which
    /// Supabase sets to `authenticated` for every signed-in user.
    pub fn clinic_role(&self) -> Option<String> {
        self.app_metadata
            .as_ref()
            .and_then(|meta| meta.get("role"))
            .and_then(|role| role.as_str())
            .map(str::to_string)
            .or_else(|| self.role.clone())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Patient,
    Doctor,
    Admin,
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Patient => write!(f, "patient"),
            UserRole::Doctor => write!(f, "doctor"),
            UserRole::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "patient" => Ok(UserRole::Patient),
            "doctor" => Ok(UserRole::Doctor),
            "admin" => Ok(UserRole::Admin),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

/// Already-authenticated caller, placed in request extensions by the auth
/// middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn user_role(&self) -> Option<UserRole> {
        self.role.as_deref().and_then(|role| role.parse().ok())
    }

    pub fn has_role(&self, role: UserRole) -> bool {
        self.user_role() == Some(role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(UserRole::Admin)
    }

    /// True when the caller is the owner of `id`.
    pub fn is(&self, id: Uuid) -> bool {
        self.id == id.to_string()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.id).ok()
    }
}

/// Entry resolved from the user directory collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectoryUser {
    pub id: Uuid,
    pub full_name: String,
    pub role: UserRole,
}
