use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use shared_database::SupabaseClient;
use shared_models::auth::DirectoryUser;

use crate::models::AppointmentError;

/// Read-only view of the identity/profile collaborator.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<DirectoryUser>, AppointmentError>;
}

pub struct SupabaseUserDirectory {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseUserDirectory {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

#[async_trait]
impl UserDirectory for SupabaseUserDirectory {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<DirectoryUser>, AppointmentError> {
        debug!("Resolving user {} from profiles", id);

        let path = format!("/rest/v1/profiles?id=eq.{}&select=id,full_name,role", id);
        let rows: Vec<DirectoryUser> = self.supabase
            .request(Method::GET, &path, Some(self.supabase.service_token()), None)
            .await
            .map_err(|e| AppointmentError::DirectoryError(e.to_string()))?;

        Ok(rows.into_iter().next())
    }
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<Uuid, DirectoryUser>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: DirectoryUser) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn remove(&self, id: Uuid) {
        self.users.write().await.remove(&id);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<DirectoryUser>, AppointmentError> {
        Ok(self.users.read().await.get(&id).cloned())
    }
}
