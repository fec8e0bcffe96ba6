pub mod error;
pub mod supabase;

pub use error::{StoreError, SupabaseApiError};
pub use supabase::SupabaseClient;
