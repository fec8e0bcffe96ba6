use std::env;
use tracing::warn;

pub const DEFAULT_STRIPE_API_BASE_URL: &str = "https://api.stripe.com";
pub const DEFAULT_WEBHOOK_TOLERANCE_SECONDS: i64 = 300;
pub const DEFAULT_API_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: String,
    pub supabase_jwt_secret: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_base_url: String,
    pub stripe_webhook_tolerance_seconds: i64,
    pub api_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY")
                .unwrap_or_else(|_| {
                    warn!("STRIPE_SECRET_KEY not set, using empty value");
                    String::new()
                }),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .unwrap_or_else(|_| {
                    warn!("STRIPE_WEBHOOK_SECRET not set, webhooks will be rejected");
                    String::new()
                }),
            stripe_api_base_url: env::var("STRIPE_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_STRIPE_API_BASE_URL.to_string()),
            stripe_webhook_tolerance_seconds: env::var("STRIPE_WEBHOOK_TOLERANCE_SECONDS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECONDS),
            api_port: env::var("API_PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(DEFAULT_API_PORT),
        };

        if !config.is_configured() {
            warn!("Database not configured - missing Supabase environment variables");
        }

        if !config.is_payments_configured() {
            warn!("Payments not configured - missing Stripe environment variables");
        }

        config
    }

    /// Whether the Supabase-backed stores can be used.
    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_service_role_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    pub fn is_payments_configured(&self) -> bool {
        !self.stripe_secret_key.is_empty()
            && !self.stripe_webhook_secret.is_empty()
            && !self.stripe_api_base_url.is_empty()
    }
}
