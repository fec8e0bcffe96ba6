use std::sync::Arc;

use axum::{routing::get, Router};
use tracing::{info, warn};

use appointment_cell::router::appointment_routes;
use appointment_cell::services::booking::AppointmentBookingService;
use appointment_cell::services::directory::{InMemoryUserDirectory, SupabaseUserDirectory, UserDirectory};
use appointment_cell::services::store::{AppointmentStore, InMemoryAppointmentStore, SupabaseAppointmentStore};
use billing_cell::router::billing_routes;
use billing_cell::services::ledger::BillingLedgerService;
use billing_cell::store::{BillingStore, InMemoryBillingStore, SupabaseBillingStore};
use payment_cell::handlers::PaymentState;
use payment_cell::router::payment_routes;
use payment_cell::services::checkout::CheckoutService;
use payment_cell::services::gateway::{PaymentGateway, StripeGateway};
use payment_cell::services::reconciler::PaymentReconciler;
use payment_cell::services::refund::RefundService;
use shared_config::AppConfig;
use shared_database::SupabaseClient;
use shared_utils::clock::Clock;

struct Stores {
    appointments: Arc<dyn AppointmentStore>,
    billing: Arc<dyn BillingStore>,
    directory: Arc<dyn UserDirectory>,
}

fn build_stores(config: &AppConfig) -> Stores {
    if config.is_configured() {
        info!("Using Supabase-backed stores");
        let supabase = Arc::new(SupabaseClient::new(config));
        return Stores {
            appointments: Arc::new(SupabaseAppointmentStore::new(Arc::clone(&supabase))),
            billing: Arc::new(SupabaseBillingStore::new(Arc::clone(&supabase))),
            directory: Arc::new(SupabaseUserDirectory::new(supabase)),
        };
    }

    warn!("Supabase not configured, falling back to in-memory stores (local development only)");
    let billing = Arc::new(InMemoryBillingStore::new());
    Stores {
        appointments: Arc::new(InMemoryAppointmentStore::new(Arc::clone(&billing))),
        billing,
        directory: Arc::new(InMemoryUserDirectory::new()),
    }
}

pub fn create_router(config: Arc<AppConfig>, clock: Arc<dyn Clock>) -> Router {
    let stores = build_stores(&config);

    let booking = Arc::new(AppointmentBookingService::new(
        stores.appointments,
        stores.directory,
        Arc::clone(&clock),
    ));
    let ledger = Arc::new(BillingLedgerService::new(Arc::clone(&stores.billing)));

    let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(&config, Arc::clone(&clock)));
    let payments = PaymentState {
        checkout: Arc::new(CheckoutService::new(
            Arc::clone(&gateway),
            Arc::clone(&stores.billing),
            Arc::clone(&clock),
        )),
        refunds: Arc::new(RefundService::new(
            Arc::clone(&gateway),
            Arc::clone(&ledger),
            Arc::clone(&clock),
        )),
        reconciler: Arc::new(PaymentReconciler::new(
            gateway,
            stores.billing,
            clock,
            config.stripe_webhook_secret.clone(),
        )),
    };

    Router::new()
        .route("/", get(|| async { "Clinic API is running!" }))
        .nest("/appointments", appointment_routes(Arc::clone(&config), booking))
        .nest("/billing", billing_routes(Arc::clone(&config), ledger))
        .nest("/payments", payment_routes(config, payments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use shared_utils::clock::SystemClock;
    use shared_utils::test_utils::TestConfig;

    fn unconfigured() -> Arc<AppConfig> {
        let mut config = TestConfig::default();
        config.supabase_url = String::new();
        config.to_arc()
    }

    #[tokio::test]
    async fn root_responds() {
        let app = create_router(unconfigured(), Arc::new(SystemClock));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cells_are_mounted_behind_auth() {
        let app = create_router(unconfigured(), Arc::new(SystemClock));

        for uri in ["/appointments", "/billing/appointments/00000000-0000-0000-0000-000000000000"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/payments/webhook")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
