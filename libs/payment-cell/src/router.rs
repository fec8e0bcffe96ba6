// libs/payment-cell/src/router.rs
use std::sync::Arc;

use axum::{middleware, routing::post, Router};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers::{self, PaymentState};

pub fn payment_routes(config: Arc<AppConfig>, state: PaymentState) -> Router {
    let protected = Router::new()
        .route("/checkout", post(handlers::pay_for_session))
        .route("/refunds", post(handlers::request_refund))
        .layer(middleware::from_fn_with_state(config, auth_middleware));

    // The processor authenticates with the signature header, not a bearer token
    let public = Router::new().route("/webhook", post(handlers::handle_webhook));

    Router::new()
        .merge(protected)
        .merge(public)
        .with_state(state)
}
