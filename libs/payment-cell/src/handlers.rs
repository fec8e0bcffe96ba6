// libs/payment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, State},
    http::{HeaderName, HeaderValue},
    Json,
};
use axum_extra::TypedHeader;
use headers::Header;
use serde_json::{json, Value};
use tracing::error;

use shared_models::auth::{User, UserRole};
use shared_models::error::AppError;

use crate::models::{PayForSessionRequest, RefundRequest, WebhookAck};
use crate::services::checkout::CheckoutService;
use crate::services::reconciler::PaymentReconciler;
use crate::services::refund::RefundService;

#[derive(Clone)]
pub struct PaymentState {
    pub checkout: Arc<CheckoutService>,
    pub refunds: Arc<RefundService>,
    pub reconciler: Arc<PaymentReconciler>,
}

static STRIPE_SIGNATURE: HeaderName = HeaderName::from_static("stripe-signature");

/// Raw `Stripe-Signature` header value.
#[derive(Debug, Clone)]
pub struct StripeSignature(pub String);

impl Header for StripeSignature {
    fn name() -> &'static HeaderName {
        &STRIPE_SIGNATURE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let value = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(StripeSignature(value.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

#[axum::debug_handler]
pub async fn pay_for_session(
    State(state): State<PaymentState>,
    Extension(user): Extension<User>,
    Json(request): Json<PayForSessionRequest>,
) -> Result<Json<Value>, AppError> {
    // Run to completion even if the client goes away, so a created intent
    // always ends up recorded or cancelled.
    let checkout = Arc::clone(&state.checkout);
    let payment = tokio::spawn(async move { checkout.pay_for_session(request, &user).await })
        .await
        .map_err(|e| {
            error!("Checkout task failed: {}", e);
            AppError::Internal("Checkout task failed".to_string())
        })??;

    Ok(Json(json!({
        "success": true,
        "payment": payment,
        "message": "Payment initiated"
    })))
}

#[axum::debug_handler]
pub async fn request_refund(
    State(state): State<PaymentState>,
    Extension(user): Extension<User>,
    Json(request): Json<RefundRequest>,
) -> Result<Json<Value>, AppError> {
    if !user.is_admin() && !user.has_role(UserRole::Doctor) {
        return Err(AppError::Forbidden("Only clinic staff can issue refunds".to_string()));
    }

    let refund = state.refunds.request_refund(request).await?;

    Ok(Json(json!({
        "success": true,
        "refund": refund,
    })))
}

#[axum::debug_handler]
pub async fn handle_webhook(
    State(state): State<PaymentState>,
    signature: Option<TypedHeader<StripeSignature>>,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    let Some(TypedHeader(StripeSignature(signature))) = signature else {
        return Err(AppError::BadRequest("Missing Stripe-Signature header".to_string()));
    };

    let outcome = state.reconciler.handle_webhook(&body, &signature).await?;

    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}
