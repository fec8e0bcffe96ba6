use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use billing_cell::models::{Billing, BillingStatus, Payment, PaymentMethod, PaymentStatus};
use billing_cell::router::billing_routes;
use billing_cell::services::ledger::BillingLedgerService;
use billing_cell::store::{BillingStore, InMemoryBillingStore};
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};

async fn get(app: axum::Router, uri: &str, bearer: Option<String>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);
    if let Some(bearer) = bearer {
        request = request.header("authorization", bearer);
    }

    let response = app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn patient_sees_derived_totals_for_own_billing() {
    let config = TestConfig::default();
    let patient = TestUser::patient("patient@example.com");
    let store = Arc::new(InMemoryBillingStore::new());

    let billing = Billing::new_pending(Uuid::new_v4(), patient.uuid(), Utc::now());
    store.insert_billing(billing.clone()).await.unwrap();
    let payment = Payment::pending(billing.id, Decimal::new(7_500, 2), "usd", PaymentMethod::Card, "pi_view", Utc::now());
    store.insert_payment(&payment).await.unwrap();
    store
        .transition_payment("pi_view", PaymentStatus::Pending, PaymentStatus::Success, Utc::now())
        .await
        .unwrap();

    let app = billing_routes(config.to_arc(), Arc::new(BillingLedgerService::new(store)));
    let (status, body) = get(
        app,
        &format!("/appointments/{}", billing.appointment_id),
        Some(JwtTestUtils::bearer(&patient, &config.jwt_secret)),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["billing"]["total_cost"], "75.00");
    assert_eq!(body["billing"]["is_paid"], true);
    assert_eq!(body["billing"]["payments"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn other_patients_are_forbidden() {
    let config = TestConfig::default();
    let store = Arc::new(InMemoryBillingStore::new());
    let billing = Billing::new_pending(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
    store.insert_billing(billing.clone()).await.unwrap();

    let stranger = TestUser::patient("someone@example.com");
    let app = billing_routes(config.to_arc(), Arc::new(BillingLedgerService::new(store)));
    let (status, body) = get(
        app,
        &format!("/appointments/{}", billing.appointment_id),
        Some(JwtTestUtils::bearer(&stranger, &config.jwt_secret)),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["source"], "authorization");
}

#[tokio::test]
async fn forbidden_read_does_not_settle_billing() {
    let config = TestConfig::default();
    let store = Arc::new(InMemoryBillingStore::new());
    let billing = Billing::new_pending(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
    store.insert_billing(billing.clone()).await.unwrap();
    let payment = Payment::pending(billing.id, Decimal::new(7_500, 2), "usd", PaymentMethod::Card, "pi_other", Utc::now());
    store.insert_payment(&payment).await.unwrap();
    store
        .transition_payment("pi_other", PaymentStatus::Pending, PaymentStatus::Success, Utc::now())
        .await
        .unwrap();

    let stranger = TestUser::patient("someone@example.com");
    let app = billing_routes(config.to_arc(), Arc::new(BillingLedgerService::new(store.clone())));
    let (status, _) = get(
        app,
        &format!("/appointments/{}", billing.appointment_id),
        Some(JwtTestUtils::bearer(&stranger, &config.jwt_secret)),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    let stored = store.find_by_appointment(billing.appointment_id).await.unwrap().unwrap();
    assert_eq!(stored.status, BillingStatus::Pending);
}

#[tokio::test]
async fn unknown_appointment_is_not_found_and_token_is_required() {
    let config = TestConfig::default();
    let store = Arc::new(InMemoryBillingStore::new());
    let app = billing_routes(config.to_arc(), Arc::new(BillingLedgerService::new(store)));
    let admin = TestUser::admin("admin@example.com");

    let uri = format!("/appointments/{}", Uuid::new_v4());
    let (status, body) = get(app.clone(), &uri, Some(JwtTestUtils::bearer(&admin, &config.jwt_secret))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["source"], "not_found");

    let (status, _) = get(app, &uri, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
