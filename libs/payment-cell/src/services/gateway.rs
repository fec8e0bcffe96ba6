use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error, info};

use shared_config::AppConfig;
use shared_utils::clock::Clock;

use crate::models::{GatewayEvent, GatewayRefund, PaymentError, PaymentIntent};
use crate::services::webhook::{parse_event, verify_signature};

/// Converts a major-unit amount to the processor's minor units, truncating
/// anything past two decimal places.
pub fn to_minor_units(amount: Decimal) -> Result<i64, PaymentError> {
    (amount * Decimal::ONE_HUNDRED)
        .trunc()
        .to_i64()
        .ok_or_else(|| PaymentError::ValidationError(format!("Amount {} is out of range", amount)))
}

pub fn from_minor_units(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

/// Outbound seam to the card processor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a manual-capture intent for `amount` (major units).
    async fn create_payment_intent(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentIntent, PaymentError>;

    async fn cancel_payment_intent(&self, payment_intent_id: &str) -> Result<(), PaymentError>;

    fn verify_and_parse_event(
        &self,
        payload: &[u8],
        signature_header: &str,
        webhook_secret: &str,
    ) -> Result<GatewayEvent, PaymentError>;

    async fn request_refund(
        &self,
        payment_intent_id: &str,
        reason: Option<String>,
    ) -> Result<GatewayRefund, PaymentError>;
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    code: Option<String>,
}

/// Stripe REST client using form-encoded requests and bearer auth.
pub struct StripeGateway {
    client: Client,
    api_base_url: String,
    secret_key: String,
    webhook_tolerance_seconds: i64,
    clock: Arc<dyn Clock>,
}

impl StripeGateway {
    pub fn new(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            client: Client::new(),
            api_base_url: config.stripe_api_base_url.trim_end_matches('/').to_string(),
            secret_key: config.stripe_secret_key.clone(),
            webhook_tolerance_seconds: config.stripe_webhook_tolerance_seconds,
            clock,
        }
    }

    async fn post_form<T>(&self, path: &str, params: &[(String, String)]) -> Result<T, PaymentError>
    where
        T: DeserializeOwned,
    {
        if self.secret_key.is_empty() {
            return Err(PaymentError::GatewayError("Stripe secret key is not configured".to_string()));
        }

        let url = format!("{}{}", self.api_base_url, path);
        debug!("Making POST request to {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(params)
            .send()
            .await
            .map_err(|e| PaymentError::GatewayError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Stripe error ({}): {}", status, body);

            let message = serde_json::from_str::<StripeErrorBody>(&body)
                .ok()
                .and_then(|parsed| parsed.error.message.or(parsed.error.code))
                .unwrap_or_else(|| format!("Stripe request failed with status {}", status));
            return Err(PaymentError::GatewayError(message));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| PaymentError::GatewayError(format!("Unexpected Stripe response: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_payment_intent(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentIntent, PaymentError> {
        let minor_units = to_minor_units(amount)?;

        let mut params = vec![
            ("amount".to_string(), minor_units.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            ("capture_method".to_string(), "manual".to_string()),
            ("setup_future_usage".to_string(), "off_session".to_string()),
        ];
        params.extend(
            metadata
                .into_iter()
                .map(|(key, value)| (format!("metadata[{}]", key), value)),
        );

        let intent: PaymentIntent = self.post_form("/v1/payment_intents", &params).await?;
        info!("Created payment intent {} for {} {}", intent.id, minor_units, currency);
        Ok(intent)
    }

    async fn cancel_payment_intent(&self, payment_intent_id: &str) -> Result<(), PaymentError> {
        let path = format!("/v1/payment_intents/{}/cancel", payment_intent_id);
        let _: serde_json::Value = self.post_form(&path, &[]).await?;

        info!("Cancelled payment intent {}", payment_intent_id);
        Ok(())
    }

    fn verify_and_parse_event(
        &self,
        payload: &[u8],
        signature_header: &str,
        webhook_secret: &str,
    ) -> Result<GatewayEvent, PaymentError> {
        verify_signature(
            payload,
            signature_header,
            webhook_secret,
            self.clock.now(),
            self.webhook_tolerance_seconds,
        )?;
        parse_event(payload)
    }

    async fn request_refund(
        &self,
        payment_intent_id: &str,
        reason: Option<String>,
    ) -> Result<GatewayRefund, PaymentError> {
        let mut params = vec![
            ("payment_intent".to_string(), payment_intent_id.to_string()),
            ("reason".to_string(), "requested_by_customer".to_string()),
        ];
        if let Some(reason) = reason {
            params.push(("metadata[reason]".to_string(), reason));
        }

        let refund: GatewayRefund = self.post_form("/v1/refunds", &params).await?;
        info!("Refund {} for intent {} is {}", refund.id, payment_intent_id, refund.status);
        Ok(refund)
    }
}
