use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::signature::verify_timestamped_signature;
use super::{
    read_json, transport_error, CallbackRequest, InitiateRequest, InitiatedPayment,
    ParsedCallback, PaymentGateway, PaymentSignal, ProviderRef, SignalOutcome,
};
use crate::config::StripeConfig;
use crate::entities::payment_intent::{IntentStatus, PaymentProvider};
use crate::errors::ServiceError;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

const EVENT_SUCCEEDED: &str = "payment_intent.succeeded";
const EVENT_FAILED: &str = "payment_intent.payment_failed";

/// Stripe PaymentIntents.
pub struct StripeGateway {
    config: StripeConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripePaymentIntent,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    latest_charge: Option<String>,
    #[serde(default)]
    last_payment_error: Option<StripeError>,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

impl StripeError {
    fn describe(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.code.clone())
            .unwrap_or_else(|| "payment failed".to_string())
    }
}

/// Major units to Stripe's smallest currency unit.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("amount {} out of range", amount)))
}

pub fn from_minor_units(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

impl StripeGateway {
    pub fn new(config: StripeConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn signal_from_intent(
        intent: StripePaymentIntent,
        event_type: String,
        provider_event_id: Option<String>,
        outcome: SignalOutcome,
        raw: Value,
    ) -> PaymentSignal {
        PaymentSignal {
            provider: PaymentProvider::Stripe,
            correlation_id: intent.id,
            event_type,
            provider_event_id,
            outcome,
            amount: intent
                .amount_received
                .filter(|a| *a > 0)
                .or(intent.amount)
                .map(from_minor_units),
            provider_reference: intent.latest_charge,
            failure_reason: intent.last_payment_error.map(|e| e.describe()),
            raw,
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    #[instrument(skip(self, request), fields(intent_id = %request.intent_id, order_id = %request.order_id))]
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiatedPayment, ServiceError> {
        let amount = to_minor_units(request.amount)?;
        let intent_id = request.intent_id.to_string();
        let order_id = request.order_id.to_string();
        let currency = request.currency.to_lowercase();
        let amount = amount.to_string();

        let mut form: Vec<(&str, &str)> = vec![
            ("amount", amount.as_str()),
            ("currency", currency.as_str()),
            ("description", request.description.as_str()),
            ("metadata[order_id]", order_id.as_str()),
            ("metadata[intent_id]", intent_id.as_str()),
            ("automatic_payment_methods[enabled]", "true"),
        ];
        if let Some(email) = request.customer_email.as_deref() {
            form.push(("receipt_email", email));
        }

        let response = self
            .client
            .post(self.url("/v1/payment_intents"))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", intent_id.as_str())
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error(PaymentProvider::Stripe, e))?;

        let raw = read_json(PaymentProvider::Stripe, response).await?;
        let created: StripePaymentIntent = serde_json::from_value(raw.clone()).map_err(|e| {
            ServiceError::ProviderError(format!("unexpected stripe response: {}", e))
        })?;

        debug!(payment_intent = %created.id, "Stripe payment intent created");

        Ok(InitiatedPayment {
            correlation_id: created.id.clone(),
            secondary_reference: None,
            status: IntentStatus::Created,
            client_action: json!({
                "type": "stripe_client_secret",
                "payment_intent_id": created.id,
                "client_secret": created.client_secret,
            }),
            raw,
            expires_in: Duration::from_secs(self.config.confirmation_timeout_secs),
        })
    }

    async fn parse_callback(
        &self,
        request: &CallbackRequest,
    ) -> Result<ParsedCallback, ServiceError> {
        let header = request
            .headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());

        verify_timestamped_signature(
            header,
            &request.body,
            &self.config.webhook_secret,
            self.config.webhook_tolerance_secs,
            Utc::now().timestamp(),
        )
        .map_err(|e| {
            warn!("Stripe webhook signature verification failed: {}", e);
            ServiceError::InvalidSignature(e.to_string())
        })?;

        let raw: Value = serde_json::from_slice(&request.body)
            .map_err(|e| ServiceError::MalformedPayload(format!("invalid json: {}", e)))?;

        let event_type = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let outcome = match event_type.as_str() {
            EVENT_SUCCEEDED => SignalOutcome::Succeeded,
            EVENT_FAILED => SignalOutcome::Failed,
            _ => return Ok(ParsedCallback::Ignored { event_type }),
        };

        let event: StripeEvent = serde_json::from_value(raw.clone())
            .map_err(|e| ServiceError::MalformedPayload(format!("unexpected event shape: {}", e)))?;

        Ok(ParsedCallback::Signal(Self::signal_from_intent(
            event.data.object,
            event.event_type,
            Some(event.id),
            outcome,
            raw,
        )))
    }

    #[instrument(skip(self), fields(payment_intent = %reference.correlation_id))]
    async fn verify(&self, reference: &ProviderRef) -> Result<PaymentSignal, ServiceError> {
        let response = self
            .client
            .get(self.url(&format!(
                "/v1/payment_intents/{}",
                reference.correlation_id
            )))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| transport_error(PaymentProvider::Stripe, e))?;

        let raw = read_json(PaymentProvider::Stripe, response).await?;
        let intent: StripePaymentIntent = serde_json::from_value(raw.clone()).map_err(|e| {
            ServiceError::ProviderError(format!("unexpected stripe response: {}", e))
        })?;

        let status = intent.status.clone().unwrap_or_default();
        let outcome = match status.as_str() {
            "succeeded" => SignalOutcome::Succeeded,
            "canceled" => SignalOutcome::Failed,
            "requires_payment_method" if intent.last_payment_error.is_some() => {
                SignalOutcome::Failed
            }
            _ => SignalOutcome::Pending,
        };

        Ok(Self::signal_from_intent(
            intent,
            format!("poll.{}", status),
            None,
            outcome,
            raw,
        ))
    }
}
