//! Provider adapters. Each one turns its provider's wire format into the
//! normalized [`PaymentSignal`] the reconciliation engine consumes, and never
//! touches orders or intents itself.

pub mod mpesa;
pub mod paypal;
pub mod signature;
pub mod stripe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::entities::payment_intent::{IntentStatus, PaymentProvider};
use crate::errors::ServiceError;

pub use mpesa::MpesaGateway;
pub use paypal::PaypalGateway;
pub use stripe::StripeGateway;

/// What an adapter needs to start a payment.
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    /// Local intent id, doubles as the provider idempotency key
    pub intent_id: Uuid,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub customer_email: Option<String>,
    /// Required for M-Pesa
    pub phone_number: Option<String>,
    pub description: String,
}

/// The provider accepted the request and gave us something to correlate on.
#[derive(Debug, Clone)]
pub struct InitiatedPayment {
    pub correlation_id: String,
    pub secondary_reference: Option<String>,
    /// `Created` or `PendingConfirmation`
    pub status: IntentStatus,
    pub client_action: Value,
    pub raw: Value,
    /// How long the customer has to complete the payment
    pub expires_in: Duration,
}

/// Raw inbound callback, exactly as received.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SignalOutcome {
    Succeeded,
    Failed,
    /// Provider acknowledged but the customer has not finished
    Pending,
}

/// A provider-independent payment outcome, from a webhook or a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSignal {
    pub provider: PaymentProvider,
    pub correlation_id: String,
    pub event_type: String,
    pub provider_event_id: Option<String>,
    pub outcome: SignalOutcome,
    /// Amount the provider says was paid, in major units
    pub amount: Option<Decimal>,
    /// Receipt number, charge id or capture id
    pub provider_reference: Option<String>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

impl PaymentSignal {
    /// `provider:correlation:event_type:provider_event_id`
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.provider,
            self.correlation_id,
            self.event_type,
            self.provider_event_id.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCallback {
    Signal(PaymentSignal),
    /// Authentic but irrelevant (e.g. `charge.refunded`); acknowledged and dropped
    Ignored { event_type: String },
}

/// Identifies a payment at the provider for polling.
#[derive(Debug, Clone)]
pub struct ProviderRef {
    pub correlation_id: String,
    pub secondary_reference: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiatedPayment, ServiceError>;

    /// Authenticates and parses a callback. Unauthentic requests fail with
    /// `InvalidSignature`, unparseable ones with `MalformedPayload`.
    async fn parse_callback(&self, request: &CallbackRequest)
        -> Result<ParsedCallback, ServiceError>;

    /// Asks the provider for the current state of a payment.
    async fn verify(&self, reference: &ProviderRef) -> Result<PaymentSignal, ServiceError>;
}

/// Configured adapters keyed by provider. Providers without configuration
/// are simply absent.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<PaymentProvider, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.provider(), gateway);
    }

    pub fn with(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.register(gateway);
        self
    }

    pub fn get(&self, provider: PaymentProvider) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.gateways.get(&provider).cloned().ok_or_else(|| {
            ServiceError::ValidationError(format!("payment provider {} is not configured", provider))
        })
    }

    pub fn providers(&self) -> Vec<PaymentProvider> {
        self.gateways.keys().copied().collect()
    }

    /// Builds every adapter that has a config section.
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = http_client(Duration::from_secs(config.provider_timeout_secs))?;
        let mut registry = Self::new();
        if let Some(stripe) = &config.stripe {
            registry.register(Arc::new(StripeGateway::new(stripe.clone(), client.clone())));
        }
        if let Some(mpesa) = &config.mpesa {
            registry.register(Arc::new(MpesaGateway::new(mpesa.clone(), client.clone())));
        }
        if let Some(paypal) = &config.paypal {
            registry.register(Arc::new(PaypalGateway::new(paypal.clone(), client)));
        }
        if registry.gateways.is_empty() {
            warn!("No payment providers configured; payment initiation will be rejected");
        }
        Ok(registry)
    }
}

pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("storefront-payments/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ServiceError::ConfigurationError(format!("http client: {}", e)))
}

/// Network failures are transient; everything else about the transport is ours.
pub(crate) fn transport_error(provider: PaymentProvider, err: reqwest::Error) -> ServiceError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ServiceError::ProviderError(format!("{} unreachable: {}", provider, err))
    } else {
        ServiceError::ProviderError(format!("{} request failed: {}", provider, err))
    }
}

/// Reads a provider response: 2xx → JSON body; 5xx and 429 → retryable
/// `ProviderError`; auth failures → `ConfigurationError`; other 4xx →
/// `PaymentRejected` with the provider's message.
pub(crate) async fn read_json(
    provider: PaymentProvider,
    response: reqwest::Response,
) -> Result<Value, ServiceError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(provider, e))?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(|e| {
            ServiceError::ProviderError(format!("{} returned invalid JSON: {}", provider, e))
        });
    }

    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| provider_message(&v))
        .unwrap_or_else(|| body.chars().take(200).collect());

    if status.is_server_error() || status.as_u16() == 429 {
        Err(ServiceError::ProviderError(format!(
            "{} returned {}: {}",
            provider, status, message
        )))
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        Err(ServiceError::ConfigurationError(format!(
            "{} rejected credentials: {}",
            provider, message
        )))
    } else {
        Err(ServiceError::PaymentRejected(format!("{}: {}", provider, message)))
    }
}

fn provider_message(body: &Value) -> Option<String> {
    body.pointer("/error/message")
        .or_else(|| body.get("errorMessage"))
        .or_else(|| body.get("message"))
        .or_else(|| body.get("error_description"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// OAuth client-credentials token cache shared by M-Pesa and PayPal.
#[derive(Debug, Default)]
pub(crate) struct TokenCache {
    inner: Mutex<Option<(String, Instant)>>,
}

impl TokenCache {
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(String, Duration), ServiceError>>,
    {
        let mut guard = self.inner.lock().await;
        if let Some((token, expires)) = guard.as_ref() {
            if Instant::now() < *expires {
                return Ok(token.clone());
            }
        }
        let (token, ttl) = fetch().await?;
        // Refresh a minute early
        let ttl = ttl.saturating_sub(Duration::from_secs(60));
        *guard = Some((token.clone(), Instant::now() + ttl));
        Ok(token)
    }
}

/// Reads an amount that providers send either as a JSON number or a string.
pub(crate) fn decimal_from_json(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn dedupe_key_includes_every_part() {
        let signal = PaymentSignal {
            provider: PaymentProvider::Stripe,
            correlation_id: "pi_1".into(),
            event_type: "payment_intent.succeeded".into(),
            provider_event_id: Some("evt_9".into()),
            outcome: SignalOutcome::Succeeded,
            amount: None,
            provider_reference: None,
            failure_reason: None,
            raw: Value::Null,
        };
        assert_eq!(
            signal.dedupe_key(),
            "stripe:pi_1:payment_intent.succeeded:evt_9"
        );
    }

    #[test]
    fn decimal_from_number_or_string() {
        assert_eq!(decimal_from_json(&json!(33)), Some(dec!(33)));
        assert_eq!(decimal_from_json(&json!("33.50")), Some(dec!(33.50)));
        assert_eq!(decimal_from_json(&json!(null)), None);
    }

    #[test]
    fn missing_provider_is_a_validation_error() {
        let registry = GatewayRegistry::new();
        assert!(matches!(
            registry.get(PaymentProvider::Mpesa),
            Err(ServiceError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn token_cache_reuses_fresh_token() {
        let cache = TokenCache::default();
        let first = cache
            .get_or_fetch(|| async { Ok(("t1".to_string(), Duration::from_secs(3600))) })
            .await
            .unwrap();
        let second = cache
            .get_or_fetch(|| async { Ok(("t2".to_string(), Duration::from_secs(3600))) })
            .await
            .unwrap();
        assert_eq!(first, "t1");
        assert_eq!(second, "t1");
    }
}
