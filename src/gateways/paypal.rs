use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::signature::shared_token_matches;
use super::{
    decimal_from_json, read_json, transport_error, CallbackRequest, InitiateRequest,
    InitiatedPayment, ParsedCallback, PaymentGateway, PaymentSignal, ProviderRef, SignalOutcome,
    TokenCache,
};
use crate::config::PaypalConfig;
use crate::entities::payment_intent::{IntentStatus, PaymentProvider};
use crate::errors::ServiceError;

pub const WEBHOOK_TOKEN_HEADER: &str = "x-webhook-token";

/// Headers PayPal signs webhook deliveries with, as named by the verification API.
const TRANSMISSION_HEADERS: [(&str, &str); 5] = [
    ("auth_algo", "paypal-auth-algo"),
    ("cert_url", "paypal-cert-url"),
    ("transmission_id", "paypal-transmission-id"),
    ("transmission_sig", "paypal-transmission-sig"),
    ("transmission_time", "paypal-transmission-time"),
];

/// PayPal Checkout, Orders v2.
pub struct PaypalGateway {
    config: PaypalConfig,
    client: reqwest::Client,
    token: TokenCache,
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Turns a PayPal order body (from GET or capture) into an outcome.
fn order_signal(correlation_id: &str, order: Value, event_type: String) -> PaymentSignal {
    let status = str_at(&order, "/status").unwrap_or_default().to_string();
    let capture = order.pointer("/purchase_units/0/payments/captures/0").cloned();
    let capture_status = capture
        .as_ref()
        .and_then(|c| str_at(c, "/status"))
        .unwrap_or_default()
        .to_string();

    let outcome = match (status.as_str(), capture_status.as_str()) {
        (_, "DECLINED") | (_, "FAILED") | ("VOIDED", _) => SignalOutcome::Failed,
        ("COMPLETED", _) => SignalOutcome::Succeeded,
        _ => SignalOutcome::Pending,
    };

    let amount = capture
        .as_ref()
        .and_then(|c| c.pointer("/amount/value"))
        .or_else(|| order.pointer("/purchase_units/0/amount/value"))
        .and_then(decimal_from_json);

    PaymentSignal {
        provider: PaymentProvider::Paypal,
        correlation_id: correlation_id.to_string(),
        event_type,
        provider_event_id: None,
        outcome,
        amount,
        provider_reference: capture
            .as_ref()
            .and_then(|c| str_at(c, "/id"))
            .map(str::to_string),
        failure_reason: (outcome == SignalOutcome::Failed)
            .then(|| format!("paypal order {} capture {}", status, capture_status)),
        raw: order,
    }
}

impl PaypalGateway {
    pub fn new(config: PaypalConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            token: TokenCache::default(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, ServiceError> {
        self.token
            .get_or_fetch(|| async {
                let response = self
                    .client
                    .post(self.url("/v1/oauth2/token"))
                    .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                    .form(&[("grant_type", "client_credentials")])
                    .send()
                    .await
                    .map_err(|e| transport_error(PaymentProvider::Paypal, e))?;
                let body = read_json(PaymentProvider::Paypal, response).await?;
                let token = str_at(&body, "/access_token")
                    .ok_or_else(|| {
                        ServiceError::ProviderError("paypal token response without access_token".into())
                    })?
                    .to_string();
                let ttl = body.get("expires_in").and_then(Value::as_u64).unwrap_or(3600);
                Ok((token, Duration::from_secs(ttl)))
            })
            .await
    }

    async fn get_order(&self, paypal_order_id: &str) -> Result<Value, ServiceError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.url(&format!("/v2/checkout/orders/{}", paypal_order_id)))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(PaymentProvider::Paypal, e))?;
        read_json(PaymentProvider::Paypal, response).await
    }

    async fn capture_order(&self, paypal_order_id: &str) -> Result<Value, ServiceError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url(&format!("/v2/checkout/orders/{}/capture", paypal_order_id)))
            .bearer_auth(token)
            .header("PayPal-Request-Id", format!("capture-{}", paypal_order_id))
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| transport_error(PaymentProvider::Paypal, e))?;
        read_json(PaymentProvider::Paypal, response).await
    }

    /// Asks PayPal whether the delivery was signed by them for our webhook id.
    async fn verify_webhook_signature(
        &self,
        webhook_id: &str,
        request: &CallbackRequest,
        event: &Value,
    ) -> Result<(), ServiceError> {
        let mut body = serde_json::Map::new();
        for (field, header) in TRANSMISSION_HEADERS {
            let value = request
                .headers
                .get(header)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ServiceError::InvalidSignature(format!("missing {}", header)))?;
            body.insert(field.to_string(), Value::String(value.to_string()));
        }
        body.insert("webhook_id".into(), Value::String(webhook_id.to_string()));
        body.insert("webhook_event".into(), event.clone());

        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url("/v1/notifications/verify-webhook-signature"))
            .bearer_auth(token)
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| transport_error(PaymentProvider::Paypal, e))?;
        let result = read_json(PaymentProvider::Paypal, response).await?;

        match str_at(&result, "/verification_status") {
            Some("SUCCESS") => Ok(()),
            other => {
                warn!(status = ?other, "PayPal webhook signature verification failed");
                Err(ServiceError::InvalidSignature(
                    "paypal signature verification failed".into(),
                ))
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for PaypalGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Paypal
    }

    #[instrument(skip(self, request), fields(intent_id = %request.intent_id, order_id = %request.order_id))]
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiatedPayment, ServiceError> {
        let token = self.access_token().await?;
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_id.to_string(),
                "custom_id": request.intent_id.to_string(),
                "description": request.description,
                "amount": {
                    "currency_code": request.currency.to_uppercase(),
                    "value": format!("{:.2}", request.amount),
                },
            }],
            "application_context": {
                "return_url": self.config.return_url,
                "cancel_url": self.config.cancel_url,
                "user_action": "PAY_NOW",
            },
        });

        let response = self
            .client
            .post(self.url("/v2/checkout/orders"))
            .bearer_auth(token)
            .header("PayPal-Request-Id", request.intent_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(PaymentProvider::Paypal, e))?;

        let raw = read_json(PaymentProvider::Paypal, response).await?;
        let paypal_order_id = str_at(&raw, "/id")
            .ok_or_else(|| ServiceError::ProviderError("paypal order response without id".into()))?
            .to_string();
        let approval_url = raw
            .get("links")
            .and_then(Value::as_array)
            .and_then(|links| {
                links.iter().find(|l| {
                    matches!(str_at(l, "/rel"), Some("approve") | Some("payer-action"))
                })
            })
            .and_then(|l| str_at(l, "/href"))
            .map(str::to_string);

        debug!(paypal_order_id = %paypal_order_id, "PayPal order created");

        Ok(InitiatedPayment {
            correlation_id: paypal_order_id.clone(),
            secondary_reference: None,
            status: IntentStatus::Created,
            client_action: json!({
                "type": "paypal_approval",
                "paypal_order_id": paypal_order_id,
                "approval_url": approval_url,
            }),
            raw,
            expires_in: Duration::from_secs(self.config.approval_timeout_secs),
        })
    }

    async fn parse_callback(
        &self,
        request: &CallbackRequest,
    ) -> Result<ParsedCallback, ServiceError> {
        let raw: Value = serde_json::from_slice(&request.body)
            .map_err(|e| ServiceError::MalformedPayload(format!("invalid json: {}", e)))?;

        if let Some(webhook_id) = self.config.webhook_id.as_deref() {
            self.verify_webhook_signature(webhook_id, request, &raw).await?;
        } else if let Some(expected) = self.config.webhook_token.as_deref() {
            if !shared_token_matches(
                &request.headers,
                WEBHOOK_TOKEN_HEADER,
                request.query.as_deref(),
                expected,
            ) {
                warn!("PayPal webhook token mismatch");
                return Err(ServiceError::InvalidSignature("webhook token mismatch".into()));
            }
        }

        let event_type = str_at(&raw, "/event_type").unwrap_or_default().to_string();
        let resource = raw
            .get("resource")
            .ok_or_else(|| ServiceError::MalformedPayload("webhook without resource".into()))?;
        let resource_id = str_at(resource, "/id")
            .ok_or_else(|| ServiceError::MalformedPayload("resource without id".into()))?;
        let status = str_at(resource, "/status").unwrap_or_default();

        let outcome = match (event_type.as_str(), status) {
            (_, "COMPLETED") => SignalOutcome::Succeeded,
            ("PAYMENT.CAPTURE.DENIED", _) | ("PAYMENT.CAPTURE.DECLINED", _) => {
                SignalOutcome::Failed
            }
            (_, "DENIED") | (_, "DECLINED") | (_, "VOIDED") => SignalOutcome::Failed,
            ("CHECKOUT.ORDER.APPROVED", _) => SignalOutcome::Pending,
            _ => return Ok(ParsedCallback::Ignored { event_type }),
        };

        // Capture events carry the capture id; the order id sits in related_ids
        let is_capture = event_type.starts_with("PAYMENT.CAPTURE.");
        let correlation_id = str_at(resource, "/supplementary_data/related_ids/order_id")
            .unwrap_or(resource_id)
            .to_string();
        let provider_reference = if is_capture {
            Some(resource_id.to_string())
        } else {
            str_at(resource, "/purchase_units/0/payments/captures/0/id").map(str::to_string)
        };
        let amount = resource
            .pointer("/amount/value")
            .or_else(|| resource.pointer("/purchase_units/0/amount/value"))
            .and_then(decimal_from_json);

        Ok(ParsedCallback::Signal(PaymentSignal {
            provider: PaymentProvider::Paypal,
            correlation_id,
            provider_event_id: str_at(&raw, "/id").map(str::to_string),
            outcome,
            amount,
            provider_reference,
            failure_reason: (outcome == SignalOutcome::Failed)
                .then(|| format!("{} ({})", event_type, status)),
            event_type,
            raw,
        }))
    }

    #[instrument(skip(self), fields(paypal_order_id = %reference.correlation_id))]
    async fn verify(&self, reference: &ProviderRef) -> Result<PaymentSignal, ServiceError> {
        let order = self.get_order(&reference.correlation_id).await?;
        let status = str_at(&order, "/status").unwrap_or_default().to_string();

        if status != "APPROVED" {
            return Ok(order_signal(
                &reference.correlation_id,
                order,
                format!("poll.{}", status.to_lowercase()),
            ));
        }

        // Buyer approved but nobody captured yet
        match self.capture_order(&reference.correlation_id).await {
            Ok(captured) => Ok(order_signal(
                &reference.correlation_id,
                captured,
                "poll.captured".to_string(),
            )),
            Err(ServiceError::PaymentRejected(reason)) => {
                // Typically ORDER_ALREADY_CAPTURED from a concurrent capture
                debug!(%reason, "Capture rejected, re-reading order");
                let order = self.get_order(&reference.correlation_id).await?;
                let status = str_at(&order, "/status").unwrap_or_default().to_lowercase();
                Ok(order_signal(
                    &reference.correlation_id,
                    order,
                    format!("poll.{}", status),
                ))
            }
            Err(e) => Err(e),
        }
    }
}
