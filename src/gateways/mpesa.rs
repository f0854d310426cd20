use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::signature::shared_token_matches;
use super::{
    decimal_from_json, read_json, transport_error, CallbackRequest, InitiateRequest,
    InitiatedPayment, ParsedCallback, PaymentGateway, PaymentSignal, ProviderRef, SignalOutcome,
    TokenCache,
};
use crate::config::MpesaConfig;
use crate::entities::payment_intent::{IntentStatus, PaymentProvider};
use crate::errors::ServiceError;

pub const CALLBACK_TOKEN_HEADER: &str = "x-callback-token";

/// Daraja answers an STK query with this code while the customer is still deciding.
const STILL_PROCESSING: &str = "500.001.1001";

/// Daraja expects timestamps in Kenyan local time (UTC+3).
const EAT_OFFSET_SECS: i64 = 3 * 3600;

/// Safaricom Daraja STK Push.
pub struct MpesaGateway {
    config: MpesaConfig,
    client: reqwest::Client,
    token: TokenCache,
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    #[serde(rename = "Body")]
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    result_code: Value,
    #[serde(rename = "ResultDesc", default)]
    result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: Option<Value>,
}

impl CallbackMetadata {
    fn get(&self, name: &str) -> Option<&Value> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .and_then(|item| item.value.as_ref())
    }
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: Value,
    #[serde(rename = "ResponseDescription", default)]
    response_description: Option<String>,
    #[serde(rename = "CustomerMessage", default)]
    customer_message: Option<String>,
}

/// `ResultCode` arrives as a number in callbacks and as a string in queries.
fn result_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Normalizes Kenyan numbers (`07..`, `+2547..`, `2547..`) to `2547XXXXXXXX`.
pub fn normalize_msisdn(phone: &str) -> Result<String, ServiceError> {
    let digits: String = phone
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    let digits = digits.strip_prefix('+').unwrap_or(&digits);

    let normalized = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{}", rest)
    } else {
        digits.to_string()
    };

    if normalized.len() == 12
        && normalized.starts_with("254")
        && normalized.chars().all(|c| c.is_ascii_digit())
    {
        Ok(normalized)
    } else {
        Err(ServiceError::ValidationError(format!(
            "invalid M-Pesa phone number: {}",
            phone
        )))
    }
}

/// STK Push only takes whole units; fractions are rounded up so the order is covered.
pub fn whole_units(amount: Decimal) -> Result<i64, ServiceError> {
    amount
        .ceil()
        .to_i64()
        .filter(|a| *a > 0)
        .ok_or_else(|| ServiceError::ValidationError(format!("invalid M-Pesa amount {}", amount)))
}

pub fn timestamp(now: DateTime<Utc>) -> String {
    (now + chrono::Duration::seconds(EAT_OFFSET_SECS))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            token: TokenCache::default(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// base64(shortcode + passkey + timestamp)
    pub fn password(&self, timestamp: &str) -> String {
        BASE64.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }

    async fn access_token(&self) -> Result<String, ServiceError> {
        self.token
            .get_or_fetch(|| async {
                let response = self
                    .client
                    .get(self.url("/oauth/v1/generate?grant_type=client_credentials"))
                    .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
                    .send()
                    .await
                    .map_err(|e| transport_error(PaymentProvider::Mpesa, e))?;
                let body = read_json(PaymentProvider::Mpesa, response).await?;
                let token = body
                    .get("access_token")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ServiceError::ProviderError("mpesa token response without access_token".into())
                    })?
                    .to_string();
                let ttl = body
                    .get("expires_in")
                    .and_then(|v| result_code(v))
                    .unwrap_or(3599);
                Ok((token, Duration::from_secs(ttl.max(0) as u64)))
            })
            .await
    }
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Mpesa
    }

    #[instrument(skip(self, request), fields(intent_id = %request.intent_id, order_id = %request.order_id))]
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiatedPayment, ServiceError> {
        let phone = request
            .phone_number
            .as_deref()
            .ok_or_else(|| ServiceError::ValidationError("phone_number is required for M-Pesa".into()))
            .and_then(normalize_msisdn)?;
        let amount = whole_units(request.amount)?;
        let token = self.access_token().await?;
        let ts = timestamp(Utc::now());

        let body = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&ts),
            "Timestamp": ts,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": phone,
            "PartyB": self.config.shortcode,
            "PhoneNumber": phone,
            "CallBackURL": self.config.callback_url,
            "AccountReference": request.order_id.to_string(),
            "TransactionDesc": format!("Payment for order {}", request.order_id),
        });

        let response = self
            .client
            .post(self.url("/mpesa/stkpush/v1/processrequest"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(PaymentProvider::Mpesa, e))?;

        let raw = read_json(PaymentProvider::Mpesa, response).await?;
        let push: StkPushResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            ServiceError::ProviderError(format!("unexpected mpesa response: {}", e))
        })?;

        if result_code(&push.response_code) != Some(0) {
            return Err(ServiceError::PaymentRejected(
                push.response_description
                    .unwrap_or_else(|| "STK push rejected".to_string()),
            ));
        }

        debug!(
            merchant_request_id = %push.merchant_request_id,
            checkout_request_id = %push.checkout_request_id,
            "STK push accepted"
        );

        Ok(InitiatedPayment {
            correlation_id: push.merchant_request_id,
            secondary_reference: Some(push.checkout_request_id.clone()),
            status: IntentStatus::PendingConfirmation,
            client_action: json!({
                "type": "mpesa_stk_push",
                "checkout_request_id": push.checkout_request_id,
                "customer_message": push.customer_message,
            }),
            raw,
            expires_in: Duration::from_secs(self.config.stk_timeout_secs),
        })
    }

    async fn parse_callback(
        &self,
        request: &CallbackRequest,
    ) -> Result<ParsedCallback, ServiceError> {
        if let Some(expected) = self.config.callback_token.as_deref().filter(|t| !t.is_empty()) {
            if !shared_token_matches(
                &request.headers,
                CALLBACK_TOKEN_HEADER,
                request.query.as_deref(),
                expected,
            ) {
                warn!("M-Pesa callback token mismatch");
                return Err(ServiceError::InvalidSignature(
                    "callback token mismatch".into(),
                ));
            }
        }

        let raw: Value = serde_json::from_slice(&request.body)
            .map_err(|e| ServiceError::MalformedPayload(format!("invalid json: {}", e)))?;
        let envelope: CallbackEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| ServiceError::MalformedPayload(format!("unexpected callback shape: {}", e)))?;
        let callback = envelope.body.stk_callback;

        let code = result_code(&callback.result_code).ok_or_else(|| {
            ServiceError::MalformedPayload("ResultCode is not a number".into())
        })?;

        let (amount, receipt) = match &callback.callback_metadata {
            Some(meta) => (
                meta.get("Amount").and_then(decimal_from_json),
                meta.get("MpesaReceiptNumber").map(json_to_string),
            ),
            None => (None, None),
        };

        let outcome = if code == 0 {
            SignalOutcome::Succeeded
        } else {
            SignalOutcome::Failed
        };

        Ok(ParsedCallback::Signal(PaymentSignal {
            provider: PaymentProvider::Mpesa,
            correlation_id: callback.merchant_request_id,
            event_type: format!("stk_callback.{}", code),
            provider_event_id: Some(callback.checkout_request_id),
            outcome,
            amount,
            provider_reference: receipt,
            failure_reason: (code != 0).then(|| {
                callback
                    .result_desc
                    .unwrap_or_else(|| format!("ResultCode {}", code))
            }),
            raw,
        }))
    }

    #[instrument(skip(self), fields(merchant_request_id = %reference.correlation_id))]
    async fn verify(&self, reference: &ProviderRef) -> Result<PaymentSignal, ServiceError> {
        let checkout_request_id = reference.secondary_reference.as_deref().ok_or_else(|| {
            ServiceError::InternalError("M-Pesa intent without CheckoutRequestID".into())
        })?;
        let token = self.access_token().await?;
        let ts = timestamp(Utc::now());

        let response = self
            .client
            .post(self.url("/mpesa/stkpushquery/v1/query"))
            .bearer_auth(token)
            .json(&json!({
                "BusinessShortCode": self.config.shortcode,
                "Password": self.password(&ts),
                "Timestamp": ts,
                "CheckoutRequestID": checkout_request_id,
            }))
            .send()
            .await
            .map_err(|e| transport_error(PaymentProvider::Mpesa, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(PaymentProvider::Mpesa, e))?;
        let raw: Value = serde_json::from_str(&text).unwrap_or(Value::String(text.clone()));

        let still_processing = raw
            .get("errorCode")
            .and_then(Value::as_str)
            .map(|c| c == STILL_PROCESSING)
            .unwrap_or(false);

        let pending = |raw: Value| PaymentSignal {
            provider: PaymentProvider::Mpesa,
            correlation_id: reference.correlation_id.clone(),
            event_type: "poll.processing".to_string(),
            provider_event_id: None,
            outcome: SignalOutcome::Pending,
            amount: None,
            provider_reference: None,
            failure_reason: None,
            raw,
        };

        if still_processing {
            return Ok(pending(raw));
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ServiceError::ProviderError(format!(
                "mpesa returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }
        if !status.is_success() {
            return Err(ServiceError::ProviderError(format!(
                "mpesa query rejected with {}",
                status
            )));
        }

        let Some(code) = raw.get("ResultCode").and_then(result_code) else {
            return Ok(pending(raw));
        };
        let desc = raw
            .get("ResultDesc")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(PaymentSignal {
            provider: PaymentProvider::Mpesa,
            correlation_id: reference.correlation_id.clone(),
            event_type: format!("poll.{}", code),
            provider_event_id: None,
            outcome: if code == 0 {
                SignalOutcome::Succeeded
            } else {
                SignalOutcome::Failed
            },
            amount: None,
            provider_reference: None,
            failure_reason: (code != 0).then(|| desc.unwrap_or_else(|| format!("ResultCode {}", code))),
            raw,
        })
    }
}
