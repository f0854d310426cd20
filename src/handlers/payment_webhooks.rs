use axum::{
    extract::{RawQuery, State},
    http::HeaderMap,
    response::Json,
};
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::{
    entities::{payment_intent::PaymentProvider, webhook_event::EventSource},
    errors::ServiceError,
    gateways::CallbackRequest,
    services::reconciliation::ApplyOutcome,
    AppState,
};

async fn receive(
    state: &AppState,
    provider: PaymentProvider,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
) -> Result<ApplyOutcome, ServiceError> {
    let gateway = state.payments.gateways().get(provider)?;
    let request = CallbackRequest {
        headers,
        query,
        body,
    };
    let parsed = gateway.parse_callback(&request).await?;
    let outcome = state
        .payments
        .engine()
        .apply_parsed(parsed, EventSource::Webhook)
        .await?;
    info!(%provider, ?outcome, "Payment callback handled");
    Ok(outcome)
}

// POST /payments/stripe/webhook
#[utoipa::path(
    post,
    path = "/payments/stripe/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Event accepted"),
        (status = 400, description = "Invalid signature or payload", body = crate::errors::ErrorResponse)
    ),
    tag = "webhooks"
)]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let outcome = receive(&state, PaymentProvider::Stripe, headers, None, body).await?;
    Ok(Json(json!({ "received": true, "outcome": outcome })))
}

// POST /payments/mpesa/callback
#[utoipa::path(
    post,
    path = "/payments/mpesa/callback",
    request_body = String,
    responses(
        (status = 200, description = "Always acknowledged so Daraja stops retrying; failures are logged and the sweep polls the payment")
    ),
    tag = "webhooks"
)]
pub async fn mpesa_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Json<Value> {
    match receive(&state, PaymentProvider::Mpesa, headers, query, body).await {
        Ok(_) => {}
        Err(e @ (ServiceError::InvalidSignature(_) | ServiceError::MalformedPayload(_))) => {
            warn!("Rejected M-Pesa callback: {}", e);
        }
        Err(e) => {
            error!("M-Pesa callback processing failed: {}", e);
        }
    }
    Json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" }))
}

// POST /payments/paypal/webhook
#[utoipa::path(
    post,
    path = "/payments/paypal/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Event accepted"),
        (status = 400, description = "Unverified or malformed event", body = crate::errors::ErrorResponse)
    ),
    tag = "webhooks"
)]
pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let outcome = receive(&state, PaymentProvider::Paypal, headers, query, body).await?;
    Ok(Json(json!({ "received": true, "outcome": outcome })))
}
