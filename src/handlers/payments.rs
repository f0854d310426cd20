use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::payment_intent::{IntentStatus, Model as IntentModel, PaymentProvider},
    errors::ServiceError,
    handlers::orders::OrderResponse,
    services::{
        payments::{InitiateOptions, PaymentSession, PaymentStatus},
        reconciliation::ApplyOutcome,
    },
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaymentIntentResponse {
    pub id: Uuid,
    pub order_id: Uuid,
    pub provider: PaymentProvider,
    pub status: IntentStatus,
    pub amount: Decimal,
    pub currency: String,
    pub provider_correlation_id: Option<String>,
    /// Client secret, approval URL or STK prompt details
    #[schema(value_type = Option<Object>)]
    pub client_action: Option<Value>,
    pub provider_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl From<IntentModel> for PaymentIntentResponse {
    fn from(intent: IntentModel) -> Self {
        Self {
            id: intent.id,
            order_id: intent.order_id,
            provider: intent.provider,
            status: intent.status,
            amount: intent.amount,
            currency: intent.currency,
            provider_correlation_id: intent.provider_correlation_id,
            client_action: intent.client_action,
            provider_reference: intent.provider_reference,
            failure_reason: intent.failure_reason,
            expires_at: intent.expires_at,
            created_at: intent.created_at,
            settled_at: intent.settled_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentSessionResponse {
    pub order: OrderResponse,
    pub intent: PaymentIntentResponse,
    pub reused: bool,
}

impl From<PaymentSession> for PaymentSessionResponse {
    fn from(session: PaymentSession) -> Self {
        Self {
            order: session.order.into(),
            intent: session.intent.into(),
            reused: session.reused,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentStatusResponse {
    pub order: OrderResponse,
    pub intent: Option<PaymentIntentResponse>,
    /// What the provider poll changed, if a poll was made
    pub outcome: Option<ApplyOutcome>,
}

impl From<PaymentStatus> for PaymentStatusResponse {
    fn from(status: PaymentStatus) -> Self {
        Self {
            order: status.order.into(),
            intent: status.intent.map(Into::into),
            outcome: status.outcome,
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payments",
    summary = "Initiate payment",
    description = "Start payment with the order's provider. Repeated calls while a payment is open return the same intent.",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body(content = InitiateOptions, description = "Optional M-Pesa phone number"),
    responses(
        (status = 201, description = "Payment started", body = ApiResponse<PaymentSessionResponse>),
        (status = 200, description = "Existing payment returned", body = ApiResponse<PaymentSessionResponse>),
        (status = 402, description = "Provider rejected the payment", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order cannot be paid in its current status", body = crate::errors::ErrorResponse),
        (status = 503, description = "Payment temporarily unavailable", body = crate::errors::ErrorResponse),
    ),
    tag = "payments"
)]
pub async fn initiate_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
    options: Option<Json<InitiateOptions>>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentSessionResponse>>), ServiceError> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    let session = state
        .payments
        .initiate(user.user_id, order_id, options)
        .await?;
    let status = if session.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::success(session.into()))))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payments/verify",
    summary = "Verify payment",
    description = "Ask the provider for the latest payment state and reconcile it",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Current payment state", body = ApiResponse<PaymentStatusResponse>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 503, description = "Provider unreachable", body = crate::errors::ErrorResponse),
    ),
    tag = "payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<PaymentStatusResponse> {
    let status = state.payments.verify(user.user_id, order_id).await?;
    Ok(Json(ApiResponse::success(status.into())))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/payments",
    summary = "Payment history",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Intents oldest first", body = ApiResponse<Vec<PaymentIntentResponse>>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "payments"
)]
pub async fn list_payments(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Vec<PaymentIntentResponse>> {
    let intents = state.payments.list_intents(user.user_id, order_id).await?;
    Ok(Json(ApiResponse::success(
        intents.into_iter().map(Into::into).collect(),
    )))
}
