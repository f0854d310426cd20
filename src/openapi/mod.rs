use axum::{response::IntoResponse, Json};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront Payments API",
        version = "0.1.0",
        description = r#"
# Storefront Payments API

Orders, payment initiation and payment reconciliation for Stripe, M-Pesa (STK Push) and PayPal.

## Authentication

Callers are authenticated by the edge gateway, which forwards:

```
X-User-Id: <uuid>
X-User-Role: admin   (admin routes only)
```

Provider callbacks under `/payments/*` authenticate with the provider's own
signature or shared token instead.

## Errors

Failures return a JSON body with `error`, `message`, `request_id` and `timestamp`.
"#
    ),
    tags(
        (name = "orders", description = "Order creation and fulfilment"),
        (name = "payments", description = "Payment initiation and verification"),
        (name = "webhooks", description = "Provider callbacks"),
        (name = "admin", description = "Operator endpoints")
    ),
    paths(
        crate::handlers::orders::create_order,
        crate::handlers::orders::list_my_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::list_flagged_orders,
        crate::handlers::payments::initiate_payment,
        crate::handlers::payments::verify_payment,
        crate::handlers::payments::list_payments,
        crate::handlers::payment_webhooks::stripe_webhook,
        crate::handlers::payment_webhooks::mpesa_callback,
        crate::handlers::payment_webhooks::paypal_webhook,
        crate::handlers::admin::replay_webhook_event,
        crate::handlers::admin::run_sweep,
    ),
    components(
        schemas(
            crate::handlers::orders::OrderResponse,
            crate::handlers::orders::OrderItemResponse,
            crate::handlers::orders::UpdateStatusRequest,
            crate::handlers::payments::PaymentIntentResponse,
            crate::handlers::payments::PaymentSessionResponse,
            crate::handlers::payments::PaymentStatusResponse,
            crate::services::orders::CreateOrderInput,
            crate::services::orders::OrderLineInput,
            crate::services::orders::ShippingAddress,
            crate::services::payments::InitiateOptions,
            crate::services::reconciliation::ApplyOutcome,
            crate::services::sweep::SweepReport,
            crate::entities::order::OrderStatus,
            crate::entities::order::PaymentMethod,
            crate::entities::payment_intent::IntentStatus,
            crate::entities::payment_intent::PaymentProvider,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

/// GET /api-docs/openapi.json
pub async fn openapi_json() -> impl IntoResponse {
    Json(ApiDocV1::openapi())
}
