//! Storefront payments
//!
//! Order store, Stripe / M-Pesa / PayPal payment adapters and the
//! reconciliation engine that turns provider callbacks and polls into order
//! transitions.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod handlers;
pub mod health;
pub mod migrator;
pub mod openapi;
pub mod retry;
pub mod services;
pub mod tracing;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use utoipa::ToSchema;

use crate::{
    errors::ServiceError,
    events::EventSender,
    gateways::GatewayRegistry,
    services::{
        catalog::CatalogService, orders::OrderService, payments::PaymentService,
        reconciliation::ReconciliationEngine, sweep::ReconciliationSweep,
    },
};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: EventSender,
    pub catalog: CatalogService,
    pub orders: OrderService,
    pub payments: PaymentService,
    pub sweep: ReconciliationSweep,
}

impl AppState {
    /// Wires every service from configuration. Gateways are passed in so
    /// callers (and tests) decide which providers exist.
    pub fn new(
        config: config::AppConfig,
        db: Arc<DatabaseConnection>,
        gateways: GatewayRegistry,
        event_sender: EventSender,
    ) -> Result<Self, ServiceError> {
        let pricing = config
            .pricing_policy()
            .map_err(|e| ServiceError::ConfigurationError(e.to_string()))?;

        let catalog = CatalogService::new(db.clone());
        let orders = OrderService::new(
            db.clone(),
            catalog.clone(),
            pricing,
            event_sender.clone(),
            config.default_currency.clone(),
        );
        let engine = ReconciliationEngine::new(db.clone(), event_sender.clone());
        let payments = PaymentService::new(
            db.clone(),
            engine,
            gateways,
            event_sender.clone(),
            config.retry_config(),
            Duration::from_secs(config.initiation_timeout_secs),
        );
        let sweep = ReconciliationSweep::new(payments.clone());

        Ok(Self {
            db,
            config,
            event_sender,
            catalog,
            orders,
            payments,
            sweep,
        })
    }
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<axum::Json<ApiResponse<T>>, ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    let orders = Router::new()
        .route(
            "/orders",
            post(handlers::orders::create_order).get(handlers::orders::list_my_orders),
        )
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/:id/status",
            post(handlers::orders::update_order_status),
        )
        .route(
            "/orders/:id/payments",
            post(handlers::payments::initiate_payment).get(handlers::payments::list_payments),
        )
        .route(
            "/orders/:id/payments/verify",
            post(handlers::payments::verify_payment),
        );

    let admin = Router::new()
        .route(
            "/admin/orders/review",
            get(handlers::orders::list_flagged_orders),
        )
        .route(
            "/admin/webhook-events/:id/replay",
            post(handlers::admin::replay_webhook_event),
        )
        .route(
            "/admin/reconciliation/sweep",
            post(handlers::admin::run_sweep),
        );

    orders.merge(admin)
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/stripe/webhook",
            post(handlers::payment_webhooks::stripe_webhook),
        )
        .route(
            "/mpesa/callback",
            post(handlers::payment_webhooks::mpesa_callback),
        )
        .route(
            "/paypal/webhook",
            post(handlers::payment_webhooks::paypal_webhook),
        )
}

/// Full application router with request ids and HTTP tracing. CORS and
/// timeouts are environment concerns and are layered on by the binary.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .nest("/payments", webhook_routes())
        .nest("/health", health::health_routes())
        .route("/api-docs/openapi.json", get(openapi::openapi_json))
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            crate::tracing::request_id_middleware,
        ))
        .with_state(state)
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[tokio::test]
    async fn error_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-err"), async {
                ApiResponse::<()>::error("oops".into())
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-err"));
        assert!(!response.success);
    }
}
