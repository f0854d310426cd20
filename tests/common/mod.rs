#![allow(dead_code)]

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use storefront_payments::{
    auth::{ADMIN_ROLE, USER_ID_HEADER, USER_ROLE_HEADER},
    config::{AppConfig, MpesaConfig, PaypalConfig, StripeConfig},
    db,
    entities::{
        order::{Model as OrderModel, PaymentMethod},
        payment_intent::{IntentStatus, PaymentProvider},
        product::Model as ProductModel,
    },
    errors::ServiceError,
    events::{self, Event, EventHandler, EventSender},
    gateways::{
        signature::sign_timestamped, CallbackRequest, GatewayRegistry, InitiateRequest,
        InitiatedPayment, ParsedCallback, PaymentGateway, PaymentSignal, ProviderRef,
        SignalOutcome,
    },
    services::{
        catalog::NewProduct,
        orders::{CreateOrderInput, OrderDetails, OrderLineInput, ShippingAddress},
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const FAKE_SIGNATURE_HEADER: &str = "x-fake-signature";

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.auto_migrate = true;
    cfg.sweep_interval_secs = 0;
    cfg.provider_max_attempts = 2;
    cfg.provider_initial_backoff_ms = 25;
    cfg
}

pub fn stripe_config(api_base: &str) -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_123".to_string(),
        webhook_secret: STRIPE_WEBHOOK_SECRET.to_string(),
        api_base: api_base.to_string(),
        webhook_tolerance_secs: 300,
        confirmation_timeout_secs: 3600,
    }
}

pub fn mpesa_config(api_base: &str) -> MpesaConfig {
    MpesaConfig {
        api_base: api_base.to_string(),
        consumer_key: "consumer".to_string(),
        consumer_secret: "secret".to_string(),
        passkey: "passkey".to_string(),
        shortcode: "174379".to_string(),
        callback_url: "https://shop.example.com/payments/mpesa/callback".to_string(),
        callback_token: None,
        stk_timeout_secs: 60,
    }
}

/// PayPal sandbox-style config; `webhook_id` switches on signature verification.
pub fn paypal_config(api_base: &str, webhook_id: Option<&str>) -> PaypalConfig {
    PaypalConfig {
        api_base: api_base.to_string(),
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        webhook_id: webhook_id.map(str::to_string),
        webhook_token: None,
        return_url: "https://shop.example.com/checkout/return".to_string(),
        cancel_url: "https://shop.example.com/checkout/cancel".to_string(),
        approval_timeout_secs: 10_800,
    }
}

/// `stripe-signature` header for `body`, signed now.
pub fn stripe_signature(body: &str) -> String {
    sign_timestamped(body.as_bytes(), STRIPE_WEBHOOK_SECRET, Utc::now().timestamp())
}

/// Collects every published event.
#[derive(Default)]
pub struct RecordedEvents(Mutex<Vec<Event>>);

impl RecordedEvents {
    pub fn all(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordedEvents {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Scriptable stand-in for a payment provider.
///
/// Callbacks are JSON `{"correlation_id", "event_id", "outcome", "amount"}`
/// and must carry `x-fake-signature: ok`.
pub struct FakeGateway {
    provider: PaymentProvider,
    initiate_calls: AtomicUsize,
    verify_calls: AtomicUsize,
    initiate_delay: Mutex<Duration>,
    failing_initiates: AtomicUsize,
    expires_in: Mutex<Duration>,
    verify_outcome: Mutex<SignalOutcome>,
    verify_amount: Mutex<Option<Decimal>>,
}

impl FakeGateway {
    pub fn new(provider: PaymentProvider) -> Arc<Self> {
        Arc::new(Self {
            provider,
            initiate_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            initiate_delay: Mutex::new(Duration::ZERO),
            failing_initiates: AtomicUsize::new(0),
            expires_in: Mutex::new(Duration::from_secs(3600)),
            verify_outcome: Mutex::new(SignalOutcome::Pending),
            verify_amount: Mutex::new(None),
        })
    }

    pub fn correlation_for(intent_id: Uuid) -> String {
        format!("fake_{}", intent_id.simple())
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn set_initiate_delay(&self, delay: Duration) {
        *self.initiate_delay.lock().unwrap() = delay;
    }

    /// The next `count` initiate calls fail with a provider outage.
    pub fn fail_next_initiates(&self, count: usize) {
        self.failing_initiates.store(count, Ordering::SeqCst);
    }

    pub fn set_expires_in(&self, expires_in: Duration) {
        *self.expires_in.lock().unwrap() = expires_in;
    }

    pub fn set_verify_outcome(&self, outcome: SignalOutcome, amount: Option<Decimal>) {
        *self.verify_outcome.lock().unwrap() = outcome;
        *self.verify_amount.lock().unwrap() = amount;
    }

    pub fn callback_body(
        correlation_id: &str,
        event_id: &str,
        outcome: SignalOutcome,
        amount: Decimal,
    ) -> String {
        json!({
            "correlation_id": correlation_id,
            "event_id": event_id,
            "outcome": outcome,
            "amount": amount.to_string(),
        })
        .to_string()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn provider(&self) -> PaymentProvider {
        self.provider
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiatedPayment, ServiceError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.initiate_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self.failing_initiates.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_initiates.store(failing - 1, Ordering::SeqCst);
            return Err(ServiceError::ProviderError("fake provider is down".to_string()));
        }

        let correlation_id = Self::correlation_for(request.intent_id);
        Ok(InitiatedPayment {
            correlation_id: correlation_id.clone(),
            secondary_reference: None,
            status: IntentStatus::Created,
            client_action: json!({ "type": "fake", "reference": correlation_id }),
            raw: json!({ "id": correlation_id }),
            expires_in: *self.expires_in.lock().unwrap(),
        })
    }

    async fn parse_callback(
        &self,
        request: &CallbackRequest,
    ) -> Result<ParsedCallback, ServiceError> {
        let signed = request
            .headers
            .get(FAKE_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            == Some("ok");
        if !signed {
            return Err(ServiceError::InvalidSignature("missing fake signature".to_string()));
        }

        let raw: Value = serde_json::from_slice(&request.body)
            .map_err(|e| ServiceError::MalformedPayload(e.to_string()))?;
        let outcome: SignalOutcome = serde_json::from_value(raw["outcome"].clone())
            .map_err(|e| ServiceError::MalformedPayload(e.to_string()))?;
        Ok(ParsedCallback::Signal(PaymentSignal {
            provider: self.provider,
            correlation_id: raw["correlation_id"].as_str().unwrap_or_default().to_string(),
            event_type: format!("fake.{}", outcome),
            provider_event_id: raw["event_id"].as_str().map(str::to_string),
            outcome,
            amount: raw["amount"].as_str().and_then(|a| Decimal::from_str(a).ok()),
            provider_reference: Some("fake_receipt".to_string()),
            failure_reason: (outcome == SignalOutcome::Failed).then(|| "declined".to_string()),
            raw,
        }))
    }

    async fn verify(&self, reference: &ProviderRef) -> Result<PaymentSignal, ServiceError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = *self.verify_outcome.lock().unwrap();
        Ok(PaymentSignal {
            provider: self.provider,
            correlation_id: reference.correlation_id.clone(),
            event_type: format!("poll.{}", outcome),
            provider_event_id: None,
            outcome,
            amount: *self.verify_amount.lock().unwrap(),
            provider_reference: (outcome == SignalOutcome::Succeeded)
                .then(|| "fake_receipt".to_string()),
            failure_reason: (outcome == SignalOutcome::Failed).then(|| "declined".to_string()),
            raw: json!({ "status": outcome }),
        })
    }
}

/// Application state over a fresh in-memory SQLite database, plus the
/// router the binary serves.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub events: Arc<RecordedEvents>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new(gateways: GatewayRegistry) -> Self {
        Self::with_config(test_config(), gateways).await
    }

    pub async fn with_config(cfg: AppConfig, gateways: GatewayRegistry) -> Self {
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let recorded = Arc::new(RecordedEvents::default());
        let handlers: Vec<Arc<dyn EventHandler>> = vec![recorded.clone()];
        let event_task = tokio::spawn(events::process_events(event_rx, handlers));

        let state = AppState::new(cfg, Arc::new(pool), gateways, EventSender::new(event_tx))
            .expect("failed to build app state");
        let router = storefront_payments::build_router(state.clone());

        Self {
            router,
            state,
            events: recorded,
            _event_task: event_task,
        }
    }

    /// Sends a request as `user` (if any). Admin requests also carry the admin role.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user: Option<Uuid>,
        admin: bool,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user.to_string());
        }
        if admin {
            builder = builder.header(USER_ROLE_HEADER, ADMIN_ROLE);
        }

        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };

        self.router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request")
    }

    pub async fn as_user(&self, method: Method, uri: &str, body: Option<Value>, user: Uuid) -> Response {
        self.request(method, uri, body, Some(user), false).await
    }

    pub async fn as_admin(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request(method, uri, body, Some(Uuid::new_v4()), true)
            .await
    }

    /// Posts a raw provider callback.
    pub async fn callback(&self, uri: &str, headers: &[(&str, &str)], body: String) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.router
            .clone()
            .oneshot(builder.body(Body::from(body)).expect("build callback"))
            .await
            .expect("router error during callback")
    }

    pub async fn seed_product(&self, sku: &str, price: Decimal, stock: i32) -> ProductModel {
        self.state
            .catalog
            .create_product(NewProduct {
                sku: sku.to_string(),
                name: format!("Product {}", sku),
                price,
                stock,
            })
            .await
            .expect("seed product")
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        self.state
            .catalog
            .get_product(product_id)
            .await
            .expect("product exists")
            .stock
    }

    pub async fn place_order(
        &self,
        user: Uuid,
        lines: &[(Uuid, i32)],
        method: PaymentMethod,
    ) -> OrderDetails {
        self.state
            .orders
            .create_order(user, order_input(lines, method))
            .await
            .expect("create order")
    }

    pub async fn order(&self, id: Uuid) -> OrderModel {
        self.state.orders.get_order(id).await.expect("order exists").order
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub fn shipping_address() -> ShippingAddress {
    ShippingAddress {
        name: "Wanjiru Kamau".to_string(),
        line1: "12 Moi Avenue".to_string(),
        line2: None,
        city: "Nairobi".to_string(),
        state: None,
        postal_code: Some("00100".to_string()),
        country: "KE".to_string(),
        phone: Some("0712345678".to_string()),
    }
}

pub fn order_input(lines: &[(Uuid, i32)], method: PaymentMethod) -> CreateOrderInput {
    CreateOrderInput {
        items: lines
            .iter()
            .map(|(product_id, quantity)| OrderLineInput {
                product_id: *product_id,
                quantity: *quantity,
            })
            .collect(),
        payment_method: method,
        shipping_address: shipping_address(),
        customer_email: Some("buyer@example.com".to_string()),
        currency: None,
    }
}

pub async fn read_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("not a decimal: {}", other),
    }
}
