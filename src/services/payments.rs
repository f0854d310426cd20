use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        order::{Model as OrderModel, OrderStatus},
        payment_intent::{IntentStatus, Model as IntentModel, PaymentProvider},
        webhook_event::EventSource,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{GatewayRegistry, InitiateRequest, InitiatedPayment, PaymentGateway, ProviderRef},
    retry::{with_retry, ProviderRetryPolicy, RetryConfig},
    services::{
        intents::{IntentClaim, IntentPatch, IntentTracker},
        orders::OrderService,
        reconciliation::{ApplyOutcome, ReconciliationEngine},
    },
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct InitiateOptions {
    /// MSISDN for M-Pesa; defaults to the shipping address phone
    #[serde(default)]
    pub phone_number: Option<String>,
}

/// What the client needs to complete a payment.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentSession {
    pub order: OrderModel,
    pub intent: IntentModel,
    /// True when an existing active intent was returned instead of a new one
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentStatus {
    pub order: OrderModel,
    pub intent: Option<IntentModel>,
    pub outcome: Option<ApplyOutcome>,
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    intents: IntentTracker,
    engine: ReconciliationEngine,
    gateways: GatewayRegistry,
    event_sender: EventSender,
    retry: RetryConfig,
    claim_timeout: ChronoDuration,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        engine: ReconciliationEngine,
        gateways: GatewayRegistry,
        event_sender: EventSender,
        retry: RetryConfig,
        claim_timeout: Duration,
    ) -> Self {
        Self {
            intents: IntentTracker::new(db.clone()),
            db,
            engine,
            gateways,
            event_sender,
            retry,
            claim_timeout: ChronoDuration::from_std(claim_timeout)
                .unwrap_or_else(|_| ChronoDuration::minutes(2)),
        }
    }

    pub fn intents(&self) -> &IntentTracker {
        &self.intents
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn gateways(&self) -> &GatewayRegistry {
        &self.gateways
    }

    pub fn claim_timeout(&self) -> ChronoDuration {
        self.claim_timeout
    }

    async fn owned_order(&self, user_id: Uuid, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        let order = OrderService::find(&*self.db, order_id).await?;
        if order.user_id != user_id {
            return Err(ServiceError::Forbidden(format!(
                "order {} belongs to another user",
                order_id
            )));
        }
        Ok(order)
    }

    /// Starts (or resumes) payment for an order. At most one provider request
    /// is in flight per order; concurrent callers share its intent.
    #[instrument(skip(self, options), fields(user_id = %user_id, order_id = %order_id))]
    pub async fn initiate(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        options: InitiateOptions,
    ) -> Result<PaymentSession, ServiceError> {
        let order = self.owned_order(user_id, order_id).await?;
        if !OrderStatus::PAYABLE.contains(&order.status) {
            return Err(ServiceError::Conflict(format!(
                "order {} is {}, payment cannot be initiated",
                order.id, order.status
            )));
        }

        let provider = PaymentProvider::from(order.payment_method);
        let gateway = self.gateways.get(provider)?;
        let phone_number = options.phone_number.or_else(|| {
            order
                .shipping_address
                .get("phone")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        if provider == PaymentProvider::Mpesa && phone_number.is_none() {
            return Err(ServiceError::ValidationError(
                "phone_number is required for M-Pesa".to_string(),
            ));
        }

        // A claim older than claim_timeout is abandoned below, so waiting that
        // long always ends with either the winner's intent or our own claim.
        let deadline = tokio::time::Instant::now()
            + self.claim_timeout.to_std().unwrap_or(Duration::ZERO);
        let mut attempt = 0;
        loop {
            attempt += 1;

            let intent = match self.intents.get_or_create_active_intent(&order).await? {
                IntentClaim::Claimed(intent) => {
                    return self
                        .start(order, intent, gateway.as_ref(), phone_number)
                        .await;
                }
                IntentClaim::Existing(intent) => intent,
            };

            let now = Utc::now();
            if IntentStatus::OPEN.contains(&intent.status) {
                if intent.expires_at.map(|at| at > now).unwrap_or(true) {
                    debug!(intent_id = %intent.id, "Reusing active payment intent");
                    let order = OrderService::find(&*self.db, order.id).await?;
                    return Ok(PaymentSession {
                        order,
                        intent,
                        reused: true,
                    });
                }
                self.expire(&intent).await?;
                continue;
            }

            // Another request holds the claim
            if now - intent.created_at > self.claim_timeout {
                if let Err(e) = self.intents.abandon(intent.id, "initiation timed out").await {
                    debug!(intent_id = %intent.id, "Stale claim already released: {}", e);
                }
                continue;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ServiceError::Conflict(format!(
                    "payment for order {} is already being initiated",
                    order.id
                )));
            }
            debug!(intent_id = %intent.id, attempt, "Waiting on in-flight initiation");
            tokio::time::sleep(self.retry.delay_for(attempt).min(remaining)).await;
        }
    }

    /// Moves an open intent past its window to `expired`, freeing the order.
    pub async fn expire(&self, intent: &IntentModel) -> Result<(), ServiceError> {
        match IntentTracker::transition(
            &*self.db,
            intent.id,
            &IntentStatus::OPEN,
            IntentStatus::Expired,
            IntentPatch {
                failure_reason: Some("customer did not complete payment in time".to_string()),
                ..Default::default()
            },
        )
        .await
        {
            Ok(_) => {
                info!(intent_id = %intent.id, order_id = %intent.order_id, "Payment intent expired");
                metrics::counter!("storefront.payments.expired", 1);
                Ok(())
            }
            Err(ServiceError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn start(
        &self,
        order: OrderModel,
        intent: IntentModel,
        gateway: &dyn PaymentGateway,
        phone_number: Option<String>,
    ) -> Result<PaymentSession, ServiceError> {
        let request = InitiateRequest {
            intent_id: intent.id,
            order_id: order.id,
            amount: intent.amount,
            currency: intent.currency.clone(),
            customer_email: order.customer_email.clone(),
            phone_number,
            description: format!("Order {}", order.id),
        };

        let request = &request;
        let initiated =
            match with_retry(&self.retry, ProviderRetryPolicy, move || gateway.initiate(request))
                .await
            {
                Ok(initiated) => initiated,
                Err(e) => {
                    metrics::counter!("storefront.payments.initiate_failed", 1, "provider" => gateway.provider().to_string());
                    if let Err(abandon_err) = self.intents.abandon(intent.id, &e.to_string()).await {
                        warn!(intent_id = %intent.id, "Could not release claim: {}", abandon_err);
                    }
                    return Err(e);
                }
            };

        let txn = self.db.begin().await?;
        let settled = Self::record_initiation(&txn, &order, intent.id, initiated).await;
        let (before, updated, intent) = match settled {
            Ok(done) => {
                txn.commit().await?;
                done
            }
            Err(e) => {
                txn.rollback().await?;
                warn!(intent_id = %intent.id, "Provider accepted payment but order moved on: {}", e);
                if let Err(abandon_err) = self.intents.abandon(intent.id, &e.to_string()).await {
                    debug!(intent_id = %intent.id, "Claim already released: {}", abandon_err);
                }
                return Err(e);
            }
        };

        metrics::counter!("storefront.payments.initiated", 1, "provider" => intent.provider.to_string());
        if before != updated.status {
            self.event_sender
                .publish(Event::OrderStatusChanged {
                    order_id: updated.id,
                    old_status: before,
                    new_status: updated.status,
                })
                .await;
        }
        self.event_sender
            .publish(Event::PaymentInitiated {
                order_id: updated.id,
                intent_id: intent.id,
            })
            .await;

        Ok(PaymentSession {
            order: updated,
            intent,
            reused: false,
        })
    }

    async fn record_initiation(
        txn: &DatabaseTransaction,
        order: &OrderModel,
        intent_id: Uuid,
        initiated: InitiatedPayment,
    ) -> Result<(OrderStatus, OrderModel, IntentModel), ServiceError> {
        let intent = IntentTracker::confirm_initiated(txn, intent_id, initiated).await?;
        let before = OrderService::find(txn, order.id).await?.status;
        let updated = OrderService::transition(
            txn,
            order.id,
            &OrderStatus::PAYABLE,
            OrderStatus::AwaitingPayment,
        )
        .await?;
        OrderService::attach_intent(txn, order.id, intent.id).await?;
        let updated = OrderService::find(txn, updated.id).await?;
        Ok((before, updated, intent))
    }

    /// Asks the provider about the order's latest intent and applies the
    /// answer. Intents that are settled or still being claimed are returned
    /// as they are.
    #[instrument(skip(self), fields(user_id = %user_id, order_id = %order_id))]
    pub async fn verify(&self, user_id: Uuid, order_id: Uuid) -> Result<PaymentStatus, ServiceError> {
        self.owned_order(user_id, order_id).await?;
        self.verify_order(order_id).await
    }

    /// [`PaymentService::verify`] without the ownership check, for operators.
    pub async fn verify_order(&self, order_id: Uuid) -> Result<PaymentStatus, ServiceError> {
        let latest = self.intents.list_for_order(order_id).await?.pop();
        let outcome = match &latest {
            Some(intent) => self.poll(intent).await?,
            None => None,
        };

        let order = OrderService::find(&*self.db, order_id).await?;
        let intent = match latest {
            Some(intent) => Some(self.intents.get(intent.id).await?),
            None => None,
        };
        Ok(PaymentStatus {
            order,
            intent,
            outcome,
        })
    }

    /// Polls the provider for one intent. `None` when there is nothing to ask.
    pub async fn poll(&self, intent: &IntentModel) -> Result<Option<ApplyOutcome>, ServiceError> {
        let pollable = IntentStatus::OPEN.contains(&intent.status)
            || intent.status == IntentStatus::Expired;
        let Some(correlation_id) = intent.provider_correlation_id.clone().filter(|_| pollable)
        else {
            return Ok(None);
        };

        let gateway = self.gateways.get(intent.provider)?;
        let reference = ProviderRef {
            correlation_id,
            secondary_reference: intent.secondary_reference.clone(),
        };
        let reference = &reference;
        let gateway = gateway.as_ref();
        let signal =
            with_retry(&self.retry, ProviderRetryPolicy, move || gateway.verify(reference)).await?;

        Ok(Some(self.engine.apply(signal, EventSource::Poll).await?))
    }

    pub async fn list_intents(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<Vec<IntentModel>, ServiceError> {
        self.owned_order(user_id, order_id).await?;
        self.intents.list_for_order(order_id).await
    }

    pub async fn replay_event(&self, event_id: Uuid) -> Result<ApplyOutcome, ServiceError> {
        self.engine.replay(event_id).await
    }
}
