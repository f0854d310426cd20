use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, TransactionTrait,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        order::OrderStatus,
        payment_intent::{IntentStatus, Model as IntentModel},
        webhook_event::{self, Entity as WebhookEventEntity, EventSource, Model as WebhookEventModel},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{ParsedCallback, PaymentSignal, SignalOutcome},
    services::{
        catalog::CatalogService,
        intents::{IntentPatch, IntentTracker},
        orders::OrderService,
    },
};

/// What applying a signal did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied {
        order_status: OrderStatus,
        intent_status: IntentStatus,
    },
    /// Already processed under the same dedupe key
    Duplicate,
    /// No intent carries this correlation id
    Unmatched,
    /// Authentic event of a type we do not act on
    Ignored,
    /// The intent had already moved past what the signal reports
    Stale { intent_status: IntentStatus },
}

impl ApplyOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Duplicate => "duplicate",
            Self::Unmatched => "unmatched",
            Self::Ignored => "ignored",
            Self::Stale { .. } => "stale",
        }
    }
}

/// Single entry point for payment outcomes. Webhooks, verify polls, the sweep
/// and replays all end up in [`ReconciliationEngine::apply`].
#[derive(Clone)]
pub struct ReconciliationEngine {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl ReconciliationEngine {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    pub async fn apply_parsed(
        &self,
        parsed: ParsedCallback,
        source: EventSource,
    ) -> Result<ApplyOutcome, ServiceError> {
        match parsed {
            ParsedCallback::Signal(signal) => self.apply(signal, source).await,
            ParsedCallback::Ignored { event_type } => {
                debug!(%event_type, "Ignoring payment event");
                metrics::counter!("storefront.reconciliation.ignored", 1);
                Ok(ApplyOutcome::Ignored)
            }
        }
    }

    #[instrument(
        skip(self, signal),
        fields(
            provider = %signal.provider,
            correlation_id = %signal.correlation_id,
            event_type = %signal.event_type,
            source = %source,
        )
    )]
    pub async fn apply(
        &self,
        signal: PaymentSignal,
        source: EventSource,
    ) -> Result<ApplyOutcome, ServiceError> {
        let event = self.record(&signal, source).await?;
        if event.processed {
            debug!(event_id = %event.id, "Duplicate payment event");
            metrics::counter!("storefront.reconciliation.duplicate", 1);
            return Ok(ApplyOutcome::Duplicate);
        }
        self.process(event, signal).await
    }

    /// Re-runs a stored event, typically one that arrived before its intent
    /// was correlated.
    #[instrument(skip(self))]
    pub async fn replay(&self, event_id: Uuid) -> Result<ApplyOutcome, ServiceError> {
        let event = WebhookEventEntity::find_by_id(event_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Webhook event {} not found", event_id)))?;
        if event.processed {
            return Ok(ApplyOutcome::Duplicate);
        }

        let mut signal: PaymentSignal = serde_json::from_value(event.signal.clone())?;
        signal.raw = event.raw_payload.clone();
        info!(event_id = %event.id, "Replaying payment event");
        self.process(event, signal).await
    }

    /// Appends the signal to the event log, or returns the row already stored
    /// under its dedupe key.
    async fn record(
        &self,
        signal: &PaymentSignal,
        source: EventSource,
    ) -> Result<WebhookEventModel, ServiceError> {
        let dedupe_key = signal.dedupe_key();
        let stored_signal = PaymentSignal {
            raw: Value::Null,
            ..signal.clone()
        };

        let row = webhook_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            provider: Set(signal.provider),
            provider_correlation_id: Set(signal.correlation_id.clone()),
            event_type: Set(signal.event_type.clone()),
            provider_event_id: Set(signal.provider_event_id.clone()),
            dedupe_key: Set(dedupe_key.clone()),
            source: Set(source),
            raw_payload: Set(signal.raw.clone()),
            signal: Set(serde_json::to_value(&stored_signal)?),
            received_at: Set(Utc::now()),
            processed: Set(false),
            processed_at: Set(None),
            outcome: Set(None),
        };

        WebhookEventEntity::insert(row)
            .on_conflict(
                OnConflict::column(webhook_event::Column::DedupeKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        WebhookEventEntity::find()
            .filter(webhook_event::Column::DedupeKey.eq(dedupe_key.as_str()))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!("event {} vanished after insert", dedupe_key))
            })
    }

    async fn process(
        &self,
        event: WebhookEventModel,
        signal: PaymentSignal,
    ) -> Result<ApplyOutcome, ServiceError> {
        let intent =
            match IntentTracker::resolve(&*self.db, signal.provider, &signal.correlation_id).await {
                Ok(intent) => intent,
                Err(ServiceError::NotFound(_)) => {
                    // Left unprocessed so a provider retry or a replay can pick it up
                    warn!(event_id = %event.id, "No payment intent matches event");
                    set_outcome(&*self.db, event.id, ApplyOutcome::Unmatched.label()).await?;
                    metrics::counter!("storefront.reconciliation.unmatched", 1);
                    return Ok(ApplyOutcome::Unmatched);
                }
                Err(e) => return Err(e),
            };

        let txn = self.db.begin().await?;

        let claimed = WebhookEventEntity::update_many()
            .col_expr(webhook_event::Column::Processed, Expr::value(true))
            .col_expr(webhook_event::Column::ProcessedAt, Expr::value(Some(Utc::now())))
            .filter(webhook_event::Column::Id.eq(event.id))
            .filter(webhook_event::Column::Processed.eq(false))
            .exec(&txn)
            .await?;
        if claimed.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(ApplyOutcome::Duplicate);
        }

        let mut events = Vec::new();
        let outcome = match signal.outcome {
            SignalOutcome::Succeeded => {
                apply_success(&txn, &intent, &signal, &mut events).await?
            }
            SignalOutcome::Failed => apply_failure(&txn, &intent, &signal, &mut events).await?,
            SignalOutcome::Pending => apply_pending(&txn, &intent, &signal).await?,
        };

        set_outcome(&txn, event.id, outcome.label()).await?;
        txn.commit().await?;

        metrics::counter!("storefront.reconciliation.processed", 1, "outcome" => outcome.label());
        info!(
            event_id = %event.id,
            intent_id = %intent.id,
            order_id = %intent.order_id,
            outcome = outcome.label(),
            "Payment event processed"
        );

        for event in events {
            self.event_sender.publish(event).await;
        }
        Ok(outcome)
    }
}

async fn set_outcome<C: ConnectionTrait>(
    conn: &C,
    event_id: Uuid,
    outcome: &str,
) -> Result<(), ServiceError> {
    WebhookEventEntity::update_many()
        .col_expr(webhook_event::Column::Outcome, Expr::value(Some(outcome.to_string())))
        .filter(webhook_event::Column::Id.eq(event_id))
        .exec(conn)
        .await?;
    Ok(())
}

async fn flag(
    txn: &DatabaseTransaction,
    order_id: Uuid,
    reason: String,
    events: &mut Vec<Event>,
) -> Result<(), ServiceError> {
    OrderService::flag_for_review(txn, order_id, &reason).await?;
    events.push(Event::OrderFlaggedForReview { order_id, reason });
    Ok(())
}

async fn apply_success(
    txn: &DatabaseTransaction,
    intent: &IntentModel,
    signal: &PaymentSignal,
    events: &mut Vec<Event>,
) -> Result<ApplyOutcome, ServiceError> {
    let settled = IntentTracker::transition(
        txn,
        intent.id,
        &[
            IntentStatus::Created,
            IntentStatus::PendingConfirmation,
            IntentStatus::Expired,
        ],
        IntentStatus::Succeeded,
        IntentPatch {
            provider_reference: signal.provider_reference.clone(),
            raw_provider_payload: Some(signal.raw.clone()),
            ..Default::default()
        },
    )
    .await;

    let settled = match settled {
        Ok(settled) => settled,
        Err(ServiceError::Conflict(_)) => {
            let current = IntentTracker::find(txn, intent.id).await?;
            if current.status == IntentStatus::Failed {
                flag(
                    txn,
                    intent.order_id,
                    format!("intent {} reported succeeded after it failed", intent.id),
                    events,
                )
                .await?;
            }
            return Ok(ApplyOutcome::Stale {
                intent_status: current.status,
            });
        }
        Err(e) => return Err(e),
    };

    if let Some(paid) = signal.amount {
        if paid < settled.amount {
            flag(
                txn,
                intent.order_id,
                format!(
                    "intent {} paid {} {} but {} was due",
                    intent.id, paid, settled.currency, settled.amount
                ),
                events,
            )
            .await?;
        }
    }

    let before = OrderService::find(txn, intent.order_id).await?;
    let order = match OrderService::transition(
        txn,
        intent.order_id,
        &OrderStatus::PAYABLE,
        OrderStatus::Paid,
    )
    .await
    {
        Ok(order) => order,
        Err(ServiceError::Conflict(_)) => {
            let current = OrderService::find(txn, intent.order_id).await?;
            let reason = if current.status == OrderStatus::Cancelled {
                format!("payment {} succeeded for a cancelled order", intent.id)
            } else {
                format!(
                    "duplicate capture: intent {} succeeded while order was {}",
                    intent.id, current.status
                )
            };
            flag(txn, intent.order_id, reason, events).await?;
            return Ok(ApplyOutcome::Applied {
                order_status: current.status,
                intent_status: settled.status,
            });
        }
        Err(e) => return Err(e),
    };

    reserve_stock(txn, intent.order_id, events).await?;
    events.push(Event::OrderStatusChanged {
        order_id: order.id,
        old_status: before.status,
        new_status: order.status,
    });

    Ok(ApplyOutcome::Applied {
        order_status: order.status,
        intent_status: settled.status,
    })
}

/// Takes stock for every line of a freshly paid order. A shortage gives back
/// what was taken and leaves the order paid but flagged.
async fn reserve_stock(
    txn: &DatabaseTransaction,
    order_id: Uuid,
    events: &mut Vec<Event>,
) -> Result<(), ServiceError> {
    let items = OrderService::items(txn, order_id).await?;
    let mut taken = Vec::with_capacity(items.len());

    for item in &items {
        if CatalogService::decrement_stock(txn, item.product_id, item.quantity).await? {
            taken.push(item);
            continue;
        }

        for done in taken {
            CatalogService::restore_stock(txn, done.product_id, done.quantity).await?;
        }
        flag(
            txn,
            order_id,
            format!(
                "insufficient stock for {} (needed {})",
                item.product_name, item.quantity
            ),
            events,
        )
        .await?;
        return Ok(());
    }
    Ok(())
}

async fn apply_failure(
    txn: &DatabaseTransaction,
    intent: &IntentModel,
    signal: &PaymentSignal,
    events: &mut Vec<Event>,
) -> Result<ApplyOutcome, ServiceError> {
    let failed = match IntentTracker::transition(
        txn,
        intent.id,
        &IntentStatus::OPEN,
        IntentStatus::Failed,
        IntentPatch {
            failure_reason: Some(
                signal
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| signal.event_type.clone()),
            ),
            raw_provider_payload: Some(signal.raw.clone()),
            ..Default::default()
        },
    )
    .await
    {
        Ok(failed) => failed,
        Err(ServiceError::Conflict(_)) => {
            let current = IntentTracker::find(txn, intent.id).await?;
            return Ok(ApplyOutcome::Stale {
                intent_status: current.status,
            });
        }
        Err(e) => return Err(e),
    };

    let before = OrderService::find(txn, intent.order_id).await?;
    let order_status = match OrderService::transition(
        txn,
        intent.order_id,
        &[OrderStatus::Pending, OrderStatus::AwaitingPayment],
        OrderStatus::PaymentFailed,
    )
    .await
    {
        Ok(order) => {
            events.push(Event::OrderStatusChanged {
                order_id: order.id,
                old_status: before.status,
                new_status: order.status,
            });
            order.status
        }
        // Order already settled some other way; the failure only closes the intent
        Err(ServiceError::Conflict(_)) => before.status,
        Err(e) => return Err(e),
    };

    Ok(ApplyOutcome::Applied {
        order_status,
        intent_status: failed.status,
    })
}

async fn apply_pending(
    txn: &DatabaseTransaction,
    intent: &IntentModel,
    signal: &PaymentSignal,
) -> Result<ApplyOutcome, ServiceError> {
    let order = OrderService::find(txn, intent.order_id).await?;
    match IntentTracker::transition(
        txn,
        intent.id,
        &[IntentStatus::Created],
        IntentStatus::PendingConfirmation,
        IntentPatch {
            raw_provider_payload: Some(signal.raw.clone()),
            ..Default::default()
        },
    )
    .await
    {
        Ok(updated) => Ok(ApplyOutcome::Applied {
            order_status: order.status,
            intent_status: updated.status,
        }),
        Err(ServiceError::Conflict(_)) => {
            let current = IntentTracker::find(txn, intent.id).await?;
            if current.status == IntentStatus::PendingConfirmation {
                Ok(ApplyOutcome::Applied {
                    order_status: order.status,
                    intent_status: current.status,
                })
            } else {
                Ok(ApplyOutcome::Stale {
                    intent_status: current.status,
                })
            }
        }
        Err(e) => Err(e),
    }
}
