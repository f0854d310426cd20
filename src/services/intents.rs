use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveEnum, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder,
};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::Model as OrderModel,
        payment_intent::{
            self, Entity as IntentEntity, IntentStatus, Model as IntentModel, PaymentProvider,
        },
    },
    errors::ServiceError,
    gateways::InitiatedPayment,
};

/// Result of asking for an order's active intent.
#[derive(Debug, Clone)]
pub enum IntentClaim {
    /// A fresh `initiating` intent now owned by the caller
    Claimed(IntentModel),
    /// Someone else's active intent, in whatever state it is
    Existing(IntentModel),
}

/// Optional column updates applied together with a status change.
#[derive(Debug, Clone, Default)]
pub struct IntentPatch {
    pub provider_correlation_id: Option<String>,
    pub secondary_reference: Option<String>,
    pub client_action: Option<Value>,
    pub raw_provider_payload: Option<Value>,
    pub provider_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Tracks payment intents and guards their lifecycle.
#[derive(Clone)]
pub struct IntentTracker {
    db: Arc<DatabaseConnection>,
}

impl IntentTracker {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: Uuid) -> Result<IntentModel, ServiceError> {
        Self::find(&*self.db, id).await
    }

    pub async fn find<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<IntentModel, ServiceError> {
        IntentEntity::find_by_id(id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment intent {} not found", id)))
    }

    pub async fn active_for_order(&self, order_id: Uuid) -> Result<Option<IntentModel>, ServiceError> {
        Ok(IntentEntity::find()
            .filter(payment_intent::Column::ActiveOrderId.eq(order_id))
            .one(&*self.db)
            .await?)
    }

    /// Returns the order's active intent, or claims the slot with a new
    /// `initiating` intent. Losing the unique-index race yields the winner's
    /// intent as `Existing`.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn get_or_create_active_intent(
        &self,
        order: &OrderModel,
    ) -> Result<IntentClaim, ServiceError> {
        // The slot may free up between the insert and the re-read
        for _ in 0..3 {
            if let Some(existing) = self.active_for_order(order.id).await? {
                return Ok(IntentClaim::Existing(existing));
            }

            let now = Utc::now();
            let id = Uuid::new_v4();
            let claim = payment_intent::ActiveModel {
                id: Set(id),
                order_id: Set(order.id),
                active_order_id: Set(Some(order.id)),
                provider: Set(PaymentProvider::from(order.payment_method)),
                provider_correlation_id: Set(None),
                secondary_reference: Set(None),
                amount: Set(order.total),
                currency: Set(order.currency.clone()),
                status: Set(IntentStatus::Initiating),
                client_action: Set(None),
                raw_provider_payload: Set(None),
                provider_reference: Set(None),
                failure_reason: Set(None),
                expires_at: Set(None),
                version: Set(1),
                created_at: Set(now),
                updated_at: Set(now),
                settled_at: Set(None),
            };

            let inserted = IntentEntity::insert(claim)
                .on_conflict(
                    OnConflict::column(payment_intent::Column::ActiveOrderId)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&*self.db)
                .await?;

            if inserted == 1 {
                debug!(intent_id = %id, "Claimed payment slot");
                return Ok(IntentClaim::Claimed(self.get(id).await?));
            }
        }

        Err(ServiceError::Conflict(format!(
            "payment for order {} is changing concurrently, retry",
            order.id
        )))
    }

    /// Compare-and-set on intent status. Terminal targets release the
    /// order's active slot; `succeeded` stamps `settled_at`.
    pub async fn transition<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        from: &[IntentStatus],
        to: IntentStatus,
        patch: IntentPatch,
    ) -> Result<IntentModel, ServiceError> {
        let now = Utc::now();
        let mut update = IntentEntity::update_many()
            .col_expr(payment_intent::Column::Status, Expr::value(to.to_value()))
            .col_expr(
                payment_intent::Column::Version,
                Expr::col(payment_intent::Column::Version).add(1),
            )
            .col_expr(payment_intent::Column::UpdatedAt, Expr::value(now));

        if to.is_terminal() {
            update = update.col_expr(
                payment_intent::Column::ActiveOrderId,
                Expr::value(Option::<Uuid>::None),
            );
        }
        if to == IntentStatus::Succeeded {
            update = update.col_expr(payment_intent::Column::SettledAt, Expr::value(now));
        }
        if let Some(v) = patch.provider_correlation_id {
            update = update.col_expr(
                payment_intent::Column::ProviderCorrelationId,
                Expr::value(Some(v)),
            );
        }
        if let Some(v) = patch.secondary_reference {
            update = update.col_expr(
                payment_intent::Column::SecondaryReference,
                Expr::value(Some(v)),
            );
        }
        if let Some(v) = patch.client_action {
            update = update.col_expr(payment_intent::Column::ClientAction, Expr::value(v));
        }
        if let Some(v) = patch.raw_provider_payload {
            update = update.col_expr(payment_intent::Column::RawProviderPayload, Expr::value(v));
        }
        if let Some(v) = patch.provider_reference {
            update = update.col_expr(
                payment_intent::Column::ProviderReference,
                Expr::value(Some(v)),
            );
        }
        if let Some(v) = patch.failure_reason {
            update = update.col_expr(payment_intent::Column::FailureReason, Expr::value(Some(v)));
        }
        if let Some(v) = patch.expires_at {
            update = update.col_expr(payment_intent::Column::ExpiresAt, Expr::value(v));
        }

        let result = update
            .filter(payment_intent::Column::Id.eq(id))
            .filter(payment_intent::Column::Status.is_in(from.iter().map(|s| s.to_value())))
            .exec(conn)
            .await?;

        let current = Self::find(conn, id).await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "payment intent {} is {}, cannot move to {}",
                id, current.status, to
            )));
        }
        Ok(current)
    }

    /// `initiating → created | pending_confirmation` once the provider has
    /// accepted the request.
    pub async fn confirm_initiated<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        initiated: InitiatedPayment,
    ) -> Result<IntentModel, ServiceError> {
        let expires_at = Utc::now()
            + ChronoDuration::from_std(initiated.expires_in)
                .unwrap_or_else(|_| ChronoDuration::hours(1));
        let intent = Self::transition(
            conn,
            id,
            &[IntentStatus::Initiating],
            initiated.status,
            IntentPatch {
                provider_correlation_id: Some(initiated.correlation_id),
                secondary_reference: initiated.secondary_reference,
                client_action: Some(initiated.client_action),
                raw_provider_payload: Some(initiated.raw),
                expires_at: Some(expires_at),
                ..Default::default()
            },
        )
        .await?;
        info!(intent_id = %id, status = %intent.status, "Payment intent initiated");
        Ok(intent)
    }

    /// `initiating → failed`, freeing the order for another attempt.
    pub async fn abandon(&self, id: Uuid, reason: &str) -> Result<IntentModel, ServiceError> {
        warn!(intent_id = %id, %reason, "Abandoning payment intent claim");
        Self::transition(
            &*self.db,
            id,
            &[IntentStatus::Initiating],
            IntentStatus::Failed,
            IntentPatch {
                failure_reason: Some(reason.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    /// Exact match on `(provider, provider_correlation_id)`.
    pub async fn resolve<C: ConnectionTrait>(
        conn: &C,
        provider: PaymentProvider,
        correlation_id: &str,
    ) -> Result<IntentModel, ServiceError> {
        IntentEntity::find()
            .filter(payment_intent::Column::Provider.eq(provider.to_value()))
            .filter(payment_intent::Column::ProviderCorrelationId.eq(correlation_id))
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "no {} payment intent for {}",
                    provider, correlation_id
                ))
            })
    }

    pub async fn list_for_order(&self, order_id: Uuid) -> Result<Vec<IntentModel>, ServiceError> {
        Ok(IntentEntity::find()
            .filter(payment_intent::Column::OrderId.eq(order_id))
            .order_by_asc(payment_intent::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Open intents whose customer window has passed.
    pub async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<IntentModel>, ServiceError> {
        let open = IntentEntity::find()
            .filter(
                payment_intent::Column::Status
                    .is_in(IntentStatus::OPEN.iter().map(|s| s.to_value())),
            )
            .filter(payment_intent::Column::ExpiresAt.is_not_null())
            .order_by_asc(payment_intent::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(open
            .into_iter()
            .filter(|i| i.expires_at.map(|at| at <= now).unwrap_or(false))
            .collect())
    }

    /// `initiating` claims older than `max_age`; their request never finished.
    pub async fn find_stale_claims(
        &self,
        now: DateTime<Utc>,
        max_age: ChronoDuration,
    ) -> Result<Vec<IntentModel>, ServiceError> {
        let claims = IntentEntity::find()
            .filter(payment_intent::Column::Status.eq(IntentStatus::Initiating.to_value()))
            .all(&*self.db)
            .await?;
        let cutoff = now - max_age;
        Ok(claims.into_iter().filter(|i| i.created_at < cutoff).collect())
    }
}
