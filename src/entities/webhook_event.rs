use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::payment_intent::PaymentProvider;

/// Where a payment signal came from.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventSource {
    #[sea_orm(string_value = "webhook")]
    Webhook,
    #[sea_orm(string_value = "poll")]
    Poll,
}

/// Append-only record of every inbound payment signal.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub provider: PaymentProvider,
    pub provider_correlation_id: String,
    pub event_type: String,
    pub provider_event_id: Option<String>,
    /// `provider:correlation:event_type:provider_event_id`
    #[sea_orm(unique)]
    pub dedupe_key: String,
    pub source: EventSource,
    pub raw_payload: Json,
    /// Normalized signal, kept for replay
    pub signal: Json,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
