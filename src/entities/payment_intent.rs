use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::order::PaymentMethod;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentProvider {
    #[sea_orm(string_value = "stripe")]
    Stripe,
    #[sea_orm(string_value = "mpesa")]
    Mpesa,
    #[sea_orm(string_value = "paypal")]
    Paypal,
}

impl From<PaymentMethod> for PaymentProvider {
    fn from(method: PaymentMethod) -> Self {
        match method {
            PaymentMethod::Card => PaymentProvider::Stripe,
            PaymentMethod::Mpesa => PaymentProvider::Mpesa,
            PaymentMethod::Paypal => PaymentProvider::Paypal,
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntentStatus {
    /// Claimed locally, provider call in flight
    #[sea_orm(string_value = "initiating")]
    Initiating,
    #[sea_orm(string_value = "created")]
    Created,
    #[sea_orm(string_value = "pending_confirmation")]
    PendingConfirmation,
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "expired")]
    Expired,
}

impl IntentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Expired)
    }

    /// Statuses in which the provider may still report an outcome.
    pub const OPEN: [IntentStatus; 2] = [IntentStatus::Created, IntentStatus::PendingConfirmation];
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_intents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,

    /// Equal to `order_id` while the intent is non-terminal, NULL afterwards.
    /// The unique index on this column allows one active intent per order.
    #[sea_orm(unique)]
    pub active_order_id: Option<Uuid>,

    pub provider: PaymentProvider,
    /// Stripe PaymentIntent id, M-Pesa MerchantRequestID or PayPal order id
    pub provider_correlation_id: Option<String>,
    /// M-Pesa CheckoutRequestID, used for STK queries
    pub secondary_reference: Option<String>,

    pub amount: Decimal,
    pub currency: String,
    pub status: IntentStatus,

    /// What the client needs to complete the payment
    pub client_action: Option<Json>,
    /// Last provider payload seen for this intent
    pub raw_provider_payload: Option<Json>,
    /// Receipt number or capture id once settled
    pub provider_reference: Option<String>,
    pub failure_reason: Option<String>,

    pub expires_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
