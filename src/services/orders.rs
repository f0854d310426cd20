use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ActiveValue::Set, ColumnTrait,
    ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus, PaymentMethod},
        order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        catalog::CatalogService,
        pricing::{PricedLine, PricingPolicy},
    },
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[validate(length(min = 2, max = 2, message = "country must be an ISO 3166-1 alpha-2 code"))]
    pub country: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderLineInput {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateOrderInput {
    pub items: Vec<OrderLineInput>,
    pub payment_method: PaymentMethod,
    #[validate]
    pub shipping_address: ShippingAddress,
    #[serde(default)]
    #[validate(email)]
    pub customer_email: Option<String>,
    /// ISO 4217; defaults to the store currency
    #[serde(default)]
    #[validate(length(min = 3, max = 3))]
    pub currency: Option<String>,
}

/// An order together with its lines, in submission order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
}

/// Statuses an order may move to `to` from. This table is the state machine;
/// every status write goes through [`OrderService::transition`] with it.
pub fn allowed_sources(to: OrderStatus) -> &'static [OrderStatus] {
    use OrderStatus::*;
    match to {
        Pending => &[],
        AwaitingPayment => &[Pending, AwaitingPayment, PaymentFailed],
        Paid => &[Pending, AwaitingPayment, PaymentFailed],
        PaymentFailed => &[Pending, AwaitingPayment],
        Processing => &[Paid],
        Shipped => &[Processing],
        Delivered => &[Shipped],
        Cancelled => &[Pending, AwaitingPayment, Processing],
    }
}

pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    allowed_sources(to).contains(&from)
}

/// Statuses an operator may set directly. The rest belong to payment reconciliation.
const FULFILMENT_TARGETS: [OrderStatus; 4] = [
    OrderStatus::Processing,
    OrderStatus::Shipped,
    OrderStatus::Delivered,
    OrderStatus::Cancelled,
];

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    catalog: CatalogService,
    pricing: PricingPolicy,
    event_sender: EventSender,
    default_currency: String,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: CatalogService,
        pricing: PricingPolicy,
        event_sender: EventSender,
        default_currency: String,
    ) -> Self {
        Self {
            db,
            catalog,
            pricing,
            event_sender,
            default_currency,
        }
    }

    /// Prices the order from the catalog and persists it as `pending`.
    #[instrument(skip(self, input), fields(user_id = %user_id, lines = input.items.len()))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        input: CreateOrderInput,
    ) -> Result<OrderDetails, ServiceError> {
        input.validate()?;
        if input.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "order must contain at least one item".to_string(),
            ));
        }
        if let Some(line) = input.items.iter().find(|l| l.quantity <= 0) {
            return Err(ServiceError::ValidationError(format!(
                "quantity for product {} must be positive",
                line.product_id
            )));
        }

        let product_ids: Vec<Uuid> = input.items.iter().map(|l| l.product_id).collect();
        let products = self.catalog.resolve_many(&product_ids).await?;

        let mut priced = Vec::with_capacity(input.items.len());
        let mut lines = Vec::with_capacity(input.items.len());
        for (position, line) in input.items.iter().enumerate() {
            let product = products.get(&line.product_id).ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", line.product_id))
            })?;
            let priced_line = PricedLine {
                unit_price: product.price,
                quantity: line.quantity,
            };
            priced.push(priced_line);
            lines.push((position as i32, product, priced_line));
        }
        let totals = self.pricing.price(&priced);

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let shipping_address = serde_json::to_value(&input.shipping_address)?;
        let currency = input
            .currency
            .map(|c| c.to_uppercase())
            .unwrap_or_else(|| self.default_currency.clone());

        let txn = self.db.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        let order = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            status: Set(OrderStatus::Pending),
            payment_method: Set(input.payment_method),
            subtotal: Set(totals.subtotal),
            tax: Set(totals.tax),
            shipping: Set(totals.shipping),
            total: Set(totals.total),
            currency: Set(currency),
            payment_intent_id: Set(None),
            shipping_address: Set(shipping_address),
            customer_email: Set(input.customer_email),
            needs_review: Set(false),
            review_reason: Set(None),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
            paid_at: Set(None),
            shipped_at: Set(None),
            delivered_at: Set(None),
            cancelled_at: Set(None),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(lines.len());
        for (position, product, priced_line) in lines {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                position: Set(position),
                product_id: Set(product.id),
                product_name: Set(product.name.clone()),
                quantity: Set(priced_line.quantity),
                unit_price: Set(priced_line.unit_price),
                line_total: Set(priced_line.line_total()),
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        txn.commit().await.map_err(|e| {
            error!("Failed to commit order {}: {}", order_id, e);
            ServiceError::DatabaseError(e)
        })?;

        metrics::counter!("storefront.orders.created", 1);
        info!(order_id = %order_id, total = %order.total, "Order created");
        self.event_sender.publish(Event::OrderCreated(order_id)).await;

        Ok(OrderDetails { order, items })
    }

    pub async fn get_order(&self, id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = Self::find(&*self.db, id).await?;
        let items = Self::items(&*self.db, id).await?;
        Ok(OrderDetails { order, items })
    }

    /// Like [`get_order`](Self::get_order) but only for the owner.
    pub async fn get_order_for_user(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let details = self.get_order(id).await?;
        if details.order.user_id != user_id {
            warn!(order_id = %id, %user_id, "Order access denied");
            return Err(ServiceError::Forbidden(format!(
                "order {} belongs to another user",
                id
            )));
        }
        Ok(details)
    }

    pub async fn find<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<OrderModel, ServiceError> {
        OrderEntity::find_by_id(id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))
    }

    pub async fn items<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<OrderItemModel>, ServiceError> {
        Ok(OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::Position)
            .all(conn)
            .await?)
    }

    /// Compare-and-set: moves the order to `to` only if its current status is
    /// in `from`. Returns the updated row, `Conflict` when the status did not
    /// match, or `NotFound`.
    pub async fn transition<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> Result<OrderModel, ServiceError> {
        let now = Utc::now();
        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(to.to_value()))
            .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
            .col_expr(order::Column::UpdatedAt, Expr::value(now));

        update = match to {
            OrderStatus::Paid => update.col_expr(order::Column::PaidAt, Expr::value(now)),
            OrderStatus::Shipped => update.col_expr(order::Column::ShippedAt, Expr::value(now)),
            OrderStatus::Delivered => {
                update.col_expr(order::Column::DeliveredAt, Expr::value(now))
            }
            OrderStatus::Cancelled => {
                update.col_expr(order::Column::CancelledAt, Expr::value(now))
            }
            _ => update,
        };

        let result = update
            .filter(order::Column::Id.eq(id))
            .filter(order::Column::Status.is_in(from.iter().map(|s| s.to_value())))
            .exec(conn)
            .await?;

        let current = Self::find(conn, id).await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "order {} is {}, cannot move to {}",
                id, current.status, to
            )));
        }
        Ok(current)
    }

    pub async fn attach_intent<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        intent_id: Uuid,
    ) -> Result<(), ServiceError> {
        OrderEntity::update_many()
            .col_expr(order::Column::PaymentIntentId, Expr::value(Some(intent_id)))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(id))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Marks the order for manual review. Reasons accumulate.
    pub async fn flag_for_review<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        reason: &str,
    ) -> Result<(), ServiceError> {
        let current = Self::find(conn, id).await?;
        let reason = match current.review_reason {
            Some(existing) if !existing.is_empty() => format!("{}; {}", existing, reason),
            _ => reason.to_string(),
        };
        OrderEntity::update_many()
            .col_expr(order::Column::NeedsReview, Expr::value(true))
            .col_expr(order::Column::ReviewReason, Expr::value(Some(reason.clone())))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(id))
            .exec(conn)
            .await?;
        metrics::counter!("storefront.orders.flagged_for_review", 1);
        warn!(order_id = %id, %reason, "Order flagged for review");
        Ok(())
    }

    /// The caller's own orders, newest first, without their lines.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<OrderModel>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    pub async fn list_flagged(&self) -> Result<Vec<OrderModel>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::NeedsReview.eq(true))
            .order_by_asc(order::Column::UpdatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Fulfilment and cancellation. Payment statuses are rejected here since
    /// only reconciliation may set them.
    #[instrument(skip(self), fields(order_id = %id, to = %to))]
    pub async fn update_status(&self, id: Uuid, to: OrderStatus) -> Result<OrderModel, ServiceError> {
        if !FULFILMENT_TARGETS.contains(&to) {
            return Err(ServiceError::ValidationError(format!(
                "status {} is set by payment reconciliation",
                to
            )));
        }

        let before = Self::find(&*self.db, id).await?;
        if !is_valid_transition(before.status, to) {
            return Err(ServiceError::Conflict(format!(
                "order {} is {}, cannot move to {}",
                id, before.status, to
            )));
        }

        let updated = Self::transition(&*self.db, id, allowed_sources(to), to).await?;
        info!(from = %before.status, to = %updated.status, "Order status updated");
        self.event_sender
            .publish(Event::OrderStatusChanged {
                order_id: id,
                old_status: before.status,
                new_status: updated.status,
            })
            .await;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_statuses_follow_the_state_machine() {
        use OrderStatus::*;
        assert!(is_valid_transition(Pending, AwaitingPayment));
        assert!(is_valid_transition(AwaitingPayment, Paid));
        assert!(is_valid_transition(AwaitingPayment, PaymentFailed));
        assert!(is_valid_transition(PaymentFailed, AwaitingPayment));
        assert!(!is_valid_transition(Delivered, Paid));
        assert!(!is_valid_transition(Cancelled, Paid));
        assert!(!is_valid_transition(Paid, PaymentFailed));
    }

    #[test]
    fn fulfilment_runs_in_order() {
        use OrderStatus::*;
        assert!(is_valid_transition(Paid, Processing));
        assert!(is_valid_transition(Processing, Shipped));
        assert!(is_valid_transition(Shipped, Delivered));
        assert!(!is_valid_transition(Paid, Shipped));
        assert!(!is_valid_transition(Shipped, Cancelled));
        assert!(is_valid_transition(Processing, Cancelled));
    }

    #[test]
    fn nothing_returns_to_pending() {
        assert!(allowed_sources(OrderStatus::Pending).is_empty());
    }
}
