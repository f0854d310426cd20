use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::NotificationConfig,
    entities::{
        notification_log::{self, Entity as NotificationLogEntity},
        order::OrderStatus,
    },
    errors::ServiceError,
    events::{Event, EventHandler},
    services::orders::OrderService,
};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Email API rejected message: {0}")]
    Rejected(String),
}

/// A rendered customer message.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub order_id: Uuid,
    pub recipient: String,
    pub template: &'static str,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Writes notifications to the log instead of sending them.
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            order_id = %notification.order_id,
            recipient = %notification.recipient,
            template = notification.template,
            subject = %notification.subject,
            "Notification (log transport)"
        );
        Ok(())
    }
}

/// Posts `{from, to, subject, text}` to a JSON email API.
pub struct HttpEmailTransport {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    from: String,
}

impl HttpEmailTransport {
    pub fn new(client: reqwest::Client, url: String, api_key: Option<String>, from: String) -> Self {
        Self {
            client,
            url,
            api_key,
            from,
        }
    }
}

#[async_trait]
impl NotificationTransport for HttpEmailTransport {
    #[instrument(skip(self, notification), fields(order_id = %notification.order_id, template = notification.template))]
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "from": self.from,
            "to": notification.recipient,
            "subject": notification.subject,
            "text": notification.body,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotificationError::Rejected(response.status().to_string()));
        }
        Ok(())
    }
}

/// Picks the transport for a notification config.
pub fn transport_from_config(
    config: &NotificationConfig,
    client: reqwest::Client,
) -> Arc<dyn NotificationTransport> {
    match &config.email_api_url {
        Some(url) => Arc::new(HttpEmailTransport::new(
            client,
            url.clone(),
            config.email_api_key.clone(),
            config.email_from.clone(),
        )),
        None => Arc::new(LogTransport),
    }
}

/// Template and subject for a status the customer hears about.
fn template_for(status: OrderStatus) -> Option<(&'static str, &'static str)> {
    match status {
        OrderStatus::Pending => Some(("order_received", "We received your order")),
        OrderStatus::Paid => Some(("payment_received", "Payment received")),
        OrderStatus::PaymentFailed => Some(("payment_failed", "Your payment did not go through")),
        OrderStatus::Shipped => Some(("order_shipped", "Your order has shipped")),
        OrderStatus::Delivered => Some(("order_delivered", "Your order was delivered")),
        OrderStatus::Cancelled => Some(("order_cancelled", "Your order was cancelled")),
        OrderStatus::AwaitingPayment | OrderStatus::Processing => None,
    }
}

/// Sends one customer notification per committed order transition.
pub struct NotificationDispatcher {
    db: Arc<DatabaseConnection>,
    transport: Arc<dyn NotificationTransport>,
}

impl NotificationDispatcher {
    pub fn new(db: Arc<DatabaseConnection>, transport: Arc<dyn NotificationTransport>) -> Self {
        Self { db, transport }
    }

    /// Claims `(order_id, status)`; false when it was already claimed.
    async fn claim(
        &self,
        id: Uuid,
        order_id: Uuid,
        status: OrderStatus,
        template: &str,
    ) -> Result<bool, ServiceError> {
        let row = notification_log::ActiveModel {
            id: Set(id),
            order_id: Set(order_id),
            status: Set(status.to_string()),
            template: Set(template.to_string()),
            recipient: Set(None),
            delivered: Set(false),
            error: Set(None),
            created_at: Set(Utc::now()),
        };
        let inserted = NotificationLogEntity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    notification_log::Column::OrderId,
                    notification_log::Column::Status,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(inserted == 1)
    }

    async fn record(
        &self,
        id: Uuid,
        recipient: Option<String>,
        delivered: bool,
        error: Option<String>,
    ) -> Result<(), ServiceError> {
        NotificationLogEntity::update_many()
            .col_expr(notification_log::Column::Recipient, Expr::value(recipient))
            .col_expr(notification_log::Column::Delivered, Expr::value(delivered))
            .col_expr(notification_log::Column::Error, Expr::value(error))
            .filter(notification_log::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(order_id = %order_id, status = %status))]
    pub async fn notify(&self, order_id: Uuid, status: OrderStatus) -> Result<(), ServiceError> {
        let Some((template, subject)) = template_for(status) else {
            return Ok(());
        };

        let id = Uuid::new_v4();
        if !self.claim(id, order_id, status, template).await? {
            debug!("Notification already sent");
            return Ok(());
        }

        let order = OrderService::find(&*self.db, order_id).await?;
        let Some(recipient) = order.customer_email.clone() else {
            return self
                .record(id, None, false, Some("order has no customer email".to_string()))
                .await;
        };

        let notification = Notification {
            order_id,
            recipient: recipient.clone(),
            template,
            subject: format!("{} (order {})", subject, order_id),
            body: format!(
                "Order {} is now {}. Total: {} {}.",
                order_id, status, order.total, order.currency
            ),
        };

        match self.transport.send(&notification).await {
            Ok(()) => {
                metrics::counter!("storefront.notifications.sent", 1, "template" => template);
                self.record(id, Some(recipient), true, None).await
            }
            Err(e) => {
                warn!("Notification delivery failed: {}", e);
                metrics::counter!("storefront.notifications.failed", 1, "template" => template);
                self.record(id, Some(recipient), false, Some(e.to_string())).await
            }
        }
    }
}

#[async_trait]
impl EventHandler for NotificationDispatcher {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        let result = match event {
            Event::OrderCreated(order_id) => self.notify(*order_id, OrderStatus::Pending).await,
            Event::OrderStatusChanged {
                order_id,
                new_status,
                ..
            } => self.notify(*order_id, *new_status).await,
            Event::OrderFlaggedForReview { order_id, reason } => {
                warn!(%order_id, %reason, "Order needs manual review");
                Ok(())
            }
            Event::PaymentInitiated { .. } => Ok(()),
        };
        result.map_err(|e| e.to_string())
    }
}
