use crate::entities::order::OrderStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes after a commit. The state change already happened, so a closed
    /// channel is logged rather than surfaced to the caller.
    pub async fn publish(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            error!("{}", e);
        }
    }
}

/// Facts published after the transaction that produced them has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderFlaggedForReview {
        order_id: Uuid,
        reason: String,
    },
    PaymentInitiated {
        order_id: Uuid,
        intent_id: Uuid,
    },
}

impl Event {
    pub fn order_id(&self) -> Uuid {
        match self {
            Event::OrderCreated(order_id) => *order_id,
            Event::OrderStatusChanged { order_id, .. }
            | Event::OrderFlaggedForReview { order_id, .. }
            | Event::PaymentInitiated { order_id, .. } => *order_id,
        }
    }
}

// Handlers implementing this trait process events asynchronously.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Drains the channel and hands every event to each registered handler.
/// Handler failures are logged; the loop ends when every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(order_id = %event.order_id(), "Received event: {:?}", event);

        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!(
                    "Failed to handle event: order_id={}, error={}",
                    event.order_id(),
                    e
                );
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventHandler for Recording {
        async fn handle_event(&self, event: &Event) -> Result<(), String> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle_event(&self, _event: &Event) -> Result<(), String> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn every_handler_sees_every_event() {
        let (tx, rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        let recording = Arc::new(Recording::default());

        let order_id = Uuid::new_v4();
        sender.publish(Event::OrderCreated(order_id)).await;
        sender
            .publish(Event::OrderStatusChanged {
                order_id,
                old_status: OrderStatus::AwaitingPayment,
                new_status: OrderStatus::Paid,
            })
            .await;
        drop(sender);

        process_events(rx, vec![Arc::new(Failing), recording.clone()]).await;

        let seen = recording.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| e.order_id() == order_id));
    }
}
