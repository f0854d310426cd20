pub mod notification_log;
pub mod order;
pub mod order_item;
pub mod payment_intent;
pub mod product;
pub mod webhook_event;
