// Orders and catalog
pub mod catalog;
pub mod orders;
pub mod pricing;

// Payments
pub mod intents;
pub mod payments;
pub mod reconciliation;
pub mod sweep;

// Customer notifications
pub mod notifications;
