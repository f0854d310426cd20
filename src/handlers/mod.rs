pub mod admin;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;
