use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Stripe card payments.
#[derive(Clone, Debug, Deserialize)]
pub struct StripeConfig {
    pub secret_key: String,
    /// `whsec_...` signing secret for the webhook endpoint
    pub webhook_secret: String,
    #[serde(default = "default_stripe_api_base")]
    pub api_base: String,
    /// Accepted clock skew on `stripe-signature` timestamps
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,
    /// How long a card intent may wait for customer confirmation
    #[serde(default = "default_stripe_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
}

/// M-Pesa (Daraja) STK Push.
#[derive(Clone, Debug, Deserialize)]
pub struct MpesaConfig {
    #[serde(default = "default_mpesa_api_base")]
    pub api_base: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub passkey: String,
    pub shortcode: String,
    /// Public URL of `/payments/mpesa/callback`, including the token query if used
    pub callback_url: String,
    /// Shared secret expected on callbacks (`x-callback-token` header or `token` query)
    #[serde(default)]
    pub callback_token: Option<String>,
    #[serde(default = "default_mpesa_stk_timeout_secs")]
    pub stk_timeout_secs: u64,
}

/// PayPal Checkout (Orders v2).
#[derive(Clone, Debug, Deserialize)]
pub struct PaypalConfig {
    #[serde(default = "default_paypal_api_base")]
    pub api_base: String,
    pub client_id: String,
    pub client_secret: String,
    /// Registered webhook id; enables the verify-webhook-signature API
    #[serde(default)]
    pub webhook_id: Option<String>,
    /// Fallback shared secret header (`x-webhook-token`)
    #[serde(default)]
    pub webhook_token: Option<String>,
    pub return_url: String,
    pub cancel_url: String,
    #[serde(default = "default_paypal_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
}

/// Outbound customer notifications.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NotificationConfig {
    /// JSON email API endpoint; notifications are only logged when unset
    #[serde(default)]
    pub email_api_url: Option<String>,
    #[serde(default)]
    pub email_api_key: Option<String>,
    #[serde(default = "default_email_from")]
    pub email_from: String,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Request timeout for the HTTP surface (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Currency used when an order does not name one
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Sales tax rate (as decimal, e.g., 0.15 for 15%)
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: f64,

    /// Flat shipping charge below the free-shipping threshold
    #[serde(default = "default_flat_shipping")]
    #[validate(custom = "validate_money")]
    pub flat_shipping: f64,

    /// Subtotals strictly above this ship for free
    #[serde(default = "default_free_shipping_threshold")]
    #[validate(custom = "validate_money")]
    pub free_shipping_threshold: f64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Interval between reconciliation sweeps; 0 disables the background sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// An `initiating` claim older than this is considered abandoned
    #[serde(default = "default_initiation_timeout_secs")]
    pub initiation_timeout_secs: u64,

    /// Provider call retries (initiate)
    #[serde(default = "default_provider_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub provider_max_attempts: u32,

    #[serde(default = "default_provider_initial_backoff_ms")]
    pub provider_initial_backoff_ms: u64,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    #[serde(default)]
    pub stripe: Option<StripeConfig>,

    #[serde(default)]
    pub mpesa: Option<MpesaConfig>,

    #[serde(default)]
    pub paypal: Option<PaypalConfig>,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            default_currency: default_currency(),
            tax_rate: default_tax_rate(),
            flat_shipping: default_flat_shipping(),
            free_shipping_threshold: default_free_shipping_threshold(),
            event_channel_capacity: default_event_channel_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
            initiation_timeout_secs: default_initiation_timeout_secs(),
            provider_max_attempts: default_provider_max_attempts(),
            provider_initial_backoff_ms: default_provider_initial_backoff_ms(),
            provider_timeout_secs: default_provider_timeout_secs(),
            stripe: None,
            mpesa: None,
            paypal: None,
            notifications: NotificationConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    /// Builds the pricing policy from the float settings.
    ///
    /// Floats go through their shortest decimal rendering so `0.15` becomes
    /// exactly `0.15` rather than its binary approximation.
    pub fn pricing_policy(&self) -> Result<crate::services::pricing::PricingPolicy, AppConfigError> {
        let to_decimal = |field: &'static str, value: f64| {
            Decimal::from_str(&value.to_string()).map_err(|_| {
                let mut errors = ValidationErrors::new();
                errors.add(field, ValidationError::new("decimal"));
                AppConfigError::Validation(errors)
            })
        };
        Ok(crate::services::pricing::PricingPolicy {
            tax_rate: to_decimal("tax_rate", self.tax_rate)?,
            flat_shipping: to_decimal("flat_shipping", self.flat_shipping)?,
            free_shipping_threshold: to_decimal(
                "free_shipping_threshold",
                self.free_shipping_threshold,
            )?,
        })
    }

    pub fn retry_config(&self) -> crate::retry::RetryConfig {
        crate::retry::RetryConfig {
            max_attempts: self.provider_max_attempts,
            initial_delay: Duration::from_millis(self.provider_initial_backoff_ms),
            ..Default::default()
        }
    }

    /// Checks that span several fields and cannot be expressed as derive rules.
    pub fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development()
            && !self.cors_allow_any_origin
            && self
                .cors_allowed_origins
                .as_deref()
                .map(|s| s.trim().is_empty())
                .unwrap_or(true)
        {
            let mut err = ValidationError::new("cors_allowed_origins");
            err.message = Some(
                "cors_allowed_origins must be set outside development (or set cors_allow_any_origin)"
                    .into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if self.is_production() {
            if let Some(mpesa) = &self.mpesa {
                if mpesa.callback_token.as_deref().unwrap_or("").is_empty() {
                    let mut err = ValidationError::new("mpesa.callback_token");
                    err.message = Some("M-Pesa callbacks must be authenticated in production".into());
                    errors.add("mpesa", err);
                }
            }
            if let Some(paypal) = &self.paypal {
                if paypal.webhook_id.is_none() && paypal.webhook_token.is_none() {
                    let mut err = ValidationError::new("paypal.webhook_id");
                    err.message = Some(
                        "PayPal webhooks need webhook_id or webhook_token in production".into(),
                    );
                    errors.add("paypal", err);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_true_bool() -> bool {
    true
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_currency() -> String {
    "USD".to_string()
}
fn default_tax_rate() -> f64 {
    0.15
}
fn default_flat_shipping() -> f64 {
    10.0
}
fn default_free_shipping_threshold() -> f64 {
    100.0
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_initiation_timeout_secs() -> u64 {
    120
}
fn default_provider_max_attempts() -> u32 {
    3
}
fn default_provider_initial_backoff_ms() -> u64 {
    200
}
fn default_provider_timeout_secs() -> u64 {
    15
}
fn default_webhook_tolerance_secs() -> u64 {
    300
}
fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}
fn default_stripe_confirmation_timeout_secs() -> u64 {
    3600
}
fn default_mpesa_api_base() -> String {
    "https://sandbox.safaricom.co.ke".to_string()
}
fn default_mpesa_stk_timeout_secs() -> u64 {
    60
}
fn default_paypal_api_base() -> String {
    "https://api-m.sandbox.paypal.com".to_string()
}
fn default_paypal_approval_timeout_secs() -> u64 {
    3 * 3600
}
fn default_email_from() -> String {
    "orders@storefront.local".to_string()
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_tax_rate(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || rate < 0.0 || rate > 1.0 {
        let mut err = ValidationError::new("tax_rate");
        err.message = Some("tax_rate must be a finite value between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_money(amount: f64) -> Result<(), ValidationError> {
    if !amount.is_finite() || amount < 0.0 {
        let mut err = ValidationError::new("money");
        err.message = Some("amount must be a finite, non-negative value".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_payments={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*, nested with `__`, e.g. APP__STRIPE__SECRET_KEY)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn non_dev_requires_cors_origins() {
        let cfg = base_config();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn non_dev_with_origins_passes() {
        let mut cfg = base_config();
        cfg.cors_allowed_origins = Some("https://shop.example.com".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn production_requires_mpesa_callback_token() {
        let mut cfg = base_config();
        cfg.cors_allow_any_origin = true;
        cfg.mpesa = Some(MpesaConfig {
            api_base: default_mpesa_api_base(),
            consumer_key: "key".into(),
            consumer_secret: "secret".into(),
            passkey: "pass".into(),
            shortcode: "174379".into(),
            callback_url: "https://shop.example.com/payments/mpesa/callback".into(),
            callback_token: None,
            stk_timeout_secs: 60,
        });
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.field_errors().contains_key("mpesa"));

        if let Some(mpesa) = cfg.mpesa.as_mut() {
            mpesa.callback_token = Some("s3cret".into());
        }
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn derive_rules_reject_bad_tax_rate() {
        let mut cfg = base_config();
        cfg.tax_rate = 1.5;
        assert!(cfg.validate().is_err());
        cfg.tax_rate = 0.15;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn pricing_policy_uses_exact_decimals() {
        let cfg = base_config();
        let policy = cfg.pricing_policy().unwrap();
        assert_eq!(policy.tax_rate, dec!(0.15));
        assert_eq!(policy.flat_shipping, dec!(10));
        assert_eq!(policy.free_shipping_threshold, dec!(100));
    }

    #[test]
    fn sweep_interval_zero_disables_sweep() {
        let mut cfg = base_config();
        assert_eq!(cfg.sweep_interval(), Some(Duration::from_secs(30)));
        cfg.sweep_interval_secs = 0;
        assert_eq!(cfg.sweep_interval(), None);
    }
}
