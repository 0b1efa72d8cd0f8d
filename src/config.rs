use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub settlement: SettlementConfig,
    pub shipping: ShippingConfig,
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub dry_run: DryRunConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    /// Processor API base URL (default: the live Stripe endpoint)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Secret API key
    pub secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShippingConfig {
    /// Courier rate API base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Fixed rate in cents used when no courier API is configured
    #[serde(default = "default_flat_rate_cents")]
    pub flat_rate_cents: i64,
}

fn default_flat_rate_cents() -> i64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsConfig {
    /// ISO currency code for settlement
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Days a payment_pending order may wait for capture
    #[serde(default = "default_payment_window_days")]
    pub payment_window_days: i64,
}

fn default_currency() -> String {
    "eur".to_string()
}

fn default_payment_window_days() -> i64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between expiry sweep cycles
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DryRunConfig {
    /// Enable dry run mode (in-memory store, simulated gateway, flat shipping)
    pub enabled: bool,
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .set_default("sweeper.interval_secs", 300)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("HAGGLE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (HAGGLE_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("HAGGLE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.is_empty() {
            errors.push("database.url must be set".to_string());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be positive".to_string());
        }

        if !self.dry_run.enabled && self.settlement.secret_key.is_empty() {
            errors.push("settlement.secret_key must be set outside dry-run mode".to_string());
        }

        if self.shipping.flat_rate_cents < 0 {
            errors.push("shipping.flat_rate_cents must not be negative".to_string());
        }

        if self.payments.currency.len() != 3 {
            errors.push(format!(
                "payments.currency must be a 3-letter ISO code, got '{}'",
                self.payments.currency
            ));
        }
        if self.payments.payment_window_days <= 0 {
            errors.push("payments.payment_window_days must be positive".to_string());
        }

        if self.sweeper.interval_secs == 0 {
            errors.push("sweeper.interval_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
