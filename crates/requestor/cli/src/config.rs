//! Configuration for the requestor binary

use requestor_core::{HttpApiConfig, NegotiationConfig, PricingConstraints, SessionConfig};
use requestor_payment::PaymentConfig;
use requestor_tasks::DistributorConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main requestor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestorConfig {
    /// Daemon connection
    #[serde(default)]
    pub daemon: HttpApiConfig,

    /// Run store
    #[serde(default)]
    pub storage: StorageConfig,

    /// Run behaviour
    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Run store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite connection URL
    #[serde(default = "default_storage_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_storage_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// How a run rents and uses activities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Concurrent activities
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Spending cap per trailing hour
    #[serde(default = "default_budget")]
    pub budget_per_hour: Decimal,

    /// Highest acceptable cost per result
    #[serde(default)]
    pub max_price: Option<Decimal>,

    /// Offers with a higher hourly estimate are not negotiated
    #[serde(default)]
    pub max_hourly_price: Option<f64>,

    #[serde(default)]
    pub pricing: PricingConstraints,

    #[serde(default = "default_payment_platform")]
    pub payment_platform: String,

    /// Subnet used when the work source names none
    #[serde(default = "default_subnet_tag")]
    pub subnet_tag: Option<String>,

    /// Lifetime of the published demand
    #[serde(default = "default_demand_expiration")]
    pub demand_expiration_secs: u64,

    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout_secs: u64,

    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Time an activity runs before its cost per result is judged
    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,

    #[serde(default = "default_max_activity_failures")]
    pub max_activity_failures: u32,

    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,

    #[serde(default = "default_max_agreement_failures")]
    pub max_agreement_failures: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            budget_per_hour: default_budget(),
            max_price: None,
            max_hourly_price: None,
            pricing: PricingConstraints::default(),
            payment_platform: default_payment_platform(),
            subnet_tag: default_subnet_tag(),
            demand_expiration_secs: default_demand_expiration(),
            prepare_timeout_secs: default_prepare_timeout(),
            task_timeout_secs: default_task_timeout(),
            warmup_secs: default_warmup(),
            max_activity_failures: default_max_activity_failures(),
            max_task_attempts: default_max_task_attempts(),
            max_agreement_failures: default_max_agreement_failures(),
        }
    }
}

impl RunConfig {
    pub fn payment(&self) -> PaymentConfig {
        PaymentConfig {
            budget_per_hour: self.budget_per_hour,
            max_price: self.max_price,
            warmup: Duration::from_secs(self.warmup_secs),
            payment_platform: self.payment_platform.clone(),
        }
    }

    pub fn distributor(&self) -> DistributorConfig {
        DistributorConfig {
            workers: self.workers,
            prepare_timeout: Duration::from_secs(self.prepare_timeout_secs),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            max_activity_failures: self.max_activity_failures,
            max_agreement_failures: self.max_agreement_failures,
            ..DistributorConfig::default()
        }
    }

    pub fn negotiation(&self) -> NegotiationConfig {
        NegotiationConfig {
            agreement_validity: Duration::from_secs(self.demand_expiration_secs),
            ..NegotiationConfig::default()
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig::default()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_storage_url() -> String {
    "sqlite://requestor.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_workers() -> usize {
    2
}

fn default_budget() -> Decimal {
    Decimal::ONE
}

fn default_payment_platform() -> String {
    "erc20-holesky-tglm".to_string()
}

fn default_subnet_tag() -> Option<String> {
    Some("public".to_string())
}

fn default_demand_expiration() -> u64 {
    1800
}

fn default_prepare_timeout() -> u64 {
    300
}

fn default_task_timeout() -> u64 {
    600
}

fn default_warmup() -> u64 {
    10
}

fn default_max_activity_failures() -> u32 {
    3
}

fn default_max_task_attempts() -> u32 {
    5
}

fn default_max_agreement_failures() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `config.toml` under the user's config directory, when present
fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("requestor").join("config.toml"))
        .filter(|path| path.exists())
}

impl RequestorConfig {
    /// Load defaults, then the config file, then the environment.
    ///
    /// Environment keys use the `REQUESTOR` prefix with `__` between
    /// sections (`REQUESTOR__RUN__WORKERS=4`). `YAGNA_APPKEY` and
    /// `YAGNA_API_URL` set the daemon key and url.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&RequestorConfig::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::with_name(path).required(true));
            }
            None => {
                if let Some(path) = default_config_file() {
                    builder = builder.add_source(config::File::from(path).required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("REQUESTOR")
                .separator("__")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("daemon.app_key", std::env::var("YAGNA_APPKEY").ok())?
            .set_override_option("daemon.url", std::env::var("YAGNA_API_URL").ok())?;

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RequestorConfig::default();
        assert_eq!(config.daemon.url, "http://127.0.0.1:7465");
        assert_eq!(config.daemon.market_prefix, "/market-api/v1");
        assert_eq!(config.storage.url, "sqlite://requestor.db");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_run_defaults() {
        let run = RunConfig::default();
        assert_eq!(run.workers, 2);
        assert_eq!(run.subnet_tag.as_deref(), Some("public"));

        let distributor = run.distributor();
        assert_eq!(distributor.max_concurrent_preparations, 2);
        assert_eq!(distributor.prepare_timeout, Duration::from_secs(300));

        let payment = run.payment();
        assert_eq!(payment.warmup, Duration::from_secs(10));
        assert!(payment.max_price.is_none());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requestor.yaml");
        std::fs::write(
            &path,
            "run:\n  workers: 5\n  budget_per_hour: 2.5\nstorage:\n  url: \"sqlite::memory:\"\n",
        )
        .unwrap();

        let config = RequestorConfig::load(path.to_str()).unwrap();
        assert_eq!(config.run.workers, 5);
        assert_eq!(config.run.budget_per_hour, Decimal::new(25, 1));
        assert_eq!(config.storage.url, "sqlite::memory:");
        assert_eq!(config.run.task_timeout_secs, 600);
    }
}
