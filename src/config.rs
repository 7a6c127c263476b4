use serde::Deserialize;
use std::time::Duration;

use crate::deposit::verification::is_valid_address;
use crate::execution::RefundServiceConfig;
use crate::explorer::BlockfrostConfig;
use crate::monitor::MonitorConfig;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Process configuration, read from the environment (and `.env`)
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub store_backend: StoreBackend,

    pub explorer_url: String,
    pub explorer_project_id: String,
    pub explorer_timeout_secs: u64,

    pub refund_service_url: String,
    pub refund_service_token: Option<String>,
    pub refund_timeout_secs: u64,

    pub deposit_address: String,
    pub required_amount: u64,
    pub max_age_secs: u64,
    pub min_confirmations: u64,
    pub fetch_count: usize,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub interval_growth_factor: f64,
    pub cooldown_secs: u64,

    pub webhook_url: Option<String>,
    pub monitor_autostart: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .set_default("database_url", "postgresql://localhost/deposit_monitor")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("store_backend", "postgres")?
            .set_default("explorer_url", "https://cardano-mainnet.blockfrost.io/api/v0")?
            .set_default("explorer_project_id", "")?
            .set_default("explorer_timeout_secs", 15i64)?
            .set_default("refund_service_url", "http://localhost:8090")?
            .set_default("refund_timeout_secs", 60i64)?
            .set_default("deposit_address", "")?
            .set_default("required_amount", 2_000_000i64)?
            .set_default("max_age_secs", 3600i64)?
            .set_default("min_confirmations", 0i64)?
            .set_default("fetch_count", 10i64)?
            .set_default("min_interval_secs", 10i64)?
            .set_default("max_interval_secs", 60i64)?
            .set_default("interval_growth_factor", 1.5f64)?
            .set_default("cooldown_secs", 3600i64)?
            .set_default("monitor_autostart", true)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if !is_valid_address(&self.deposit_address) {
            return Err(config::ConfigError::Message(format!(
                "DEPOSIT_ADDRESS is missing or not a valid address: '{}'",
                self.deposit_address
            )));
        }
        if self.required_amount == 0 {
            return Err(config::ConfigError::Message(
                "REQUIRED_AMOUNT must be greater than zero".to_string(),
            ));
        }
        if self.min_interval_secs == 0 || self.max_interval_secs < self.min_interval_secs {
            return Err(config::ConfigError::Message(format!(
                "Polling interval range {}..{}s is invalid",
                self.min_interval_secs, self.max_interval_secs
            )));
        }
        if !(self.interval_growth_factor >= 1.0) {
            return Err(config::ConfigError::Message(
                "INTERVAL_GROWTH_FACTOR must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            deposit_address: self.deposit_address.clone(),
            required_amount: self.required_amount,
            max_age: Duration::from_secs(self.max_age_secs),
            min_confirmations: self.min_confirmations,
            fetch_count: self.fetch_count,
            min_interval: Duration::from_secs(self.min_interval_secs),
            max_interval: Duration::from_secs(self.max_interval_secs),
            growth_factor: self.interval_growth_factor,
            cooldown: Duration::from_secs(self.cooldown_secs),
            ..MonitorConfig::default()
        }
    }

    pub fn explorer_config(&self) -> BlockfrostConfig {
        BlockfrostConfig {
            base_url: self.explorer_url.clone(),
            project_id: self.explorer_project_id.clone(),
            request_timeout: Duration::from_secs(self.explorer_timeout_secs),
        }
    }

    pub fn refund_service_config(&self) -> RefundServiceConfig {
        RefundServiceConfig {
            base_url: self.refund_service_url.clone(),
            api_token: self.refund_service_token.clone().filter(|t| !t.is_empty()),
            request_timeout: Duration::from_secs(self.refund_timeout_secs),
        }
    }
}
