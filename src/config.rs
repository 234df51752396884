use config::{Config, Environment};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("{0} must not be blank")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    /// Tax applied to customer self-service orders.
    pub order_tax_rate: Decimal,
    pub page_size: u32,
}

impl AppConfig {
    /// Reads the process environment (`DATABASE_URL`, `PORT`, ...). Call
    /// `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::default())
    }

    fn load(environment: Environment) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("port", 3000)?
            .set_default("db_max_connections", 10)?
            .set_default("db_acquire_timeout_secs", 30)?
            .set_default("order_tax_rate", "0.08")?
            .set_default("page_size", 20)?
            .add_source(environment)
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        if app_config.database_url.trim().is_empty() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if app_config.jwt_secret.trim().is_empty() {
            return Err(ConfigError::Missing("JWT_SECRET"));
        }

        log::debug!("Configuration loaded (port {})", app_config.port);
        Ok(app_config)
    }

    pub fn db_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.db_acquire_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}
