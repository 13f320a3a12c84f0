use std::{env, fmt, net::SocketAddr};

use super::server_bind_address;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
///
/// `webhook_secret` is deliberately optional at startup: a missing secret
/// must not prevent the process from serving health checks, so the webhook
/// handler reports the misconfiguration per request instead.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub webhook_secret: Option<String>,
    pub identity_api_url: String,
    pub identity_api_key: String,
    pub mail_api_url: String,
    pub mail_api_key: String,
    pub mail_from: String,
    pub public_base_url: String,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        Ok(Self {
            bind_addr,
            environment,
            database_url: require("DATABASE_URL")?,
            webhook_secret: optional("DELIVERY_WEBHOOK_SECRET"),
            identity_api_url: require("IDENTITY_API_URL")?,
            identity_api_key: require("IDENTITY_API_KEY")?,
            mail_api_url: require("MAIL_API_URL")?,
            mail_api_key: require("MAIL_API_KEY")?,
            mail_from: require("MAIL_FROM_ADDRESS")?,
            public_base_url: require("PUBLIC_BASE_URL")?,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::MissingVar(name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVar(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVar(name) => write!(f, "required environment variable {name} is not set"),
        }
    }
}

impl std::error::Error for ConfigError {}
