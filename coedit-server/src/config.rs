//! Server configuration, parsed from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

/// Deployment environment; development turns on verbose diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            other => anyhow::bail!("unknown environment: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port.
    pub port: u16,
    /// Allowed CORS origin for browser clients.
    pub client_url: Option<String>,
    /// Directory backing the document store.
    pub store_uri: PathBuf,
    /// Redis URL for the fan-out bus; in-process bus when unset.
    pub bus_url: Option<String>,
    /// HMAC secret for session tokens.
    pub jwt_secret: String,
    /// Session token lifetime.
    pub jwt_expires_in: Duration,
    pub node_env: Environment,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            client_url: None,
            store_uri: PathBuf::from("storage"),
            bus_url: None,
            jwt_secret: "development-secret".to_string(),
            jwt_expires_in: Duration::from_secs(7 * 24 * 3600),
            node_env: Environment::Development,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// development defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let port = match std::env::var("PORT") {
            Ok(value) => value.parse().context("Unable to parse PORT")?,
            Err(_) => defaults.port,
        };
        let jwt_expires_in = match std::env::var("JWT_EXPIRES_IN") {
            Ok(value) => Duration::from_secs(
                value.parse().context("Unable to parse JWT_EXPIRES_IN")?,
            ),
            Err(_) => defaults.jwt_expires_in,
        };
        let node_env = match std::env::var("NODE_ENV") {
            Ok(value) => value.parse().context("Unable to parse NODE_ENV")?,
            Err(_) => defaults.node_env,
        };
        Ok(Self {
            port,
            client_url: std::env::var("CLIENT_URL").ok(),
            store_uri: std::env::var("STORE_URI")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_uri),
            bus_url: std::env::var("BUS_URL").ok(),
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_expires_in,
            node_env,
        })
    }
}
