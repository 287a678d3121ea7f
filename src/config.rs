//! Layered service configuration.
//!
//! Sources, highest priority first:
//! 1. Environment variables (`FIELDLOG_*` prefix, `__` separates sections)
//! 2. `fieldlog.toml` in the working directory, or the file named by `FIELDLOG_CONFIG`
//! 3. Built-in defaults
//!
//! `FIELDLOG_RELAY__PASSWORD` maps to `relay.password`,
//! `FIELDLOG_TRANSPORT__MAX_CONNECTIONS` to `transport.max_connections`, and so on.

use std::path::PathBuf;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::compose::ComposeOptions;
use crate::domain::submission::{MAX_ATTACHMENTS, ValidationLimits};
use crate::error::{FieldlogError, Result};
use crate::relay::RelayConfig;
use crate::staging::StagingConfig;
use crate::transport::TransportConfig;

/// Inbound HTTP listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body, all parts included
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            max_body_bytes: 250 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    pub backend: AuditBackend,
    /// Required when `backend` is `postgres`
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldlogConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub validation: ValidationLimits,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FieldlogConfig {
    /// Load and validate configuration from files and the environment.
    ///
    /// Does not read `.env`; see [`FieldlogConfig::load_with_dotenv`].
    pub fn load() -> Result<Self> {
        let config: Self = Self::figment()
            .extract()
            .map_err(|e| FieldlogError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `.env` from the working directory, then [`FieldlogConfig::load`].
    pub fn load_with_dotenv() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(FieldlogError::Config(format!("Failed to read .env: {}", e))),
        }
        Self::load()
    }

    /// The provider chain, exposed so tests can layer extra providers on top.
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        let path = std::env::var("FIELDLOG_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("fieldlog.toml"));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }

        figment.merge(Env::prefixed("FIELDLOG_").ignore(&["CONFIG"]).split("__"))
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let t = &self.transport;
        if t.max_connections == 0 {
            return Err(invalid("transport.max_connections must be at least 1"));
        }
        if t.max_messages_per_connection == 0 {
            return Err(invalid("transport.max_messages_per_connection must be at least 1"));
        }
        if t.connect_timeout_ms == 0
            || t.greeting_timeout_ms == 0
            || t.socket_timeout_ms == 0
            || t.max_idle_ms == 0
        {
            return Err(invalid("transport timeouts must be greater than zero"));
        }
        if t.queue_capacity == 0 {
            return Err(invalid("transport.queue_capacity must be at least 1"));
        }
        if self.relay.recipient.trim().is_empty() {
            return Err(invalid("relay.recipient is required"));
        }
        if self.validation.max_attachments > MAX_ATTACHMENTS {
            return Err(FieldlogError::Config(format!(
                "validation.max_attachments cannot exceed {}",
                MAX_ATTACHMENTS
            )));
        }
        if self.audit.backend == AuditBackend::Postgres && self.audit.database_url.is_none() {
            return Err(invalid("audit.database_url is required for the postgres backend"));
        }
        Ok(())
    }

    pub fn compose_options(&self) -> ComposeOptions {
        ComposeOptions {
            recipient: self.relay.recipient.clone(),
        }
    }
}

fn invalid(message: &str) -> FieldlogError {
    FieldlogError::Config(message.to_string())
}
