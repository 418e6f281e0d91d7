//! Configuration handling for the push service.
//!
//! Reads the gateway and credential settings from a YAML file, then applies
//! environment variable overrides on top.

use anyhow::{Context, Result};
use push_session::{CredentialBundle, GatewayAddress, GatewayConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Push service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Gateway connection settings
    pub gateway: GatewaySettings,
    /// Client certificate settings
    pub credentials: CredentialSettings,
}

/// Gateway connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Explicit gateway host; derived from `sandbox` when unset
    pub host: Option<String>,
    /// Gateway port
    pub port: u16,
    /// Use the sandbox gateway instead of production
    pub sandbox: bool,
    /// Reconnect after unexpected termination; off unless configured, like `GatewayConfig::new`
    pub persistent: bool,
    /// Connect plus handshake bound, e.g. "10s"
    pub connect_timeout: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            sandbox: false,
            persistent: false,
            connect_timeout: None,
        }
    }
}

/// Client certificate settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    /// Path to the PKCS#12 certificate store
    pub p12_file: String,
    /// Passphrase protecting the store
    pub passphrase: String,
}

impl PushConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<PushConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", config_path.as_ref(), e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "Final push configuration: gateway={}, persistent={}, p12_file={:?}",
            config.gateway_address(),
            config.gateway.persistent,
            config.credentials.p12_file
        );

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, keyed by environment variable name
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PUSH_GATEWAY_HOST") {
            info!("Gateway host overridden by environment: {}", host);
            self.gateway.host = Some(host);
        }

        if let Some(port) = lookup("PUSH_GATEWAY_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.gateway.port = port;
                    info!("Gateway port overridden by environment: {}", port);
                }
                Err(e) => {
                    warn!(
                        "Ignoring invalid PUSH_GATEWAY_PORT {:?} ({}), keeping port {}",
                        port, e, self.gateway.port
                    );
                }
            }
        }

        if let Some(persistent) = lookup("PUSH_PERSISTENT") {
            self.gateway.persistent = persistent.to_lowercase() == "true";
            info!("Persistence overridden by environment: {}", self.gateway.persistent);
        }

        if let Some(p12_file) = lookup("PUSH_P12_FILE") {
            info!("Certificate store overridden by environment: {}", p12_file);
            self.credentials.p12_file = p12_file;
        }

        if let Some(passphrase) = lookup("PUSH_P12_PASSPHRASE") {
            self.credentials.passphrase = passphrase;
        }
    }

    /// Gateway address after applying the sandbox switch
    pub fn gateway_address(&self) -> GatewayAddress {
        let base = if self.gateway.sandbox {
            GatewayAddress::sandbox()
        } else {
            GatewayAddress::production()
        };
        let host = self.gateway.host.clone().unwrap_or(base.host);
        GatewayAddress::new(host, self.gateway.port)
    }

    /// Load the credential bundle and assemble the connection settings
    pub fn to_gateway_config(&self) -> Result<GatewayConfig> {
        if self.credentials.p12_file.is_empty() {
            anyhow::bail!("credentials.p12_file is not configured");
        }

        let connect_timeout = self
            .gateway
            .connect_timeout
            .as_deref()
            .map(humantime::parse_duration)
            .transpose()
            .context("Invalid gateway.connect_timeout")?;

        let credentials =
            CredentialBundle::from_file(&self.credentials.p12_file, self.credentials.passphrase.clone())
                .context("Failed to load certificate store")?;

        Ok(GatewayConfig {
            credentials,
            address: self.gateway_address(),
            persistent: self.gateway.persistent,
            connect_timeout,
        })
    }
}
