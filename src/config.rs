//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub control: ControlConfig,
    pub firewall: FirewallConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address the honeypot ports bind to
    pub host: String,
    /// Ports to listen on; `--ports` on the command line takes precedence
    pub ports: Vec<u16>,
    /// Upper bound on how long each listener gets to stop after shutdown is requested
    pub shutdown_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            ports: Vec::new(),
            shutdown_timeout_secs: 5,
        }
    }
}

impl ListenerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Loopback port that triggers global shutdown when connected to
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { port: 5500 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    Iptables,
    Netsh,
    Memory,
    None,
}

impl Default for FirewallBackend {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Iptables
        } else if cfg!(windows) {
            Self::Netsh
        } else {
            Self::None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub backend: FirewallBackend,
    /// Rule names are `<rule_prefix>-<port>`
    pub rule_prefix: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: FirewallBackend::default(),
            rule_prefix: "honeypot".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "honeypot.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                // e.g. HONEYPOT_LISTENER__PORTS=21,22
                config::Environment::with_prefix("HONEYPOT")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("listener.ports")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.listener.host.is_empty() {
            anyhow::bail!("Listener host cannot be empty");
        }
        if self.listener.ports.contains(&0) {
            anyhow::bail!("Invalid listener port: 0 is not allowed");
        }
        if self.listener.shutdown_timeout_secs == 0 {
            anyhow::bail!("shutdown_timeout_secs must be greater than 0");
        }

        if self.control.port == 0 {
            anyhow::bail!("Invalid control port: 0 is not allowed");
        }
        self.check_control_port(&self.listener.ports)?;

        if self.firewall.rule_prefix.is_empty() {
            anyhow::bail!("Firewall rule prefix cannot be empty");
        }

        if self.database.enabled && self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }

    /// The control port cannot double as a honeypot port
    pub fn check_control_port(&self, ports: &[u16]) -> Result<()> {
        if ports.contains(&self.control.port) {
            anyhow::bail!(
                "Port {} is reserved for the control channel",
                self.control.port
            );
        }
        Ok(())
    }
}
