//! Daemon Configuration
//!
//! Configuration management for the Android TV Remote daemon.

use anyhow::{bail, Context, Result};
use atvremote_protocol::{DeviceConfig, RegistryConfig, CONTROL_PORT, PAIRING_PORT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Storage paths
    #[serde(default)]
    pub paths: PathConfig,

    /// TVs to control, indexed from 1 in file order
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TLS control port on the TVs
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// TLS pairing port on the TVs
    #[serde(default = "default_pairing_port")]
    pub pairing_port: u16,

    /// Local port of the media bridge
    #[serde(default = "default_media_port")]
    pub media_port: u16,

    /// Local port of the configuration endpoint
    #[serde(default = "default_configuration_port")]
    pub configuration_port: u16,

    /// Serve the configuration endpoint
    #[serde(default = "default_true")]
    pub enable_configuration: bool,

    /// Address of this host as seen by the TVs, needed for companion app setup
    #[serde(default)]
    pub host_ip: Option<IpAddr>,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log every frame in hex
    #[serde(default)]
    pub trace: bool,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Certificate directory
    pub cert_dir: PathBuf,
}

fn default_control_port() -> u16 {
    CONTROL_PORT
}

fn default_pairing_port() -> u16 {
    PAIRING_PORT
}

fn default_media_port() -> u16 {
    6468
}

fn default_configuration_port() -> u16 {
    6469
}

fn default_true() -> bool {
    true
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("atvremote")
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            pairing_port: default_pairing_port(),
            media_port: default_media_port(),
            configuration_port: default_configuration_port(),
            enable_configuration: true,
            host_ip: None,
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let config_dir = default_config_dir();
        let cert_dir = config_dir.join("certs");
        Self {
            config_dir,
            cert_dir,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
            paths: PathConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        default_config_dir().join("daemon.toml")
    }

    /// Load configuration from `path`, creating a default file if not found
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject configurations the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            bail!("No devices configured, add a [[devices]] entry");
        }
        let ports = [
            self.network.media_port,
            self.network.configuration_port,
        ];
        if self.network.enable_configuration && ports[0] == ports[1] {
            bail!("media_port and configuration_port must differ");
        }
        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.cert_dir)
            .context("Failed to create certificate directory")?;
        Ok(())
    }

    /// Get the certificate path of the driver identity
    pub fn certificate_path(&self) -> PathBuf {
        self.paths.cert_dir.join("device_cert.pem")
    }

    /// Get the private key path of the driver identity
    pub fn private_key_path(&self) -> PathBuf {
        self.paths.cert_dir.join("device_key.pem")
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            control_port: self.network.control_port,
            pairing_port: self.network.pairing_port,
            media_port: self.network.media_port,
            host_ip: self.network.host_ip,
        }
    }
}
