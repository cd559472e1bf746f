use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub directories: Directories,
    #[serde(default)]
    pub issuance: IssuanceDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// TOML document holding admin UI and plugin TLS settings.
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            directories: Directories::default(),
            issuance: IssuanceDefaults::default(),
            logging: LoggingConfig::default(),
            settings_path: default_settings_path(),
        }
    }
}

/// The four material directories. Created on store initialization.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Directories {
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    #[serde(default = "default_ca_cert_dir")]
    pub ca_cert_dir: PathBuf,
    #[serde(default = "default_ca_key_dir")]
    pub ca_key_dir: PathBuf,
}

impl Directories {
    /// Standard layout below a single root directory.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            cert_dir: root.join("certs"),
            key_dir: root.join("keys"),
            ca_cert_dir: root.join("ca").join("certs"),
            ca_key_dir: root.join("ca").join("keys"),
        }
    }
}

impl Default for Directories {
    fn default() -> Self {
        Self {
            cert_dir: default_cert_dir(),
            key_dir: default_key_dir(),
            ca_cert_dir: default_ca_cert_dir(),
            ca_key_dir: default_ca_key_dir(),
        }
    }
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/etc/certkeeper/certs")
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("/etc/certkeeper/keys")
}

fn default_ca_cert_dir() -> PathBuf {
    PathBuf::from("/etc/certkeeper/ca/certs")
}

fn default_ca_key_dir() -> PathBuf {
    PathBuf::from("/etc/certkeeper/ca/keys")
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("/etc/certkeeper/settings.toml")
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct IssuanceDefaults {
    #[serde(default = "default_organization")]
    pub organization: String,
    /// Group that owns every written key and certificate file.
    #[serde(default = "default_tls_group")]
    pub tls_group: String,
    #[serde(default = "default_ca_key_bits")]
    pub ca_key_bits: u32,
    #[serde(default = "default_ca_validity")]
    pub ca_validity_days: u32,
    #[serde(default = "default_leaf_validity")]
    pub leaf_validity_days: u32,
}

impl Default for IssuanceDefaults {
    fn default() -> Self {
        Self {
            organization: default_organization(),
            tls_group: default_tls_group(),
            ca_key_bits: default_ca_key_bits(),
            ca_validity_days: default_ca_validity(),
            leaf_validity_days: default_leaf_validity(),
        }
    }
}

fn default_organization() -> String {
    "Certkeeper Servers".to_string()
}

fn default_tls_group() -> String {
    "ssl-cert".to_string()
}

fn default_ca_key_bits() -> u32 {
    2048
}

fn default_ca_validity() -> u32 {
    5 * 365 // 5 years
}

fn default_leaf_validity() -> u32 {
    2 * 365 // 2 years
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(config_str).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.issuance.ca_key_bits, 2048);
        assert_eq!(config.issuance.ca_validity_days, 1825);
        assert_eq!(config.issuance.leaf_validity_days, 730);
        assert_eq!(config.issuance.tls_group, "ssl-cert");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.directories, Directories::default());
    }

    #[test]
    fn test_partial_override() {
        let config = AppConfig::from_toml(
            r#"
            settings_path = "/srv/settings.toml"

            [directories]
            cert_dir = "/srv/tls/certs"

            [issuance]
            organization = "Home Lab"
            "#,
        )
        .unwrap();

        assert_eq!(config.directories.cert_dir, PathBuf::from("/srv/tls/certs"));
        assert_eq!(config.directories.key_dir, default_key_dir());
        assert_eq!(config.issuance.organization, "Home Lab");
        assert_eq!(config.settings_path, PathBuf::from("/srv/settings.toml"));
    }

    #[test]
    fn test_layout_under_root() {
        let dirs = Directories::under("/var/lib/tls");
        assert_eq!(dirs.ca_key_dir, PathBuf::from("/var/lib/tls/ca/keys"));
        assert_eq!(dirs.cert_dir, PathBuf::from("/var/lib/tls/certs"));
    }
}
