//! Configuration for the setup and upgrade tools
//!
//! Every field has a default, so a missing or partial config file is fine.
//! Setup values can additionally be overridden from `VPN_*` environment
//! variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ikev2kit.toml";

/// Name of the IKEv2 fragment inside the IPsec config directory
pub const FRAGMENT_FILE: &str = "ikev2.conf";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub setup: SetupConfig,
    pub upgrade: UpgradeConfig,
    pub network: NetworkConfig,
    pub paths: PathsConfig,
}

/// Answers used by `--auto` and as prompt defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// Use this DNS name as the server address instead of the public IP
    pub dns_name: Option<String>,
    /// Server public IP (skips detection)
    pub public_ip: Option<String>,
    /// Name of the first client
    pub client_name: String,
    /// Client certificate validity in months (1-120)
    pub client_validity: u32,
    /// One or two DNS servers pushed to clients
    pub dns_servers: Vec<String>,
    /// Enable MOBIKE when the kernel supports it
    pub mobike: bool,
    /// Fixed password for exported client files (random if unset)
    pub client_password: Option<String>,
    /// Where client files are written (auto-selected if unset)
    pub export_dir: Option<PathBuf>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            dns_name: None,
            public_ip: None,
            client_name: "vpnclient".to_string(),
            client_validity: 120,
            dns_servers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            mobike: true,
            client_password: None,
            export_dir: None,
        }
    }
}

impl SetupConfig {
    /// Apply `VPN_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup; empty values are ignored
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(name) = get("VPN_DNS_NAME") {
            self.dns_name = Some(name);
        }
        if let Some(ip) = get("VPN_PUBLIC_IP") {
            self.public_ip = Some(ip);
        }
        if let Some(client) = get("VPN_CLIENT_NAME") {
            self.client_name = client;
        }
        if let Some(months) = get("VPN_CLIENT_VALIDITY") {
            match months.parse() {
                Ok(m) => self.client_validity = m,
                Err(_) => log::warn!("Ignoring invalid VPN_CLIENT_VALIDITY: {}", months),
            }
        }
        match (get("VPN_DNS_SRV1"), get("VPN_DNS_SRV2")) {
            (Some(primary), Some(secondary)) => self.dns_servers = vec![primary, secondary],
            (Some(primary), None) => self.dns_servers = vec![primary],
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Libreswan version to build (defaults to the tool's built-in target)
    pub target_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Base URL of the Libreswan version check service
    pub update_base_url: String,
    /// Plain-text services that echo the caller's IPv4 address
    pub public_ip_urls: Vec<String>,
    /// Attempts per request
    pub retries: u32,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            update_base_url: "https://dl.ls20.com/v1".to_string(),
            public_ip_urls: vec![
                "http://ipv4.icanhazip.com".to_string(),
                "http://ip1.dynupdate.no-ip.com".to_string(),
            ],
            retries: 3,
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Primary Libreswan config file
    pub ipsec_conf: PathBuf,
    /// Config fragment directory, also holds the NSS database
    pub ipsec_dir: PathBuf,
    /// The `ipsec` command
    pub ipsec_bin: PathBuf,
    /// Where Libreswan sources are unpacked and built
    pub src_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ipsec_conf: PathBuf::from("/etc/ipsec.conf"),
            ipsec_dir: PathBuf::from("/etc/ipsec.d"),
            ipsec_bin: PathBuf::from("/usr/local/sbin/ipsec"),
            src_dir: PathBuf::from("/opt/src"),
        }
    }
}

impl PathsConfig {
    /// The IKEv2 connection fragment
    pub fn fragment(&self) -> PathBuf {
        self.ipsec_dir.join(FRAGMENT_FILE)
    }
}

impl Config {
    /// Load config from `path`, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            log::debug!("Config file not found: {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> Result<Self, Error> {
        Ok(toml::from_str(content)?)
    }
}

/// Base64 helpers for certificate payloads
pub mod encoding {
    use base64::{engine::general_purpose::STANDARD, Engine};

    /// Encode bytes to a single base64 line
    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    /// Encode bytes to base64 split into lines of at most `width` characters
    pub fn encode_wrapped(data: &[u8], width: usize) -> Vec<String> {
        wrap(&encode(data), width)
    }

    /// Split ASCII `text` into lines of at most `width` characters
    pub fn wrap(text: &str, width: usize) -> Vec<String> {
        text.as_bytes()
            .chunks(width.max(1))
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_config_default() {
        let config = SetupConfig::default();
        assert_eq!(config.client_name, "vpnclient");
        assert_eq!(config.client_validity, 120);
        assert_eq!(config.dns_servers, vec!["8.8.8.8", "8.8.4.4"]);
        assert!(config.mobike);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
[setup]
client_name = "laptop"

[paths]
ipsec_dir = "/tmp/ipsec.d"
"#,
        )
        .unwrap();
        assert_eq!(config.setup.client_name, "laptop");
        assert_eq!(config.setup.client_validity, 120);
        assert_eq!(config.paths.fragment(), PathBuf::from("/tmp/ipsec.d/ikev2.conf"));
        assert_eq!(config.paths.ipsec_conf, PathBuf::from("/etc/ipsec.conf"));
        assert_eq!(config.network.retries, 3);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = Config::parse("[setup\nclient_name = 1").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SetupConfig::default();
        config.apply_env_with(|key| match key {
            "VPN_DNS_NAME" => Some("vpn.example.com".into()),
            "VPN_CLIENT_NAME" => Some("phone".into()),
            "VPN_CLIENT_VALIDITY" => Some("24".into()),
            "VPN_DNS_SRV1" => Some("1.1.1.1".into()),
            "VPN_DNS_SRV2" => Some("  ".into()),
            _ => None,
        });
        assert_eq!(config.dns_name.as_deref(), Some("vpn.example.com"));
        assert_eq!(config.client_name, "phone");
        assert_eq!(config.client_validity, 24);
        assert_eq!(config.dns_servers, vec!["1.1.1.1"]);
    }

    #[test]
    fn test_env_bad_validity_ignored() {
        let mut config = SetupConfig::default();
        config.apply_env_with(|key| (key == "VPN_CLIENT_VALIDITY").then(|| "ten".to_string()));
        assert_eq!(config.client_validity, 120);
    }

    #[test]
    fn test_encode_wrapped() {
        let lines = encoding::encode_wrapped(&[0u8; 60], 52);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 52);
        assert_eq!(lines.concat(), encoding::encode(&[0u8; 60]));
    }
}
