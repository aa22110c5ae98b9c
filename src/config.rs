use crate::ca::Curve;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://tunnelgate.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Origins allowed by CORS; empty disables cross-origin access
    #[serde(default)]
    pub cors_allow_origins: Vec<String>,
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_allow_origins: Vec::new(),
        }
    }
}

/// Authentication settings for the provisioning endpoints
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Master bearer token. Empty disables master authentication.
    #[serde(default = "default_master_token")]
    pub master_token: String,
    /// Only accept the master token from loopback peers
    #[serde(default = "default_true")]
    pub master_localhost_only: bool,
    /// Reject every one-time token (master token still works)
    #[serde(default)]
    pub token_auth_disabled: bool,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u64,
}

fn default_master_token() -> String {
    "tunnel".to_string()
}

fn default_true() -> bool {
    true
}

fn default_token_ttl_hours() -> u64 {
    24
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            master_token: default_master_token(),
            master_localhost_only: true,
            token_auth_disabled: false,
            token_ttl_hours: default_token_ttl_hours(),
        }
    }
}

/// Overlay network settings
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    /// Address range handed out to nodes; network + 1 belongs to the server
    #[serde(default = "default_cidr")]
    pub cidr: String,
    #[serde(default = "default_tun_dev_name")]
    pub tun_dev_name: String,
    /// Where the overlay engine of the server listens
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address nodes use to reach the server's overlay engine
    #[serde(default = "default_public_addr")]
    pub public_addr: String,
    /// Wipe an existing address pool when the server profile is regenerated
    #[serde(default)]
    pub force_reinit: bool,
}

fn default_cidr() -> String {
    "10.0.0.0/8".to_string()
}

fn default_tun_dev_name() -> String {
    "nebula1".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:4242".to_string()
}

fn default_public_addr() -> String {
    "127.0.0.1:4242".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: default_cidr(),
            tun_dev_name: default_tun_dev_name(),
            listen_addr: default_listen_addr(),
            public_addr: default_public_addr(),
            force_reinit: false,
        }
    }
}

/// Certificate authority settings
#[derive(Debug, Deserialize, Clone)]
pub struct PkiConfig {
    #[serde(default = "default_ca_name")]
    pub ca_name: String,
    #[serde(default = "default_ca_key_path")]
    pub ca_key_path: String,
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: String,
    #[serde(default)]
    pub curve: Curve,
    /// Upper bound on leaf lifetime; the CA expiry always caps it further
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,
}

fn default_ca_name() -> String {
    "Tunnelgate Network CA".to_string()
}

fn default_ca_key_path() -> String {
    "ca.key".to_string()
}

fn default_ca_cert_path() -> String {
    "ca.crt".to_string()
}

fn default_leaf_validity_days() -> u32 {
    365
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            ca_name: default_ca_name(),
            ca_key_path: default_ca_key_path(),
            ca_cert_path: default_ca_cert_path(),
            curve: Curve::default(),
            leaf_validity_days: default_leaf_validity_days(),
        }
    }
}

impl PkiConfig {
    pub fn leaf_validity(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.leaf_validity_days))
    }
}

/// Server node settings
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Rendered overlay profile of the server node
    #[serde(default = "default_profile_path")]
    pub profile_path: String,
}

fn default_profile_path() -> String {
    "server.yaml".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            profile_path: default_profile_path(),
        }
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub pki: PkiConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: TUNNELGATE_)
            // e.g., TUNNELGATE_AUTH__MASTER_TOKEN, TUNNELGATE_NETWORK__CIDR
            .add_source(
                Environment::with_prefix("TUNNELGATE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("api.cors_allow_origins")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }
}

impl ApiConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_bootstrap() {
        let config = AppConfig::default();
        assert_eq!(config.network.cidr, "10.0.0.0/8");
        assert_eq!(config.api.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.auth.token_ttl_hours, 24);
        assert!(config.auth.master_localhost_only);
        assert!(!config.network.force_reinit);
        assert_eq!(config.pki.curve, Curve::Curve25519);
        assert_eq!(config.pki.leaf_validity(), chrono::Duration::days(365));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(
                "[network]\ncidr = \"192.168.100.0/24\"\n[pki]\ncurve = \"p256\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.network.cidr, "192.168.100.0/24");
        assert_eq!(config.network.public_addr, "127.0.0.1:4242");
        assert_eq!(config.pki.curve, Curve::P256);
        assert_eq!(config.auth.master_token, "tunnel");
    }
}
