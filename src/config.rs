//! Configuration for all three gateway roles.
//!
//! One TOML file carries every section; each role reads the sections it
//! needs and `validate_for` rejects missing required settings at startup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{defaults, SESSION_PROTOCOL_VERSION};
use crate::error::AppError;

/// Platform-specific data directory for message storage.
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("smsgw")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".smsgw")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    /// Submission and routing node
    Wis,
    /// Dispatcher bridging a WIS to modem node sessions
    Pis,
    /// Modem-attached node
    Pid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub codec: CodecConfig,
    #[serde(default)]
    pub wis: WisConfig,
    #[serde(default)]
    pub pis: PisConfig,
    #[serde(default)]
    pub pid: PidConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `sled` or `memory`
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub data_dir: String,
    /// Messages older than this are swept regardless of status.
    #[serde(default = "default_retention")]
    pub retention_secs: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: String::new(),
            retention_secs: default_retention(),
        }
    }
}

fn default_backend() -> String {
    "sled".to_string()
}

fn default_retention() -> i64 {
    defaults::RETENTION_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Shared secret; every node in the federation must use the same one.
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WisConfig {
    #[serde(default)]
    pub node_id: String,
    #[serde(default = "default_wis_listen")]
    pub listen_address: String,
    /// Base URL other nodes use to reach this WIS.
    #[serde(default)]
    pub public_url: String,
    /// Statically configured peer WIS base URLs.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: i64,
    #[serde(default = "default_probe_every")]
    pub probe_every_ticks: u32,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,
}

impl Default for WisConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            listen_address: default_wis_listen(),
            public_url: String::new(),
            peers: vec![],
            gossip_interval_secs: default_gossip_interval(),
            stale_after_secs: default_stale_after(),
            probe_every_ticks: default_probe_every(),
            http_timeout_secs: default_http_timeout(),
            delivery_timeout_secs: default_delivery_timeout(),
        }
    }
}

impl WisConfig {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_secs(self.gossip_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

fn default_wis_listen() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_gossip_interval() -> u64 {
    defaults::GOSSIP_INTERVAL_SECS
}

fn default_stale_after() -> i64 {
    defaults::STALE_AFTER_SECS
}

fn default_probe_every() -> u32 {
    defaults::PROBE_EVERY_TICKS
}

fn default_http_timeout() -> u64 {
    defaults::HTTP_TIMEOUT_SECS
}

fn default_delivery_timeout() -> u64 {
    defaults::DELIVERY_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PisConfig {
    #[serde(default)]
    pub node_id: String,
    #[serde(default = "default_pis_listen")]
    pub listen_address: String,
    /// Base URL the WIS uses to reach this dispatcher.
    #[serde(default)]
    pub public_url: String,
    /// Ordered WIS base URLs tried for modem registration.
    #[serde(default)]
    pub wis_urls: Vec<String>,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    #[serde(default = "default_retry_url")]
    pub retry_wis_url: u32,
    #[serde(default = "default_retry_wait")]
    pub retry_wait_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_protocol")]
    pub protocol_version: String,
}

impl Default for PisConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            listen_address: default_pis_listen(),
            public_url: String::new(),
            wis_urls: vec![],
            max_wait_secs: default_max_wait(),
            retry_wis_url: default_retry_url(),
            retry_wait_secs: default_retry_wait(),
            http_timeout_secs: default_http_timeout(),
            protocol_version: default_protocol(),
        }
    }
}

fn default_pis_listen() -> String {
    "127.0.0.1:7788".to_string()
}

fn default_max_wait() -> u64 {
    defaults::MAX_WAIT_SECS
}

fn default_retry_url() -> u32 {
    defaults::RETRY_URL
}

fn default_retry_wait() -> u64 {
    defaults::RETRY_WAIT_SECS
}

fn default_protocol() -> String {
    SESSION_PROTOCOL_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    #[serde(default)]
    pub node_id: String,
    /// Ordered dispatcher URLs (`ws://host:port`); the first one is the primary.
    #[serde(default)]
    pub pis_urls: Vec<String>,
    #[serde(default = "default_retry_url")]
    pub retry_pis_url: u32,
    #[serde(default = "default_retry_wait")]
    pub retry_wait_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_primary_check")]
    pub primary_check_secs: i64,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "default_protocol")]
    pub protocol_version: String,
    #[serde(default = "default_gammu_command")]
    pub gammu_command: String,
    #[serde(default)]
    pub gammu_config: String,
    #[serde(default)]
    pub modems: Vec<ModemConfig>,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            pis_urls: vec![],
            retry_pis_url: default_retry_url(),
            retry_wait_secs: default_retry_wait(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            primary_check_secs: default_primary_check(),
            test_mode: false,
            protocol_version: default_protocol(),
            gammu_command: default_gammu_command(),
            gammu_config: String::new(),
            modems: vec![],
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    defaults::HEARTBEAT_INTERVAL_SECS
}

fn default_primary_check() -> i64 {
    defaults::PRIMARY_CHECK_SECS
}

fn default_gammu_command() -> String {
    "gammu".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    pub modem_id: String,
    pub number_pattern: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_load_factor")]
    pub load_factor: u32,
    /// Section index in the gammu configuration file.
    #[serde(default)]
    pub gammu_section: u32,
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default = "default_exit_code")]
    pub country_exit_code: String,
}

fn default_load_factor() -> u32 {
    1
}

fn default_exit_code() -> String {
    "00".to_string()
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            codec: CodecConfig {
                key: "changeme".to_string(),
            },
            wis: WisConfig {
                node_id: "wis1".to_string(),
                public_url: "http://127.0.0.1:7777".to_string(),
                ..WisConfig::default()
            },
            pis: PisConfig {
                node_id: "pis1".to_string(),
                public_url: "http://127.0.0.1:7788".to_string(),
                wis_urls: vec!["http://127.0.0.1:7777".to_string()],
                ..PisConfig::default()
            },
            pid: PidConfig {
                node_id: "pid1".to_string(),
                pis_urls: vec!["ws://127.0.0.1:7788".to_string()],
                test_mode: true,
                modems: vec![ModemConfig {
                    modem_id: "00436760000000".to_string(),
                    number_pattern: "^\\+43".to_string(),
                    label: "test modem".to_string(),
                    load_factor: 1,
                    gammu_section: 0,
                    pin: None,
                    country_exit_code: default_exit_code(),
                }],
                ..PidConfig::default()
            },
        }
    }

    /// Load the config at `path`, writing a default file first if none exists.
    pub fn load_or_create(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = if fs::metadata(path).is_ok() {
            Self::load_from_file(path)?
        } else {
            let config = Config::default();
            config.save_to_file(path)?;
            config
        };

        if config.storage.data_dir.is_empty() {
            config.storage.data_dir = get_data_dir().to_string_lossy().to_string();
        }
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Reject configurations the given role cannot run with.
    pub fn validate_for(&self, role: Role) -> Result<(), AppError> {
        if self.codec.key.is_empty() {
            return Err(AppError::Config("[codec] key must be set".to_string()));
        }

        match role {
            Role::Wis => {
                require(!self.wis.node_id.is_empty(), "[wis] node_id must be set")?;
                require(!self.wis.public_url.is_empty(), "[wis] public_url must be set")?;
                parse_listen(&self.wis.listen_address, "wis")?;
                require(
                    self.wis.gossip_interval_secs > 0,
                    "[wis] gossip_interval_secs must be positive",
                )?;
                require(
                    self.wis.probe_every_ticks > 0,
                    "[wis] probe_every_ticks must be positive",
                )?;
                require(
                    matches!(self.storage.backend.as_str(), "sled" | "memory"),
                    "[storage] backend must be \"sled\" or \"memory\"",
                )?;
            }
            Role::Pis => {
                require(!self.pis.public_url.is_empty(), "[pis] public_url must be set")?;
                require(!self.pis.wis_urls.is_empty(), "[pis] wis_urls must not be empty")?;
                parse_listen(&self.pis.listen_address, "pis")?;
                require(self.pis.retry_wis_url > 0, "[pis] retry_wis_url must be positive")?;
            }
            Role::Pid => {
                require(!self.pid.node_id.is_empty(), "[pid] node_id must be set")?;
                require(!self.pid.pis_urls.is_empty(), "[pid] pis_urls must not be empty")?;
                require(!self.pid.modems.is_empty(), "[pid] modems - not set")?;
                require(self.pid.retry_pis_url > 0, "[pid] retry_pis_url must be positive")?;
                for modem in &self.pid.modems {
                    if regex::Regex::new(&modem.number_pattern).is_err() {
                        return Err(AppError::Config(format!(
                            "[pid] modem {} has an invalid number_pattern",
                            modem.modem_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn require(ok: bool, message: &str) -> Result<(), AppError> {
    if ok {
        Ok(())
    } else {
        Err(AppError::Config(message.to_string()))
    }
}

fn parse_listen(addr: &str, section: &str) -> Result<SocketAddr, AppError> {
    addr.parse().map_err(|e| {
        AppError::Config(format!(
            "[{}] listen_address {:?} is invalid: {}",
            section, addr, e
        ))
    })
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_file_gets_protocol_defaults() {
        let config: Config = toml::from_str(
            r#"
            [codec]
            key = "secret"

            [wis]
            node_id = "wis-a"
            public_url = "http://10.0.0.1:7777"
            "#,
        )
        .unwrap();

        assert_eq!(config.wis.gossip_interval_secs, 25);
        assert_eq!(config.wis.stale_after_secs, 30);
        assert_eq!(config.wis.probe_every_ticks, 5);
        assert_eq!(config.pis.max_wait_secs, 10);
        assert_eq!(config.pis.retry_wis_url, 2);
        assert_eq!(config.pid.heartbeat_interval_secs, 30);
        assert_eq!(config.pid.retry_wait_secs, 5);
        assert_eq!(config.storage.retention_secs, 86_400);
        assert!(config.validate_for(Role::Wis).is_ok());
    }

    #[test]
    fn test_missing_required_settings_are_rejected() {
        let mut config = Config::default();
        assert!(config.validate_for(Role::Wis).is_ok());
        assert!(config.validate_for(Role::Pis).is_ok());
        assert!(config.validate_for(Role::Pid).is_ok());

        config.pid.modems.clear();
        assert!(matches!(
            config.validate_for(Role::Pid),
            Err(AppError::Config(_))
        ));

        config.codec.key.clear();
        assert!(config.validate_for(Role::Wis).is_err());
    }

    #[test]
    fn test_invalid_listen_address() {
        let mut config = Config::default();
        config.pis.listen_address = "not-an-address".to_string();
        assert!(config.validate_for(Role::Pis).is_err());
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smsgw.toml");
        let path = path.to_str().unwrap();

        let created = Config::load_or_create(path).unwrap();
        assert!(fs::metadata(path).is_ok());
        assert!(!created.storage.data_dir.is_empty());

        let reloaded = Config::load_from_file(path).unwrap();
        assert_eq!(reloaded.wis.node_id, "wis1");
        assert_eq!(reloaded.pid.modems.len(), 1);
    }
}
