use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/counter-gateway/gateway.toml";
const ENV_CONFIG_PATH: &str = "GATEWAY_CONFIG_PATH";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub mes: MesConfig,
    #[serde(default)]
    pub rs485: Rs485Config,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration from file. The path can be overridden with the
    /// `GATEWAY_CONFIG_PATH` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => GatewayConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MesConfig {
    #[serde(default = "default_mes_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_company_id")]
    pub company_id: u64,
    #[serde(default = "default_user_id")]
    pub user_id: u64,
}

impl Default for MesConfig {
    fn default() -> Self {
        Self {
            base_url: default_mes_base_url(),
            username: String::new(),
            password: String::new(),
            company_id: default_company_id(),
            user_id: default_user_id(),
        }
    }
}

fn default_mes_base_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_company_id() -> u64 {
    1
}
fn default_user_id() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rs485Config {
    #[serde(default = "default_rs485_port")]
    pub port: String,
    #[serde(default = "default_rs485_baud")]
    pub baud: u32,
    #[serde(default = "default_rs485_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Rs485Config {
    fn default() -> Self {
        Self {
            port: default_rs485_port(),
            baud: default_rs485_baud(),
            timeout_ms: default_rs485_timeout_ms(),
        }
    }
}

fn default_rs485_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_rs485_baud() -> u32 {
    9600
}
fn default_rs485_timeout_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_path")]
    pub path: String,
    #[serde(default = "default_buffer_batch_max")]
    pub batch_max: usize,
    #[serde(default = "default_buffer_retention_days")]
    pub retention_days: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: default_buffer_path(),
            batch_max: default_buffer_batch_max(),
            retention_days: default_buffer_retention_days(),
        }
    }
}

fn default_buffer_path() -> String {
    "/var/lib/counter-gateway/buffer.db".to_string()
}
fn default_buffer_batch_max() -> usize {
    100
}
fn default_buffer_retention_days() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_sec")]
    pub interval_sec: u64,
    #[serde(default = "default_sync_max_attempts")]
    pub max_attempts_per_pass: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_sec: default_sync_interval_sec(),
            max_attempts_per_pass: default_sync_max_attempts(),
        }
    }
}

fn default_sync_interval_sec() -> u64 {
    300
}
fn default_sync_max_attempts() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StationConfig {
    #[serde(default)]
    pub id: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_level")]
    pub level: String,
    #[serde(default = "default_logging_json")]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_logging_level(),
            json: default_logging_json(),
        }
    }
}

fn default_logging_level() -> String {
    "info".to_string()
}
fn default_logging_json() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[mes]
base_url = "https://mes.example.com"
username = "operator"
password = "secret"
company_id = 7
user_id = 42

[rs485]
port = "/dev/ttyUSB1"
baud = 19200
timeout_ms = 500

[buffer]
path = "/tmp/buffer.db"
batch_max = 50
retention_days = 14

[sync]
interval_sec = 60
max_attempts_per_pass = 5

[station]
id = 7

[logging]
level = "debug"
json = true
"#;
        let cfg: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.mes.base_url, "https://mes.example.com");
        assert_eq!(cfg.mes.company_id, 7);
        assert_eq!(cfg.rs485.port, "/dev/ttyUSB1");
        assert_eq!(cfg.rs485.baud, 19200);
        assert_eq!(cfg.buffer.batch_max, 50);
        assert_eq!(cfg.sync.interval_sec, 60);
        assert_eq!(cfg.station.id, Some(7));
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn missing_keys_take_documented_defaults() {
        let cfg: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.mes.base_url, "http://localhost:3000");
        assert_eq!(cfg.rs485.baud, 9600);
        assert_eq!(cfg.buffer.batch_max, 100);
        assert_eq!(cfg.sync.interval_sec, 300);
        assert!(cfg.station.id.is_none());
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[station]\nid = 99").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, file.path());
        let cfg = GatewayConfig::load();
        assert_eq!(cfg.station.id, Some(99));
        std::env::remove_var(ENV_CONFIG_PATH);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/path/gateway.toml");
        let cfg = GatewayConfig::load();
        assert_eq!(cfg.buffer.retention_days, 30);
        std::env::remove_var(ENV_CONFIG_PATH);
    }
}
