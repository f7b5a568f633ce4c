//! Runtime configuration.
//!
//! Precedence: built-in defaults, then an optional TOML config file, then
//! environment variables. CLI flags cover the listener surface (ports, TLS,
//! static dir) and are handled in `args`.
mod types;


use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub use types::{ConfigFile, FleetConfig, LimitsSection, UploadSection};

const DEFAULT_CONFIG_PATH: &str = "contend.toml";

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Central,
    Isp,
}

impl ServerMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Central => "central",
            Self::Isp => "isp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Standard,
    BackgroundBatch,
    HighPriority,
}

impl UploadMode {
    /// Absolute server-protection ceiling for upload intake, in bytes per
    /// second. Traffic below the ceiling is never throttled.
    pub const fn ceiling_bytes_per_sec(self) -> u64 {
        match self {
            Self::Standard => 2000 * MIB,
            Self::BackgroundBatch => 1000 * MIB,
            Self::HighPriority => 4000 * MIB,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::BackgroundBatch => "background_batch",
            Self::HighPriority => "high_priority",
        }
    }

    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "standard" => Ok(Self::Standard),
            "background_batch" => Ok(Self::BackgroundBatch),
            "high_priority" => Ok(Self::HighPriority),
            other => Err(ConfigError::InvalidValue {
                field: "upload.mode",
                value: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimitConfig {
    pub max_download_conns: u32,
    pub max_upload_conns: u32,
    pub max_websocket_sessions: u32,
    pub downloads_per_hour: u32,
    pub bandwidth_gb_per_hour: u64,
    pub pings_per_minute: u32,
    pub cleanup_interval: Duration,
    pub fleet_bypass: bool,
    pub fleet_user_agent: String,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_download_conns: 3,
            max_upload_conns: 100,
            max_websocket_sessions: 4,
            downloads_per_hour: 16,
            bandwidth_gb_per_hour: 45,
            pings_per_minute: 180,
            cleanup_interval: Duration::from_secs(300),
            fleet_bypass: false,
            fleet_user_agent: "Contend-Central/".to_owned(),
        }
    }
}

impl LimitConfig {
    pub const fn bandwidth_bytes_per_hour(&self) -> u64 {
        self.bandwidth_gb_per_hour.saturating_mul(GIB)
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub mode: UploadMode,
    pub max_request_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            mode: UploadMode::Standard,
            max_request_bytes: 512 * MIB,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub multiprocess_enabled: bool,
    pub server_mode: ServerMode,
    pub telemetry_enabled: bool,
    pub limits: LimitConfig,
    pub upload: UploadConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            multiprocess_enabled: true,
            server_mode: ServerMode::Isp,
            telemetry_enabled: false,
            limits: LimitConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Build the effective configuration from defaults, the optional config
    /// file and the process environment.
    ///
    /// # Errors
    /// Returns an error when the config file cannot be read or parsed, or an
    /// environment override carries an unparsable value.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(file) = load_config_file(explicit_path)? {
            config.apply_file(&file)?;
        }
        config.apply_env_with(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn apply_file(&mut self, file: &ConfigFile) -> Result<(), ConfigError> {
        if let Some(limits) = file.limits.as_ref() {
            if let Some(value) = limits.max_download_connections {
                self.limits.max_download_conns = value;
            }
            if let Some(value) = limits.max_upload_connections {
                self.limits.max_upload_conns = value;
            }
            if let Some(value) = limits.websocket_sessions {
                self.limits.max_websocket_sessions = value;
            }
            if let Some(value) = limits.downloads_per_hour {
                self.limits.downloads_per_hour = value;
            }
            if let Some(value) = limits.bandwidth_gb_per_hour {
                self.limits.bandwidth_gb_per_hour = value;
            }
            if let Some(value) = limits.pings_per_minute {
                self.limits.pings_per_minute = value;
            }
            if let Some(value) = limits.cleanup_interval_secs {
                self.limits.cleanup_interval = Duration::from_secs(value);
            }
        }
        if let Some(upload) = file.upload.as_ref() {
            if let Some(mode) = upload.mode.as_deref() {
                self.upload.mode = UploadMode::parse(mode)?;
            }
            if let Some(mb) = upload.max_request_mb {
                self.upload.max_request_bytes = mb.saturating_mul(MIB);
            }
        }
        if let Some(fleet) = file.fleet.as_ref() {
            if let Some(value) = fleet.bypass {
                self.limits.fleet_bypass = value;
            }
            if let Some(prefix) = fleet.user_agent_prefix.as_ref() {
                self.limits.fleet_user_agent = prefix.clone();
            }
        }
        Ok(())
    }

    /// Apply environment overrides through a lookup closure so tests can
    /// feed values without touching the process environment.
    fn apply_env_with<TLookup>(&mut self, lookup: TLookup) -> Result<(), ConfigError>
    where
        TLookup: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ENABLE_SIMPLE_MULTIPROCESS") {
            self.multiprocess_enabled = parse_bool("ENABLE_SIMPLE_MULTIPROCESS", &value)?;
        }
        if let Some(value) = lookup("SERVER_MODE") {
            self.server_mode = match value.to_ascii_lowercase().as_str() {
                "central" => ServerMode::Central,
                "isp" => ServerMode::Isp,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "SERVER_MODE",
                        value: other.to_owned(),
                    });
                }
            };
        }
        if let Some(value) = lookup("ENABLE_TELEMETRY") {
            self.telemetry_enabled = parse_bool("ENABLE_TELEMETRY", &value)?;
        }
        if let Some(value) = lookup("RATE_LIMIT_DOWNLOADS_PER_HOUR") {
            self.limits.downloads_per_hour =
                parse_number("RATE_LIMIT_DOWNLOADS_PER_HOUR", &value)?;
        }
        if let Some(value) = lookup("RATE_LIMIT_BANDWIDTH_GB_PER_HOUR") {
            self.limits.bandwidth_gb_per_hour =
                parse_number("RATE_LIMIT_BANDWIDTH_GB_PER_HOUR", &value)?;
        }
        if let Some(value) = lookup("RATE_LIMIT_WEBSOCKET_SESSIONS") {
            self.limits.max_websocket_sessions =
                parse_number("RATE_LIMIT_WEBSOCKET_SESSIONS", &value)?;
        }
        if let Some(value) = lookup("RATE_LIMIT_CLEANUP_INTERVAL") {
            let secs: u64 = parse_number("RATE_LIMIT_CLEANUP_INTERVAL", &value)?;
            self.limits.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(value) = lookup("RATE_LIMIT_FLEET_BYPASS") {
            self.limits.fleet_bypass = parse_bool("RATE_LIMIT_FLEET_BYPASS", &value)?;
        }
        if let Some(value) = lookup("FLEET_USER_AGENT_PREFIX") {
            self.limits.fleet_user_agent = value;
        }
        if let Some(value) = lookup("UPLOAD_MODE") {
            self.upload.mode = UploadMode::parse(&value)?;
        }
        Ok(())
    }
}

fn load_config_file(explicit_path: Option<&Path>) -> Result<Option<ConfigFile>, ConfigError> {
    let path: PathBuf = match explicit_path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                return Ok(None);
            }
            default
        }
    };
    let raw = std::fs::read_to_string(&path).map_err(|err| ConfigError::Read {
        path: path.clone(),
        source: err,
    })?;
    let parsed = toml::from_str(&raw).map_err(|err| ConfigError::Parse { path, source: err })?;
    Ok(Some(parsed))
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            field,
            value: other.to_owned(),
        }),
    }
}

fn parse_number<TNum>(field: &'static str, value: &str) -> Result<TNum, ConfigError>
where
    TNum: std::str::FromStr,
    TNum::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|err| ConfigError::InvalidValue {
        field,
        value: format!("{} ({})", value, err),
    })
}
