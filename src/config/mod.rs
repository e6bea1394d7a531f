//! Configuration module - defaults, optional JSON file, environment overrides

use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defs::TeamMode;
use crate::geom::Vec2;

/// Default path of the optional JSON override file
pub const DEFAULT_CONFIG_PATH: &str = "royale-config.json";

/// How match instances are hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    /// Every match ticks inside one loop on the main runtime
    Single,
    /// Every match runs on its own worker thread
    Multi,
}

/// A selectable game mode, indexed by `gameModeIdx` in find-game requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeConfig {
    pub map_name: String,
    pub team_mode: TeamMode,
    pub enabled: bool,
}

/// Public address of a region's game server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub https: bool,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMode {
    Default,
    /// Everyone spawns at `spawn_pos` (or the map center)
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub spawn_mode: SpawnMode,
    pub spawn_pos: Option<Vec2>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            spawn_mode: SpawnMode::Default,
            spawn_pos: None,
        }
    }
}

/// Application configuration. Built once at startup and shared through `Arc`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS, comma separated
    pub client_origin: String,

    /// Shared secret for find-game requests
    pub api_key: String,
    pub regions: BTreeMap<String, RegionConfig>,
    pub this_region: String,
    pub modes: Vec<ModeConfig>,

    /// Simulation ticks per second
    pub game_tps: u32,
    /// Net syncs per second
    pub net_sync_tps: u32,
    pub process_mode: ProcessMode,

    /// Manager to worker heartbeat period
    pub keepalive_secs: u64,
    /// Kill a worker that has been silent this long
    pub worker_timeout_secs: u64,
    /// Kill a worker whose match stopped this long ago
    pub stopped_worker_secs: u64,
    /// First worker route id; ids are handed out from a fixed pool above it
    pub worker_id_base: u16,
    pub worker_pool_size: u16,

    /// Longest a find-game request waits for a new match to come up
    pub find_game_timeout_secs: u64,
    /// Unused join tokens expire after this long
    pub join_token_ttl_secs: u64,
    /// A match that never filled stops after being empty this long
    pub empty_game_timeout_secs: u64,
    /// Sockets with no inbound traffic are closed after this long
    pub socket_idle_timeout_secs: u64,
    /// Max inbound frames per second per socket
    pub socket_frame_rate: u32,

    pub banned_ips: Vec<String>,
    /// Period of the performance log line, 0 disables it
    pub perf_log_secs: u64,
    pub debug: DebugConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut regions = BTreeMap::new();
        regions.insert(
            "local".to_string(),
            RegionConfig {
                https: false,
                address: "127.0.0.1:8001".to_string(),
            },
        );

        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            log_level: "info".to_string(),
            client_origin: "http://127.0.0.1:3000".to_string(),
            api_key: "dev-api-key".to_string(),
            regions,
            this_region: "local".to_string(),
            modes: vec![
                ModeConfig {
                    map_name: "main".to_string(),
                    team_mode: TeamMode::Solo,
                    enabled: true,
                },
                ModeConfig {
                    map_name: "main".to_string(),
                    team_mode: TeamMode::Duo,
                    enabled: true,
                },
                ModeConfig {
                    map_name: "main".to_string(),
                    team_mode: TeamMode::Squad,
                    enabled: true,
                },
                ModeConfig {
                    map_name: "main_spring".to_string(),
                    team_mode: TeamMode::Solo,
                    enabled: false,
                },
                ModeConfig {
                    map_name: "faction".to_string(),
                    team_mode: TeamMode::Squad,
                    enabled: false,
                },
            ],
            game_tps: 100,
            net_sync_tps: 33,
            process_mode: ProcessMode::Single,
            keepalive_secs: 5,
            worker_timeout_secs: 10,
            stopped_worker_secs: 60,
            worker_id_base: 8001,
            worker_pool_size: 512,
            find_game_timeout_secs: 10,
            join_token_ttl_secs: 20,
            empty_game_timeout_secs: 60,
            socket_idle_timeout_secs: 30,
            socket_frame_rate: 120,
            banned_ips: Vec::new(),
            perf_log_secs: 60,
            debug: DebugConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the JSON file named by
    /// `ROYALE_CONFIG` (if present), then environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("ROYALE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file_or_default(Path::new(&path))?;
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// A missing file means "use defaults"; an unreadable or malformed one is an error
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR
        if let Some(port) = lookup("PORT") {
            self.server_addr = format!("0.0.0.0:{}", port)
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?;
        } else if let Some(addr) = lookup("SERVER_ADDR") {
            self.server_addr = addr.parse().map_err(|_| ConfigError::InvalidAddress)?;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(key) = lookup("API_KEY") {
            self.api_key = key;
        }
        if let Some(region) = lookup("REGION") {
            self.this_region = region;
        }
        if let Some(origin) = lookup("CLIENT_ORIGIN") {
            self.client_origin = origin;
        }
        if let Some(mode) = lookup("PROCESS_MODE") {
            self.process_mode = match mode.to_ascii_lowercase().as_str() {
                "single" => ProcessMode::Single,
                "multi" => ProcessMode::Multi,
                _ => return Err(ConfigError::InvalidValue("PROCESS_MODE", mode)),
            };
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.game_tps == 0 || self.net_sync_tps == 0 {
            return Err(ConfigError::Invalid("tick rates must be non-zero".into()));
        }
        if self.net_sync_tps > self.game_tps {
            return Err(ConfigError::Invalid(
                "net_sync_tps cannot exceed game_tps".into(),
            ));
        }
        if self.modes.is_empty() {
            return Err(ConfigError::Invalid("at least one mode is required".into()));
        }
        if !self.regions.contains_key(&self.this_region) {
            return Err(ConfigError::Invalid(format!(
                "this_region '{}' is not in regions",
                self.this_region
            )));
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("worker_pool_size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn region(&self) -> Option<&RegionConfig> {
        self.regions.get(&self.this_region)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn stopped_worker_grace(&self) -> Duration {
        Duration::from_secs(self.stopped_worker_secs)
    }

    pub fn find_game_timeout(&self) -> Duration {
        Duration::from_secs(self.find_game_timeout_secs)
    }

    pub fn socket_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_idle_timeout_secs)
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.banned_ips.iter().any(|banned| banned == ip)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Malformed config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
