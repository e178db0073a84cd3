#![forbid(unsafe_code)]

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8787";
pub const DEFAULT_REFRESH_TICK_MS: u64 = 1_000;
const REFRESH_TICK_RANGE_MS: std::ops::RangeInclusive<u64> = 100..=1_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Process configuration. Every value has a local default; the `AUTH2_*`
/// environment variables override them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth2Config {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub keystore_dir: PathBuf,
    pub http_bind: SocketAddr,
    pub refresh_tick: Duration,
}

impl Auth2Config {
    /// Defaults rooted at `data_dir`, ignoring the environment.
    pub fn for_data_dir(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("database.json"),
            keystore_dir: data_dir.join("keystore"),
            data_dir,
            http_bind: SocketAddr::from(([127, 0, 0, 1], 8787)),
            refresh_tick: Duration::from_millis(DEFAULT_REFRESH_TICK_MS),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = non_empty_var("AUTH2_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let mut cfg = Self::for_data_dir(data_dir);
        if let Some(path) = non_empty_var("AUTH2_DATABASE_PATH") {
            cfg.database_path = PathBuf::from(path);
        }
        if let Some(raw) = non_empty_var("AUTH2_HTTP_BIND") {
            cfg.http_bind = parse_http_bind(&raw)?;
        }
        if let Some(raw) = non_empty_var("AUTH2_REFRESH_TICK_MS") {
            cfg.refresh_tick = parse_refresh_tick(&raw)?;
        }
        Ok(cfg)
    }

    /// Base URL a second process uses to reach the link ingress.
    pub fn ingress_base_url(&self) -> String {
        format!("http://{}", self.http_bind)
    }
}

pub fn parse_http_bind(raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.trim()
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::Invalid {
            var: "AUTH2_HTTP_BIND",
            reason: e.to_string(),
        })
}

pub fn parse_refresh_tick(raw: &str) -> Result<Duration, ConfigError> {
    let ms = raw
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::Invalid {
            var: "AUTH2_REFRESH_TICK_MS",
            reason: e.to_string(),
        })?;
    if !REFRESH_TICK_RANGE_MS.contains(&ms) {
        return Err(ConfigError::Invalid {
            var: "AUTH2_REFRESH_TICK_MS",
            reason: format!(
                "must be within {}..={}",
                REFRESH_TICK_RANGE_MS.start(),
                REFRESH_TICK_RANGE_MS.end()
            ),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().and_then(|v| {
        let s = v.trim().to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    })
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg_config_home) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg_config_home).join("auth2");
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".config").join("auth2");
    }
    PathBuf::from(".auth2")
}
