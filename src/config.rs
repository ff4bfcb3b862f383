use std::env;
use std::time::Duration;

/// Default public STUN hosts used when `STUN_SERVERS` is not set.
const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub room_code: String,
    pub username: String,
    pub redis_url: Option<String>,
    pub stun_servers: Vec<String>,
    pub ring_timeout_seconds: u64,
    pub signal_max_age_seconds: u64,
    pub store_lease_ttl_seconds: u64,
    pub viewport_width: u32,
    pub capture_audio: bool,
    pub capture_video: bool,
    pub storage_url: Option<String>,
    pub storage_key: Option<String>,
    pub storage_bucket: String,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            room_code: non_empty_var("ROOM_CODE").ok_or(ConfigError::MissingRoomCode)?,
            username: non_empty_var("USERNAME").ok_or(ConfigError::MissingUsername)?,
            redis_url: non_empty_var("REDIS_URL"),
            stun_servers: non_empty_var("STUN_SERVERS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_else(|| DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()),
            ring_timeout_seconds: env::var("RING_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            signal_max_age_seconds: env::var("SIGNAL_MAX_AGE_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60),
            store_lease_ttl_seconds: env::var("STORE_LEASE_TTL_SECONDS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("STORE_LEASE_TTL_SECONDS"))?,
            viewport_width: env::var("VIEWPORT_WIDTH")
                .unwrap_or_else(|_| "1280".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("VIEWPORT_WIDTH"))?,
            capture_audio: parse_flag("CAPTURE_AUDIO")?,
            capture_video: parse_flag("CAPTURE_VIDEO")?,
            storage_url: non_empty_var("STORAGE_URL"),
            storage_key: non_empty_var("STORAGE_KEY"),
            storage_bucket: env::var("STORAGE_BUCKET").unwrap_or_else(|_| "chat-files".to_string()),
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_seconds)
    }

    pub fn signal_max_age(&self) -> Duration {
        Duration::from_secs(self.signal_max_age_seconds)
    }

    /// How long presence entries of a client that vanished without
    /// disconnecting stay in a Redis store.
    pub fn store_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.store_lease_ttl_seconds.max(1))
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(key: &'static str) -> Result<bool, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(true),
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key)),
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server port")]
    InvalidPort,
    #[error("ROOM_CODE environment variable is required")]
    MissingRoomCode,
    #[error("USERNAME environment variable is required")]
    MissingUsername,
    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
pub(crate) fn test_config(username: &str) -> Config {
    Config {
        server_host: "localhost".to_string(),
        server_port: 8080,
        room_code: "room-1".to_string(),
        username: username.to_string(),
        redis_url: None,
        stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        ring_timeout_seconds: 30,
        signal_max_age_seconds: 60,
        store_lease_ttl_seconds: 15,
        viewport_width: 1280,
        capture_audio: true,
        capture_video: true,
        storage_url: None,
        storage_key: None,
        storage_bucket: "chat-files".to_string(),
        log_format: LogFormat::Pretty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_list_is_trimmed_and_filtered() {
        assert_eq!(
            parse_list(" stun:a:1 , ,stun:b:2"),
            vec!["stun:a:1".to_string(), "stun:b:2".to_string()]
        );
    }

    #[test]
    fn durations_follow_seconds() {
        let config = test_config("alice");
        assert_eq!(config.ring_timeout(), Duration::from_secs(30));
        assert_eq!(config.signal_max_age(), Duration::from_secs(60));
        assert_eq!(config.server_addr(), "localhost:8080");
    }
}
