use std::env;
use std::path::PathBuf;

use tokio::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub driver_id: Option<i64>,
    pub store_path: PathBuf,
    pub position_throttle: Duration,
    pub gps_timeout: Duration,
    pub gps_max_age: Duration,
    pub logout_clear_delay: Duration,
    pub notify_delay: Duration,
    pub refresh_interval: Duration,
    pub fetch_limit: usize,
    pub history_limit: usize,
    pub recent_receivers_limit: usize,
    pub event_buffer_size: usize,
    pub manager_phone: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            driver_id: parse_optional("DRIVER_ID")?,
            store_path: env::var("STORE_PATH")
                .unwrap_or_else(|_| "driver-state.json".to_string())
                .into(),
            position_throttle: Duration::from_secs(parse_or_default("POSITION_THROTTLE_SECS", 10)?),
            gps_timeout: Duration::from_secs(parse_or_default("GPS_TIMEOUT_SECS", 10)?),
            gps_max_age: Duration::from_secs(parse_or_default("GPS_MAX_AGE_SECS", 5)?),
            logout_clear_delay: Duration::from_secs(parse_or_default("LOGOUT_CLEAR_DELAY_SECS", 10)?),
            notify_delay: Duration::from_millis(parse_or_default("NOTIFY_DELAY_MS", 750)?),
            refresh_interval: Duration::from_secs(parse_or_default("REFRESH_INTERVAL_SECS", 30)?),
            fetch_limit: parse_or_default("FETCH_LIMIT", 50)?,
            history_limit: parse_or_default("HISTORY_LIMIT", 50)?,
            recent_receivers_limit: parse_or_default("RECENT_RECEIVERS_LIMIT", 20)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            manager_phone: env::var("MANAGER_PHONE")
                .ok()
                .filter(|phone| !phone.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the runtime cannot start with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.event_buffer_size == 0 {
            return Err(AppError::Internal(
                "invalid EVENT_BUFFER_SIZE: must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            driver_id: None,
            store_path: PathBuf::from("driver-state.json"),
            position_throttle: Duration::from_secs(10),
            gps_timeout: Duration::from_secs(10),
            gps_max_age: Duration::from_secs(5),
            logout_clear_delay: Duration::from_secs(10),
            notify_delay: Duration::from_millis(750),
            refresh_interval: Duration::from_secs(30),
            fetch_limit: 50,
            history_limit: 50,
            recent_receivers_limit: 20,
            event_buffer_size: 1024,
            manager_phone: None,
        }
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional(key)?.unwrap_or(default))
}

fn parse_optional<T>(key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(None),
    }
}
