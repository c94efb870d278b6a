use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub offer_ttl_secs: u64,
    pub search_interval_secs: u64,
    pub search_deadline_secs: u64,
    pub max_search_attempts: u32,
    pub search_radius_km: f64,
    pub average_speed_kmh: f64,
    pub service_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            offer_ttl_secs: parse_or_default("OFFER_TTL_SECS", 15 * 60)?,
            search_interval_secs: parse_or_default("SEARCH_INTERVAL_SECS", 30)?,
            search_deadline_secs: parse_or_default("SEARCH_DEADLINE_SECS", 15 * 60)?,
            max_search_attempts: parse_or_default("MAX_SEARCH_ATTEMPTS", 31)?,
            search_radius_km: parse_or_default("SEARCH_RADIUS_KM", 5.0)?,
            average_speed_kmh: parse_or_default("AVERAGE_SPEED_KMH", 30.0)?,
            service_max_attempts: parse_or_default("SERVICE_MAX_ATTEMPTS", 10)?,
        })
    }

    pub fn dispatch_settings(&self) -> Result<DispatchSettings, AppError> {
        if self.search_radius_km <= 0.0 {
            return Err(AppError::Internal(
                "SEARCH_RADIUS_KM must be > 0".to_string(),
            ));
        }
        if self.average_speed_kmh <= 0.0 {
            return Err(AppError::Internal(
                "AVERAGE_SPEED_KMH must be > 0".to_string(),
            ));
        }

        Ok(DispatchSettings {
            offer_ttl: Duration::from_secs(self.offer_ttl_secs),
            search_interval: Duration::from_secs(self.search_interval_secs.max(1)),
            search_deadline: Duration::from_secs(self.search_deadline_secs),
            max_search_attempts: self.max_search_attempts.max(1),
            search_radius_km: self.search_radius_km,
            average_speed_kmh: self.average_speed_kmh,
            service_max_attempts: self.service_max_attempts.max(1),
        })
    }
}

/// Timing and matching knobs consumed by the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub offer_ttl: Duration,
    pub search_interval: Duration,
    pub search_deadline: Duration,
    pub max_search_attempts: u32,
    pub search_radius_km: f64,
    pub average_speed_kmh: f64,
    pub service_max_attempts: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            offer_ttl: Duration::from_secs(15 * 60),
            search_interval: Duration::from_secs(30),
            search_deadline: Duration::from_secs(15 * 60),
            max_search_attempts: 31,
            search_radius_km: 5.0,
            average_speed_kmh: 30.0,
            service_max_attempts: 10,
        }
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
