use std::env;
use std::fmt;
use std::time::Duration;

use crate::error::AppError;

const MAX_DIRECTIONS_TIMEOUT_SECS: u64 = 10;

/// Hides its contents from `Debug` and `Display` so config dumps stay safe to log.
#[derive(Clone, Default)]
pub struct Secret<T: Clone + Default> {
    value: T,
}

impl<T: Clone + Default> Secret<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }

    pub fn reveal(&self) -> &T {
        &self.value
    }
}

impl<T: Clone + Default> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

impl<T: Clone + Default> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub nearby_radius_km: f64,
    pub nearby_limit: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            nearby_radius_km: 10.0,
            nearby_limit: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<Secret<String>>,
    pub db_max_connections: u32,
    pub jwt_secret: Secret<String>,
    pub directions_api_key: Option<Secret<String>>,
    pub directions_base_url: String,
    pub directions_timeout: Duration,
    pub dispatch: DispatchSettings,
    pub order_queue_size: usize,
    pub route_sweep_interval: Duration,
    pub dispatch_sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let jwt_secret = non_empty("JWT_SECRET")
            .ok_or_else(|| AppError::Internal("JWT_SECRET must be set".to_string()))?;

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") | Err(_) => LogFormat::Compact,
            Ok(other) => {
                return Err(AppError::Internal(format!("invalid LOG_FORMAT: {other}")));
            }
        };

        let timeout_secs: u64 = parse_or_default("DIRECTIONS_TIMEOUT_SECS", 10)?;

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            database_url: non_empty("DATABASE_URL").map(Secret::new),
            db_max_connections: parse_or_default("DB_MAX_CONNECTIONS", 10)?,
            jwt_secret: Secret::new(jwt_secret),
            directions_api_key: non_empty("DIRECTIONS_API_KEY").map(Secret::new),
            directions_base_url: env::var("DIRECTIONS_BASE_URL")
                .unwrap_or_else(|_| "https://serpapi.com".to_string()),
            directions_timeout: Duration::from_secs(
                timeout_secs.clamp(1, MAX_DIRECTIONS_TIMEOUT_SECS),
            ),
            dispatch: DispatchSettings {
                nearby_radius_km: parse_or_default("NEARBY_RADIUS_KM", 10.0)?,
                nearby_limit: parse_or_default("NEARBY_LIMIT", 100)?,
            },
            order_queue_size: parse_or_default("ORDER_QUEUE_SIZE", 1024)?,
            route_sweep_interval: Duration::from_secs(parse_or_default("ROUTE_SWEEP_SECS", 60)?),
            dispatch_sweep_interval: Duration::from_secs(parse_or_default(
                "DISPATCH_SWEEP_SECS",
                30,
            )?),
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
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

#[cfg(test)]
mod tests {
    use super::Secret;

    #[test]
    fn secrets_do_not_leak_through_formatting() {
        let secret = Secret::new("hunter2".to_string());
        assert_eq!(format!("{secret}"), "****");
        assert_eq!(format!("{secret:?}"), "****");
        assert_eq!(secret.reveal(), "hunter2");
    }
}
