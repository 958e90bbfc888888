use std::env;
use std::time::Duration;

use crate::error::AppError;

/// Signing secret used only when `ALLOW_DEV_SECRET=true` and `JWT_SECRET` is unset.
pub const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub order_queue_size: usize,
    pub event_buffer_size: usize,
    pub archive_size: usize,
    pub order_service_url: String,
    pub lookup_timeout: Duration,
    pub jwt_secret: String,
    pub jwt_dev_secret: bool,
    pub amqp: Option<AmqpConfig>,
    pub reaper_interval: Duration,
    pub stale_after: Duration,
    pub tracking_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    pub order_queue: String,
    pub event_queue: String,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") | Err(_) => LogFormat::Compact,
            Ok(other) => {
                return Err(AppError::Internal(format!(
                    "invalid LOG_FORMAT: {other}, expected compact/json"
                )));
            }
        };

        let (jwt_secret, jwt_dev_secret) = resolve_jwt_secret(
            env::var("JWT_SECRET").ok(),
            parse_or_default("ALLOW_DEV_SECRET", false)?,
        )?;

        let amqp = match env::var("AMQP_URL") {
            Ok(url) if !url.trim().is_empty() => Some(AmqpConfig {
                url,
                order_queue: string_or_default("ORDER_QUEUE_NAME", "food-queue"),
                event_queue: string_or_default("EVENT_QUEUE_NAME", "food_orders"),
                connect_attempts: parse_or_default("CONNECT_ATTEMPTS", 5)?,
                connect_backoff: Duration::from_secs(parse_or_default("CONNECT_BACKOFF_SECS", 5)?),
            }),
            _ => None,
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 8080)?,
            log_level: string_or_default("LOG_LEVEL", "info"),
            log_format,
            order_queue_size: capacity_or_default("ORDER_QUEUE_SIZE", 1024)?,
            event_buffer_size: capacity_or_default("EVENT_BUFFER_SIZE", 1024)?,
            archive_size: parse_or_default("ARCHIVE_SIZE", 1024)?,
            order_service_url: string_or_default("ORDER_SERVICE_URL", "http://localhost:8000"),
            lookup_timeout: Duration::from_secs(parse_or_default("LOOKUP_TIMEOUT_SECS", 10)?),
            jwt_secret,
            jwt_dev_secret,
            amqp,
            reaper_interval: period_or_default("REAPER_INTERVAL_SECS", 300)?,
            stale_after: period_or_default("STALE_AFTER_SECS", 300)?,
            tracking_interval: period_or_default("TRACKING_INTERVAL_SECS", 10)?,
        })
    }
}

fn string_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Returns the secret and whether it is the built-in development one.
fn resolve_jwt_secret(secret: Option<String>, allow_dev: bool) -> Result<(String, bool), AppError> {
    match secret {
        Some(secret) if !secret.trim().is_empty() => Ok((secret, false)),
        _ if allow_dev => Ok((DEV_JWT_SECRET.to_string(), true)),
        _ => Err(AppError::Internal(
            "invalid JWT_SECRET: must be set (ALLOW_DEV_SECRET=true for local runs)".to_string(),
        )),
    }
}

fn require_nonzero<T>(key: &str, value: T) -> Result<T, AppError>
where
    T: PartialEq + Default,
{
    if value == T::default() {
        return Err(AppError::Internal(format!("invalid {key}: must be > 0")));
    }
    Ok(value)
}

fn capacity_or_default(key: &str, default: usize) -> Result<usize, AppError> {
    require_nonzero(key, parse_or_default(key, default)?)
}

fn period_or_default(key: &str, default_secs: u64) -> Result<Duration, AppError> {
    let secs = require_nonzero(key, parse_or_default(key, default_secs)?)?;
    Ok(Duration::from_secs(secs))
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
