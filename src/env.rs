use std::str::FromStr;

use anyhow::{anyhow, Result};
use dotenv::dotenv;
use tracing::debug;

use crate::config::RelayConfig;

pub const RABBIT_URI: &str = "RABBIT_URI";
pub const QUEUE_NAME: &str = "QUEUE_NAME";
pub const RECONNECT_DELAY_MS: &str = "RECONNECT_DELAY_MS";
pub const NACK_DELAY_MS: &str = "NACK_DELAY_MS";
pub const PREFETCH_COUNT: &str = "PREFETCH_COUNT";
pub const CONFIRM_MODE: &str = "CONFIRM_MODE";
pub const HTTP_ADDRESS: &str = "HTTP_ADDRESS";
pub const HTTP_PORT: &str = "HTTP_PORT";
pub const POSTGRES_URI: &str = "POSTGRES_URI";
pub const POSTGRES_MAX_CONNECTIONS: &str = "POSTGRES_MAX_CONNECTIONS";
pub const POSTGRES_CREATE_TABLE: &str = "POSTGRES_CREATE_TABLE";
pub const POSTGRES_ACQUIRE_TIMEOUT_MS: &str = "POSTGRES_ACQUIRE_TIMEOUT_MS";

/// Loads `.env` from the working directory if there is one.
pub fn load_dotenv() {
    if let Ok(path) = dotenv() {
        debug!("Loaded environment from {}", path.display());
    }
}

/// Overwrites `config` with every variable `lookup` knows about. A value that
/// does not parse is an error rather than a silent fallback.
pub fn apply_overrides<F>(config: &mut RelayConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup(RABBIT_URI) {
        config.broker.uri = val;
    }
    if let Some(val) = lookup(QUEUE_NAME) {
        config.broker.queue = val;
    }
    if let Some(val) = lookup(RECONNECT_DELAY_MS) {
        config.broker.reconnect_delay_ms = parse(RECONNECT_DELAY_MS, &val)?;
    }
    if let Some(val) = lookup(NACK_DELAY_MS) {
        config.broker.nack_delay_ms = parse(NACK_DELAY_MS, &val)?;
    }
    if let Some(val) = lookup(PREFETCH_COUNT) {
        config.broker.prefetch_count = parse(PREFETCH_COUNT, &val)?;
    }
    if let Some(val) = lookup(CONFIRM_MODE) {
        config.broker.confirm_mode = parse_bool(CONFIRM_MODE, &val)?;
    }
    if let Some(val) = lookup(HTTP_ADDRESS) {
        config.http.address = val;
    }
    if let Some(val) = lookup(HTTP_PORT) {
        config.http.port = parse(HTTP_PORT, &val)?;
    }
    if let Some(val) = lookup(POSTGRES_URI) {
        config.database.uri = val;
    }
    if let Some(val) = lookup(POSTGRES_MAX_CONNECTIONS) {
        config.database.max_connections = parse(POSTGRES_MAX_CONNECTIONS, &val)?;
    }
    if let Some(val) = lookup(POSTGRES_CREATE_TABLE) {
        config.database.create_table = parse_bool(POSTGRES_CREATE_TABLE, &val)?;
    }
    if let Some(val) = lookup(POSTGRES_ACQUIRE_TIMEOUT_MS) {
        config.database.acquire_timeout_ms = parse(POSTGRES_ACQUIRE_TIMEOUT_MS, &val)?;
    }
    Ok(())
}

fn parse<T>(key: &str, val: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    val.trim()
        .parse()
        .map_err(|e| anyhow!("Invalid value for {}: {:?} ({})", key, val, e))
}

fn parse_bool(key: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("Invalid value for {}: {:?} (expected a boolean)", key, val)),
    }
}
