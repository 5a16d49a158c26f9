use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;

use crate::config::{
    default_heartbeat, default_port, default_timeout, default_vhost, ConnectionConfig,
};

/// Reads connection settings from `RMQ_*` variables, after loading `.env`.
///
/// `RMQ_HOST`, `RMQ_USER` and `RMQ_PASS` are required; `RMQ_PORT`,
/// `RMQ_VHOST`, `RMQ_CONNECT_TIMEOUT_MS` and `RMQ_HEARTBEAT_SECONDS` fall back
/// to defaults.
pub fn load() -> Result<ConnectionConfig> {
    dotenv().ok();
    from_lookup(|key| env::var(key).ok())
}

pub fn from_lookup<F>(lookup: F) -> Result<ConnectionConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| lookup(key).with_context(|| format!("{} is not set", key));

    let config = ConnectionConfig {
        host: required("RMQ_HOST")?,
        username: required("RMQ_USER")?,
        password: required("RMQ_PASS")?,
        port: match lookup("RMQ_PORT") {
            Some(val) => val.parse().context("RMQ_PORT must be a port number")?,
            None => default_port(),
        },
        vhost: lookup("RMQ_VHOST").unwrap_or_else(default_vhost),
        connection_timeout_ms: match lookup("RMQ_CONNECT_TIMEOUT_MS") {
            Some(val) => val
                .parse()
                .context("RMQ_CONNECT_TIMEOUT_MS must be a number of milliseconds")?,
            None => default_timeout(),
        },
        heartbeat_seconds: match lookup("RMQ_HEARTBEAT_SECONDS") {
            Some(val) => val
                .parse()
                .context("RMQ_HEARTBEAT_SECONDS must be a number of seconds")?,
            None => default_heartbeat(),
        },
    };
    config.validate()?;
    Ok(config)
}
