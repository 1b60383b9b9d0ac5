//! Configuration commands.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Dump the current configuration to stdout.
pub fn dump(config: &ClientConfig) -> ClientResult<()> {
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| ClientError::Config(format!("failed to serialize config: {e}")))?;
    println!("# config.toml ({})", ClientConfig::default_path().display());
    println!("{toml_str}");

    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &ClientConfig) -> ClientResult<()> {
    check(config)?;
    if config.connection.secret.is_some() {
        println!("Secret resolves.");
    }
    println!("Configuration is valid.");
    Ok(())
}

/// Show the configuration file path.
pub fn path() -> ClientResult<()> {
    let config_path = ClientConfig::default_path();
    println!("config: {}", config_path.display());
    Ok(())
}

fn check(config: &ClientConfig) -> ClientResult<()> {
    if config.connection.host.trim().is_empty() {
        return Err(ClientError::Config("connection.host must not be empty".into()));
    }
    if config.connection.port == 0 {
        return Err(ClientError::Config("connection.port must not be 0".into()));
    }
    if config.connection.timeout_ms == 0 {
        return Err(ClientError::Config(
            "connection.timeout_ms must be positive".into(),
        ));
    }
    if config.reconnect.enabled && config.reconnect.interval_ms == 0 {
        return Err(ClientError::Config(
            "reconnect.interval_ms must be positive".into(),
        ));
    }
    config.resolve_secret()?;
    Ok(())
}
