//! Subcommand implementations.

pub mod call;
pub mod config;
pub mod enumerate;

use crate::config::ClientConfig;
use crate::connection::IpConnection;
use crate::error::ClientResult;

/// Opens a one-shot connection to the configured daemon.
///
/// Auto-reconnect is off: a command either finishes or fails.
pub async fn connect(config: &ClientConfig) -> ClientResult<IpConnection> {
    let connection = IpConnection::with_config(config)?;
    connection.set_auto_reconnect(false);
    connection
        .connect(&config.connection.host, config.connection.port)
        .await?;
    Ok(connection)
}
