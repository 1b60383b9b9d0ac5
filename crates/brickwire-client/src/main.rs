//! brickwire CLI entry point.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use brickwire_client::cli::{Cli, Command, ConfigAction};
use brickwire_client::commands;
use brickwire_client::commands::call::CallArgs;
use brickwire_client::config::ClientConfig;
use brickwire_client::error::ClientResult;
use brickwire_client::logging::{LoggingConfig, init_logging};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LoggingConfig::for_cli(cli.debug, cli.log_format)) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let mut config = match cli.config {
        Some(ref path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };

    // command line wins over the file
    if let Some(host) = cli.host {
        config.connection.host = host;
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if let Some(timeout) = cli.timeout {
        config.connection.timeout_ms = timeout;
    }

    match cli.command {
        Command::Enumerate { json, wait } => {
            commands::enumerate::run(&config, json, Duration::from_millis(wait)).await
        }
        Command::Call {
            uid,
            function_id,
            request_format,
            args,
            response_format,
            no_response,
            json,
        } => {
            commands::call::run(
                &config,
                CallArgs {
                    uid,
                    function_id,
                    request_format,
                    args,
                    response_format,
                    no_response,
                    json,
                },
            )
            .await
        }
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}
