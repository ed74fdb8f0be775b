//! NSC CLI entry point

use std::sync::Mutex;

use clap::Parser;
use nsc_cli::{Cli, CliOverrides, Config, ExitCode};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Create default config on first run
    if cli.config.is_none() {
        if let Err(e) = Config::create_default_if_missing() {
            eprintln!("Warning: Could not create default config: {e}");
        }
    }

    // Load config from custom path or default
    let config = match Config::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Config error: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };

    // Command-line flags win over the file
    let overrides = CliOverrides {
        output_format: cli.output.map(|f| f.to_string()),
        verbose: if cli.verbose { Some(true) } else { None },
        debug: if cli.debug { Some(true) } else { None },
        relays: if cli.relays.is_empty() {
            None
        } else {
            Some(cli.relays.clone())
        },
        grace_window_ms: cli.grace_window_ms,
    };
    let config = config.with_overrides(&overrides);

    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        return ExitCode::InvalidInput.to_exit_code();
    }

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let file_layer = config.logging.file.as_ref().and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            Err(e) => {
                eprintln!("Warning: Could not open log file {}: {e}", path.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    // Execute command with resolved config
    match cli.execute_with_config(config).await {
        Ok(code) => code.to_exit_code(),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::GeneralError.to_exit_code()
        }
    }
}
