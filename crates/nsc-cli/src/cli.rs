//! CLI command definitions and argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use nsc_core::{bunker::BunkerUrl, connect_uri::ConnectionRequest, PublicKey};

use crate::config::Config;
use crate::demo::{self, Scenario};
use crate::output::{BunkerOutput, OutputFormat, OutputFormatter, RequestOutput};
use crate::ExitCode;

/// NSC - remote-signer connection tooling
#[derive(Parser, Debug)]
#[command(name = "nsc")]
#[command(version, about = "NSC - remote-signer connection tooling")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (defaults to the config file value)
    #[arg(long, global = true)]
    pub output: Option<OutputFormat>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug mode (state machine tracing)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Relay URL (can be specified multiple times)
    #[arg(long = "relay", global = true)]
    pub relays: Vec<String>,

    /// Grace window for late approval URLs, in milliseconds
    #[arg(long, global = true)]
    pub grace_window_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a nostrconnect:// URI for a signer to scan
    Request(RequestArgs),
    /// Inspect a bunker:// URL without revealing its secret
    Inspect(InspectArgs),
    /// Run a scripted connection scenario
    Demo(DemoArgs),
    /// Manage the configuration file
    Config(ConfigArgs),
}

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        let output: OutputFormat = config.output.format.parse().unwrap_or_default();
        let verbose = config.output.verbose;

        match self.command {
            Commands::Request(args) => args.execute(&output, verbose, &config),
            Commands::Inspect(args) => args.execute(&output, verbose),
            Commands::Demo(args) => args.execute(&output, verbose, &config).await,
            Commands::Config(args) => args.execute(&output, verbose, &config, self.config),
        }
    }
}

/// Arguments for the request command
#[derive(Parser, Debug)]
pub struct RequestArgs {
    /// Client public key (64 hex chars); falls back to `request.client_pubkey`
    #[arg(long)]
    pub client_pubkey: Option<String>,

    /// App name shown by the signer
    #[arg(long)]
    pub name: Option<String>,

    /// Requested permissions (comma-separated)
    #[arg(long)]
    pub perms: Option<String>,

    /// Replace the secret with a placeholder in the printed URI
    #[arg(long)]
    pub redact: bool,
}

impl RequestArgs {
    pub fn execute(self, output: &OutputFormat, verbose: bool, config: &Config) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(*output, verbose);

        let Some(raw_key) = self
            .client_pubkey
            .or_else(|| config.request.client_pubkey.clone())
        else {
            formatter.error("No client key. Pass --client-pubkey or set request.client_pubkey.");
            return Ok(ExitCode::InvalidInput);
        };
        let client_pubkey = match PublicKey::from_hex(&raw_key) {
            Ok(key) => key,
            Err(e) => {
                formatter.error(&e.to_string());
                return Ok(ExitCode::InvalidInput);
            }
        };

        let perms = match self.perms {
            Some(list) => parse_list(&list),
            None => config.request.perms.clone(),
        };
        let name = self.name.unwrap_or_else(|| config.request.app_name.clone());

        formatter.progress(&format!(
            "Building request for {} on {} relay(s)",
            client_pubkey.short(),
            config.request.relays.len()
        ));

        let request = match ConnectionRequest::new(client_pubkey, config.request.relays.clone()) {
            Ok(request) => request.with_name(name.clone()).with_perms(perms.clone()),
            Err(e) => {
                formatter.error(&e.to_string());
                return Ok(ExitCode::InvalidInput);
            }
        };
        tracing::debug!(uri = %request.redacted_uri(), "built connect request");

        let uri = if self.redact {
            request.redacted_uri()
        } else {
            request.to_uri()
        };
        let result = RequestOutput {
            uri,
            client_pubkey: client_pubkey.to_hex(),
            relays: request.relays.clone(),
            name,
            perms,
        };
        println!("{}", formatter.format_request(&result));
        Ok(ExitCode::Success)
    }
}

/// Arguments for the inspect command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// The bunker:// URL to inspect
    pub bunker_url: String,
}

impl InspectArgs {
    pub fn execute(self, output: &OutputFormat, verbose: bool) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(*output, verbose);

        let details = match BunkerUrl::new(&self.bunker_url).and_then(|url| {
            let details = url.details()?;
            Ok((url.redacted(), details))
        }) {
            Ok(parsed) => parsed,
            Err(e) => {
                formatter.error(&e.to_string());
                return Ok(ExitCode::InvalidInput);
            }
        };
        let (redacted, details) = details;

        let result = BunkerOutput {
            redacted,
            remote_signer: details.remote_signer.to_hex(),
            relays: details.relays,
            has_secret: details.secret.is_some(),
        };
        if !result.has_secret {
            formatter.warning("Bunker URL carries no secret; the signer may require approval");
        }
        let rendered = formatter.format_bunker(&result);
        if !rendered.is_empty() {
            println!("{rendered}");
        }
        Ok(ExitCode::Success)
    }
}

/// Arguments for the demo command
#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Scenario to run
    #[arg(value_enum)]
    pub scenario: Scenario,

    /// Use the configured timings instead of compressed demo timings
    #[arg(long)]
    pub realtime: bool,
}

impl DemoArgs {
    pub async fn execute(
        self,
        output: &OutputFormat,
        verbose: bool,
        config: &Config,
    ) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(*output, verbose);
        let timings = if self.realtime {
            config.connect.clone()
        } else {
            demo::demo_timings()
        };

        formatter.progress(&format!("Running scenario '{}'", self.scenario.name()));
        let report = demo::run(self.scenario, timings).await?;

        let rendered = formatter.format_demo(&report);
        if !rendered.is_empty() {
            println!("{rendered}");
        }

        let code = ExitCode::for_snapshot(&report.outcome);
        if code == ExitCode::Success {
            formatter.success("Signed in");
        } else if let Some(error) = &report.outcome.error {
            formatter.warning(&format!("Session ended in error: {}", error.message));
        }
        Ok(code)
    }
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a commented sample configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the configuration file path
    Path,
}

impl ConfigArgs {
    pub fn execute(
        self,
        output: &OutputFormat,
        verbose: bool,
        config: &Config,
        custom_path: Option<PathBuf>,
    ) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(*output, verbose);
        let path = custom_path.or_else(Config::default_path);

        match self.action {
            ConfigAction::Show => {
                let rendered = match output {
                    OutputFormat::Json => serde_json::to_string_pretty(
                        &crate::JsonResponse::success_with_command(config, "config show"),
                    )?,
                    OutputFormat::Table => toml::to_string_pretty(config)?,
                    OutputFormat::Quiet => return Ok(ExitCode::Success),
                };
                println!("{rendered}");
                Ok(ExitCode::Success)
            }
            ConfigAction::Init { force } => {
                let Some(path) = path else {
                    formatter.error("Could not determine a configuration directory");
                    return Ok(ExitCode::GeneralError);
                };
                if path.exists() && !force {
                    formatter.error(&format!(
                        "{} already exists (use --force to overwrite)",
                        path.display()
                    ));
                    return Ok(ExitCode::InvalidInput);
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, Config::sample_toml())?;
                formatter.success(&format!("Wrote {}", path.display()));
                Ok(ExitCode::Success)
            }
            ConfigAction::Path => {
                match path {
                    Some(path) => println!("{}", path.display()),
                    None => {
                        formatter.error("Could not determine a configuration directory");
                        return Ok(ExitCode::GeneralError);
                    }
                }
                Ok(ExitCode::Success)
            }
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
