//! Output formatting for CLI results
//!
//! This module provides consistent output formatting across all CLI commands.
//! It supports three output formats:
//! - Table: Human-readable tables (default)
//! - JSON: Structured JSON for scripting and automation
//! - Quiet: Minimal output, exit codes only

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use nsc_core::{ErrorInfo, SessionSnapshot};

use crate::demo::DemoReport;
use crate::ExitCode;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format for scripting
    Json,
    /// Minimal output - exit codes only
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper for consistent schema
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    /// Whether the operation was successful
    pub success: bool,
    /// The response data (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    /// Command that was executed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    /// Create a successful response with command context
    pub fn success_with_command(data: T, command: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: Some(command.to_string()),
        }
    }
}

impl JsonResponse<()> {
    /// Create an error response
    pub fn error(message: &str) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: None,
        }
    }
}

/// `nsc request` result
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutput {
    pub uri: String,
    pub client_pubkey: String,
    pub relays: Vec<String>,
    pub name: String,
    pub perms: Vec<String>,
}

/// `nsc inspect` result
#[derive(Debug, Clone, Serialize)]
pub struct BunkerOutput {
    pub redacted: String,
    pub remote_signer: String,
    pub relays: Vec<String>,
    pub has_secret: bool,
}

/// Formats output for different modes
pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    /// Format a connect request
    pub fn format_request(&self, request: &RequestOutput) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                table.add_row(vec!["URI", &request.uri]);
                table.add_row(vec!["Client Key", &request.client_pubkey]);
                table.add_row(vec!["Relays", &request.relays.join("\n")]);
                table.add_row(vec!["App Name", &request.name]);
                table.add_row(vec!["Permissions", &join_or_dash(&request.perms, ", ")]);
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(request, "request"),
            OutputFormat::Quiet => request.uri.clone(),
        }
    }

    /// Format bunker URL details
    pub fn format_bunker(&self, bunker: &BunkerOutput) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                table.add_row(vec!["Bunker URL", &bunker.redacted]);
                table.add_row(vec!["Remote Signer", &bunker.remote_signer]);
                table.add_row(vec!["Relays", &bunker.relays.join("\n")]);
                table.add_row(vec!["Secret", if bunker.has_secret { "present" } else { "none" }]);
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(bunker, "inspect"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a demo run
    pub fn format_demo(&self, report: &DemoReport) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = property_table();
                table.add_row(vec!["Scenario", report.scenario.name()]);
                let stages: Vec<&str> = report.stages.iter().map(|s| s.as_str()).collect();
                table.add_row(vec!["Stages", &stages.join(" -> ")]);
                table.add_row(vec!["Approval URLs", &join_or_dash(&report.approval_urls, "\n")]);
                table.add_row(vec!["Slow Warnings", &report.slow_warnings.to_string()]);
                table.add_row(vec!["Bunker Calls", &report.bunker_calls.to_string()]);
                table.add_row(vec!["Sign-in Calls", &report.sign_in_calls.to_string()]);
                if let Some(refusal) = &report.resubmit_refusal {
                    table.add_row(vec!["Resubmit", refusal]);
                }
                let mut out = table.to_string();
                out.push('\n');
                out.push_str(&self.snapshot_table(&report.outcome));
                out
            }
            OutputFormat::Json => self.to_json_response(report, "demo"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format error with exit code context
    pub fn format_error_with_code(&self, message: &str, code: ExitCode) -> String {
        match self.format {
            OutputFormat::Table => format!("Error: {message}"),
            OutputFormat::Json => {
                let response = JsonResponse::<()>::error(message);
                let mut output = match serde_json::to_value(&response) {
                    Ok(value) => value,
                    Err(e) => return format!("{{\"error\": \"{e}\"}}"),
                };
                output["exit_code"] = serde_json::json!(code as i32);
                output["exit_code_name"] = serde_json::json!(code.name());
                self.to_json(&output)
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Progress message (only shown in verbose mode)
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    pub fn error(&self, message: &str) {
        match self.format {
            OutputFormat::Table => eprintln!("✗ {message}"),
            OutputFormat::Json => println!("{}", self.to_json(&JsonResponse::<()>::error(message))),
            OutputFormat::Quiet => {}
        }
    }

    pub fn warning(&self, message: &str) {
        if self.format == OutputFormat::Table {
            eprintln!("⚠ {message}");
        }
    }

    fn snapshot_table(&self, snapshot: &SessionSnapshot) -> String {
        let mut table = property_table();
        table.add_row(vec!["Final Stage", snapshot.stage.as_str()]);
        let key = snapshot
            .resolved_public_key
            .map(|k| k.to_hex())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec!["Signer Key", &key]);
        table.add_row(vec![
            "Secret",
            &format!("{:?}", snapshot.secret_disposition),
        ]);
        table.add_row(vec!["Attempts", &snapshot.attempt_count.to_string()]);
        if let Some(error) = &snapshot.error {
            table.add_row(vec!["Error", &describe_error(error)]);
        }
        table.to_string()
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        self.to_json(&JsonResponse::success_with_command(value, command))
    }
}

fn property_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Property", "Value"]);
    table
}

fn join_or_dash(items: &[String], sep: &str) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(sep)
    }
}

fn describe_error(error: &ErrorInfo) -> String {
    let hint = if error.allows_same_credential_retry() {
        "retry available"
    } else {
        "new bunker URL required"
    };
    format!(
        "{} during {}: {} ({hint})",
        error.kind.code(),
        error.failed_stage,
        error.message
    )
}
