//! NSC CLI - tooling around the remote-signer connection flow
//!
//! This crate provides a command-line interface for:
//! - Building `nostrconnect://` requests for interactive connection
//! - Inspecting bunker URLs without leaking their secret
//! - Running the connection state machine against scripted signers
//! - Managing the CLI configuration file

pub mod cli;
pub mod config;
pub mod demo;
pub mod output;

pub use cli::Cli;
pub use config::{CliOverrides, Config};
pub use output::{JsonResponse, OutputFormat, OutputFormatter};

use nsc_core::{FailureKind, SessionSnapshot, Stage};

/// Exit codes for CLI operations
///
/// - 0: Success - operation completed successfully
/// - 1: General error - unspecified error occurred
/// - 2: Authentication failed - the sign-in step failed
/// - 3: Timeout - sign-in timed out
/// - 4: Connection failed - no signer connection could be established
/// - 5: Invalid input - bad arguments or data provided
/// - 6: Approval pending - the signer is waiting for out-of-band approval
/// - 7: Secret expired - the bunker URL can no longer be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// General error (exit code 1)
    GeneralError = 1,
    /// Authentication failed (exit code 2)
    AuthenticationFailed = 2,
    /// Operation timed out (exit code 3)
    Timeout = 3,
    /// Connection failed (exit code 4)
    ConnectionFailed = 4,
    /// Invalid input provided (exit code 5)
    InvalidInput = 5,
    /// Waiting on out-of-band approval (exit code 6)
    ApprovalPending = 6,
    /// Bunker secret expired or consumed (exit code 7)
    SecretExpired = 7,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<FailureKind> for ExitCode {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::SignerWaitFailed => ExitCode::ConnectionFailed,
            FailureKind::SecretExpiredOrConsumed | FailureKind::ApprovalRetriesExhausted => {
                ExitCode::SecretExpired
            }
            FailureKind::AuthenticationFailed => ExitCode::AuthenticationFailed,
            FailureKind::AuthenticationTimedOut => ExitCode::Timeout,
        }
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Exit code describing where a session ended up
    pub fn for_snapshot(snapshot: &SessionSnapshot) -> Self {
        match snapshot.stage {
            Stage::Complete => ExitCode::Success,
            Stage::AwaitingApproval => ExitCode::ApprovalPending,
            Stage::Error => snapshot
                .error
                .as_ref()
                .map(|e| ExitCode::from(e.kind))
                .unwrap_or(ExitCode::GeneralError),
            _ => ExitCode::GeneralError,
        }
    }

    /// Get the exit code name as a string
    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::AuthenticationFailed => "AUTH_FAILED",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::ApprovalPending => "APPROVAL_PENDING",
            ExitCode::SecretExpired => "SECRET_EXPIRED",
        }
    }

    /// Get a human-readable description of the exit code
    pub fn description(&self) -> &'static str {
        match self {
            ExitCode::Success => "Operation completed successfully",
            ExitCode::GeneralError => "An unspecified error occurred",
            ExitCode::AuthenticationFailed => "Sign-in with the signer failed",
            ExitCode::Timeout => "Sign-in timed out",
            ExitCode::ConnectionFailed => "Could not connect to a signer",
            ExitCode::InvalidInput => "Invalid arguments or data provided",
            ExitCode::ApprovalPending => "The signer is waiting for approval",
            ExitCode::SecretExpired => "The bunker URL expired; generate a new one",
        }
    }
}
