//! Error types for NSC Core.
//!
//! Two families live here:
//! - [`ConnectError`]: caller-contract violations returned by entry points
//!   (wrong stage, empty bunker URL, resubmitting an expired secret).
//! - [`ErrorInfo`] / [`FailureKind`]: operational failures. These never cross
//!   the component boundary as errors; they are recorded on the session while
//!   it sits in the `error` stage.

use serde::Serialize;
use thiserror::Error;

use crate::types::Stage;

/// Guidance appended to every failure that invalidates a bunker secret.
pub const NEW_BUNKER_URL_GUIDANCE: &str =
    "Generate a new bunker URL in your signer app and submit it to connect again";

// ============================================================================
// Caller Contract Errors
// ============================================================================

/// Errors returned by the state machine entry points.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Operation not valid in the current stage
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Bunker URL was empty or whitespace
    #[error("bunker URL must not be empty")]
    EmptyBunkerUrl,

    /// Bunker URL failed strict parsing
    #[error("invalid bunker URL: {0}")]
    InvalidBunkerUrl(String),

    /// Connect request could not be built
    #[error("invalid connect request: {0}")]
    InvalidConnectRequest(String),

    /// Public key was not 32 bytes of hex
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The bunker URL's secret was already rejected as expired or consumed
    #[error("bunker secret expired or already used: {}", NEW_BUNKER_URL_GUIDANCE)]
    SecretExpiredOrConsumed,

    /// Timing configuration is inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Random number generation failed
    #[error("random generator failed")]
    Rng,

    /// The controller task is gone
    #[error("connection controller has shut down")]
    ControllerClosed,
}

// ============================================================================
// Operational Failures (Error Stage)
// ============================================================================

/// Why a session ended up in the `error` stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Interactive wait (or bunker connect) failed or hit the hard timeout
    SignerWaitFailed,
    /// The bunker secret was rejected and no approval path showed up
    SecretExpiredOrConsumed,
    /// Too many approval retries against the same bunker URL
    ApprovalRetriesExhausted,
    /// The completer rejected or failed the sign-in
    AuthenticationFailed,
    /// The completer gave up after its hard timeout
    AuthenticationTimedOut,
}

/// What the caller can offer the user from an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Recovery {
    /// Start over with `start_interactive_connection` or a bunker URL
    Restart,
    /// Obtain a brand-new bunker URL; the old one must not be retried
    NewBunkerUrl,
    /// `retry_from_error` can re-run only the sign-in step
    RetryAuthentication,
}

impl FailureKind {
    pub fn recovery(&self) -> Recovery {
        match self {
            FailureKind::SignerWaitFailed => Recovery::Restart,
            FailureKind::SecretExpiredOrConsumed | FailureKind::ApprovalRetriesExhausted => {
                Recovery::NewBunkerUrl
            }
            FailureKind::AuthenticationFailed | FailureKind::AuthenticationTimedOut => {
                Recovery::RetryAuthentication
            }
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::SignerWaitFailed => "SIGNER_WAIT_FAILED",
            FailureKind::SecretExpiredOrConsumed => "SECRET_EXPIRED_OR_CONSUMED",
            FailureKind::ApprovalRetriesExhausted => "APPROVAL_RETRIES_EXHAUSTED",
            FailureKind::AuthenticationFailed => "AUTHENTICATION_FAILED",
            FailureKind::AuthenticationTimedOut => "AUTHENTICATION_TIMED_OUT",
        }
    }
}

/// Error details recorded while the session is in the `error` stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: FailureKind,
    pub message: String,
    pub failed_stage: Stage,
}

impl ErrorInfo {
    pub fn new(kind: FailureKind, failed_stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            failed_stage,
        }
    }

    pub fn recovery(&self) -> Recovery {
        self.kind.recovery()
    }

    /// Whether the UI may offer a same-credential retry button.
    pub fn allows_same_credential_retry(&self) -> bool {
        self.recovery() != Recovery::NewBunkerUrl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_secret_requires_new_url() {
        let info = ErrorInfo::new(
            FailureKind::SecretExpiredOrConsumed,
            Stage::Connected,
            "secret rejected",
        );
        assert_eq!(info.recovery(), Recovery::NewBunkerUrl);
        assert!(!info.allows_same_credential_retry());
    }

    #[test]
    fn test_auth_failures_allow_retry() {
        for kind in [FailureKind::AuthenticationFailed, FailureKind::AuthenticationTimedOut] {
            let info = ErrorInfo::new(kind, Stage::Signing, "nope");
            assert_eq!(info.recovery(), Recovery::RetryAuthentication);
            assert!(info.allows_same_credential_retry());
        }
    }

    #[test]
    fn test_error_display_mentions_new_url() {
        let msg = ConnectError::SecretExpiredOrConsumed.to_string();
        assert!(msg.contains("new bunker URL"));
    }

    #[test]
    fn test_error_info_serializes_camel_case() {
        let info = ErrorInfo::new(FailureKind::SignerWaitFailed, Stage::WaitingForSigner, "x");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["failedStage"], "waitingForSigner");
        assert_eq!(json["kind"], "signerWaitFailed");
    }
}
