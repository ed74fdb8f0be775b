//! Signer connection service boundary.
//!
//! The service owns relay subscriptions, message signing and the NIP-46
//! handshake. The state machine only consumes what it reports back.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::PublicKey;

/// Invoked at most once per bunker connect call when the signer asks for
/// out-of-band approval. May fire before or after the call resolves.
pub type ApprovalUrlCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Errors reported by the signer connection service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    /// No signer attached in time
    #[error("timed out waiting for signer")]
    Timeout,

    /// Relay or transport failure
    #[error("relay error: {0}")]
    Relay(String),

    /// The signer answered with an error
    #[error("signer rejected the connection: {0}")]
    Rejected(String),

    /// The service was disconnected while the call was pending
    #[error("signer service disconnected")]
    Disconnected,
}

/// Result of a bunker connect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BunkerOutcome {
    /// Handshake finished; the signer serves this user key
    Connected(PublicKey),
    /// The signer wants the user to approve out of band first
    ApprovalRequired,
    /// The signer rejected the secret (expired, consumed, or not yet approved)
    SecretRejected(String),
    /// Anything else
    Failed(SignerError),
}

impl BunkerOutcome {
    /// Map a raw signer error string onto an outcome.
    ///
    /// Signers disagree on wording, so this matches on the fragments seen in
    /// the wild: `auth_url` / approval hints first, then secret rejections.
    pub fn classify_error(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("auth_url")
            || lower.contains("approval")
            || lower.contains("not yet approved")
            || lower.contains("pending")
        {
            return BunkerOutcome::ApprovalRequired;
        }
        if lower.contains("secret")
            && (lower.contains("invalid")
                || lower.contains("expired")
                || lower.contains("already used")
                || lower.contains("consumed")
                || lower.contains("new secret"))
        {
            return BunkerOutcome::SecretRejected(message.trim().to_string());
        }
        BunkerOutcome::Failed(SignerError::Rejected(message.trim().to_string()))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, BunkerOutcome::Connected(_))
    }
}

/// Trait implemented by the transport layer that talks to remote signers.
#[async_trait]
pub trait SignerConnectionService: Send + Sync {
    /// Wait for a signer to attach to an advertised connection URI.
    async fn wait_for_connection(&self, connection_uri: &str) -> Result<PublicKey, SignerError>;

    /// Connect using a signer-issued bunker URL.
    async fn connect_with_bunker_url(
        &self,
        bunker_url: &str,
        attempts: u32,
        force_new_secret: bool,
        on_approval_url: ApprovalUrlCallback,
    ) -> BunkerOutcome;

    /// Whether the transport to the signer is still up.
    fn is_connected(&self) -> bool;

    /// Drop relay subscriptions and abort pending calls.
    async fn disconnect(&self);
}
