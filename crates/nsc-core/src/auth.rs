//! Authentication completer boundary.
//!
//! After the handshake resolves a public key, the completer runs the
//! challenge/response sign-in and establishes the application session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AuthStage, PublicKey};

/// Progress sink handed to the completer.
pub type ProgressCallback = Arc<dyn Fn(AuthStage) + Send + Sync>;

/// Errors from the sign-in exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignInError {
    /// Hard timeout elapsed before the signer answered
    #[error("sign-in timed out after {0:?}")]
    Timeout(Duration),

    /// The signer refused to sign the challenge
    #[error("signature rejected: {0}")]
    Rejected(String),

    /// Server or session establishment failed
    #[error("sign-in failed: {0}")]
    Failed(String),
}

impl SignInError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SignInError::Timeout(_))
    }
}

/// Options for one sign-in run.
#[derive(Clone)]
pub struct SignInOptions {
    pub timeout: Duration,
    pub on_progress: ProgressCallback,
}

impl SignInOptions {
    pub fn report(&self, stage: AuthStage) {
        (self.on_progress)(stage);
    }
}

impl std::fmt::Debug for SignInOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignInOptions")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Trait for completing sign-in once a signer key is known.
///
/// Implementations must report at least `Signing`, and on success `Syncing`
/// then `Complete`, before returning.
#[async_trait]
pub trait AuthenticationCompleter: Send + Sync {
    async fn complete_sign_in(
        &self,
        public_key: PublicKey,
        options: SignInOptions,
    ) -> Result<(), SignInError>;
}
