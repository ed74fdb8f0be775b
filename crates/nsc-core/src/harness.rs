//! Scripted collaborators for tests and demos.
//!
//! [`ScriptedSigner`] and [`ScriptedCompleter`] replay queued behaviour and
//! record every call they receive, so connection flows can be driven end to
//! end without relays or a real signer app.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::auth::{AuthenticationCompleter, SignInError, SignInOptions};
use crate::signer::{ApprovalUrlCallback, BunkerOutcome, SignerConnectionService, SignerError};
use crate::types::{AuthStage, PublicKey};

/// Deterministic test key filled with `byte`.
pub fn test_key(byte: u8) -> PublicKey {
    PublicKey::from_bytes([byte; 32])
}

// ============================================================================
// Signer
// ============================================================================

/// Scripted reply to `wait_for_connection`.
#[derive(Clone, Debug)]
pub enum WaitScript {
    Resolve {
        after: Duration,
        result: Result<PublicKey, SignerError>,
    },
    /// Never resolves
    Hang,
}

impl WaitScript {
    pub fn connects(key: PublicKey, after: Duration) -> Self {
        WaitScript::Resolve {
            after,
            result: Ok(key),
        }
    }

    pub fn fails(error: SignerError, after: Duration) -> Self {
        WaitScript::Resolve {
            after,
            result: Err(error),
        }
    }
}

/// When the approval URL callback fires relative to the outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalTiming {
    BeforeOutcome,
    /// Fired from a detached task this long after the outcome
    AfterOutcome(Duration),
}

/// Scripted reply to `connect_with_bunker_url`.
#[derive(Clone, Debug)]
pub struct BunkerScript {
    pub delay: Duration,
    /// `None` never resolves
    pub outcome: Option<BunkerOutcome>,
    pub approval_url: Option<(String, ApprovalTiming)>,
}

impl BunkerScript {
    pub fn resolves(outcome: BunkerOutcome) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Some(outcome),
            approval_url: None,
        }
    }

    pub fn hangs() -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: None,
            approval_url: None,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_approval_url(mut self, url: impl Into<String>, timing: ApprovalTiming) -> Self {
        self.approval_url = Some((url.into(), timing));
        self
    }
}

/// Arguments of one recorded bunker connect call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BunkerCall {
    pub bunker_url: String,
    pub attempts: u32,
    pub force_new_secret: bool,
}

/// Signer connection service that replays scripts in call order.
#[derive(Debug, Default)]
pub struct ScriptedSigner {
    waits: Mutex<VecDeque<WaitScript>>,
    bunkers: Mutex<VecDeque<BunkerScript>>,
    wait_calls: Mutex<Vec<String>>,
    bunker_calls: Mutex<Vec<BunkerCall>>,
    disconnects: AtomicUsize,
    connected: AtomicBool,
}

impl ScriptedSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_wait(&self, script: WaitScript) -> &Self {
        self.waits.lock().push_back(script);
        self
    }

    pub fn push_bunker(&self, script: BunkerScript) -> &Self {
        self.bunkers.lock().push_back(script);
        self
    }

    pub fn wait_calls(&self) -> Vec<String> {
        self.wait_calls.lock().clone()
    }

    pub fn bunker_calls(&self) -> Vec<BunkerCall> {
        self.bunker_calls.lock().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Simulate the transport coming up or dropping.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignerConnectionService for ScriptedSigner {
    async fn wait_for_connection(&self, connection_uri: &str) -> Result<PublicKey, SignerError> {
        self.wait_calls.lock().push(connection_uri.to_string());
        let script = self.waits.lock().pop_front().unwrap_or(WaitScript::Hang);

        match script {
            WaitScript::Resolve { after, result } => {
                tokio::time::sleep(after).await;
                if result.is_ok() {
                    self.set_connected(true);
                }
                result
            }
            WaitScript::Hang => std::future::pending().await,
        }
    }

    async fn connect_with_bunker_url(
        &self,
        bunker_url: &str,
        attempts: u32,
        force_new_secret: bool,
        on_approval_url: ApprovalUrlCallback,
    ) -> BunkerOutcome {
        self.bunker_calls.lock().push(BunkerCall {
            bunker_url: bunker_url.to_string(),
            attempts,
            force_new_secret,
        });
        let script = self.bunkers.lock().pop_front().unwrap_or_else(|| {
            BunkerScript::resolves(BunkerOutcome::Failed(SignerError::Rejected(
                "no scripted outcome".into(),
            )))
        });

        if let Some((url, ApprovalTiming::BeforeOutcome)) = &script.approval_url {
            on_approval_url(url.clone());
        }

        tokio::time::sleep(script.delay).await;
        let Some(outcome) = script.outcome else {
            return std::future::pending().await;
        };

        if let Some((url, ApprovalTiming::AfterOutcome(delay))) = script.approval_url {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                on_approval_url(url);
            });
        }
        if outcome.is_connected() {
            self.set_connected(true);
        }
        outcome
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
    }
}

// ============================================================================
// Completer
// ============================================================================

/// Scripted sign-in behaviour.
#[derive(Clone, Debug)]
pub enum CompleterScript {
    Succeed,
    SucceedAfter(Duration),
    Fail(SignInError),
    /// Never returns; the caller's timeout has to end it
    Hang,
}

/// Authentication completer that replays scripts in call order and
/// succeeds once the queue is empty.
#[derive(Debug, Default)]
pub struct ScriptedCompleter {
    scripts: Mutex<VecDeque<CompleterScript>>,
    calls: Mutex<Vec<PublicKey>>,
}

impl ScriptedCompleter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: CompleterScript) -> &Self {
        self.scripts.lock().push_back(script);
        self
    }

    pub fn calls(&self) -> Vec<PublicKey> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AuthenticationCompleter for ScriptedCompleter {
    async fn complete_sign_in(
        &self,
        public_key: PublicKey,
        options: SignInOptions,
    ) -> Result<(), SignInError> {
        self.calls.lock().push(public_key);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or(CompleterScript::Succeed);

        options.report(AuthStage::Signing);
        match script {
            CompleterScript::Succeed => {}
            CompleterScript::SucceedAfter(delay) => tokio::time::sleep(delay).await,
            CompleterScript::Fail(e) => return Err(e),
            CompleterScript::Hang => std::future::pending::<()>().await,
        }
        options.report(AuthStage::Syncing);
        options.report(AuthStage::Complete);
        Ok(())
    }
}
