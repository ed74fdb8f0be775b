//! Connection state machine.
//!
//! [`SessionMachine`] is a pure transition function: caller entry points and
//! asynchronous [`Event`]s go in, a list of [`Effect`]s comes out. It never
//! awaits, spawns or sleeps; [`crate::controller::ConnectionController`]
//! executes the effects and feeds results back as events.
//!
//! Every asynchronous call is tagged with an [`OpId`] and every timer with an
//! epoch. Events carrying an id the session no longer expects are dropped,
//! which is what keeps late callbacks from a cancelled or superseded attempt
//! away from the session.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::auth::SignInError;
use crate::bunker::BunkerUrl;
use crate::config::ConnectTimings;
use crate::errors::{ConnectError, ErrorInfo, FailureKind, NEW_BUNKER_URL_GUIDANCE};
use crate::session::{ConnectionSession, SecretDisposition, SessionSnapshot};
use crate::signer::{BunkerOutcome, SignerError};
use crate::timers::{TimerKind, TimerToken};
use crate::types::{AuthStage, PublicKey, Stage};

/// Identifier of one asynchronous call issued by the machine.
pub type OpId = u64;

/// Bunker connects are never retried inside the service.
pub const BUNKER_CONNECT_ATTEMPTS: u32 = 1;

/// Results and signals delivered back to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SignerWaitResolved {
        op: OpId,
        result: Result<PublicKey, SignerError>,
    },
    BunkerOutcomeResolved {
        op: OpId,
        outcome: BunkerOutcome,
    },
    ApprovalUrlReceived {
        op: OpId,
        url: String,
    },
    AuthProgress {
        op: OpId,
        stage: AuthStage,
    },
    AuthResolved {
        op: OpId,
        result: Result<(), SignInError>,
    },
    TimerFired(TimerToken),
}

/// Work the machine asks its runtime to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    WaitForSigner {
        op: OpId,
        connection_uri: String,
    },
    ConnectBunker {
        op: OpId,
        bunker_url: String,
        attempts: u32,
        force_new_secret: bool,
    },
    CompleteSignIn {
        op: OpId,
        public_key: PublicKey,
        timeout: Duration,
    },
    ArmTimer {
        token: TimerToken,
        after: Duration,
    },
    DisarmTimer(TimerKind),
    /// Abort the outstanding service call, if any
    AbortCall,
    /// Ask the signer service to drop its transport
    Disconnect,
    Publish(ConnectUpdate),
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectUpdate {
    #[serde(rename_all = "camelCase")]
    StageChanged {
        stage: Stage,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    ApprovalUrl { url: String },
    SlowOperation { stage: Stage },
}

/// Owner of the [`ConnectionSession`] and its transition rules.
#[derive(Debug)]
pub struct SessionMachine {
    config: ConnectTimings,
    session: ConnectionSession,
    /// Bunker URLs whose secret was classified expired/consumed. Survives
    /// session resets so the same URL can never be retried.
    consumed_bunker_urls: HashSet<String>,
    armed: HashMap<TimerKind, u64>,
    next_op: OpId,
    next_epoch: u64,
}

impl SessionMachine {
    pub fn new(connection_uri: impl Into<String>, config: ConnectTimings) -> Self {
        Self {
            config,
            session: ConnectionSession::new(connection_uri),
            consumed_bunker_urls: HashSet::new(),
            armed: HashMap::new(),
            next_op: 1,
            next_epoch: 1,
        }
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn stage(&self) -> Stage {
        self.session.stage
    }

    pub fn config(&self) -> &ConnectTimings {
        &self.config
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn is_consumed(&self, bunker_url: &str) -> bool {
        self.consumed_bunker_urls.contains(bunker_url.trim())
    }

    pub fn armed_timers(&self) -> Vec<TimerKind> {
        let mut kinds: Vec<TimerKind> = self.armed.keys().copied().collect();
        kinds.sort_by_key(|k| *k as u8);
        kinds
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// `idle -> waitingForSigner`, waiting on the advertised connection URI.
    pub fn start_interactive(&mut self) -> Result<Vec<Effect>, ConnectError> {
        if self.session.stage != Stage::Idle {
            return Err(ConnectError::InvalidState(format!(
                "can only start an interactive connection from idle, not {}",
                self.session.stage
            )));
        }

        let mut fx = Vec::new();
        self.enter(Stage::WaitingForSigner, &mut fx);
        self.arm_signer_timers(&mut fx);

        let op = self.issue_op();
        info!(op, "waiting for signer on connection URI");
        fx.push(Effect::WaitForSigner {
            op,
            connection_uri: self.session.connection_uri.clone(),
        });
        Ok(fx)
    }

    /// `idle/error -> waitingForSigner` via a bunker URL.
    pub fn submit_bunker_url(&mut self, raw: &str) -> Result<Vec<Effect>, ConnectError> {
        let url = BunkerUrl::new(raw)?;

        match self.session.stage {
            Stage::Idle | Stage::Error => {}
            other => {
                return Err(ConnectError::InvalidState(format!(
                    "can only submit a bunker URL from idle or error, not {other}"
                )));
            }
        }

        if self.consumed_bunker_urls.contains(url.as_str()) {
            warn!(bunker_url = %url.redacted(), "refusing bunker URL with a consumed secret");
            return Err(ConnectError::SecretExpiredOrConsumed);
        }

        let mut fx = Vec::new();
        if self.session.stage == Stage::Error {
            self.session = ConnectionSession::new(self.session.connection_uri.clone());
        }
        info!(bunker_url = %url.redacted(), "connecting with bunker URL");
        self.session.bunker_url = Some(url);

        self.enter(Stage::WaitingForSigner, &mut fx);
        self.arm_signer_timers(&mut fx);
        self.issue_bunker_connect(&mut fx)?;
        Ok(fx)
    }

    /// Re-issue the same bunker URL after the user approved out of band.
    pub fn retry_after_approval(&mut self) -> Result<Vec<Effect>, ConnectError> {
        if self.session.stage != Stage::AwaitingApproval {
            return Err(ConnectError::InvalidState(format!(
                "can only retry after approval from awaitingApproval, not {}",
                self.session.stage
            )));
        }
        if !self.session.secret_disposition.is_reusable() {
            return Err(ConnectError::SecretExpiredOrConsumed);
        }
        // Only an approval URL may overturn a rejection inside the grace window.
        if self.session.pending_rejection.is_some() {
            return Err(ConnectError::InvalidState(
                "the signer rejected the secret; waiting for a late approval URL".into(),
            ));
        }

        let mut fx = Vec::new();
        if self.session.attempt_count >= self.config.max_approval_retries {
            warn!(
                attempts = self.session.attempt_count,
                "approval retries exhausted for bunker URL"
            );
            self.expire_secret(
                FailureKind::ApprovalRetriesExhausted,
                "The signer did not confirm the approval after repeated retries",
                &mut fx,
            );
            return Ok(fx);
        }

        self.session.attempt_count += 1;
        debug!(attempt = self.session.attempt_count, "retrying bunker connect after approval");
        self.issue_bunker_connect(&mut fx)?;
        Ok(fx)
    }

    /// Recover from `error`. `transport_connected` is the signer service's
    /// answer to `is_connected()`.
    pub fn retry_from_error(&mut self, transport_connected: bool) -> Result<Vec<Effect>, ConnectError> {
        if self.session.stage != Stage::Error {
            return Err(ConnectError::InvalidState(format!(
                "can only retry from error, not {}",
                self.session.stage
            )));
        }

        let mut fx = Vec::new();
        match self.session.resolved_public_key {
            Some(public_key) if transport_connected => {
                info!(pubkey = %public_key.short(), "retrying sign-in on live signer connection");
                self.session.error_info = None;
                self.enter(Stage::Signing, &mut fx);
                self.begin_auth_episode(&mut fx);
                self.issue_sign_in(public_key, &mut fx);
            }
            _ => {
                info!(transport_connected, "signer connection gone; full restart required");
                if transport_connected {
                    fx.push(Effect::Disconnect);
                }
                self.reset(&mut fx);
            }
        }
        Ok(fx)
    }

    /// Tear everything down and return to `idle`. Always succeeds.
    pub fn cancel(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.session.stage == Stage::Idle && self.session.current_op.is_none() {
            return fx;
        }
        info!(stage = %self.session.stage, "connection cancelled by user");
        fx.push(Effect::AbortCall);
        fx.push(Effect::Disconnect);
        self.reset(&mut fx);
        fx
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Apply one asynchronous event.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            Event::SignerWaitResolved { op, result } => {
                if !self.expects(op) || self.session.stage != Stage::WaitingForSigner {
                    debug!(op, stage = %self.session.stage, "dropping stale signer wait result");
                    return fx;
                }
                match result {
                    Ok(public_key) => self.on_signer_connected(public_key, &mut fx),
                    Err(e) => self.fail(
                        FailureKind::SignerWaitFailed,
                        Stage::WaitingForSigner,
                        format!("Could not connect to signer: {e}"),
                        &mut fx,
                    ),
                }
            }
            Event::BunkerOutcomeResolved { op, outcome } => {
                if !self.expects(op)
                    || !matches!(
                        self.session.stage,
                        Stage::WaitingForSigner | Stage::AwaitingApproval
                    )
                {
                    debug!(op, stage = %self.session.stage, "dropping stale bunker outcome");
                    return fx;
                }
                self.on_bunker_outcome(op, outcome, &mut fx);
            }
            Event::ApprovalUrlReceived { op, url } => {
                if !self.expects(op)
                    || !matches!(
                        self.session.stage,
                        Stage::WaitingForSigner | Stage::AwaitingApproval
                    )
                {
                    debug!(op, stage = %self.session.stage, "dropping stale approval URL");
                    return fx;
                }
                self.on_approval_url(op, url, &mut fx);
            }
            Event::AuthProgress { op, stage } => {
                if !self.expects(op) || !self.session.stage.is_authenticating() {
                    debug!(op, ?stage, "dropping stale auth progress");
                    return fx;
                }
                let reported = Stage::from(stage);
                if reported != self.session.stage {
                    self.enter(reported, &mut fx);
                }
            }
            Event::AuthResolved { op, result } => {
                if !self.expects(op) {
                    debug!(op, "dropping stale auth result");
                    return fx;
                }
                self.on_auth_resolved(result, &mut fx);
            }
            Event::TimerFired(token) => {
                if !self.take_timer(token) {
                    debug!(kind = ?token.kind, epoch = token.epoch, "dropping stale timer");
                    return fx;
                }
                self.on_timer(token.kind, &mut fx);
            }
        }
        fx
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn on_bunker_outcome(&mut self, op: OpId, outcome: BunkerOutcome, fx: &mut Vec<Effect>) {
        match outcome {
            BunkerOutcome::Connected(public_key) => {
                self.session.pending_rejection = None;
                if self.session.secret_disposition == SecretDisposition::PendingApproval {
                    self.session.advance_disposition(SecretDisposition::Resumed);
                }
                self.on_signer_connected(public_key, fx);
            }
            BunkerOutcome::ApprovalRequired => {
                self.session.pending_rejection = None;
                self.disarm(TimerKind::GraceWindow, fx);
                self.session.advance_disposition(SecretDisposition::PendingApproval);
                self.enter(Stage::AwaitingApproval, fx);
            }
            BunkerOutcome::SecretRejected(reason) => {
                if self.session.approval_url_op == Some(op) {
                    // The approval URL for this very call already arrived.
                    info!("secret rejected but approval URL already received; awaiting approval");
                    self.session.advance_disposition(SecretDisposition::PendingApproval);
                    self.enter(Stage::AwaitingApproval, fx);
                } else {
                    info!(
                        grace_ms = self.config.grace_window_ms,
                        "secret rejected; waiting out grace window for an approval URL"
                    );
                    // The call has resolved; only the grace window decides now.
                    self.disarm(TimerKind::SignerTimeout, fx);
                    self.session.pending_rejection = Some(reason);
                    self.arm(TimerKind::GraceWindow, self.config.grace_window(), fx);
                }
            }
            BunkerOutcome::Failed(e) => {
                if self.session.attempt_count > 0 {
                    self.expire_secret(
                        FailureKind::SecretExpiredOrConsumed,
                        &format!("Retry after approval failed: {e}"),
                        fx,
                    );
                } else {
                    self.fail(
                        FailureKind::SignerWaitFailed,
                        Stage::WaitingForSigner,
                        format!("Could not connect to signer: {e}"),
                        fx,
                    );
                }
            }
        }
    }

    fn on_approval_url(&mut self, op: OpId, url: String, fx: &mut Vec<Effect>) {
        info!(op, "signer requested out-of-band approval");
        if self.session.pending_rejection.take().is_some() {
            info!("approval URL arrived within grace window; secret stays reusable");
            self.disarm(TimerKind::GraceWindow, fx);
        }
        self.session.approval_url = Some(url.clone());
        self.session.approval_url_op = Some(op);
        self.session.advance_disposition(SecretDisposition::PendingApproval);
        fx.push(Effect::Publish(ConnectUpdate::ApprovalUrl { url }));
        self.enter(Stage::AwaitingApproval, fx);
    }

    fn on_signer_connected(&mut self, public_key: PublicKey, fx: &mut Vec<Effect>) {
        self.session.resolve_public_key(public_key);
        self.session.current_op = None;
        info!(pubkey = %public_key.short(), "signer connected");

        self.enter(Stage::Connected, fx);
        self.begin_auth_episode(fx);
        self.arm(TimerKind::Settle, self.config.settle_delay(), fx);
    }

    fn on_auth_resolved(&mut self, result: Result<(), SignInError>, fx: &mut Vec<Effect>) {
        self.session.current_op = None;
        match result {
            Ok(()) => {
                if self.session.stage != Stage::Complete {
                    self.enter(Stage::Complete, fx);
                }
                info!("sign-in complete");
            }
            Err(e) if self.session.stage.is_authenticating() => {
                let kind = if e.is_timeout() {
                    FailureKind::AuthenticationTimedOut
                } else {
                    FailureKind::AuthenticationFailed
                };
                self.fail(kind, Stage::Signing, format!("Sign-in failed: {e}"), fx);
            }
            Err(e) => {
                warn!(stage = %self.session.stage, error = %e, "ignoring sign-in failure after completion");
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind, fx: &mut Vec<Effect>) {
        match kind {
            TimerKind::SignerSlow | TimerKind::AuthSlow => {
                if !self.session.slow_warning_sent {
                    self.session.slow_warning_sent = true;
                    warn!(stage = %self.session.stage, "connection is taking longer than expected");
                    fx.push(Effect::Publish(ConnectUpdate::SlowOperation {
                        stage: self.session.stage,
                    }));
                }
            }
            TimerKind::SignerTimeout => {
                fx.push(Effect::AbortCall);
                self.fail(
                    FailureKind::SignerWaitFailed,
                    Stage::WaitingForSigner,
                    format!(
                        "Timed out after {}s waiting for the signer",
                        self.config.signer_wait_timeout().as_secs()
                    ),
                    fx,
                );
            }
            TimerKind::GraceWindow => {
                if let Some(reason) = self.session.pending_rejection.take() {
                    self.expire_secret(
                        FailureKind::SecretExpiredOrConsumed,
                        &format!("The signer rejected the bunker secret ({reason})"),
                        fx,
                    );
                }
            }
            TimerKind::Settle => {
                if self.session.stage != Stage::Connected {
                    return;
                }
                let Some(public_key) = self.session.resolved_public_key else {
                    return;
                };
                self.enter(Stage::Signing, fx);
                self.issue_sign_in(public_key, fx);
            }
        }
    }

    /// Mark the bunker secret unusable and fail with new-URL guidance.
    fn expire_secret(&mut self, kind: FailureKind, detail: &str, fx: &mut Vec<Effect>) {
        self.session.advance_disposition(SecretDisposition::ExpiredOrConsumed);
        self.session.approval_url = None;
        self.session.approval_url_op = None;
        if let Some(url) = &self.session.bunker_url {
            warn!(bunker_url = %url.redacted(), "bunker secret expired or consumed");
            self.consumed_bunker_urls.insert(url.as_str().to_string());
        }
        self.fail(
            kind,
            Stage::Connected,
            format!("{detail}. {NEW_BUNKER_URL_GUIDANCE}."),
            fx,
        );
    }

    fn fail(&mut self, kind: FailureKind, failed_stage: Stage, message: String, fx: &mut Vec<Effect>) {
        warn!(kind = kind.code(), %failed_stage, %message, "connection failed");
        self.session.current_op = None;
        self.session.pending_rejection = None;
        self.session.error_info = Some(ErrorInfo::new(kind, failed_stage, message));
        self.enter(Stage::Error, fx);
    }

    fn reset(&mut self, fx: &mut Vec<Effect>) {
        let previous = self.session.stage;
        for kind in self.armed_timers() {
            self.disarm(kind, fx);
        }
        self.session = ConnectionSession::new(self.session.connection_uri.clone());
        if previous != Stage::Idle {
            info!(from = %previous, "session reset");
            fx.push(Effect::Publish(ConnectUpdate::StageChanged {
                stage: Stage::Idle,
                error: None,
            }));
        }
    }

    /// Change stage, releasing every timer that does not survive it.
    fn enter(&mut self, stage: Stage, fx: &mut Vec<Effect>) {
        let from = self.session.stage;
        if from == stage {
            return;
        }
        self.session.stage = stage;
        if stage != Stage::Error {
            self.session.error_info = None;
        }
        for kind in self.armed_timers() {
            if !kind.survives(stage) {
                self.disarm(kind, fx);
            }
        }
        info!(%from, to = %stage, "connection stage changed");
        fx.push(Effect::Publish(ConnectUpdate::StageChanged {
            stage,
            error: self.session.error_info.clone(),
        }));
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn issue_op(&mut self) -> OpId {
        let op = self.next_op;
        self.next_op += 1;
        self.session.current_op = Some(op);
        op
    }

    fn expects(&self, op: OpId) -> bool {
        self.session.current_op == Some(op)
    }

    fn issue_bunker_connect(&mut self, fx: &mut Vec<Effect>) -> Result<(), ConnectError> {
        let url = self
            .session
            .bunker_url
            .clone()
            .ok_or_else(|| ConnectError::InvalidState("no bunker URL in session".into()))?;
        if !self.session.secret_disposition.is_reusable()
            || self.consumed_bunker_urls.contains(url.as_str())
        {
            return Err(ConnectError::SecretExpiredOrConsumed);
        }
        let op = self.issue_op();
        fx.push(Effect::ConnectBunker {
            op,
            bunker_url: url.as_str().to_string(),
            attempts: BUNKER_CONNECT_ATTEMPTS,
            force_new_secret: false,
        });
        Ok(())
    }

    fn issue_sign_in(&mut self, public_key: PublicKey, fx: &mut Vec<Effect>) {
        let op = self.issue_op();
        fx.push(Effect::CompleteSignIn {
            op,
            public_key,
            timeout: self.config.auth_timeout(),
        });
    }

    fn arm_signer_timers(&mut self, fx: &mut Vec<Effect>) {
        self.session.slow_warning_sent = false;
        self.arm(TimerKind::SignerSlow, self.config.slow_warning(), fx);
        self.arm(TimerKind::SignerTimeout, self.config.signer_wait_timeout(), fx);
    }

    fn begin_auth_episode(&mut self, fx: &mut Vec<Effect>) {
        self.session.slow_warning_sent = false;
        self.arm(TimerKind::AuthSlow, self.config.slow_warning(), fx);
    }

    fn arm(&mut self, kind: TimerKind, after: Duration, fx: &mut Vec<Effect>) {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.armed.insert(kind, epoch);
        fx.push(Effect::ArmTimer {
            token: TimerToken { kind, epoch },
            after,
        });
    }

    fn disarm(&mut self, kind: TimerKind, fx: &mut Vec<Effect>) {
        if self.armed.remove(&kind).is_some() {
            fx.push(Effect::DisarmTimer(kind));
        }
    }

    fn take_timer(&mut self, token: TimerToken) -> bool {
        if self.armed.get(&token.kind) == Some(&token.epoch) {
            self.armed.remove(&token.kind);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "nostrconnect://client?relay=wss%3A%2F%2Fr.example&secret=abc";

    fn key(b: u8) -> PublicKey {
        PublicKey::from_bytes([b; 32])
    }

    fn machine() -> SessionMachine {
        SessionMachine::new(URI, ConnectTimings::default())
    }

    fn stages(fx: &[Effect]) -> Vec<Stage> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Publish(ConnectUpdate::StageChanged { stage, .. }) => Some(*stage),
                _ => None,
            })
            .collect()
    }

    fn bunker_op(fx: &[Effect]) -> OpId {
        fx.iter()
            .find_map(|e| match e {
                Effect::ConnectBunker { op, .. } => Some(*op),
                _ => None,
            })
            .expect("bunker connect effect")
    }

    fn sign_in_op(fx: &[Effect]) -> OpId {
        fx.iter()
            .find_map(|e| match e {
                Effect::CompleteSignIn { op, .. } => Some(*op),
                _ => None,
            })
            .expect("sign-in effect")
    }

    fn token(fx: &[Effect], kind: TimerKind) -> TimerToken {
        fx.iter()
            .find_map(|e| match e {
                Effect::ArmTimer { token, .. } if token.kind == kind => Some(*token),
                _ => None,
            })
            .unwrap_or_else(|| panic!("{kind:?} not armed"))
    }

    fn bunker_calls(fx: &[Effect]) -> usize {
        fx.iter()
            .filter(|e| matches!(e, Effect::ConnectBunker { .. }))
            .count()
    }

    #[test]
    fn test_initial_state() {
        let m = machine();
        assert_eq!(m.stage(), Stage::Idle);
        assert_eq!(m.session().connection_uri(), URI);
        assert!(m.session().resolved_public_key().is_none());
        assert!(m.armed_timers().is_empty());
    }

    #[test]
    fn test_start_interactive_issues_wait_and_timers() {
        let mut m = machine();
        let fx = m.start_interactive().unwrap();
        assert_eq!(stages(&fx), vec![Stage::WaitingForSigner]);
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::WaitForSigner { connection_uri, .. } if connection_uri == URI
        )));
        assert_eq!(m.armed_timers(), vec![TimerKind::SignerSlow, TimerKind::SignerTimeout]);
    }

    #[test]
    fn test_start_interactive_requires_idle() {
        let mut m = machine();
        m.start_interactive().unwrap();
        assert!(matches!(m.start_interactive(), Err(ConnectError::InvalidState(_))));
    }

    #[test]
    fn test_interactive_success_runs_to_complete() {
        let mut m = machine();
        let fx = m.start_interactive().unwrap();
        let op = fx
            .iter()
            .find_map(|e| match e {
                Effect::WaitForSigner { op, .. } => Some(*op),
                _ => None,
            })
            .unwrap();

        let fx = m.handle(Event::SignerWaitResolved { op, result: Ok(key(1)) });
        assert_eq!(stages(&fx), vec![Stage::Connected]);
        assert!(fx.contains(&Effect::DisarmTimer(TimerKind::SignerTimeout)));
        let settle = token(&fx, TimerKind::Settle);

        let fx = m.handle(Event::TimerFired(settle));
        assert_eq!(stages(&fx), vec![Stage::Signing]);
        let op = sign_in_op(&fx);

        let fx = m.handle(Event::AuthProgress { op, stage: AuthStage::Signing });
        assert!(stages(&fx).is_empty());
        let fx = m.handle(Event::AuthProgress { op, stage: AuthStage::Syncing });
        assert_eq!(stages(&fx), vec![Stage::Syncing]);
        let fx = m.handle(Event::AuthProgress { op, stage: AuthStage::Complete });
        assert_eq!(stages(&fx), vec![Stage::Complete]);
        assert!(fx.contains(&Effect::DisarmTimer(TimerKind::AuthSlow)));
        let fx = m.handle(Event::AuthResolved { op, result: Ok(()) });
        assert!(fx.is_empty());

        assert_eq!(m.stage(), Stage::Complete);
        assert_eq!(m.session().resolved_public_key(), Some(key(1)));
        assert!(m.armed_timers().is_empty());
    }

    #[test]
    fn test_interactive_failure_records_waiting_stage() {
        let mut m = machine();
        m.start_interactive().unwrap();
        let op = m.session().current_op.unwrap();
        let fx = m.handle(Event::SignerWaitResolved {
            op,
            result: Err(SignerError::Relay("closed".into())),
        });
        assert_eq!(stages(&fx), vec![Stage::Error]);
        let info = m.session().error_info().unwrap();
        assert_eq!(info.kind, FailureKind::SignerWaitFailed);
        assert_eq!(info.failed_stage, Stage::WaitingForSigner);
        assert!(m.armed_timers().is_empty());
    }

    #[test]
    fn test_interactive_timeout_warns_once_then_fails() {
        let mut m = machine();
        let fx = m.start_interactive().unwrap();
        let slow = token(&fx, TimerKind::SignerSlow);
        let hard = token(&fx, TimerKind::SignerTimeout);

        let fx = m.handle(Event::TimerFired(slow));
        assert_eq!(
            fx,
            vec![Effect::Publish(ConnectUpdate::SlowOperation {
                stage: Stage::WaitingForSigner
            })]
        );
        // A duplicate delivery of the same token is stale.
        assert!(m.handle(Event::TimerFired(slow)).is_empty());

        let fx = m.handle(Event::TimerFired(hard));
        assert!(fx.contains(&Effect::AbortCall));
        assert_eq!(stages(&fx), vec![Stage::Error]);
        assert_eq!(
            m.session().error_info().unwrap().failed_stage,
            Stage::WaitingForSigner
        );
    }

    #[test]
    fn test_submit_bunker_url_rejects_empty() {
        let mut m = machine();
        assert_eq!(m.submit_bunker_url("  "), Err(ConnectError::EmptyBunkerUrl));
        assert_eq!(m.stage(), Stage::Idle);
    }

    #[test]
    fn test_submit_bunker_url_issues_single_attempt() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://valid-unused-secret").unwrap();
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::ConnectBunker { bunker_url, attempts: 1, force_new_secret: false, .. }
                if bunker_url == "bunker://valid-unused-secret"
        )));
        assert_eq!(stages(&fx), vec![Stage::WaitingForSigner]);
    }

    #[test]
    fn test_approval_required_moves_to_awaiting_approval() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://needs-approval").unwrap();
        let op = bunker_op(&fx);

        let fx = m.handle(Event::ApprovalUrlReceived {
            op,
            url: "https://approve.example/x".into(),
        });
        assert!(fx.contains(&Effect::Publish(ConnectUpdate::ApprovalUrl {
            url: "https://approve.example/x".into()
        })));
        assert_eq!(stages(&fx), vec![Stage::AwaitingApproval]);

        let fx = m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::ApprovalRequired,
        });
        assert!(stages(&fx).is_empty());
        assert_eq!(m.stage(), Stage::AwaitingApproval);
        assert_eq!(m.session().approval_url(), Some("https://approve.example/x"));
        assert_eq!(
            m.session().secret_disposition(),
            SecretDisposition::PendingApproval
        );
    }

    #[test]
    fn test_rejection_then_late_approval_url_wins() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://racy").unwrap();
        let op = bunker_op(&fx);

        let fx = m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::SecretRejected("invalid secret".into()),
        });
        let grace = token(&fx, TimerKind::GraceWindow);
        assert_eq!(m.stage(), Stage::WaitingForSigner);
        assert!(m.session().has_pending_rejection());

        let fx = m.handle(Event::ApprovalUrlReceived {
            op,
            url: "https://approve.example/late".into(),
        });
        assert!(fx.contains(&Effect::DisarmTimer(TimerKind::GraceWindow)));
        assert_eq!(m.stage(), Stage::AwaitingApproval);

        // The grace timer may still be delivered if it raced the disarm.
        assert!(m.handle(Event::TimerFired(grace)).is_empty());
        assert_eq!(m.stage(), Stage::AwaitingApproval);
        assert!(!m.is_consumed("bunker://racy"));
    }

    #[test]
    fn test_approval_url_before_rejection_wins() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://racy").unwrap();
        let op = bunker_op(&fx);

        m.handle(Event::ApprovalUrlReceived {
            op,
            url: "https://approve.example/early".into(),
        });
        let fx = m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::SecretRejected("invalid secret".into()),
        });
        assert!(!fx.iter().any(|e| matches!(e, Effect::ArmTimer { .. })));
        assert_eq!(m.stage(), Stage::AwaitingApproval);
    }

    #[test]
    fn test_rejection_without_approval_expires_secret() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://expired-secret").unwrap();
        let op = bunker_op(&fx);

        let fx = m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::SecretRejected("invalid secret".into()),
        });
        let grace = token(&fx, TimerKind::GraceWindow);
        let fx = m.handle(Event::TimerFired(grace));
        assert_eq!(stages(&fx), vec![Stage::Error]);

        let info = m.session().error_info().unwrap();
        assert_eq!(info.kind, FailureKind::SecretExpiredOrConsumed);
        assert_eq!(info.failed_stage, Stage::Connected);
        assert!(info.message.contains("new bunker URL"));
        assert_eq!(
            m.session().secret_disposition(),
            SecretDisposition::ExpiredOrConsumed
        );

        // An approval URL after the window closed is ignored.
        assert!(m
            .handle(Event::ApprovalUrlReceived { op, url: "https://late".into() })
            .is_empty());

        // Resubmitting the same URL is refused without a service call.
        assert_eq!(
            m.submit_bunker_url("bunker://expired-secret"),
            Err(ConnectError::SecretExpiredOrConsumed)
        );
        assert_eq!(m.stage(), Stage::Error);

        // A different URL starts a fresh session.
        let fx = m.submit_bunker_url("bunker://fresh").unwrap();
        assert_eq!(bunker_calls(&fx), 1);
        assert_eq!(m.session().secret_disposition(), SecretDisposition::Unknown);
    }

    #[test]
    fn test_retry_after_approval_is_idempotent_while_pending() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://needs-approval").unwrap();
        let op = bunker_op(&fx);
        m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::ApprovalRequired,
        });

        for attempt in 1..=2 {
            let fx = m.retry_after_approval().unwrap();
            assert_eq!(bunker_calls(&fx), 1);
            assert!(stages(&fx).is_empty());
            let op = bunker_op(&fx);
            let fx = m.handle(Event::BunkerOutcomeResolved {
                op,
                outcome: BunkerOutcome::ApprovalRequired,
            });
            assert!(fx.is_empty());
            assert_eq!(m.stage(), Stage::AwaitingApproval);
            assert_eq!(m.session().attempt_count(), attempt);
        }
    }

    #[test]
    fn test_retry_after_approval_success_resumes() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://needs-approval").unwrap();
        let op = bunker_op(&fx);
        m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::ApprovalRequired,
        });

        let fx = m.retry_after_approval().unwrap();
        let op = bunker_op(&fx);
        let fx = m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::Connected(key(9)),
        });
        assert_eq!(stages(&fx), vec![Stage::Connected]);
        assert_eq!(m.session().secret_disposition(), SecretDisposition::Resumed);
        assert_eq!(m.session().resolved_public_key(), Some(key(9)));
    }

    #[test]
    fn test_retry_after_approval_failure_demands_new_url() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://needs-approval").unwrap();
        let op = bunker_op(&fx);
        m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::ApprovalRequired,
        });

        let fx = m.retry_after_approval().unwrap();
        let op = bunker_op(&fx);
        m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::Failed(SignerError::Rejected("denied".into())),
        });
        assert_eq!(m.stage(), Stage::Error);
        let info = m.session().error_info().unwrap();
        assert!(!info.allows_same_credential_retry());
        assert!(m.session().approval_url().is_none());
        assert!(m.is_consumed("bunker://needs-approval"));
    }

    #[test]
    fn test_retry_rejected_during_grace_window() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://needs-approval").unwrap();
        let op = bunker_op(&fx);
        m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::ApprovalRequired,
        });

        let fx = m.retry_after_approval().unwrap();
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::ConnectBunker { attempts: 1, force_new_secret: false, .. }
        )));
        let op = bunker_op(&fx);
        let fx = m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::SecretRejected("invalid secret".into()),
        });
        let grace = token(&fx, TimerKind::GraceWindow);
        assert_eq!(m.stage(), Stage::AwaitingApproval);
        assert!(m.session().has_pending_rejection());

        // A second retry may not resend the rejected secret or drop the window.
        assert!(matches!(
            m.retry_after_approval(),
            Err(ConnectError::InvalidState(_))
        ));
        assert!(m.session().has_pending_rejection());
        assert!(m.armed_timers().contains(&TimerKind::GraceWindow));
        assert_eq!(m.session().attempt_count(), 1);

        let fx = m.handle(Event::TimerFired(grace));
        assert_eq!(stages(&fx), vec![Stage::Error]);
        let info = m.session().error_info().unwrap();
        assert_eq!(info.kind, FailureKind::SecretExpiredOrConsumed);
        assert!(info.message.contains("new bunker URL"));
        assert!(m.is_consumed("bunker://needs-approval"));
    }

    #[test]
    fn test_signer_timeout_cannot_preempt_grace_window() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://expired-secret").unwrap();
        let timeout = token(&fx, TimerKind::SignerTimeout);
        let op = bunker_op(&fx);

        let fx = m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::SecretRejected("invalid secret".into()),
        });
        assert!(fx.contains(&Effect::DisarmTimer(TimerKind::SignerTimeout)));
        let grace = token(&fx, TimerKind::GraceWindow);

        // A timeout that raced the disarm is stale.
        assert!(m.handle(Event::TimerFired(timeout)).is_empty());
        assert_eq!(m.stage(), Stage::WaitingForSigner);
        assert!(m.session().has_pending_rejection());

        m.handle(Event::TimerFired(grace));
        let info = m.session().error_info().unwrap();
        assert_eq!(info.kind, FailureKind::SecretExpiredOrConsumed);
        assert_eq!(info.failed_stage, Stage::Connected);
        assert_eq!(
            m.session().secret_disposition(),
            SecretDisposition::ExpiredOrConsumed
        );
        assert_eq!(
            m.submit_bunker_url("bunker://expired-secret"),
            Err(ConnectError::SecretExpiredOrConsumed)
        );
    }

    #[test]
    fn test_retry_after_approval_is_bounded() {
        let config = ConnectTimings {
            max_approval_retries: 1,
            ..Default::default()
        };
        let mut m = SessionMachine::new(URI, config);
        let fx = m.submit_bunker_url("bunker://needs-approval").unwrap();
        let op = bunker_op(&fx);
        m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::ApprovalRequired,
        });

        let fx = m.retry_after_approval().unwrap();
        let op = bunker_op(&fx);
        m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::ApprovalRequired,
        });

        let fx = m.retry_after_approval().unwrap();
        assert_eq!(bunker_calls(&fx), 0);
        assert_eq!(m.stage(), Stage::Error);
        assert_eq!(
            m.session().error_info().unwrap().kind,
            FailureKind::ApprovalRetriesExhausted
        );
    }

    #[test]
    fn test_retry_after_approval_requires_stage() {
        let mut m = machine();
        assert!(matches!(
            m.retry_after_approval(),
            Err(ConnectError::InvalidState(_))
        ));
    }

    #[test]
    fn test_auth_failure_then_cheap_retry() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://ok").unwrap();
        let op = bunker_op(&fx);
        let fx = m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::Connected(key(3)),
        });
        let fx = m.handle(Event::TimerFired(token(&fx, TimerKind::Settle)));
        let op = sign_in_op(&fx);
        let fx = m.handle(Event::AuthResolved {
            op,
            result: Err(SignInError::Timeout(Duration::from_secs(30))),
        });
        assert!(fx.contains(&Effect::DisarmTimer(TimerKind::AuthSlow)));
        let info = m.session().error_info().unwrap().clone();
        assert_eq!(info.kind, FailureKind::AuthenticationTimedOut);
        assert_eq!(info.failed_stage, Stage::Signing);

        let fx = m.retry_from_error(true).unwrap();
        assert_eq!(stages(&fx), vec![Stage::Signing]);
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::CompleteSignIn { public_key, .. } if *public_key == key(3)
        )));
        assert!(m.session().error_info().is_none());
        assert_eq!(m.session().resolved_public_key(), Some(key(3)));
    }

    #[test]
    fn test_retry_from_error_without_transport_resets() {
        let mut m = machine();
        m.start_interactive().unwrap();
        let op = m.session().current_op.unwrap();
        m.handle(Event::SignerWaitResolved {
            op,
            result: Err(SignerError::Timeout),
        });

        let fx = m.retry_from_error(false).unwrap();
        assert_eq!(stages(&fx), vec![Stage::Idle]);
        assert!(!fx.contains(&Effect::Disconnect));
        assert_eq!(m.stage(), Stage::Idle);
        assert!(m.session().error_info().is_none());
    }

    #[test]
    fn test_cancel_ignores_late_callbacks() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://slow").unwrap();
        let op = bunker_op(&fx);

        let fx = m.cancel();
        assert!(fx.contains(&Effect::AbortCall));
        assert!(fx.contains(&Effect::Disconnect));
        assert!(fx.contains(&Effect::DisarmTimer(TimerKind::SignerTimeout)));
        assert_eq!(stages(&fx), vec![Stage::Idle]);

        let before = m.snapshot();
        assert!(m
            .handle(Event::BunkerOutcomeResolved {
                op,
                outcome: BunkerOutcome::Connected(key(4)),
            })
            .is_empty());
        assert!(m
            .handle(Event::ApprovalUrlReceived { op, url: "https://x".into() })
            .is_empty());
        assert_eq!(m.snapshot(), before);
        assert!(m.armed_timers().is_empty());
    }

    #[test]
    fn test_cancel_from_idle_is_noop() {
        let mut m = machine();
        assert!(m.cancel().is_empty());
    }

    #[test]
    fn test_stale_auth_progress_after_cancel() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://ok").unwrap();
        let op = bunker_op(&fx);
        let fx = m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::Connected(key(5)),
        });
        let fx = m.handle(Event::TimerFired(token(&fx, TimerKind::Settle)));
        let op = sign_in_op(&fx);

        m.cancel();
        assert!(m
            .handle(Event::AuthProgress { op, stage: AuthStage::Syncing })
            .is_empty());
        assert!(m.handle(Event::AuthResolved { op, result: Ok(()) }).is_empty());
        assert_eq!(m.stage(), Stage::Idle);
        assert!(m.session().resolved_public_key().is_none());
    }

    #[test]
    fn test_auth_slow_warning_fires_once_per_episode() {
        let mut m = machine();
        let fx = m.submit_bunker_url("bunker://ok").unwrap();
        let op = bunker_op(&fx);
        let fx = m.handle(Event::BunkerOutcomeResolved {
            op,
            outcome: BunkerOutcome::Connected(key(6)),
        });
        let slow = token(&fx, TimerKind::AuthSlow);
        let settle = token(&fx, TimerKind::Settle);

        // Survives connected -> signing.
        let fx = m.handle(Event::TimerFired(settle));
        assert!(!fx.contains(&Effect::DisarmTimer(TimerKind::AuthSlow)));

        let fx = m.handle(Event::TimerFired(slow));
        assert_eq!(
            fx,
            vec![Effect::Publish(ConnectUpdate::SlowOperation { stage: Stage::Signing })]
        );
        assert!(m.handle(Event::TimerFired(slow)).is_empty());
    }
}
