//! Connection session data.
//!
//! A [`ConnectionSession`] is the only stateful entity of the connection
//! flow. It is owned by [`crate::machine::SessionMachine`]; everything here
//! is read-only to the outside and mutated through the machine's transitions.

use serde::Serialize;
use tracing::warn;

use crate::bunker::BunkerUrl;
use crate::errors::ErrorInfo;
use crate::machine::OpId;
use crate::types::{PublicKey, Stage};

/// Whether the secret embedded in a bunker URL can still be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretDisposition {
    /// Nothing learned yet
    #[default]
    Unknown,
    /// The signer wants out-of-band approval; the secret stays reusable
    PendingApproval,
    /// Approval went through and the handshake resumed successfully
    Resumed,
    /// Rejected for good; the URL must never be submitted again
    ExpiredOrConsumed,
}

impl SecretDisposition {
    /// Whether moving to `next` respects
    /// `unknown -> pendingApproval -> {resumed | expiredOrConsumed}`.
    pub fn can_advance_to(&self, next: SecretDisposition) -> bool {
        use SecretDisposition::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (ExpiredOrConsumed, _) => false,
            (Resumed, ExpiredOrConsumed) => false,
            (Unknown, PendingApproval | ExpiredOrConsumed) => true,
            (PendingApproval, Resumed | ExpiredOrConsumed) => true,
            _ => false,
        }
    }

    pub fn is_reusable(&self) -> bool {
        !matches!(self, SecretDisposition::ExpiredOrConsumed)
    }
}

/// State of one connection attempt.
#[derive(Clone, Debug)]
pub struct ConnectionSession {
    pub(crate) connection_uri: String,
    pub(crate) stage: Stage,
    pub(crate) resolved_public_key: Option<PublicKey>,
    pub(crate) approval_url: Option<String>,
    /// Operation during which the current approval URL arrived
    pub(crate) approval_url_op: Option<OpId>,
    pub(crate) secret_disposition: SecretDisposition,
    pub(crate) error_info: Option<ErrorInfo>,
    pub(crate) attempt_count: u32,
    pub(crate) bunker_url: Option<BunkerUrl>,
    /// Secret rejection waiting out the grace window
    pub(crate) pending_rejection: Option<String>,
    /// The one outstanding asynchronous call, if any
    pub(crate) current_op: Option<OpId>,
    pub(crate) slow_warning_sent: bool,
}

impl ConnectionSession {
    pub fn new(connection_uri: impl Into<String>) -> Self {
        Self {
            connection_uri: connection_uri.into(),
            stage: Stage::Idle,
            resolved_public_key: None,
            approval_url: None,
            approval_url_op: None,
            secret_disposition: SecretDisposition::Unknown,
            error_info: None,
            attempt_count: 0,
            bunker_url: None,
            pending_rejection: None,
            current_op: None,
            slow_warning_sent: false,
        }
    }

    pub fn connection_uri(&self) -> &str {
        &self.connection_uri
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn resolved_public_key(&self) -> Option<PublicKey> {
        self.resolved_public_key
    }

    pub fn approval_url(&self) -> Option<&str> {
        self.approval_url.as_deref()
    }

    pub fn secret_disposition(&self) -> SecretDisposition {
        self.secret_disposition
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        self.error_info.as_ref()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn bunker_url(&self) -> Option<&BunkerUrl> {
        self.bunker_url.as_ref()
    }

    pub fn has_pending_rejection(&self) -> bool {
        self.pending_rejection.is_some()
    }

    /// Record the signer key. Returns false if a different key was already
    /// resolved; the first key is kept.
    pub(crate) fn resolve_public_key(&mut self, key: PublicKey) -> bool {
        match self.resolved_public_key {
            None => {
                self.resolved_public_key = Some(key);
                true
            }
            Some(existing) if existing == key => true,
            Some(existing) => {
                warn!(
                    kept = %existing.short(),
                    ignored = %key.short(),
                    "signer reported a different key; keeping the first"
                );
                false
            }
        }
    }

    /// Move the secret disposition forward; illegal moves are dropped.
    pub(crate) fn advance_disposition(&mut self, next: SecretDisposition) {
        if self.secret_disposition.can_advance_to(next) {
            self.secret_disposition = next;
        } else {
            warn!(
                from = ?self.secret_disposition,
                to = ?next,
                "ignoring illegal secret disposition change"
            );
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_uri: self.connection_uri.clone(),
            stage: self.stage,
            resolved_public_key: self.resolved_public_key,
            approval_url: self.approval_url.clone(),
            secret_disposition: self.secret_disposition,
            error: self.error_info.clone(),
            attempt_count: self.attempt_count,
            bunker_url: self.bunker_url.as_ref().map(|u| u.redacted()),
        }
    }
}

/// Caller-facing copy of the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connection_uri: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_public_key: Option<PublicKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
    pub secret_disposition: SecretDisposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub attempt_count: u32,
    /// Redacted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bunker_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use SecretDisposition::*;

    #[test]
    fn test_disposition_never_leaves_expired() {
        for next in [Unknown, PendingApproval, Resumed] {
            assert!(!ExpiredOrConsumed.can_advance_to(next));
        }
        assert!(ExpiredOrConsumed.can_advance_to(ExpiredOrConsumed));
    }

    #[test]
    fn test_disposition_forward_moves() {
        assert!(Unknown.can_advance_to(PendingApproval));
        assert!(Unknown.can_advance_to(ExpiredOrConsumed));
        assert!(PendingApproval.can_advance_to(Resumed));
        assert!(PendingApproval.can_advance_to(ExpiredOrConsumed));
        assert!(!Unknown.can_advance_to(Resumed));
        assert!(!PendingApproval.can_advance_to(Unknown));
    }

    #[test]
    fn test_public_key_is_write_once() {
        let mut session = ConnectionSession::new("nostrconnect://x");
        let first = PublicKey::from_bytes([1; 32]);
        let second = PublicKey::from_bytes([2; 32]);
        assert!(session.resolve_public_key(first));
        assert!(session.resolve_public_key(first));
        assert!(!session.resolve_public_key(second));
        assert_eq!(session.resolved_public_key(), Some(first));
    }

    #[test]
    fn test_illegal_disposition_change_is_dropped() {
        let mut session = ConnectionSession::new("nostrconnect://x");
        session.advance_disposition(ExpiredOrConsumed);
        session.advance_disposition(PendingApproval);
        assert_eq!(session.secret_disposition(), ExpiredOrConsumed);
    }

    #[test]
    fn test_snapshot_redacts_bunker_secret() {
        let mut session = ConnectionSession::new("nostrconnect://x");
        session.bunker_url = Some(
            BunkerUrl::new("bunker://abc?relay=wss%3A%2F%2Fr.example&secret=topsecret").unwrap(),
        );
        let snapshot = session.snapshot();
        assert!(!snapshot.bunker_url.unwrap().contains("topsecret"));
    }
}
