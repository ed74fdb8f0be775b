use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ConnectError;

/// Caller-facing stage of a connection session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Idle,
    WaitingForSigner,
    AwaitingApproval,
    Connected,
    Signing,
    Syncing,
    Complete,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::WaitingForSigner => "waitingForSigner",
            Stage::AwaitingApproval => "awaitingApproval",
            Stage::Connected => "connected",
            Stage::Signing => "signing",
            Stage::Syncing => "syncing",
            Stage::Complete => "complete",
            Stage::Error => "error",
        }
    }

    /// `complete` is the only unconditional terminal stage; `error` waits for
    /// the caller to retry or cancel.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete)
    }

    /// Stages of the post-handshake episode.
    pub fn is_authenticating(&self) -> bool {
        matches!(self, Stage::Connected | Stage::Signing | Stage::Syncing)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress reported by the authentication completer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthStage {
    Signing,
    Syncing,
    Complete,
}

impl From<AuthStage> for Stage {
    fn from(stage: AuthStage) -> Self {
        match stage {
            AuthStage::Signing => Stage::Signing,
            AuthStage::Syncing => Stage::Syncing,
            AuthStage::Complete => Stage::Complete,
        }
    }
}

/// 32-byte x-only public key of a signer, hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, ConnectError> {
        let s = s.trim();
        if s.len() != 64 {
            return Err(ConnectError::InvalidPublicKey(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ConnectError::InvalidPublicKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
