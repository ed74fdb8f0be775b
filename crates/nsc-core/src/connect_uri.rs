//! Builder for the `nostrconnect://` URI advertised to signers during an
//! interactive connection.

use getrandom::getrandom;

use crate::errors::ConnectError;
use crate::types::PublicKey;

pub const NOSTR_CONNECT_SCHEME: &str = "nostrconnect";

/// Parameters of an interactive connect request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Client (app) public key the signer should talk to
    pub client_pubkey: PublicKey,
    /// Relays the client listens on
    pub relays: Vec<String>,
    /// One-time secret the signer must echo back
    pub secret: String,
    /// App name shown in the signer
    pub name: Option<String>,
    /// Requested permissions, e.g. `sign_event:22242`
    pub perms: Vec<String>,
}

impl ConnectionRequest {
    /// Create a request with a freshly generated secret.
    pub fn new(client_pubkey: PublicKey, relays: Vec<String>) -> Result<Self, ConnectError> {
        if relays.is_empty() {
            return Err(ConnectError::InvalidConnectRequest(
                "at least one relay is required".into(),
            ));
        }
        Ok(Self {
            client_pubkey,
            relays,
            secret: generate_secret()?,
            name: None,
            perms: Vec::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_perms(mut self, perms: Vec<String>) -> Self {
        self.perms = perms;
        self
    }

    /// Render the URI.
    pub fn to_uri(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for relay in &self.relays {
            query.append_pair("relay", relay.trim_end_matches('/'));
        }
        query.append_pair("secret", &self.secret);
        if let Some(name) = &self.name {
            query.append_pair("name", name);
        }
        if !self.perms.is_empty() {
            query.append_pair("perms", &self.perms.join(","));
        }
        format!(
            "{NOSTR_CONNECT_SCHEME}://{}?{}",
            self.client_pubkey.to_hex(),
            query.finish()
        )
    }

    /// URI with the secret masked, for logs.
    pub fn redacted_uri(&self) -> String {
        let mut masked = self.clone();
        masked.secret = "***".to_string();
        masked.to_uri()
    }
}

/// 16 random bytes, hex encoded.
pub fn generate_secret() -> Result<String, ConnectError> {
    let mut bytes = [0u8; 16];
    getrandom(&mut bytes).map_err(|_| ConnectError::Rng)?;
    Ok(hex::encode(bytes))
}
