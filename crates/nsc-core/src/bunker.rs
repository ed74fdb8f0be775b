//! Bunker URL handling.
//!
//! The state machine treats a bunker URL as an opaque, non-empty credential.
//! Strict NIP-46 parsing is available through [`BunkerUrl::details`] for
//! tooling and input validation in front ends; the connection flow itself
//! never depends on it.

use std::fmt;

use url::Url;

use crate::errors::ConnectError;
use crate::types::PublicKey;

pub const BUNKER_SCHEME: &str = "bunker";

/// A user-supplied bunker URL.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BunkerUrl {
    raw: String,
}

/// Parsed fields of a well-formed bunker URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BunkerDetails {
    pub remote_signer: PublicKey,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

impl BunkerUrl {
    /// Accept any non-empty input, trimmed.
    pub fn new(raw: &str) -> Result<Self, ConnectError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConnectError::EmptyBunkerUrl);
        }
        Ok(Self {
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The `secret` query parameter, if the URL parses and carries one.
    pub fn secret(&self) -> Option<String> {
        let url = Url::parse(&self.raw).ok()?;
        url.query_pairs()
            .find(|(k, _)| k.eq_ignore_ascii_case("secret"))
            .map(|(_, v)| v.into_owned())
    }

    /// Log-safe rendering with the secret masked.
    pub fn redacted(&self) -> String {
        let Ok(mut url) = Url::parse(&self.raw) else {
            return "<unparsed bunker url>".to_string();
        };
        if url.query().is_none() {
            return url.to_string();
        }

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case("secret") {
                    (k.into_owned(), "***".to_string())
                } else {
                    (k.into_owned(), v.into_owned())
                }
            })
            .collect();

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in pairs {
            serializer.append_pair(&k, &v);
        }
        url.set_query(Some(&serializer.finish()));
        url.to_string()
    }

    /// Strict parse: `bunker://<hex pubkey>?relay=wss://..[&secret=..]`.
    pub fn details(&self) -> Result<BunkerDetails, ConnectError> {
        let url = Url::parse(&self.raw).map_err(|e| ConnectError::InvalidBunkerUrl(e.to_string()))?;

        if url.scheme() != BUNKER_SCHEME {
            return Err(ConnectError::InvalidBunkerUrl(format!(
                "expected {BUNKER_SCHEME}:// scheme, got {}://",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| ConnectError::InvalidBunkerUrl("missing remote signer key".into()))?;
        let remote_signer = PublicKey::from_hex(host)
            .map_err(|e| ConnectError::InvalidBunkerUrl(format!("remote signer key: {e}")))?;

        let mut relays = Vec::new();
        let mut secret = None;
        for (k, v) in url.query_pairs() {
            if k.eq_ignore_ascii_case("relay") {
                if !v.starts_with("wss://") && !v.starts_with("ws://") {
                    return Err(ConnectError::InvalidBunkerUrl(format!(
                        "relay '{v}' must start with ws:// or wss://"
                    )));
                }
                relays.push(v.into_owned());
            } else if k.eq_ignore_ascii_case("secret") && !v.is_empty() {
                secret = Some(v.into_owned());
            }
        }

        if relays.is_empty() {
            return Err(ConnectError::InvalidBunkerUrl(
                "at least one relay parameter is required".into(),
            ));
        }

        Ok(BunkerDetails {
            remote_signer,
            relays,
            secret,
        })
    }
}

impl fmt::Debug for BunkerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BunkerUrl").field(&self.redacted()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNER: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn sample() -> String {
        format!("bunker://{SIGNER}?relay=wss%3A%2F%2Frelay.example.com&secret=s3cr3t")
    }

    #[test]
    fn test_new_trims_and_rejects_empty() {
        assert_eq!(BunkerUrl::new("   "), Err(ConnectError::EmptyBunkerUrl));
        let url = BunkerUrl::new("  bunker://abc  ").unwrap();
        assert_eq!(url.as_str(), "bunker://abc");
    }

    #[test]
    fn test_opaque_urls_are_accepted() {
        let url = BunkerUrl::new("bunker://valid-unused-secret").unwrap();
        assert!(url.details().is_err());
        assert!(url.secret().is_none());
    }

    #[test]
    fn test_details_parses_nip46_url() {
        let url = BunkerUrl::new(&sample()).unwrap();
        let details = url.details().unwrap();
        assert_eq!(details.remote_signer.to_hex(), SIGNER);
        assert_eq!(details.relays, vec!["wss://relay.example.com".to_string()]);
        assert_eq!(details.secret.as_deref(), Some("s3cr3t"));
    }

    #[test]
    fn test_details_requires_relay() {
        let url = BunkerUrl::new(&format!("bunker://{SIGNER}?secret=x")).unwrap();
        let err = url.details().unwrap_err();
        assert!(err.to_string().contains("relay"));
    }

    #[test]
    fn test_details_rejects_wrong_scheme() {
        let url = BunkerUrl::new(&format!("nostrconnect://{SIGNER}?relay=wss://r")).unwrap();
        assert!(url.details().is_err());
    }

    #[test]
    fn test_redacted_masks_secret() {
        let url = BunkerUrl::new(&sample()).unwrap();
        let redacted = url.redacted();
        assert!(!redacted.contains("s3cr3t"));
        assert!(redacted.contains("secret=***") || redacted.contains("secret=%2A%2A%2A"));
        assert!(format!("{url:?}").contains(SIGNER));
        assert_eq!(url.secret().as_deref(), Some("s3cr3t"));
    }
}
