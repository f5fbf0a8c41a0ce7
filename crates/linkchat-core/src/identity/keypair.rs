//! Dual-purpose keypair: Ed25519 for signatures, X25519 for agreement
//!
//! The same struct serves as a long-lived identity and as a single-use link
//! key addressing one step of a message chain. Public halves are carried as
//! base58 strings so they can appear directly in store paths.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{ChatError, ChatResult};

/// Base58-encoded Ed25519 verifying key. Identifies a signer and addresses
/// messages in the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PubKey(String);

/// Base58-encoded X25519 public key used for shared-secret derivation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncPubKey(String);

impl PubKey {
    /// Parse and validate a base58 Ed25519 public key.
    pub fn parse(s: &str) -> ChatResult<Self> {
        let key = Self(s.trim().to_string());
        key.verifying_key()?;
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode into an Ed25519 verifying key.
    pub fn verifying_key(&self) -> ChatResult<VerifyingKey> {
        let bytes = decode_32(&self.0)?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| ChatError::InvalidKey(e.to_string()))
    }

    /// Short form for logs and listings.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl EncPubKey {
    /// Parse and validate a base58 X25519 public key.
    pub fn parse(s: &str) -> ChatResult<Self> {
        let key = Self(s.trim().to_string());
        key.x25519()?;
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode into an X25519 public key.
    pub fn x25519(&self) -> ChatResult<X25519PublicKey> {
        Ok(X25519PublicKey::from(decode_32(&self.0)?))
    }
}

impl fmt::Display for EncPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn decode_32(s: &str) -> ChatResult<[u8; 32]> {
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|e| ChatError::InvalidKey(format!("{}: {}", s, e)))?;
    bytes
        .try_into()
        .map_err(|_| ChatError::InvalidKey(format!("{}: expected 32 bytes", s)))
}

/// Asymmetric keypair with independent signing and agreement components.
///
/// Equality compares all four components, so a conversation record holding
/// a rotated pair is never mistaken for an unchanged one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keypair {
    #[serde(rename = "pub")]
    pub_key: PubKey,
    epub: EncPubKey,
    /// Ed25519 seed
    priv_key: [u8; 32],
    /// X25519 secret scalar
    epriv: [u8; 32],
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        let mut escalar = [0u8; 32];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut seed);
        rng.fill_bytes(&mut escalar);
        Self::from_secrets(seed, escalar)
    }

    /// Rebuild a keypair from its two private components.
    pub fn from_secrets(priv_key: [u8; 32], epriv: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&priv_key);
        let secret = X25519StaticSecret::from(epriv);
        let public = X25519PublicKey::from(&secret);
        Self {
            pub_key: PubKey(bs58::encode(signing.verifying_key().as_bytes()).into_string()),
            epub: EncPubKey(bs58::encode(public.as_bytes()).into_string()),
            priv_key,
            epriv,
        }
    }

    /// Public signature-verification component.
    pub fn pub_key(&self) -> &PubKey {
        &self.pub_key
    }

    /// Public agreement component.
    pub fn epub(&self) -> &EncPubKey {
        &self.epub
    }

    pub(crate) fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.priv_key)
    }

    pub(crate) fn agreement_secret(&self) -> X25519StaticSecret {
        X25519StaticSecret::from(self.epriv)
    }

    pub(crate) fn epriv_bytes(&self) -> &[u8; 32] {
        &self.epriv
    }

    /// Serialize to JSON for export (includes private material).
    pub fn to_json(&self) -> ChatResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ChatError::Serialization(e.to_string()))
    }

    /// Import from JSON produced by [`Keypair::to_json`].
    ///
    /// The public halves are recomputed from the secrets, so a tampered
    /// export cannot claim someone else's public key.
    pub fn from_json(json: &str) -> ChatResult<Self> {
        let parsed: Keypair =
            serde_json::from_str(json).map_err(|e| ChatError::Serialization(e.to_string()))?;
        let rebuilt = Self::from_secrets(parsed.priv_key, parsed.epriv);
        if rebuilt.pub_key != parsed.pub_key || rebuilt.epub != parsed.epub {
            return Err(ChatError::InvalidKey(
                "public keys do not match private material".to_string(),
            ));
        }
        Ok(rebuilt)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("pub", &self.pub_key.as_str())
            .field("epub", &self.epub.as_str())
            .finish_non_exhaustive()
    }
}
