//! Crypto facade: agreement, AEAD, signatures and content hashes
//!
//! ```text
//! derive_secret: X25519(own.epriv, counterpart.epub) -> HKDF-SHA256 -> Secret
//! encrypt:       ChaCha20-Poly1305, output = [nonce (12)] + [ciphertext + tag]
//! sign:          Ed25519 over the opaque data, carried in a `Signed` envelope
//! hash:          SHA-256, hex encoded
//! ```
//!
//! Every "open" direction (`decrypt`, `verify`, `derive_secret`) returns
//! `Option`: a `None` means the data is not for this key or not authentic,
//! which is an expected outcome in a shared store and never an error.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, Verifier};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::error::{ChatError, ChatResult};
use crate::identity::{EncPubKey, Keypair, PubKey};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Domain separation for link secrets (Diffie-Hellman between two pairs)
const LINK_INFO: &[u8] = b"linkchat-link-v1";

/// Domain separation for owner secrets (records encrypted at rest)
const OWNER_INFO: &[u8] = b"linkchat-owner-v1";

/// Symmetric 32-byte key for authenticated encryption.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    /// Key for records only the holder of `pair` can read: private
    /// conversation/contact records, or a group descriptor readable by every
    /// holder of the group pair.
    pub fn for_keypair(pair: &Keypair) -> Self {
        Self(hkdf_expand(pair.epriv_bytes(), OWNER_INFO))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

fn hkdf_expand(ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut output = [0u8; 32];
    // 32 bytes is far below the HKDF-SHA256 output limit
    let _ = hkdf.expand(info, &mut output);
    output
}

/// Derive the shared secret between `own` and a counterpart's agreement key.
///
/// Symmetric: `derive_secret(b.epub, a) == derive_secret(a.epub, b)`. A link
/// pair derived against its own `epub` yields the one-time secret shared by
/// everyone holding that pair.
pub fn derive_secret(counterpart_epub: &EncPubKey, own: &Keypair) -> Option<Secret> {
    let public = counterpart_epub.x25519().ok()?;
    let shared = own.agreement_secret().diffie_hellman(&public);
    Some(Secret(hkdf_expand(shared.as_bytes(), LINK_INFO)))
}

/// Encrypt with ChaCha20-Poly1305 under a fresh random nonce.
pub fn encrypt(plaintext: &[u8], secret: &Secret) -> ChatResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(secret.as_bytes().into());
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| ChatError::Crypto(format!("Encryption failed: {}", e)))?;

    let mut result = nonce_bytes.to_vec();
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt `[nonce] + [ciphertext + tag]`. `None` on wrong key, tampering or
/// truncated input.
pub fn decrypt(data: &[u8], secret: &Secret) -> Option<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        trace!(len = data.len(), "ciphertext shorter than nonce");
        return None;
    }
    let cipher = ChaCha20Poly1305::new(secret.as_bytes().into());
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
    cipher.decrypt(nonce, &data[NONCE_SIZE..]).ok()
}

/// Data plus the signer's public key and an Ed25519 signature over the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signed {
    pub data: Vec<u8>,
    pub signer: PubKey,
    pub signature: Vec<u8>,
}

/// Sign `data` with the Ed25519 half of `pair`.
pub fn sign(data: Vec<u8>, pair: &Keypair) -> Signed {
    let signature = pair.signing_key().sign(&data);
    Signed {
        data,
        signer: pair.pub_key().clone(),
        signature: signature.to_bytes().to_vec(),
    }
}

/// Verify `signed` against `signer`; returns the data when authentic.
pub fn verify(signed: &Signed, signer: &PubKey) -> Option<Vec<u8>> {
    if &signed.signer != signer {
        return None;
    }
    let key = signer.verifying_key().ok()?;
    let bytes: [u8; 64] = signed.signature.as_slice().try_into().ok()?;
    let signature = Signature::from_bytes(&bytes);
    key.verify(&signed.data, &signature).ok()?;
    Some(signed.data.clone())
}

/// SHA-256 content hash, hex encoded.
pub fn hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Encode a record with postcard and encrypt it for the holder of `owner`.
pub fn seal<T: Serialize>(value: &T, owner: &Keypair) -> ChatResult<Vec<u8>> {
    let bytes = postcard::to_allocvec(value)?;
    encrypt(&bytes, &Secret::for_keypair(owner))
}

/// Reverse of [`seal`]; `None` when the record is not ours or malformed.
pub fn open<T: DeserializeOwned>(data: &[u8], owner: &Keypair) -> Option<T> {
    let bytes = decrypt(data, &Secret::for_keypair(owner))?;
    postcard::from_bytes(&bytes).ok()
}
