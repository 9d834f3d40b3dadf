//! Cryptographic identity and key management for SigRPC peers.
//!
//! This module provides Ed25519 key generation, peer identity management,
//! payload signing, and signature verification.

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Length of a key id in bytes (SHA-256 output truncated to 16 bytes).
pub const KEY_ID_LENGTH: usize = 16;

/// A short identifier derived from a public key.
///
/// The first 16 bytes of the SHA-256 hash of the public key, used in logs
/// and error messages instead of the full key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(#[serde(with = "serde_bytes")] pub [u8; KEY_ID_LENGTH]);

impl KeyId {
    /// Returns the raw bytes of this key id.
    pub fn as_bytes(&self) -> &[u8; KEY_ID_LENGTH] {
        &self.0
    }

    /// Human-readable fingerprint.
    ///
    /// Groups of 4 hex characters separated by colons, for example:
    /// `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`
    pub fn fingerprint(&self) -> String {
        self.0
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Derives a key id from raw public key bytes.
    pub fn from_public_key_bytes(public_key: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(public_key);
        let mut id = [0u8; KEY_ID_LENGTH];
        id.copy_from_slice(&hash[..KEY_ID_LENGTH]);
        Self(id)
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Creates a new Signature from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates a Signature from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AuthError> {
        let arr: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|_| {
            AuthError::Malformed(format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    fn as_ed25519(&self) -> Ed25519Signature {
        Ed25519Signature::from_bytes(&self.0)
    }
}

/// The local signing identity, including the secret key.
///
/// Passed explicitly to every channel that signs on its behalf; several
/// identities may coexist in one process.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    key_id: KeyId,
}

impl Identity {
    /// Generates a new random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Creates an identity from raw secret key bytes.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    /// Creates an identity from a hex-encoded secret key.
    pub fn from_hex(secret_hex: &str) -> Result<Self, AuthError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| AuthError::Malformed(format!("secret key is not hex: {}", e)))?;
        let arr: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            AuthError::Malformed(format!(
                "secret key must be {} bytes, got {}",
                SECRET_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self::from_secret_key_bytes(&arr))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let key_id = KeyId::from_public_key_bytes(verifying_key.as_bytes());
        Self {
            signing_key,
            verifying_key,
            key_id,
        }
    }

    /// Returns the secret key bytes.
    ///
    /// **Security Warning**: The secret key should be kept confidential.
    /// Only use this method for secure storage.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Hex encoding of the secret key, for key files.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key_bytes())
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the key id.
    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Public half of this identity.
    pub fn to_peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            verifying_key: self.verifying_key,
            key_id: self.key_id,
        }
    }

    /// Signs a message with the secret key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Human-readable fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        self.key_id.fingerprint()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("key_id", &self.key_id)
            .field("public_key", &"[REDACTED]")
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// The identity of a remote peer (public information only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    #[serde(with = "verifying_key_serde")]
    verifying_key: VerifyingKey,
    key_id: KeyId,
}

impl PeerIdentity {
    /// Creates a PeerIdentity from public key bytes.
    pub fn from_public_key_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self, AuthError> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| AuthError::InvalidPublicKey(e.to_string()))?;
        Ok(Self {
            verifying_key,
            key_id: KeyId::from_public_key_bytes(bytes),
        })
    }

    /// Creates a PeerIdentity from a public key slice of any length.
    pub fn from_public_key_slice(bytes: &[u8]) -> Result<Self, AuthError> {
        let arr: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            AuthError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Self::from_public_key_bytes(&arr)
    }

    /// Creates a PeerIdentity from a hex-encoded public key.
    pub fn from_hex(public_hex: &str) -> Result<Self, AuthError> {
        let bytes = hex::decode(public_hex.trim())
            .map_err(|e| AuthError::InvalidPublicKey(format!("not hex: {}", e)))?;
        Self::from_public_key_slice(&bytes)
    }

    /// Returns the public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Hex encoding of the public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Returns the key id.
    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Verifies a signature against a message using this peer's public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), AuthError> {
        self.verifying_key
            .verify(message, &signature.as_ed25519())
            .map_err(AuthError::from)
    }

    /// Human-readable fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        self.key_id.fingerprint()
    }
}

/// Serde support for VerifyingKey (serializes as raw bytes).
mod verifying_key_serde {
    use ed25519_dalek::{VerifyingKey, PUBLIC_KEY_LENGTH};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &VerifyingKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::Bytes::new(key.as_bytes()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<VerifyingKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: serde_bytes::ByteBuf = Deserialize::deserialize(deserializer)?;
        if bytes.len() != PUBLIC_KEY_LENGTH {
            return Err(serde::de::Error::custom(format!(
                "invalid public key length: expected {}, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut arr = [0u8; PUBLIC_KEY_LENGTH];
        arr.copy_from_slice(&bytes);
        VerifyingKey::from_bytes(&arr).map_err(serde::de::Error::custom)
    }
}
