//! Payload signing, trust policies and the channel handshake.
//!
//! Every payload that crosses a channel is wrapped in a [`SignedPayload`]
//! envelope. The envelope is encoded with MessagePack regardless of which
//! message codec the body uses, so any codec works with any carrier.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ SignedPayload (MessagePack map)               │
//! │   body:              bin  (encoded Message)   │
//! │   signature:         bin  (64 bytes, Ed25519) │
//! │   signer_public_key: bin  (32 bytes)          │
//! └──────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::RwLock;

use ed25519_dalek::PUBLIC_KEY_LENGTH;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::{Identity, PeerIdentity, Signature};
use crate::error::AuthError;

/// Length of a handshake challenge in bytes.
pub const CHALLENGE_LENGTH: usize = 32;

/// A body together with its signature and the signer's public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    /// Opaque encoded message bytes.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    /// Signature over exactly `body`.
    pub signature: Signature,
    /// Public key of the signer.
    #[serde(with = "serde_bytes")]
    pub signer_public_key: [u8; PUBLIC_KEY_LENGTH],
}

impl SignedPayload {
    /// Encode the envelope to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AuthError> {
        rmp_serde::to_vec_named(self).map_err(|e| AuthError::Malformed(e.to_string()))
    }

    /// Decode an envelope from bytes.
    ///
    /// Fails with [`AuthError::Malformed`] when any field is missing or has
    /// the wrong length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AuthError> {
        rmp_serde::from_slice(bytes).map_err(|e| AuthError::Malformed(e.to_string()))
    }

    /// Identity of the claimed signer.
    pub fn signer(&self) -> Result<PeerIdentity, AuthError> {
        PeerIdentity::from_public_key_bytes(&self.signer_public_key)
    }
}

/// Which signer keys an [`Authenticator`] accepts.
#[derive(Debug)]
pub enum TrustPolicy {
    /// Exactly one key.
    Pinned(PeerIdentity),
    /// Any key in the set.
    AllowList(HashSet<[u8; PUBLIC_KEY_LENGTH]>),
    /// The first key that presents a valid signature; only that key after.
    FirstSeen(RwLock<Option<PeerIdentity>>),
}

impl TrustPolicy {
    /// Trust a single key.
    pub fn pinned(peer: PeerIdentity) -> Self {
        TrustPolicy::Pinned(peer)
    }

    /// Trust every key in `peers`.
    pub fn allow_list<I>(peers: I) -> Self
    where
        I: IntoIterator<Item = PeerIdentity>,
    {
        TrustPolicy::AllowList(peers.into_iter().map(|p| p.public_key_bytes()).collect())
    }

    /// Trust on first use.
    pub fn first_seen() -> Self {
        TrustPolicy::FirstSeen(RwLock::new(None))
    }

    /// The key recorded by a first-seen policy, if any.
    pub fn recorded(&self) -> Option<PeerIdentity> {
        match self {
            TrustPolicy::FirstSeen(slot) => *slot.read().unwrap_or_else(|e| e.into_inner()),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TrustPolicy::Pinned(_) => "pinned",
            TrustPolicy::AllowList(_) => "allow_list",
            TrustPolicy::FirstSeen(_) => "first_seen",
        }
    }

    /// Check a key before its signature is verified.
    fn admits(&self, signer: &PeerIdentity) -> bool {
        match self {
            TrustPolicy::Pinned(pinned) => pinned == signer,
            TrustPolicy::AllowList(keys) => keys.contains(&signer.public_key_bytes()),
            TrustPolicy::FirstSeen(slot) => match *slot.read().unwrap_or_else(|e| e.into_inner())
            {
                Some(recorded) => recorded == *signer,
                None => true,
            },
        }
    }

    /// Record a verified key. Returns false if another key won the race.
    fn record(&self, signer: &PeerIdentity) -> bool {
        match self {
            TrustPolicy::FirstSeen(slot) => {
                let mut guard = slot.write().unwrap_or_else(|e| e.into_inner());
                match *guard {
                    Some(recorded) => recorded == *signer,
                    None => {
                        *guard = Some(*signer);
                        true
                    }
                }
            }
            _ => true,
        }
    }
}

/// Signs outgoing and verifies incoming payloads.
///
/// One authenticator is handed to each channel at construction; several can
/// live in the same process with different identities and policies.
#[derive(Debug)]
pub struct Authenticator {
    identity: Identity,
    policy: TrustPolicy,
}

impl Authenticator {
    /// Create an authenticator for `identity` that trusts per `policy`.
    pub fn new(identity: Identity, policy: TrustPolicy) -> Self {
        Self { identity, policy }
    }

    /// The local signing identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The trust policy applied on verify.
    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// Sign `body` with the local identity.
    pub fn sign(&self, body: &[u8]) -> SignedPayload {
        SignedPayload {
            body: body.to_vec(),
            signature: self.identity.sign(body),
            signer_public_key: self.identity.public_key_bytes(),
        }
    }

    /// Verify a payload against the trust policy.
    ///
    /// Returns the body only if the signer is permitted and the signature
    /// covers exactly that body.
    pub fn verify<'a>(&self, payload: &'a SignedPayload) -> Result<&'a [u8], AuthError> {
        let signer = payload.signer()?;
        if !self.policy.admits(&signer) {
            return Err(AuthError::UntrustedKey {
                fingerprint: signer.fingerprint(),
            });
        }
        signer.verify(&payload.body, &payload.signature)?;
        if !self.policy.record(&signer) {
            return Err(AuthError::UntrustedKey {
                fingerprint: signer.fingerprint(),
            });
        }
        Ok(&payload.body)
    }

    /// Verify a payload that must come from an already authenticated peer.
    pub fn verify_from<'a>(
        &self,
        payload: &'a SignedPayload,
        peer: &PeerIdentity,
    ) -> Result<&'a [u8], AuthError> {
        if payload.signer_public_key != peer.public_key_bytes() {
            return Err(AuthError::PeerMismatch);
        }
        peer.verify(&payload.body, &payload.signature)?;
        Ok(&payload.body)
    }

    /// Sign `body` and encode the envelope.
    pub fn seal(&self, body: &[u8]) -> Result<Vec<u8>, AuthError> {
        self.sign(body).to_bytes()
    }

    /// Decode an envelope and verify it against the trust policy.
    pub fn open(&self, bytes: &[u8]) -> Result<Vec<u8>, AuthError> {
        let payload = SignedPayload::from_bytes(bytes)?;
        self.verify(&payload).map(<[u8]>::to_vec)
    }

    /// Decode an envelope that must be signed by `peer`.
    pub fn open_from(&self, bytes: &[u8], peer: &PeerIdentity) -> Result<Vec<u8>, AuthError> {
        let payload = SignedPayload::from_bytes(bytes)?;
        self.verify_from(&payload, peer).map(<[u8]>::to_vec)
    }

    /// Short description of the policy for logs.
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Messages exchanged before a duplex channel carries any RPC traffic.
///
/// Each side sends a signed `Hello` with a fresh challenge, then a signed
/// `Proof` naming the challenge it received followed by the one it issued.
/// The receiver expects the pair in the opposite order, so a `Proof`
/// reflected back at its sender never matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Handshake {
    /// Introduces the sender and carries its challenge.
    Hello {
        #[serde(with = "serde_bytes")]
        challenge: [u8; CHALLENGE_LENGTH],
    },
    /// Binds the peer's challenge to the sender's own.
    Proof {
        /// Challenge received from the peer.
        #[serde(with = "serde_bytes")]
        received: [u8; CHALLENGE_LENGTH],
        /// Challenge the sender issued in its own hello.
        #[serde(with = "serde_bytes")]
        issued: [u8; CHALLENGE_LENGTH],
    },
}

impl Handshake {
    /// A fresh random challenge.
    pub fn challenge() -> [u8; CHALLENGE_LENGTH] {
        let mut challenge = [0u8; CHALLENGE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        challenge
    }

    /// A hello with a random challenge.
    pub fn hello() -> Self {
        Handshake::Hello {
            challenge: Self::challenge(),
        }
    }

    /// The proof a side sends after exchanging hellos.
    pub fn proof(ours: [u8; CHALLENGE_LENGTH], theirs: [u8; CHALLENGE_LENGTH]) -> Self {
        Handshake::Proof {
            received: theirs,
            issued: ours,
        }
    }

    /// Whether this is the proof the peer owes us: it must have received
    /// our challenge and issued the one from its hello.
    pub fn proves(
        &self,
        ours: &[u8; CHALLENGE_LENGTH],
        theirs: &[u8; CHALLENGE_LENGTH],
    ) -> bool {
        match self {
            Handshake::Proof { received, issued } => received == ours && issued == theirs,
            Handshake::Hello { .. } => false,
        }
    }

    /// Encode to MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AuthError> {
        rmp_serde::to_vec_named(self).map_err(|e| AuthError::HandshakeFailed(e.to_string()))
    }

    /// Decode from MessagePack.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AuthError> {
        rmp_serde::from_slice(bytes).map_err(|e| AuthError::HandshakeFailed(e.to_string()))
    }
}
