//! Error types for the protocol crate.

use thiserror::Error;

use crate::messages::RequestId;

/// Protocol error type covering encoding, framing and authentication failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A message payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    // Cryptographic errors
    /// A payload failed authentication.
    #[error(transparent)]
    Auth(#[from] AuthError),

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A payload could not be decoded into a message.
///
/// Carries whatever request id could be salvaged from the raw bytes so that
/// a protocol-level error reply can still be correlated by the peer.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("decode failed: {reason}")]
pub struct DecodeError {
    /// What went wrong.
    pub reason: String,
    /// Request id recovered from the malformed payload, if any.
    pub id: Option<RequestId>,
}

impl DecodeError {
    /// Create a decode error without a salvaged id.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            id: None,
        }
    }

    /// Attach the id recovered from the payload.
    pub fn with_id(mut self, id: Option<RequestId>) -> Self {
        self.id = id;
        self
    }
}

/// Authentication failure for a signed payload.
///
/// These are fatal to the payload: it is never decoded or dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The signature does not verify over the body.
    #[error("invalid signature")]
    InvalidSignature,

    /// The signer's key is not permitted by the trust policy.
    #[error("untrusted signer: {fingerprint}")]
    UntrustedKey {
        /// Fingerprint of the rejected key.
        fingerprint: String,
    },

    /// The signer's key bytes are not a valid Ed25519 point.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The signed envelope is structurally incomplete.
    #[error("malformed signed payload: {0}")]
    Malformed(String),

    /// A payload was signed by a key other than the handshake peer's.
    #[error("payload signer does not match the authenticated peer")]
    PeerMismatch,

    /// The challenge/response handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for AuthError {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        AuthError::InvalidSignature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_error_display() {
        let err = ProtocolError::Serialization("invalid utf-8".to_string());
        assert_eq!(err.to_string(), "serialization failed: invalid utf-8");
    }

    #[test]
    fn test_deserialization_error_display() {
        let err = ProtocolError::Deserialization("unexpected end of input".to_string());
        assert_eq!(
            err.to_string(),
            "deserialization failed: unexpected end of input"
        );
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::new("missing method");
        assert_eq!(err.to_string(), "decode failed: missing method");
        assert!(err.id.is_none());
    }

    #[test]
    fn test_decode_error_keeps_salvaged_id() {
        let err = DecodeError::new("bad params").with_id(Some(RequestId::Number(9)));
        assert_eq!(err.id, Some(RequestId::Number(9)));

        let wrapped: ProtocolError = err.into();
        assert_eq!(wrapped.to_string(), "decode failed: bad params");
    }

    #[test]
    fn test_auth_error_display() {
        assert_eq!(AuthError::InvalidSignature.to_string(), "invalid signature");
        assert_eq!(
            AuthError::UntrustedKey {
                fingerprint: "abcd:ef01".to_string()
            }
            .to_string(),
            "untrusted signer: abcd:ef01"
        );
        assert_eq!(
            AuthError::Malformed("missing signature".to_string()).to_string(),
            "malformed signed payload: missing signature"
        );
        assert_eq!(
            AuthError::HandshakeFailed("challenge mismatch".to_string()).to_string(),
            "handshake failed: challenge mismatch"
        );
    }

    #[test]
    fn test_frame_too_large_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
        assert_send_sync::<AuthError>();
        assert_send_sync::<DecodeError>();
    }
}
