//! Compact JWS framing (RFC 7515).
//!
//! Segments are kept in their transmitted base64url form; the signing input
//! is always the ASCII bytes of `protected.payload`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::errors::ErrorCode;

#[derive(Debug, Error)]
pub enum JoseError {
    #[error("token is not a compact JWS")]
    NotCompact,

    #[error("invalid base64url segment: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid JSON in segment: {0}")]
    Json(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("malformed key material: {0}")]
    InvalidKey(String),
}

impl JoseError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JoseError::SignatureInvalid => ErrorCode::SigInvalid,
            _ => ErrorCode::MalformedInput,
        }
    }
}

pub fn b64url_encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn b64url_decode(input: &str) -> Result<Vec<u8>, JoseError> {
    // Tolerate padded input from other stacks.
    let trimmed = input.trim_end_matches('=');
    Ok(URL_SAFE_NO_PAD.decode(trimmed)?)
}

/// The three segments of a compact JWS, as transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

impl CompactJws {
    pub fn split(token: &str) -> Result<Self, JoseError> {
        let mut parts = token.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() => {
                Ok(CompactJws {
                    protected: h.to_string(),
                    payload: p.to_string(),
                    signature: s.to_string(),
                })
            }
            _ => Err(JoseError::NotCompact),
        }
    }

    pub fn to_compact(&self) -> String {
        format!("{}.{}.{}", self.protected, self.payload, self.signature)
    }

    /// ASCII bytes the signature covers.
    pub fn signing_input(&self) -> Vec<u8> {
        signing_input(&self.protected, &self.payload)
    }

    pub fn decode_protected<T: DeserializeOwned>(&self) -> Result<T, JoseError> {
        decode_json_segment(&self.protected)
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, JoseError> {
        decode_json_segment(&self.payload)
    }

    pub fn decode_signature(&self) -> Result<Vec<u8>, JoseError> {
        b64url_decode(&self.signature)
    }
}

pub fn signing_input(protected_b64: &str, payload_b64: &str) -> Vec<u8> {
    let mut input = Vec::with_capacity(protected_b64.len() + payload_b64.len() + 1);
    input.extend_from_slice(protected_b64.as_bytes());
    input.push(b'.');
    input.extend_from_slice(payload_b64.as_bytes());
    input
}

pub fn decode_json_segment<T: DeserializeOwned>(segment: &str) -> Result<T, JoseError> {
    let bytes = b64url_decode(segment)?;
    serde_json::from_slice(&bytes).map_err(|e| JoseError::Json(e.to_string()))
}
