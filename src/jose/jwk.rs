//! JWK key material for the algorithms the PK Token carries.
//!
//! RSA keys belong to OPs (RS256/GQ256); EC P-256 and Ed25519 keys are the
//! client-side ephemeral keys embedded in CIC headers.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::Verifier as _;
use p256::ecdsa::signature::Verifier as _;
use rsa::signature::Verifier as _;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::jws::JoseError;

/// Public key in JWK form. Equality is structural, which makes comparing a
/// certificate key against the CIC `jwk` a plain `==`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa { n: String, e: String },

    #[serde(rename = "EC")]
    Ec { crv: String, x: String, y: String },

    #[serde(rename = "OKP")]
    Okp { crv: String, x: String },
}

impl Jwk {
    pub fn from_rsa(key: &RsaPublicKey) -> Self {
        Jwk::Rsa {
            n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        }
    }

    pub fn from_p256(key: &p256::ecdsa::VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        Jwk::Ec {
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(point.x().expect("uncompressed point has x")),
            y: URL_SAFE_NO_PAD.encode(point.y().expect("uncompressed point has y")),
        }
    }

    pub fn from_ed25519(key: &ed25519_dalek::VerifyingKey) -> Self {
        Jwk::Okp {
            crv: "Ed25519".to_string(),
            x: URL_SAFE_NO_PAD.encode(key.to_bytes()),
        }
    }

    pub fn to_rsa(&self) -> Result<RsaPublicKey, JoseError> {
        match self {
            Jwk::Rsa { n, e } => {
                let n = rsa::BigUint::from_bytes_be(&decode_param(n)?);
                let e = rsa::BigUint::from_bytes_be(&decode_param(e)?);
                RsaPublicKey::new(n, e).map_err(|e| JoseError::InvalidKey(e.to_string()))
            }
            _ => Err(JoseError::InvalidKey("expected an RSA key".into())),
        }
    }

    pub fn to_p256(&self) -> Result<p256::ecdsa::VerifyingKey, JoseError> {
        match self {
            Jwk::Ec { crv, x, y } if crv == "P-256" => {
                let x = decode_param(x)?;
                let y = decode_param(y)?;
                if x.len() != 32 || y.len() != 32 {
                    return Err(JoseError::InvalidKey("P-256 coordinate length".into()));
                }
                let point = p256::EncodedPoint::from_affine_coordinates(
                    p256::FieldBytes::from_slice(&x),
                    p256::FieldBytes::from_slice(&y),
                    false,
                );
                p256::ecdsa::VerifyingKey::from_encoded_point(&point)
                    .map_err(|e| JoseError::InvalidKey(e.to_string()))
            }
            _ => Err(JoseError::InvalidKey("expected a P-256 key".into())),
        }
    }

    pub fn to_ed25519(&self) -> Result<ed25519_dalek::VerifyingKey, JoseError> {
        match self {
            Jwk::Okp { crv, x } if crv == "Ed25519" => {
                let bytes = decode_param(x)?;
                let arr: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| JoseError::InvalidKey("Ed25519 key length".into()))?;
                ed25519_dalek::VerifyingKey::from_bytes(&arr)
                    .map_err(|e| JoseError::InvalidKey(e.to_string()))
            }
            _ => Err(JoseError::InvalidKey("expected an Ed25519 key".into())),
        }
    }

    /// JWS `alg` this key verifies.
    pub fn alg(&self) -> &'static str {
        match self {
            Jwk::Rsa { .. } => "RS256",
            Jwk::Ec { .. } => "ES256",
            Jwk::Okp { .. } => "EdDSA",
        }
    }

    /// RFC 7638 thumbprint: SHA-256 of the canonical JSON with members in
    /// lexicographic order, base64url without padding.
    pub fn thumbprint(&self) -> String {
        let canonical = match self {
            Jwk::Rsa { n, e } => format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, e, n),
            Jwk::Ec { crv, x, y } => {
                format!(r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#, crv, x, y)
            }
            Jwk::Okp { crv, x } => format!(r#"{{"crv":"{}","kty":"OKP","x":"{}"}}"#, crv, x),
        };
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Verify `signature` over `message` with the algorithm implied by the
    /// key type.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), JoseError> {
        match self {
            Jwk::Rsa { .. } => {
                let key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(self.to_rsa()?);
                let sig = rsa::pkcs1v15::Signature::try_from(signature)
                    .map_err(|_| JoseError::SignatureInvalid)?;
                key.verify(message, &sig)
                    .map_err(|_| JoseError::SignatureInvalid)
            }
            Jwk::Ec { .. } => {
                let key = self.to_p256()?;
                let sig = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| JoseError::SignatureInvalid)?;
                key.verify(message, &sig)
                    .map_err(|_| JoseError::SignatureInvalid)
            }
            Jwk::Okp { .. } => {
                let key = self.to_ed25519()?;
                let sig = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| JoseError::SignatureInvalid)?;
                key.verify(message, &sig)
                    .map_err(|_| JoseError::SignatureInvalid)
            }
        }
    }
}

fn decode_param(value: &str) -> Result<Vec<u8>, JoseError> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(JoseError::from)
}
