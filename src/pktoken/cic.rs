//! Client-instance claims.
//!
//! The CIC protected header commits the client to its ephemeral public key
//! and a fresh random value before the OP ever sees a request. The
//! commitment (SHA-256 over the base64url header exactly as transmitted)
//! rides to the OP in the `nonce` parameter, which is how the ID token ends
//! up bound to the key.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::jose::jws::{b64url_encode, decode_json_segment, JoseError};
use crate::jose::Jwk;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CicProtected {
    pub alg: String,
    pub jwk: Jwk,
    /// 256-bit random value; makes the commitment unpredictable even for a
    /// reused key.
    pub rz: String,
}

#[derive(Debug, Clone)]
pub struct Cic {
    protected_b64: String,
    protected: CicProtected,
}

impl Cic {
    /// Build fresh client-instance claims for an ephemeral key.
    pub fn new(alg: &str, jwk: Jwk) -> Self {
        let mut rz = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut rz);
        let protected = CicProtected {
            alg: alg.to_string(),
            jwk,
            rz: URL_SAFE_NO_PAD.encode(rz),
        };
        let protected_b64 =
            b64url_encode(serde_json::to_vec(&protected).expect("CIC header serializes"));
        Cic {
            protected_b64,
            protected,
        }
    }

    /// Reconstruct from a transmitted header segment, keeping the original
    /// bytes so the commitment stays stable.
    pub fn parse_b64(protected_b64: &str) -> Result<Self, JoseError> {
        let protected: CicProtected = decode_json_segment(protected_b64)?;
        Ok(Cic {
            protected_b64: protected_b64.to_string(),
            protected,
        })
    }

    pub fn protected_b64(&self) -> &str {
        &self.protected_b64
    }

    pub fn protected(&self) -> &CicProtected {
        &self.protected
    }

    pub fn jwk(&self) -> &Jwk {
        &self.protected.jwk
    }

    /// The value the client passes as the OIDC `nonce`.
    pub fn commitment(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.protected_b64.as_bytes()))
    }
}
