//! PK Tokens: three signatures over one shared payload.
//!
//! The `op` pair is the OP's RS256 signature (or its GQ transform), the
//! `cic` pair is the client's proof of possession under the ephemeral key,
//! and `cos` is an optional cosigner. All three protected headers reference
//! the same payload segment.

pub mod cic;

pub use cic::{Cic, CicProtected};

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::errors::ErrorCode;
use crate::gq::{GqError, GqSignerVerifier};
use crate::jose::jws::{
    b64url_decode, b64url_encode, decode_json_segment, signing_input, CompactJws, JoseError,
};
use crate::jose::Jwk;
use crate::oidc::jwks::{JwksError, OpKeyResolver};
use crate::ssh::keys::EphemeralKey;

/// Tolerance on `iat`, in seconds.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum PkTokenError {
    #[error(transparent)]
    Jose(#[from] JoseError),

    #[error(transparent)]
    Gq(#[from] GqError),

    #[error(transparent)]
    Jwks(#[from] JwksError),

    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("payload nonce does not commit to the client instance claims")]
    NonceMismatch,

    #[error("token expired at {exp}")]
    Expired { exp: i64 },

    #[error("issued-at {iat} outside tolerance of now {now}")]
    ClockSkew { iat: i64, now: i64 },

    #[error("issuer {0} is not a configured provider")]
    UnknownIssuer(String),
}

impl PkTokenError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PkTokenError::Jose(e) => e.code(),
            PkTokenError::Gq(e) => e.code(),
            PkTokenError::Jwks(e) => e.code(),
            PkTokenError::MissingField(_) => ErrorCode::MalformedInput,
            PkTokenError::NonceMismatch => ErrorCode::NonceMismatch,
            PkTokenError::Expired { .. } => ErrorCode::Expired,
            PkTokenError::ClockSkew { .. } => ErrorCode::ClockSkew,
            PkTokenError::UnknownIssuer(_) => ErrorCode::UnknownIssuer,
        }
    }
}

/// `aud` as string or array, as OPs emit both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Audience::One(s) => s == value,
            Audience::Many(v) => v.iter().any(|s| s == value),
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            Audience::One(s) => vec![s.as_str()],
            Audience::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// The payload claims the verify path consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
}

/// Minimal view of the `op` protected header.
#[derive(Debug, Clone, Deserialize)]
pub struct OpProtected {
    pub alg: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub typ: Option<String>,
}

/// Serialized form: every field a base64url segment, field order fixed so a
/// parse/serialize round trip is byte-exact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PkToken {
    pub payload: String,
    pub op_protected: String,
    pub op_signature: String,
    pub cic_protected: String,
    pub cic_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cos_protected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cos_signature: Option<String>,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub claims: IdClaims,
    pub ephemeral_key: Jwk,
}

impl PkToken {
    /// Assemble a PK Token from a (possibly GQ-transformed) ID token, the
    /// ephemeral key, and the CIC used at authorization time.
    ///
    /// The CIC/payload binding looks circular but is a build order: the CIC
    /// header existed first, its commitment went to the OP as `nonce`, and
    /// only now does the client sign `(cic_header, payload)`.
    pub fn build(id_token: &str, key: &EphemeralKey, cic: &Cic) -> Result<Self, PkTokenError> {
        let jws = CompactJws::split(id_token)?;
        let cic_sig = key.sign(&signing_input(cic.protected_b64(), &jws.payload));
        Ok(PkToken {
            payload: jws.payload,
            op_protected: jws.protected,
            op_signature: jws.signature,
            cic_protected: cic.protected_b64().to_string(),
            cic_signature: b64url_encode(cic_sig),
            cos_protected: None,
            cos_signature: None,
        })
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("PK Token serializes")
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, PkTokenError> {
        let pkt: PkToken =
            serde_json::from_slice(bytes).map_err(|e| JoseError::Json(e.to_string()))?;
        pkt.check_fields()?;
        Ok(pkt)
    }

    /// Compact wire form: base64url of the JSON serialization.
    pub fn to_compact(&self) -> String {
        b64url_encode(self.to_json())
    }

    pub fn from_compact(compact: &str) -> Result<Self, PkTokenError> {
        let bytes = b64url_decode(compact)?;
        Self::from_json(&bytes)
    }

    fn check_fields(&self) -> Result<(), PkTokenError> {
        if self.payload.is_empty() {
            return Err(PkTokenError::MissingField("payload"));
        }
        if self.op_protected.is_empty() || self.op_signature.is_empty() {
            return Err(PkTokenError::MissingField("op"));
        }
        if self.cic_protected.is_empty() || self.cic_signature.is_empty() {
            return Err(PkTokenError::MissingField("cic"));
        }
        Ok(())
    }

    pub fn op_header(&self) -> Result<OpProtected, PkTokenError> {
        Ok(decode_json_segment(&self.op_protected)?)
    }

    pub fn claims(&self) -> Result<IdClaims, PkTokenError> {
        Ok(decode_json_segment(&self.payload)?)
    }

    /// The full payload as JSON, for display.
    pub fn claims_value(&self) -> Result<serde_json::Value, PkTokenError> {
        Ok(decode_json_segment(&self.payload)?)
    }

    pub fn cic(&self) -> Result<Cic, PkTokenError> {
        Ok(Cic::parse_b64(&self.cic_protected)?)
    }

    /// Verify against the current clock.
    pub fn verify(
        &self,
        resolver: &dyn OpKeyResolver,
        issuers: &[String],
    ) -> Result<VerifiedIdentity, PkTokenError> {
        self.verify_at(
            resolver,
            issuers,
            chrono::Utc::now().timestamp(),
            DEFAULT_CLOCK_SKEW_SECS,
        )
    }

    /// Verify with an explicit clock, used for boundary tests.
    pub fn verify_at(
        &self,
        resolver: &dyn OpKeyResolver,
        issuers: &[String],
        now: i64,
        skew: i64,
    ) -> Result<VerifiedIdentity, PkTokenError> {
        self.check_fields()?;
        let claims = self.claims()?;

        if !issuers.iter().any(|i| i == &claims.iss) {
            return Err(PkTokenError::UnknownIssuer(claims.iss));
        }

        let op_header = self.op_header()?;
        let kid = op_header
            .kid
            .as_deref()
            .ok_or(PkTokenError::MissingField("kid"))?;
        let op_key = resolver.resolve(&claims.iss, kid)?;

        match op_header.alg.as_str() {
            "GQ256" => {
                let sv = GqSignerVerifier::new(&op_key, 256)?;
                sv.verify_parts(&self.op_protected, &self.payload, &self.op_signature)?;
            }
            "RS256" => {
                let jwk = Jwk::from_rsa(&op_key);
                let sig = b64url_decode(&self.op_signature)?;
                jwk.verify(&signing_input(&self.op_protected, &self.payload), &sig)?;
            }
            other => {
                return Err(JoseError::UnsupportedAlgorithm(other.to_string()).into());
            }
        }

        let cic = self.cic()?;
        let commitment = cic.commitment();
        // Providers that cannot carry a nonce put the commitment in `aud`.
        let committed = match &claims.nonce {
            Some(nonce) => ct_eq(nonce, &commitment),
            None => claims
                .aud
                .values()
                .iter()
                .any(|aud| ct_eq(aud, &commitment)),
        };
        if !committed {
            return Err(PkTokenError::NonceMismatch);
        }

        let cic_sig = b64url_decode(&self.cic_signature)?;
        cic.jwk().verify(
            &signing_input(&self.cic_protected, &self.payload),
            &cic_sig,
        )?;

        if claims.exp <= now {
            return Err(PkTokenError::Expired { exp: claims.exp });
        }
        if (claims.iat - now).abs() > skew {
            return Err(PkTokenError::ClockSkew {
                iat: claims.iat,
                now,
            });
        }

        Ok(VerifiedIdentity {
            ephemeral_key: cic.jwk().clone(),
            claims,
        })
    }
}

fn ct_eq(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
