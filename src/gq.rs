//! Guillou–Quisquater transform of RSA-PKCS#1 v1.5 signatures.
//!
//! An OP signs ID tokens with RS256. Shipping that signature around means a
//! leaked token can be replayed to any relying party that trusts the OP key.
//! The GQ transform replaces the signature with a non-interactive proof that
//! the prover held a valid signature, so the transformed token convinces a
//! verifier without carrying the signature itself.
//!
//! Pinned variant: the GQ exponent is the RSA public exponent `e` and the
//! verification equation is the RSA one, `x^e ≡ y (mod N)`. The security
//! parameter ν ∈ {128, 256} fixes the encoded challenge width; the challenge
//! value is reduced mod `e`, so effective soundness is min(ν, |e|) bits.
//!
//! Prove, for a token `H.P.S` with `σ = decode(S)` and `σ^e ≡ y (mod N)`
//! where `y` is the EMSA-PKCS1-v1_5 encoding of SHA-256("H.P"):
//!   r ← Z*_N, T = r^e mod N, c = H_GQ(N, e, key, identity, T) mod e,
//!   z = r·σ^c mod N, signature = c‖z at fixed widths.
//! Verify: T' = z^e · y^{-c} mod N, accept iff c = H_GQ(..., T') mod e.

use num_bigint_dig::{ModInverse, RandBigInt};
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::errors::ErrorCode;
use crate::jose::jws::{b64url_decode, b64url_encode, CompactJws, JoseError};
use crate::jose::Jwk;

/// Domain separation tag for the Fiat–Shamir challenge hash.
const CHALLENGE_DST: &[u8] = b"opkssh-gq-challenge-v1";

#[derive(Debug, Error)]
pub enum GqError {
    #[error("security parameter must be 128 or 256, got {0}")]
    InvalidSecurityParameter(usize),

    #[error("malformed JWS: {0}")]
    Jws(#[from] JoseError),

    #[error("token algorithm {0} cannot be GQ-transformed")]
    NotRs256(String),

    #[error("signature length {got} does not match expected {want}")]
    SignatureLength { got: usize, want: usize },

    #[error("signature value out of range for the modulus")]
    OutOfRange,

    #[error("GQ header is missing the original protected header")]
    MissingOriginalHeader,

    #[error("challenge mismatch")]
    ChallengeMismatch,

    #[error("modulus too small for EMSA-PKCS1-v1_5")]
    ModulusTooSmall,
}

impl GqError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GqError::InvalidSecurityParameter(_) => ErrorCode::ConfigurationError,
            GqError::Jws(e) => e.code(),
            GqError::NotRs256(_) | GqError::MissingOriginalHeader => ErrorCode::MalformedInput,
            GqError::SignatureLength { .. }
            | GqError::OutOfRange
            | GqError::ChallengeMismatch
            | GqError::ModulusTooSmall => ErrorCode::SigInvalid,
        }
    }
}

/// Protected header of a GQ-transformed token. `kid` is carried over from
/// the original header so key resolution is unchanged; `oph` is the original
/// protected segment, needed to rebuild the signing input the OP signed
/// without re-serializing JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GqProtected {
    pub alg: String,
    pub typ: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub kid: Option<String>,
    pub oph: String,
    pub jkt: String,
}

#[derive(Debug, Deserialize)]
struct OriginalProtected {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

pub struct GqSignerVerifier {
    n: BigUint,
    e: BigUint,
    nu_bits: usize,
    modulus_len: usize,
    pubkey_der: Vec<u8>,
    jkt: String,
}

impl GqSignerVerifier {
    pub fn new(op_key: &RsaPublicKey, nu_bits: usize) -> Result<Self, GqError> {
        if nu_bits != 128 && nu_bits != 256 {
            return Err(GqError::InvalidSecurityParameter(nu_bits));
        }
        let pubkey_der = op_key
            .to_pkcs1_der()
            .map_err(|e| GqError::Jws(JoseError::InvalidKey(e.to_string())))?
            .into_vec();
        Ok(Self {
            n: op_key.n().clone(),
            e: op_key.e().clone(),
            nu_bits,
            modulus_len: op_key.size(),
            pubkey_der,
            jkt: Jwk::from_rsa(op_key).thumbprint(),
        })
    }

    pub fn alg(&self) -> &'static str {
        if self.nu_bits == 256 {
            "GQ256"
        } else {
            "GQ128"
        }
    }

    fn challenge_len(&self) -> usize {
        self.nu_bits / 8
    }

    /// Transform an RS256 token `H.P.S` into a GQ-signed token over the same
    /// payload. The original RSA signature is consumed and not emitted.
    pub fn sign_jwt(&self, id_token: &str) -> Result<String, GqError> {
        let jws = CompactJws::split(id_token)?;
        let original: OriginalProtected = jws.decode_protected()?;
        if original.alg != "RS256" {
            return Err(GqError::NotRs256(original.alg));
        }

        let sigma_bytes = jws.decode_signature()?;
        if sigma_bytes.len() != self.modulus_len {
            return Err(GqError::SignatureLength {
                got: sigma_bytes.len(),
                want: self.modulus_len,
            });
        }
        let sigma = BigUint::from_bytes_be(&sigma_bytes);
        if sigma.bits() == 0 || sigma >= self.n {
            return Err(GqError::OutOfRange);
        }

        let identity = jws.signing_input();

        // r must be a unit mod N. A random value below N that shares a
        // factor with N would factor the OP key; rejecting zero is enough.
        let mut rng = rand::thread_rng();
        let r = loop {
            let candidate = rng.gen_biguint_below(&self.n);
            if candidate.bits() != 0 {
                break candidate;
            }
        };

        let t = r.modpow(&self.e, &self.n);
        let c = self.challenge(&identity, &t);
        let z = (r * sigma.modpow(&c, &self.n)) % &self.n;

        let mut sig = to_fixed_be(&c, self.challenge_len());
        sig.extend_from_slice(&to_fixed_be(&z, self.modulus_len));

        let header = GqProtected {
            alg: self.alg().to_string(),
            typ: "JWT".to_string(),
            kid: original.kid,
            oph: jws.protected.clone(),
            jkt: self.jkt.clone(),
        };
        let header_b64 = b64url_encode(serde_json::to_vec(&header).expect("header serializes"));

        Ok(format!(
            "{}.{}.{}",
            header_b64,
            jws.payload,
            b64url_encode(&sig)
        ))
    }

    /// Verify a full GQ-transformed compact token.
    pub fn verify_jws(&self, gq_token: &str) -> Result<(), GqError> {
        let jws = CompactJws::split(gq_token)?;
        self.verify_parts(&jws.protected, &jws.payload, &jws.signature)
    }

    /// Verify from the three transmitted segments. Used by PK Token
    /// verification, where the segments arrive separately.
    pub fn verify_parts(
        &self,
        protected_b64: &str,
        payload_b64: &str,
        signature_b64: &str,
    ) -> Result<(), GqError> {
        let header: GqProtected =
            crate::jose::jws::decode_json_segment(protected_b64).map_err(GqError::Jws)?;
        if header.oph.is_empty() {
            return Err(GqError::MissingOriginalHeader);
        }
        let identity = crate::jose::jws::signing_input(&header.oph, payload_b64);
        let sig = b64url_decode(signature_b64)?;
        self.verify(&identity, &sig)
    }

    /// Core verification over the original signing input and the `c‖z`
    /// signature bytes.
    pub fn verify(&self, identity: &[u8], signature: &[u8]) -> Result<(), GqError> {
        let want = self.challenge_len() + self.modulus_len;
        if signature.len() != want {
            return Err(GqError::SignatureLength {
                got: signature.len(),
                want,
            });
        }
        let (c_bytes, z_bytes) = signature.split_at(self.challenge_len());
        let c = BigUint::from_bytes_be(c_bytes);
        let z = BigUint::from_bytes_be(z_bytes);
        if c >= self.e {
            return Err(GqError::OutOfRange);
        }
        if z.bits() == 0 || z >= self.n {
            return Err(GqError::OutOfRange);
        }

        let y = emsa_pkcs1_v15_sha256(identity, self.modulus_len)?;
        let y_inv = (&y)
            .mod_inverse(&self.n)
            .and_then(|i| i.to_biguint())
            .ok_or(GqError::OutOfRange)?;

        let t = (z.modpow(&self.e, &self.n) * y_inv.modpow(&c, &self.n)) % &self.n;
        if self.challenge(identity, &t) != c {
            return Err(GqError::ChallengeMismatch);
        }
        Ok(())
    }

    /// Fiat–Shamir challenge: SHA-256 expanded with a counter to ν bits over
    /// the length-prefixed public parameters, identity, and commitment, then
    /// reduced mod e.
    fn challenge(&self, identity: &[u8], t: &BigUint) -> BigUint {
        let n_bytes = self.n.to_bytes_be();
        let e_bytes = self.e.to_bytes_be();
        let t_bytes = to_fixed_be(t, self.modulus_len);

        let needed = self.challenge_len();
        let mut material = Vec::with_capacity(needed + 32);
        let mut counter: u32 = 0;
        while material.len() < needed {
            let mut hasher = Sha256::new();
            hasher.update(CHALLENGE_DST);
            hasher.update(counter.to_be_bytes());
            for part in [
                n_bytes.as_slice(),
                e_bytes.as_slice(),
                self.pubkey_der.as_slice(),
                identity,
                t_bytes.as_slice(),
            ] {
                hasher.update((part.len() as u64).to_be_bytes());
                hasher.update(part);
            }
            material.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        material.truncate(needed);
        BigUint::from_bytes_be(&material) % &self.e
    }
}

/// Big-endian encoding left-padded to `len` bytes.
fn to_fixed_be(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    debug_assert!(bytes.len() <= len);
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

/// EMSA-PKCS1-v1_5 encoding of SHA-256(message) for a k-byte modulus: the
/// exact representative the OP's RS256 signature is a root of.
fn emsa_pkcs1_v15_sha256(message: &[u8], k: usize) -> Result<BigUint, GqError> {
    // ASN.1 DigestInfo prefix for SHA-256.
    const PREFIX: [u8; 19] = [
        0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
        0x05, 0x00, 0x04, 0x20,
    ];
    let t_len = PREFIX.len() + 32;
    if k < t_len + 11 {
        return Err(GqError::ModulusTooSmall);
    }
    let digest = Sha256::digest(message);
    let mut em = Vec::with_capacity(k);
    em.push(0x00);
    em.push(0x01);
    em.resize(k - t_len - 1, 0xff);
    em.push(0x00);
    em.extend_from_slice(&PREFIX);
    em.extend_from_slice(&digest);
    Ok(BigUint::from_bytes_be(&em))
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;

    static OP_KEY: Lazy<RsaPrivateKey> =
        Lazy::new(|| RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("keygen"));

    fn mint_rs256(payload_json: &str) -> String {
        let header = r#"{"alg":"RS256","typ":"JWT","kid":"kid-1"}"#;
        let signing_input = format!(
            "{}.{}",
            b64url_encode(header.as_bytes()),
            b64url_encode(payload_json.as_bytes())
        );
        let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(OP_KEY.clone());
        let sig = signer.sign(signing_input.as_bytes()).to_bytes();
        format!("{}.{}", signing_input, b64url_encode(&sig))
    }

    #[test]
    fn test_prove_then_verify_256() {
        let token = mint_rs256(r#"{"sub":"1","iss":"test","aud":"test"}"#);
        let sv = GqSignerVerifier::new(&OP_KEY.to_public_key(), 256).unwrap();
        let gq = sv.sign_jwt(&token).unwrap();
        sv.verify_jws(&gq).unwrap();
    }

    #[test]
    fn test_prove_then_verify_128() {
        let token = mint_rs256(r#"{"sub":"2","iss":"test","aud":"test"}"#);
        let sv = GqSignerVerifier::new(&OP_KEY.to_public_key(), 128).unwrap();
        let gq = sv.sign_jwt(&token).unwrap();
        assert!(gq.contains('.'));
        sv.verify_jws(&gq).unwrap();
    }

    #[test]
    fn test_transformed_token_drops_rsa_signature() {
        let token = mint_rs256(r#"{"sub":"3","iss":"test","aud":"test"}"#);
        let original_sig = CompactJws::split(&token).unwrap().signature;
        let sv = GqSignerVerifier::new(&OP_KEY.to_public_key(), 256).unwrap();
        let gq = sv.sign_jwt(&token).unwrap();
        assert!(!gq.contains(&original_sig));
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let token = mint_rs256(r#"{"sub":"4","iss":"test","aud":"test"}"#);
        let sv = GqSignerVerifier::new(&OP_KEY.to_public_key(), 256).unwrap();
        let gq = sv.sign_jwt(&token).unwrap();
        let mut jws = CompactJws::split(&gq).unwrap();
        jws.payload = b64url_encode(br#"{"sub":"evil","iss":"test","aud":"test"}"#);
        assert!(matches!(
            sv.verify_jws(&jws.to_compact()),
            Err(GqError::ChallengeMismatch)
        ));
    }

    #[test]
    fn test_verify_rejects_tampered_challenge() {
        let token = mint_rs256(r#"{"sub":"5","iss":"test","aud":"test"}"#);
        let sv = GqSignerVerifier::new(&OP_KEY.to_public_key(), 256).unwrap();
        let gq = sv.sign_jwt(&token).unwrap();
        let mut jws = CompactJws::split(&gq).unwrap();
        let mut sig = jws.decode_signature().unwrap();
        // Flip a bit in the low byte of c, keeping it below e.
        sig[31] ^= 0x01;
        jws.signature = b64url_encode(&sig);
        assert!(sv.verify_jws(&jws.to_compact()).is_err());
    }

    #[test]
    fn test_signature_width_is_fixed() {
        let token = mint_rs256(r#"{"sub":"6","iss":"test","aud":"test"}"#);
        let sv = GqSignerVerifier::new(&OP_KEY.to_public_key(), 256).unwrap();
        let gq = sv.sign_jwt(&token).unwrap();
        let sig = CompactJws::split(&gq).unwrap().decode_signature().unwrap();
        assert_eq!(sig.len(), 32 + 256);
    }

    #[test]
    fn test_rejects_bad_security_parameter() {
        assert!(matches!(
            GqSignerVerifier::new(&OP_KEY.to_public_key(), 192),
            Err(GqError::InvalidSecurityParameter(192))
        ));
    }

    #[test]
    fn test_rejects_truncated_signature() {
        let token = mint_rs256(r#"{"sub":"7","iss":"test","aud":"test"}"#);
        let sv = GqSignerVerifier::new(&OP_KEY.to_public_key(), 256).unwrap();
        let gq = sv.sign_jwt(&token).unwrap();
        let mut jws = CompactJws::split(&gq).unwrap();
        let sig = jws.decode_signature().unwrap();
        jws.signature = b64url_encode(&sig[..sig.len() - 1]);
        assert!(matches!(
            sv.verify_jws(&jws.to_compact()),
            Err(GqError::SignatureLength { .. })
        ));
    }

    #[test]
    fn test_emsa_matches_rsa_signature() {
        // σ^e mod N must equal the EMSA encoding the verifier rebuilds.
        let token = mint_rs256(r#"{"sub":"8","iss":"test","aud":"test"}"#);
        let jws = CompactJws::split(&token).unwrap();
        let public = OP_KEY.to_public_key();
        let sigma = BigUint::from_bytes_be(&jws.decode_signature().unwrap());
        let y = emsa_pkcs1_v15_sha256(&jws.signing_input(), public.size()).unwrap();
        assert_eq!(sigma.modpow(public.e(), public.n()), y);
    }
}
