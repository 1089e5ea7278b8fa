//! OpenSSH certificates as the PK Token transport.
//!
//! The login side wraps the ephemeral public key in a self-signed user
//! certificate whose `openpubkey-pkt` extension carries the compact PK
//! Token; the verify side unwraps it and cross-checks the certificate key
//! against the client key committed inside the token.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use ssh_key::certificate::{Builder, CertType};
use ssh_key::{Certificate, HashAlg, PublicKey};

use super::keys::{key_data_from_jwk, EphemeralKey};
use super::SshError;
use crate::pktoken::PkToken;

/// Extension key carrying the compact PK Token.
pub const PKT_EXTENSION: &str = "openpubkey-pkt";

/// Certificates start slightly in the past so a freshly issued one survives
/// modest clock differences.
const VALID_AFTER_BACKDATE_SECS: u64 = 60;

/// Certificate algorithm names accepted from sshd's `%t`.
const KNOWN_CERT_TYPES: &[&str] = &[
    "ssh-ed25519-cert-v01@openssh.com",
    "ecdsa-sha2-nistp256-cert-v01@openssh.com",
];

/// Result of parsing an authorized-key blob on the verify side.
#[derive(Debug)]
pub struct ParsedCert {
    pub cert: Certificate,
    pub pkt: PkToken,
}

/// Issue the self-signed user certificate for a verified PK Token.
///
/// `valid-before` is the ID token's `exp`: the certificate never outlives
/// the identity it carries.
pub fn issue_certificate(
    pkt: &PkToken,
    key: &EphemeralKey,
    principals: &[String],
) -> Result<Certificate, SshError> {
    let claims = pkt.claims()?;
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    let valid_after = now.saturating_sub(VALID_AFTER_BACKDATE_SECS);
    let valid_before = claims.exp.max(0) as u64;

    let mut builder = Builder::new_with_random_nonce(
        &mut OsRng,
        key.public_key_data(),
        valid_after,
        valid_before,
    )?;
    builder.serial(rand::random::<u64>())?;
    builder.key_id(claims.sub)?;
    builder.cert_type(CertType::User)?;
    if principals.is_empty() {
        builder.all_principals_valid()?;
    } else {
        for principal in principals {
            builder.valid_principal(principal.clone())?;
        }
    }
    builder.extension(PKT_EXTENSION, pkt.to_compact())?;

    Ok(builder.sign(key.ssh_private())?)
}

pub fn known_cert_type(key_type: &str) -> bool {
    KNOWN_CERT_TYPES.contains(&key_type)
}

/// Parse sshd's `%k`/`%t` pair and recover the embedded PK Token.
pub fn parse_and_extract(blob_b64: &str, key_type: &str) -> Result<ParsedCert, SshError> {
    parse_and_extract_at(
        blob_b64,
        key_type,
        chrono::Utc::now().timestamp().max(0) as u64,
    )
}

pub fn parse_and_extract_at(
    blob_b64: &str,
    key_type: &str,
    now: u64,
) -> Result<ParsedCert, SshError> {
    if !known_cert_type(key_type) {
        return Err(SshError::UnsupportedKeyType(key_type.to_string()));
    }

    let blob = STANDARD
        .decode(blob_b64.trim())
        .map_err(|e| SshError::Encoding(e.to_string()))?;
    let cert = Certificate::from_bytes(&blob)?;

    if cert.cert_type() != CertType::User {
        return Err(SshError::NotUserCert);
    }

    let pkt_compact = cert
        .extensions()
        .iter()
        .find(|(name, _)| name.as_str() == PKT_EXTENSION)
        .map(|(_, value)| value.clone())
        .ok_or(SshError::MissingPkToken)?;
    let pkt = PkToken::from_compact(&pkt_compact)?;

    // The certified key, the CA key, and the key committed in the CIC
    // header must all be the same ephemeral key.
    let client_key = key_data_from_jwk(pkt.cic()?.jwk())?;
    if cert.public_key() != &client_key {
        return Err(SshError::KeyMismatch);
    }
    if cert.signature_key() != &client_key {
        return Err(SshError::BadSignature);
    }

    if now < cert.valid_after() {
        return Err(SshError::CertNotYetValid);
    }
    if now >= cert.valid_before() {
        return Err(SshError::CertExpired);
    }

    let ca_fingerprint = PublicKey::from(client_key).fingerprint(HashAlg::Sha256);
    cert.validate_at(now, [&ca_fingerprint])
        .map_err(|_| SshError::BadSignature)?;

    Ok(ParsedCert { cert, pkt })
}
