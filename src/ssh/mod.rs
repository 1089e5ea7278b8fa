//! SSH key material and the certificate carrying the PK Token.

pub mod cert;
pub mod keys;

pub use cert::{issue_certificate, parse_and_extract, ParsedCert, PKT_EXTENSION};
pub use keys::{authorized_key_line, key_data_from_jwk, EphemeralKey, KeyAlg};

use thiserror::Error;

use crate::errors::ErrorCode;
use crate::jose::JoseError;
use crate::pktoken::PkTokenError;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("ssh key error: {0}")]
    Key(#[from] ssh_key::Error),

    #[error("invalid key material: {0}")]
    Jose(#[from] JoseError),

    #[error(transparent)]
    PkToken(#[from] PkTokenError),

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("invalid certificate encoding: {0}")]
    Encoding(String),

    #[error("certificate is not a user certificate")]
    NotUserCert,

    #[error("certificate carries no PK token extension")]
    MissingPkToken,

    #[error("certificate key does not match the PK token client key")]
    KeyMismatch,

    #[error("certificate validity window has passed")]
    CertExpired,

    #[error("certificate is not yet valid")]
    CertNotYetValid,

    #[error("certificate signature verification failed")]
    BadSignature,

    #[error("client key algorithm cannot back an SSH certificate")]
    UnsupportedClientKey,
}

impl SshError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SshError::Key(_)
            | SshError::Encoding(_)
            | SshError::NotUserCert
            | SshError::MissingPkToken
            | SshError::UnsupportedKeyType(_)
            | SshError::UnsupportedClientKey => ErrorCode::MalformedInput,
            SshError::Jose(e) => e.code(),
            SshError::PkToken(e) => e.code(),
            SshError::KeyMismatch | SshError::BadSignature => ErrorCode::SigInvalid,
            SshError::CertExpired | SshError::CertNotYetValid => ErrorCode::Expired,
        }
    }
}
