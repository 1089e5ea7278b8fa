//! OpenID Provider interaction: provider variants, the authorization-code
//! login flow, and signing-key discovery.

pub mod client;
pub mod jwks;
pub mod provider;

pub use client::AuthOptions;
pub use jwks::{CachingKeyResolver, HttpJwksFetch, JwksError, OpKeyResolver};
pub use provider::{GithubActionsProvider, MockProvider, OpenIdProvider, StandardProvider};

use thiserror::Error;

use crate::errors::ErrorCode;
use crate::jose::JoseError;

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("no configured loopback port is available")]
    NoPort,

    #[error("authorization timed out waiting for the redirect")]
    Timeout,

    #[error("redirect state does not match the request")]
    StateMismatch,

    #[error("authorization endpoint returned an error: {0}")]
    AuthorizationDenied(String),

    #[error("token exchange failed: {0}")]
    Exchange(String),

    #[error("ID token failed validation: {0}")]
    TokenInvalid(String),

    #[error("ID token nonce does not match the client commitment")]
    NonceMismatch,

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error(transparent)]
    Jwks(#[from] JwksError),

    #[error(transparent)]
    Jose(#[from] JoseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OidcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OidcError::Timeout => ErrorCode::IoTimeout,
            OidcError::Discovery(_)
            | OidcError::NoPort
            | OidcError::Exchange(_)
            | OidcError::AuthorizationDenied(_)
            | OidcError::Io(_) => ErrorCode::IoError,
            OidcError::StateMismatch | OidcError::TokenInvalid(_) => ErrorCode::SigInvalid,
            OidcError::NonceMismatch => ErrorCode::NonceMismatch,
            OidcError::MissingEnv(_) => ErrorCode::ConfigurationError,
            OidcError::Jwks(e) => e.code(),
            OidcError::Jose(e) => e.code(),
        }
    }
}
