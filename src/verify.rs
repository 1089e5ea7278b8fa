//! Server-side verification, invoked by sshd as
//! `opkssh verify <user> <key-blob-b64> <key-type>`.
//!
//! The path is strictly sequential: certificate parse, PK Token
//! verification against the OP's published keys, then policy. Success
//! yields exactly one `authorized_keys` line on stdout; every failure is an
//! audit event and empty stdout, which sshd treats as "no match".

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::audit::{new_session_id, AuditEvent, AuditLog};
use crate::config::{ConfigError, ServerProvider};
use crate::errors::ErrorCode;
use crate::oidc::jwks::OpKeyResolver;
use crate::pktoken::PkTokenError;
use crate::policy::{PolicyEngine, PolicyError};
use crate::ssh::{authorized_key_line, key_data_from_jwk, parse_and_extract, SshError};

/// Options prefixed to the emitted authorized_keys line.
const KEY_OPTIONS: &str = "restrict,pty";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    PkToken(#[from] PkTokenError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl VerifyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            VerifyError::Ssh(e) => e.code(),
            VerifyError::PkToken(e) => e.code(),
            VerifyError::Policy(e) => e.code(),
            VerifyError::Config(e) => e.code(),
        }
    }
}

/// Everything the verify path needs, assembled once at entry.
pub struct VerifyContext {
    pub providers: Vec<ServerProvider>,
    pub resolver: Box<dyn OpKeyResolver>,
    pub policy: PolicyEngine,
    pub audit: Arc<AuditLog>,
}

impl VerifyContext {
    fn issuers(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.issuer.clone()).collect()
    }
}

/// Run the verification pipeline and log the outcome. Returns the
/// authorized_keys line to print.
pub fn run_verify(
    ctx: &VerifyContext,
    principal: &str,
    key_blob_b64: &str,
    key_type: &str,
) -> Result<String, VerifyError> {
    let session_id = new_session_id();

    match verify_inner(ctx, principal, key_blob_b64, key_type) {
        Ok((line, issuer, sub, email)) => {
            ctx.audit.log(&AuditEvent::auth_granted(
                &session_id,
                principal,
                &issuer,
                &sub,
                email.as_deref(),
            ));
            info!(principal, issuer = %issuer, "authentication granted");
            Ok(line)
        }
        Err(e) => {
            ctx.audit.log(&AuditEvent::auth_denied(
                &session_id,
                principal,
                e.code().as_str(),
                &e.to_string(),
            ));
            Err(e)
        }
    }
}

fn verify_inner(
    ctx: &VerifyContext,
    principal: &str,
    key_blob_b64: &str,
    key_type: &str,
) -> Result<(String, String, String, Option<String>), VerifyError> {
    let parsed = parse_and_extract(key_blob_b64, key_type)?;

    let identity = parsed
        .pkt
        .verify(ctx.resolver.as_ref(), &ctx.issuers())?;

    ctx.policy.authorize(&identity.claims, principal)?;

    let key_data = key_data_from_jwk(&identity.ephemeral_key)?;
    let line = authorized_key_line(&key_data, KEY_OPTIONS)?;

    Ok((
        line,
        identity.claims.iss,
        identity.claims.sub,
        identity.claims.email,
    ))
}
