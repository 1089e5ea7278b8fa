//! Structured audit events.
//!
//! Events are serde-serialized JSON lines appended to the opkssh log
//! (`/var/log/opkssh.log` by default, `--log-dir` on the login side).
//! The verify path writes exactly one event per invocation and nothing to
//! stdout on failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::files::Fs;

pub const LOG_FILE_NAME: &str = "opkssh.log";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum AuditEvent {
    /// Verify emitted an authorized_keys line.
    #[serde(rename = "AUTH_GRANTED")]
    AuthGranted {
        timestamp: String,
        session_id: String,
        principal: String,
        issuer: String,
        sub: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },

    /// Verify denied the request.
    #[serde(rename = "AUTH_DENIED")]
    AuthDenied {
        timestamp: String,
        session_id: String,
        principal: String,
        code: String,
        reason: String,
    },

    /// Login wrote a fresh key and certificate.
    #[serde(rename = "LOGIN_COMPLETED")]
    LoginCompleted {
        timestamp: String,
        issuer: String,
        sub: String,
        key_path: String,
    },
}

impl AuditEvent {
    pub fn auth_granted(
        session_id: &str,
        principal: &str,
        issuer: &str,
        sub: &str,
        email: Option<&str>,
    ) -> Self {
        AuditEvent::AuthGranted {
            timestamp: now_rfc3339(),
            session_id: session_id.to_string(),
            principal: principal.to_string(),
            issuer: issuer.to_string(),
            sub: sub.to_string(),
            email: email.map(String::from),
        }
    }

    pub fn auth_denied(session_id: &str, principal: &str, code: &str, reason: &str) -> Self {
        AuditEvent::AuthDenied {
            timestamp: now_rfc3339(),
            session_id: session_id.to_string(),
            principal: principal.to_string(),
            code: code.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn login_completed(issuer: &str, sub: &str, key_path: &Path) -> Self {
        AuditEvent::LoginCompleted {
            timestamp: now_rfc3339(),
            issuer: issuer.to_string(),
            sub: sub.to_string(),
            key_path: key_path.display().to_string(),
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn new_session_id() -> String {
    format!("opkssh-{}", uuid::Uuid::new_v4())
}

/// Append-only event sink. Logging failures are reported on the tracing
/// side and never abort an authentication decision.
pub struct AuditLog {
    fs: Arc<dyn Fs>,
    path: PathBuf,
}

impl AuditLog {
    pub fn new(fs: Arc<dyn Fs>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn log(&self, event: &AuditEvent) {
        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "audit event failed to serialize");
                return;
            }
        };
        line.push(b'\n');
        if let Err(e) = self.fs.append(&self.path, &line) {
            warn!(path = %self.path.display(), error = %e, "audit append failed");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
