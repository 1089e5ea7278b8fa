//! Local authorization policy.
//!
//! Policy lines map an OIDC identity to a UNIX principal:
//!
//! ```text
//! <principal> <matcher-kind> <matcher-value> <issuer>
//! ```
//!
//! with matcher-kind one of `email`, `sub`, `oidc:groups`, `oidc`. The
//! legacy three-field form `<principal> <email> <issuer>` is accepted with
//! an implied `email` matcher. `#` starts a comment; blank lines are
//! ignored; malformed lines are skipped with a warning.
//!
//! Sources merge in order: the system file, then the requested principal's
//! own `~/.ssh/auth_id` read through the privilege-separated helper. The
//! first matching entry wins.

pub mod readhome;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use crate::errors::ErrorCode;
use crate::files::Fs;
use crate::pktoken::IdClaims;

pub const SYSTEM_POLICY_PATH: &str = "/etc/opk/auth_id";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("no policy entry authorizes principal {0}")]
    Denied(String),

    #[error("issuer {0} is not a configured provider")]
    UnknownIssuer(String),

    #[error("failed to read policy: {0}")]
    Io(#[from] std::io::Error),
}

impl PolicyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PolicyError::Denied(_) => ErrorCode::PolicyDenied,
            PolicyError::UnknownIssuer(_) => ErrorCode::UnknownIssuer,
            PolicyError::Io(_) => ErrorCode::IoError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Email,
    Sub,
    Groups,
    /// Compatibility synonym for an exact `sub` match.
    Oidc,
}

impl MatcherKind {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "email" => Some(MatcherKind::Email),
            "sub" => Some(MatcherKind::Sub),
            "oidc:groups" => Some(MatcherKind::Groups),
            "oidc" => Some(MatcherKind::Oidc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    pub principal: String,
    pub kind: MatcherKind,
    pub value: String,
    pub issuer: String,
}

impl PolicyEntry {
    fn matches(&self, claims: &IdClaims, principal: &str) -> bool {
        if self.principal != principal || self.issuer != claims.iss {
            return false;
        }
        match self.kind {
            MatcherKind::Email => match &claims.email {
                Some(email) => email_eq(&self.value, email),
                None => false,
            },
            MatcherKind::Sub | MatcherKind::Oidc => self.value == claims.sub,
            MatcherKind::Groups => match &claims.groups {
                Some(groups) => groups.iter().any(|g| g == &self.value),
                None => false,
            },
        }
    }
}

/// Case-insensitive comparison after NFC normalization; email providers
/// treat the local part case-insensitively often enough that the original
/// behaves this way.
fn email_eq(a: &str, b: &str) -> bool {
    let normalize = |s: &str| s.nfc().collect::<String>().to_lowercase();
    normalize(a) == normalize(b)
}

/// Parse one policy file. Malformed lines are skipped, not fatal; a typo in
/// one entry must not lock every user out.
pub fn parse_policy(content: &str) -> Vec<PolicyEntry> {
    content
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [principal, value, issuer] => Some(PolicyEntry {
                    principal: principal.to_string(),
                    kind: MatcherKind::Email,
                    value: value.to_string(),
                    issuer: issuer.to_string(),
                }),
                [principal, kind, value, issuer] => match MatcherKind::parse(kind) {
                    Some(kind) => Some(PolicyEntry {
                        principal: principal.to_string(),
                        kind,
                        value: value.to_string(),
                        issuer: issuer.to_string(),
                    }),
                    None => {
                        warn!(line = idx + 1, matcher = %kind, "skipping policy line with unknown matcher");
                        None
                    }
                },
                _ => {
                    warn!(line = idx + 1, "skipping malformed policy line");
                    None
                }
            }
        })
        .collect()
}

/// Reads a principal's own `~/.ssh/auth_id`. The production implementation
/// shells out through sudo; tests substitute fixtures.
pub trait HomePolicyLoader: Send + Sync {
    fn read(&self, principal: &str) -> std::io::Result<String>;
}

/// Loader that never finds a user policy.
pub struct NoHomePolicy;

impl HomePolicyLoader for NoHomePolicy {
    fn read(&self, _principal: &str) -> std::io::Result<String> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "user policy disabled",
        ))
    }
}

pub struct PolicyEngine {
    fs: Arc<dyn Fs>,
    system_path: PathBuf,
    home_loader: Box<dyn HomePolicyLoader>,
}

impl PolicyEngine {
    pub fn new(
        fs: Arc<dyn Fs>,
        system_path: impl Into<PathBuf>,
        home_loader: Box<dyn HomePolicyLoader>,
    ) -> Self {
        Self {
            fs,
            system_path: system_path.into(),
            home_loader,
        }
    }

    /// Authorize `principal` for the verified claims. The user-local policy
    /// is consulted only when the system policy does not already match, so
    /// a failure reading it is non-fatal in the authorized case.
    pub fn authorize(&self, claims: &IdClaims, principal: &str) -> Result<(), PolicyError> {
        let system = self.load_system();
        if system.iter().any(|e| e.matches(claims, principal)) {
            return Ok(());
        }

        match self.home_loader.read(principal) {
            Ok(content) => {
                let user = parse_policy(&content);
                if user.iter().any(|e| e.matches(claims, principal)) {
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(principal, error = %e, "user policy unavailable");
            }
        }

        Err(PolicyError::Denied(principal.to_string()))
    }

    fn load_system(&self) -> Vec<PolicyEntry> {
        match self.fs.read_to_string(&self.system_path) {
            Ok(content) => parse_policy(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %self.system_path.display(), error = %e, "cannot read system policy");
                Vec::new()
            }
        }
    }

    /// Append an entry to the system policy (`opkssh add`).
    pub fn add_entry(&self, entry: &PolicyEntry) -> Result<(), PolicyError> {
        let line = match entry.kind {
            MatcherKind::Email => {
                format!("{} {} {}\n", entry.principal, entry.value, entry.issuer)
            }
            MatcherKind::Sub | MatcherKind::Oidc => format!(
                "{} sub {} {}\n",
                entry.principal, entry.value, entry.issuer
            ),
            MatcherKind::Groups => format!(
                "{} oidc:groups {} {}\n",
                entry.principal, entry.value, entry.issuer
            ),
        };
        self.fs.append(&self.system_path, line.as_bytes())?;
        Ok(())
    }
}

pub fn system_policy_path() -> &'static Path {
    Path::new(SYSTEM_POLICY_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::MemFs;
    use crate::pktoken::Audience;

    fn claims(sub: &str, email: Option<&str>, iss: &str) -> IdClaims {
        IdClaims {
            iss: iss.to_string(),
            sub: sub.to_string(),
            aud: Audience::One("cid".to_string()),
            exp: 0,
            iat: 0,
            nonce: None,
            email: email.map(String::from),
            groups: Some(vec!["admins".to_string()]),
        }
    }

    fn engine(system: &str) -> PolicyEngine {
        let fs = Arc::new(MemFs::new());
        fs.write(Path::new(SYSTEM_POLICY_PATH), system.as_bytes())
            .unwrap();
        PolicyEngine::new(fs, SYSTEM_POLICY_PATH, Box::new(NoHomePolicy))
    }

    struct FixtureHome(String);
    impl HomePolicyLoader for FixtureHome {
        fn read(&self, _principal: &str) -> std::io::Result<String> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parse_skips_comments_blanks_and_garbage() {
        let entries = parse_policy(
            "# comment\n\nalice email u@test https://op.test/\nbroken line\nbob sub s-1 https://op.test/\n",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, MatcherKind::Email);
        assert_eq!(entries[1].kind, MatcherKind::Sub);
    }

    #[test]
    fn test_single_matching_entry_allows_only_that_principal() {
        let engine = engine("alice email u@test https://op.test/\n");
        let claims = claims("u@test", Some("u@test"), "https://op.test/");
        assert!(engine.authorize(&claims, "alice").is_ok());
        let err = engine.authorize(&claims, "bob").unwrap_err();
        assert_eq!(err.code(), ErrorCode::PolicyDenied);
    }

    #[test]
    fn test_no_matching_entry_denies_everyone() {
        let engine = engine("alice email other@test https://op.test/\n");
        let claims = claims("u@test", Some("u@test"), "https://op.test/");
        for principal in ["alice", "bob", "root"] {
            assert!(engine.authorize(&claims, principal).is_err());
        }
    }

    #[test]
    fn test_issuer_must_match() {
        let engine = engine("alice email u@test https://other.op/\n");
        let claims = claims("u@test", Some("u@test"), "https://op.test/");
        assert!(engine.authorize(&claims, "alice").is_err());
    }

    #[test]
    fn test_email_match_is_case_insensitive() {
        let engine = engine("alice email U@Test https://op.test/\n");
        let claims = claims("u@test", Some("u@test"), "https://op.test/");
        assert!(engine.authorize(&claims, "alice").is_ok());
    }

    #[test]
    fn test_sub_match_is_case_sensitive() {
        let engine = engine("alice sub U@test https://op.test/\n");
        let claims = claims("u@test", Some("u@test"), "https://op.test/");
        assert!(engine.authorize(&claims, "alice").is_err());
    }

    #[test]
    fn test_groups_matcher() {
        let claims = claims("u@test", None, "https://op.test/");
        let admins = engine("alice oidc:groups admins https://op.test/\n");
        assert!(admins.authorize(&claims, "alice").is_ok());

        let operators = engine("alice oidc:groups operators https://op.test/\n");
        assert!(operators.authorize(&claims, "alice").is_err());
    }

    #[test]
    fn test_user_policy_consulted_after_system() {
        let fs = Arc::new(MemFs::new());
        fs.write(Path::new(SYSTEM_POLICY_PATH), b"").unwrap();
        let engine = PolicyEngine::new(
            fs,
            SYSTEM_POLICY_PATH,
            Box::new(FixtureHome(
                "alice email u@test https://op.test/\n".to_string(),
            )),
        );
        let claims = claims("u@test", Some("u@test"), "https://op.test/");
        assert!(engine.authorize(&claims, "alice").is_ok());
    }

    #[test]
    fn test_user_policy_read_failure_is_nonfatal_when_system_matches() {
        struct FailingHome;
        impl HomePolicyLoader for FailingHome {
            fn read(&self, _principal: &str) -> std::io::Result<String> {
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "sudo"))
            }
        }
        let fs = Arc::new(MemFs::new());
        fs.write(
            Path::new(SYSTEM_POLICY_PATH),
            b"alice email u@test https://op.test/\n",
        )
        .unwrap();
        let engine = PolicyEngine::new(fs, SYSTEM_POLICY_PATH, Box::new(FailingHome));
        let claims = claims("u@test", Some("u@test"), "https://op.test/");
        assert!(engine.authorize(&claims, "alice").is_ok());
    }

    #[test]
    fn test_missing_system_policy_is_empty_not_fatal() {
        let fs = Arc::new(MemFs::new());
        let engine = PolicyEngine::new(fs, SYSTEM_POLICY_PATH, Box::new(NoHomePolicy));
        let claims = claims("u@test", Some("u@test"), "https://op.test/");
        assert!(engine.authorize(&claims, "alice").is_err());
    }

    #[test]
    fn test_add_entry_appends_legacy_email_form() {
        let fs = Arc::new(MemFs::new());
        let engine = PolicyEngine::new(fs.clone(), SYSTEM_POLICY_PATH, Box::new(NoHomePolicy));
        engine
            .add_entry(&PolicyEntry {
                principal: "alice".to_string(),
                kind: MatcherKind::Email,
                value: "u@test".to_string(),
                issuer: "https://op.test/".to_string(),
            })
            .unwrap();
        let content = fs.read_to_string(Path::new(SYSTEM_POLICY_PATH)).unwrap();
        assert_eq!(content, "alice u@test https://op.test/\n");
    }
}
