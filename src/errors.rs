//! Stable failure codes surfaced in audit events.
//!
//! Every fatal condition on the verify path maps to exactly one of these
//! codes. The code string is what lands in the log; the full error chain
//! stays in the process and never reaches stdout.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Bad JWS framing, bad base64, certificate parse failure.
    MalformedInput,
    /// Issuer is not in the configured providers.
    UnknownIssuer,
    /// JWKS has no matching key even after a refresh.
    UnknownKid,
    /// RS256, GQ, CIC or certificate signature failed to verify.
    SigInvalid,
    /// CIC commitment is not present in the payload nonce.
    NonceMismatch,
    /// Token `exp` or certificate `valid-before` has passed.
    Expired,
    /// `iat` outside the tolerance window.
    ClockSkew,
    /// No policy entry matched.
    PolicyDenied,
    /// Network or subprocess deadline exceeded.
    IoTimeout,
    /// Network or filesystem failure.
    IoError,
    /// Malformed providers list or invalid entry.
    ConfigurationError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedInput => "malformed-input",
            ErrorCode::UnknownIssuer => "unknown-issuer",
            ErrorCode::UnknownKid => "unknown-kid",
            ErrorCode::SigInvalid => "sig-invalid",
            ErrorCode::NonceMismatch => "nonce-mismatch",
            ErrorCode::Expired => "expired",
            ErrorCode::ClockSkew => "clock-skew",
            ErrorCode::PolicyDenied => "policy-denied",
            ErrorCode::IoTimeout => "io-timeout",
            ErrorCode::IoError => "io-error",
            ErrorCode::ConfigurationError => "configuration-error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::SigInvalid.as_str(), "sig-invalid");
        assert_eq!(ErrorCode::PolicyDenied.as_str(), "policy-denied");
        assert_eq!(ErrorCode::UnknownKid.as_str(), "unknown-kid");
        assert_eq!(ErrorCode::ClockSkew.to_string(), "clock-skew");
    }
}
