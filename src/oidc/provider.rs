//! Provider variants.
//!
//! One closed enum instead of trait objects: the verify path only ever
//! needs the issuer and a key resolver, and the login path one
//! `authorize` operation per variant.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use super::client::{self, AuthOptions};
use super::jwks::{CachingKeyResolver, JwksError, JwksKey, OpKeyResolver};
use super::OidcError;
use crate::config::{ConfigError, ProviderConfig};
use crate::jose::jws::b64url_encode;
use crate::pktoken::Cic;

pub const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

#[derive(Debug)]
pub enum OpenIdProvider {
    Mock(MockProvider),
    Standard(StandardProvider),
    GithubActions(GithubActionsProvider),
}

impl OpenIdProvider {
    pub fn issuer(&self) -> &str {
        match self {
            OpenIdProvider::Mock(p) => &p.issuer,
            OpenIdProvider::Standard(p) => &p.config.issuer,
            OpenIdProvider::GithubActions(p) => &p.issuer,
        }
    }

    pub fn gq_sign(&self) -> bool {
        match self {
            OpenIdProvider::Mock(_) => false,
            OpenIdProvider::Standard(p) => p.gq_sign,
            // The commitment rides in `aud`, visible to anyone the token is
            // shown to; GQ-transforming is mandatory for this provider.
            OpenIdProvider::GithubActions(_) => true,
        }
    }

    /// Run the provider's authorization flow and return a verified ID token
    /// bound to the CIC commitment.
    pub fn authorize(&self, cic: &Cic, opts: &AuthOptions) -> Result<String, OidcError> {
        match self {
            OpenIdProvider::Mock(p) => Ok(p.authorize(cic)),
            OpenIdProvider::Standard(p) => client::authorize_code_flow(&p.config, cic, opts),
            OpenIdProvider::GithubActions(p) => p.authorize(cic),
        }
    }

    pub fn key_resolver(&self) -> Result<Box<dyn OpKeyResolver>, JwksError> {
        match self {
            OpenIdProvider::Mock(p) => Ok(Box::new(p.resolver())),
            _ => Ok(Box::new(CachingKeyResolver::http()?)),
        }
    }
}

impl ProviderConfig {
    /// Turn a parsed config entry into a provider, validating the fields
    /// the flow depends on.
    pub fn to_provider(&self, open_browser: bool) -> Result<OpenIdProvider, ConfigError> {
        // http://localhost is allowed so integration setups can run an OP
        // without TLS.
        if !self.issuer.starts_with("https://") && !self.issuer.starts_with("http://localhost") {
            return Err(ConfigError::InvalidIssuer);
        }
        if self.issuer == GITHUB_ACTIONS_ISSUER {
            return Ok(OpenIdProvider::GithubActions(GithubActionsProvider {
                issuer: self.issuer.clone(),
            }));
        }
        Ok(OpenIdProvider::Standard(StandardProvider {
            config: self.clone(),
            gq_sign: self.gq_sign,
            open_browser,
        }))
    }
}

/// A real OP spoken to over the authorization-code flow.
#[derive(Debug, Clone)]
pub struct StandardProvider {
    pub config: ProviderConfig,
    pub gq_sign: bool,
    pub open_browser: bool,
}

/// GitHub Actions OIDC: the runner exposes a token endpoint through
/// environment variables, and the `audience` request parameter is the only
/// client-controlled claim, so it carries the CIC commitment.
#[derive(Debug, Clone)]
pub struct GithubActionsProvider {
    pub issuer: String,
}

impl GithubActionsProvider {
    pub fn authorize(&self, cic: &Cic) -> Result<String, OidcError> {
        let request_url = std::env::var("ACTIONS_ID_TOKEN_REQUEST_URL")
            .map_err(|_| OidcError::MissingEnv("ACTIONS_ID_TOKEN_REQUEST_URL"))?;
        let request_token = std::env::var("ACTIONS_ID_TOKEN_REQUEST_TOKEN")
            .map_err(|_| OidcError::MissingEnv("ACTIONS_ID_TOKEN_REQUEST_TOKEN"))?;

        #[derive(serde::Deserialize)]
        struct TokenReply {
            value: String,
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| OidcError::Exchange(e.to_string()))?;
        let reply: TokenReply = client
            .get(format!("{}&audience={}", request_url, cic.commitment()))
            .bearer_auth(request_token)
            .send()
            .map_err(|e| OidcError::Exchange(e.to_string()))?
            .error_for_status()
            .map_err(|e| OidcError::Exchange(e.to_string()))?
            .json()
            .map_err(|e| OidcError::Exchange(e.to_string()))?;
        Ok(reply.value)
    }
}

/// In-process OP with a fixed RSA key. Lives in the provider enum proper
/// because end-to-end flows are exercised against it.
#[derive(Debug)]
pub struct MockProvider {
    pub issuer: String,
    pub client_id: String,
    pub kid: String,
    key: RsaPrivateKey,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::with_issuer("https://accounts.example.com")
    }

    pub fn with_issuer(issuer: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            client_id: "test_client_id".to_string(),
            kid: "mock-kid-1".to_string(),
            key: RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("mock keygen"),
        }
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }

    pub fn authorize(&self, cic: &Cic) -> String {
        let now = chrono::Utc::now().timestamp();
        self.mint_id_token(
            "me",
            Some("arthur.aardvark@example.com"),
            &cic.commitment(),
            now + 3600,
            now,
        )
    }

    /// Mint an RS256 ID token with arbitrary identity claims.
    pub fn mint_id_token(
        &self,
        sub: &str,
        email: Option<&str>,
        nonce: &str,
        exp: i64,
        iat: i64,
    ) -> String {
        let header = serde_json::json!({
            "alg": "RS256",
            "typ": "JWT",
            "kid": self.kid,
        });
        let mut payload = serde_json::json!({
            "iss": self.issuer,
            "sub": sub,
            "aud": self.client_id,
            "exp": exp,
            "iat": iat,
            "nonce": nonce,
        });
        if let Some(email) = email {
            payload["email"] = serde_json::Value::String(email.to_string());
        }

        let signing_input = format!(
            "{}.{}",
            b64url_encode(header.to_string().as_bytes()),
            b64url_encode(payload.to_string().as_bytes())
        );
        let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(self.key.clone());
        let sig = signer.sign(signing_input.as_bytes()).to_bytes();
        format!("{}.{}", signing_input, b64url_encode(&sig))
    }

    pub fn jwks_key(&self) -> JwksKey {
        let public = self.public_key();
        JwksKey {
            kty: "RSA".to_string(),
            kid: Some(self.kid.clone()),
            alg: Some("RS256".to_string()),
            n: Some(URL_SAFE_NO_PAD.encode(public.n().to_bytes_be())),
            e: Some(URL_SAFE_NO_PAD.encode(public.e().to_bytes_be())),
        }
    }

    pub fn resolver(&self) -> StaticKeyResolver {
        StaticKeyResolver {
            issuer: self.issuer.clone(),
            kid: self.kid.clone(),
            key: self.public_key(),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolver over a single pinned key, for the mock provider and tests.
pub struct StaticKeyResolver {
    issuer: String,
    kid: String,
    key: RsaPublicKey,
}

impl OpKeyResolver for StaticKeyResolver {
    fn resolve(&self, issuer: &str, kid: &str) -> Result<RsaPublicKey, JwksError> {
        if issuer == self.issuer && kid == self.kid {
            Ok(self.key.clone())
        } else {
            Err(JwksError::KeyNotFound(kid.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::jws::CompactJws;
    use crate::pktoken::IdClaims;

    #[test]
    fn test_mock_provider_tokens_verify_under_its_resolver() {
        let op = MockProvider::new();
        let now = chrono::Utc::now().timestamp();
        let token = op.mint_id_token("me", None, "nonce-value", now + 60, now);
        let jws = CompactJws::split(&token).unwrap();
        let jwk = crate::jose::Jwk::from_rsa(&op.public_key());
        jwk.verify(&jws.signing_input(), &jws.decode_signature().unwrap())
            .unwrap();

        let claims: IdClaims = jws.decode_payload().unwrap();
        assert_eq!(claims.iss, "https://accounts.example.com");
        assert_eq!(claims.sub, "me");
        assert!(claims.aud.contains("test_client_id"));
    }

    #[test]
    fn test_static_resolver_scopes_by_issuer_and_kid() {
        let op = MockProvider::new();
        let resolver = op.resolver();
        assert!(resolver.resolve(&op.issuer, &op.kid).is_ok());
        assert!(resolver.resolve(&op.issuer, "other-kid").is_err());
        assert!(resolver.resolve("https://other.test/", &op.kid).is_err());
    }

    #[test]
    fn test_github_actions_requires_runner_environment() {
        std::env::remove_var("ACTIONS_ID_TOKEN_REQUEST_URL");
        let provider = GithubActionsProvider {
            issuer: GITHUB_ACTIONS_ISSUER.to_string(),
        };
        let key = crate::ssh::keys::EphemeralKey::generate(crate::ssh::keys::KeyAlg::Ed25519)
            .unwrap();
        let cic = Cic::new(key.jws_alg(), key.public_jwk());
        assert!(matches!(
            provider.authorize(&cic),
            Err(OidcError::MissingEnv(_))
        ));
    }
}
