//! OP signing-key discovery and caching.
//!
//! This module handles:
//! - OIDC discovery to find the JWKS URI
//! - Fetching and parsing JWKS
//! - Per-issuer caching with TTL and rotation support
//! - Key lookup by kid, with a single refresh on miss

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rsa::RsaPublicKey;
use serde::Deserialize;
use thiserror::Error;

use crate::errors::ErrorCode;

/// Default cache TTL (5 minutes), overridden by HTTP `max-age` when present.
const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// HTTP request timeout
const HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum JwksError {
    #[error("failed to fetch OIDC discovery document: {0}")]
    DiscoveryFetch(String),

    #[error("failed to parse OIDC discovery document: {0}")]
    DiscoveryParse(String),

    #[error("failed to fetch JWKS: {0}")]
    JwksFetch(String),

    #[error("failed to parse JWKS: {0}")]
    JwksParse(String),

    #[error("no key with kid {0} after refresh")]
    KeyNotFound(String),

    #[error("discovery issuer '{got}' does not match '{want}'")]
    IssuerMismatch { want: String, got: String },

    #[error("key {0} is not a usable RSA key")]
    InvalidKey(String),

    #[error("request deadline exceeded: {0}")]
    Timeout(String),
}

impl JwksError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JwksError::KeyNotFound(_) => ErrorCode::UnknownKid,
            JwksError::Timeout(_) => ErrorCode::IoTimeout,
            JwksError::DiscoveryFetch(_) | JwksError::JwksFetch(_) => ErrorCode::IoError,
            JwksError::DiscoveryParse(_)
            | JwksError::JwksParse(_)
            | JwksError::InvalidKey(_)
            | JwksError::IssuerMismatch { .. } => ErrorCode::MalformedInput,
        }
    }
}

/// One JWKS entry. Non-RSA entries are carried but never resolve.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksKey {
    pub kty: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
}

impl JwksKey {
    pub fn to_rsa(&self) -> Result<RsaPublicKey, JwksError> {
        let label = self.kid.clone().unwrap_or_else(|| "<no kid>".to_string());
        if self.kty != "RSA" {
            return Err(JwksError::InvalidKey(label));
        }
        let n = self.n.as_deref().ok_or_else(|| JwksError::InvalidKey(label.clone()))?;
        let e = self.e.as_deref().ok_or_else(|| JwksError::InvalidKey(label.clone()))?;
        let n = URL_SAFE_NO_PAD
            .decode(n.trim_end_matches('='))
            .map_err(|_| JwksError::InvalidKey(label.clone()))?;
        let e = URL_SAFE_NO_PAD
            .decode(e.trim_end_matches('='))
            .map_err(|_| JwksError::InvalidKey(label.clone()))?;
        RsaPublicKey::new(
            rsa::BigUint::from_bytes_be(&n),
            rsa::BigUint::from_bytes_be(&e),
        )
        .map_err(|_| JwksError::InvalidKey(label))
    }
}

/// Result of one discovery + JWKS fetch.
pub struct FetchedJwks {
    pub keys: Vec<JwksKey>,
    /// TTL from HTTP caching headers, when the server sent one.
    pub max_age: Option<Duration>,
}

/// Fetches the key set for an issuer. Implemented over HTTP in production
/// and by fixtures in tests.
pub trait JwksFetch: Send + Sync {
    fn fetch(&self, issuer: &str) -> Result<FetchedJwks, JwksError>;
}

/// Resolves `(issuer, kid)` to the OP's RSA public key.
pub trait OpKeyResolver: Send + Sync {
    fn resolve(&self, issuer: &str, kid: &str) -> Result<RsaPublicKey, JwksError>;
}

#[derive(Debug, Deserialize)]
struct Discovery {
    jwks_uri: String,
    issuer: String,
}

#[derive(Debug, Deserialize)]
struct RawJwks {
    keys: Vec<JwksKey>,
}

/// HTTP fetcher: discovery document, then the advertised JWKS URI. One
/// retry on transient transport failures.
pub struct HttpJwksFetch {
    client: reqwest::blocking::Client,
}

impl HttpJwksFetch {
    pub fn new() -> Result<Self, JwksError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| JwksError::JwksFetch(e.to_string()))?;
        Ok(Self { client })
    }

    fn get_with_retry(&self, url: &str) -> Result<reqwest::blocking::Response, JwksError> {
        let attempt = || self.client.get(url).send();
        match attempt() {
            Ok(resp) => Ok(resp),
            Err(e) if e.is_timeout() => {
                // One retry; a second timeout is final.
                attempt().map_err(|e| JwksError::Timeout(e.to_string()))
            }
            Err(e) if e.is_connect() => {
                attempt().map_err(|e| JwksError::JwksFetch(e.to_string()))
            }
            Err(e) => Err(JwksError::JwksFetch(e.to_string())),
        }
    }
}

impl JwksFetch for HttpJwksFetch {
    fn fetch(&self, issuer: &str) -> Result<FetchedJwks, JwksError> {
        let trimmed = issuer.trim_end_matches('/');
        let discovery_url = format!("{}/.well-known/openid-configuration", trimmed);

        let response = self
            .get_with_retry(&discovery_url)
            .map_err(|e| match e {
                JwksError::JwksFetch(m) => JwksError::DiscoveryFetch(m),
                other => other,
            })?;
        if !response.status().is_success() {
            return Err(JwksError::DiscoveryFetch(format!(
                "HTTP {}: {}",
                response.status(),
                discovery_url
            )));
        }
        let discovery: Discovery = response
            .json()
            .map_err(|e| JwksError::DiscoveryParse(e.to_string()))?;

        if discovery.issuer.trim_end_matches('/') != trimmed {
            return Err(JwksError::IssuerMismatch {
                want: issuer.to_string(),
                got: discovery.issuer,
            });
        }

        let response = self.get_with_retry(&discovery.jwks_uri)?;
        if !response.status().is_success() {
            return Err(JwksError::JwksFetch(format!(
                "HTTP {}: {}",
                response.status(),
                discovery.jwks_uri
            )));
        }
        let max_age = parse_max_age(response.headers());
        let jwks: RawJwks = response
            .json()
            .map_err(|e| JwksError::JwksParse(e.to_string()))?;

        Ok(FetchedJwks {
            keys: jwks.keys,
            max_age,
        })
    }
}

fn parse_max_age(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::CACHE_CONTROL)?.to_str().ok()?;
    value
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .filter_map(|secs| secs.parse::<u64>().ok())
        .next()
        .map(Duration::from_secs)
}

struct CacheEntry {
    keys: Vec<JwksKey>,
    expires_at: Instant,
}

/// Per-process key resolver with a single-mutex cache keyed by issuer.
/// Each verify invocation is short-lived, so the cache only has to survive
/// one request; a kid miss gets exactly one refresh.
pub struct CachingKeyResolver {
    fetcher: Box<dyn JwksFetch>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
}

impl CachingKeyResolver {
    pub fn new(fetcher: Box<dyn JwksFetch>) -> Self {
        Self {
            fetcher,
            cache: Mutex::new(HashMap::new()),
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }

    pub fn http() -> Result<Self, JwksError> {
        Ok(Self::new(Box::new(HttpJwksFetch::new()?)))
    }

    fn lookup(&self, issuer: &str, kid: &str) -> Option<Result<RsaPublicKey, JwksError>> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(issuer)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        entry
            .keys
            .iter()
            .find(|k| k.kid.as_deref() == Some(kid))
            .map(|k| k.to_rsa())
    }

    fn refresh(&self, issuer: &str) -> Result<(), JwksError> {
        let fetched = self.fetcher.fetch(issuer)?;
        let ttl = fetched.max_age.unwrap_or(self.default_ttl);
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            issuer.to_string(),
            CacheEntry {
                keys: fetched.keys,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

impl OpKeyResolver for CachingKeyResolver {
    fn resolve(&self, issuer: &str, kid: &str) -> Result<RsaPublicKey, JwksError> {
        if let Some(found) = self.lookup(issuer, kid) {
            return found;
        }
        self.refresh(issuer)?;
        self.lookup(issuer, kid)
            .unwrap_or_else(|| Err(JwksError::KeyNotFound(kid.to_string())))
    }
}
