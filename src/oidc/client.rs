//! Authorization-code flow with PKCE over a loopback redirect.
//!
//! The CIC commitment travels as the OIDC `nonce`, which is what binds the
//! returned ID token to the ephemeral key. The loopback listener accepts a
//! single redirect and shuts down.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::jwks::{CachingKeyResolver, OpKeyResolver};
use super::OidcError;
use crate::config::ProviderConfig;
use crate::pktoken::Cic;

pub const REDIRECT_CALLBACK_PATH: &str = "/login-callback";

/// Timeout for the code exchange request.
const EXCHANGE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Attempt to open the system browser; the URL is printed either way.
    pub open_browser: bool,
    /// How long to wait for the user to finish at the OP.
    pub redirect_timeout: Duration,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            open_browser: true,
            redirect_timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Discovery {
    authorization_endpoint: String,
    token_endpoint: String,
    issuer: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
}

type CallbackResult = Result<(String, String), String>;

#[derive(Clone)]
struct CallbackState {
    tx: Arc<Mutex<Option<mpsc::Sender<CallbackResult>>>>,
    shutdown: Arc<Mutex<Option<tokio::sync::oneshot::Sender<()>>>>,
}

/// Drive the full flow: discovery, redirect, code exchange, ID token
/// validation (signature, `iss`, `aud`, `exp`, and the nonce commitment).
pub fn authorize_code_flow(
    config: &ProviderConfig,
    cic: &Cic,
    opts: &AuthOptions,
) -> Result<String, OidcError> {
    let discovery = fetch_discovery(&config.issuer)?;

    let (listener, port) = bind_loopback(&config.redirect_ports)?;
    let redirect_uri = format!("http://localhost:{}{}", port, REDIRECT_CALLBACK_PATH);

    let code_verifier = random_b64url(32);
    let code_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));
    let state = random_b64url(16);

    let scopes = config.scopes.join(" ");
    let auth_url = reqwest::Url::parse_with_params(
        &discovery.authorization_endpoint,
        &[
            ("response_type", "code"),
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", scopes.as_str()),
            ("nonce", cic.commitment().as_str()),
            ("state", state.as_str()),
            ("code_challenge", code_challenge.as_str()),
            ("code_challenge_method", "S256"),
        ],
    )
    .map_err(|e| OidcError::Discovery(e.to_string()))?;

    println!("Open the following URL in your browser to log in:\n\n  {auth_url}\n");
    if opts.open_browser {
        open_browser(auth_url.as_str());
    }

    let (code, returned_state) = wait_for_redirect(listener, opts.redirect_timeout)?;
    if returned_state != state {
        return Err(OidcError::StateMismatch);
    }

    let token = exchange_code(
        &discovery.token_endpoint,
        config,
        &code,
        &code_verifier,
        &redirect_uri,
    )?;

    validate_id_token(config, &token.id_token, cic)?;
    info!(issuer = %config.issuer, "ID token obtained and validated");
    Ok(token.id_token)
}

fn fetch_discovery(issuer: &str) -> Result<Discovery, OidcError> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| OidcError::Discovery(e.to_string()))?;
    let discovery: Discovery = client
        .get(&url)
        .send()
        .map_err(|e| OidcError::Discovery(e.to_string()))?
        .error_for_status()
        .map_err(|e| OidcError::Discovery(e.to_string()))?
        .json()
        .map_err(|e| OidcError::Discovery(e.to_string()))?;
    if discovery.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
        return Err(OidcError::Discovery(format!(
            "discovery issuer {} does not match {}",
            discovery.issuer, issuer
        )));
    }
    Ok(discovery)
}

fn bind_loopback(ports: &[u16]) -> Result<(std::net::TcpListener, u16), OidcError> {
    for &port in ports {
        if let Ok(listener) = std::net::TcpListener::bind(("127.0.0.1", port)) {
            debug!(port, "bound loopback redirect listener");
            return Ok((listener, port));
        }
    }
    Err(OidcError::NoPort)
}

/// Serve the callback route until exactly one redirect arrives, then shut
/// the listener down.
fn wait_for_redirect(
    listener: std::net::TcpListener,
    timeout: Duration,
) -> Result<(String, String), OidcError> {
    listener.set_nonblocking(true)?;

    let (tx, rx) = mpsc::channel::<CallbackResult>();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown = Arc::new(Mutex::new(Some(shutdown_tx)));
    let state = CallbackState {
        tx: Arc::new(Mutex::new(Some(tx))),
        shutdown: shutdown.clone(),
    };

    let server = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("loopback runtime");
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).expect("loopback listener");
            let app = Router::new()
                .route(REDIRECT_CALLBACK_PATH, get(login_callback))
                .with_state(state);
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
    });

    let received = rx.recv_timeout(timeout);
    if let Some(shutdown_tx) = shutdown.lock().unwrap().take() {
        let _ = shutdown_tx.send(());
    }
    let _ = server.join();

    match received {
        Ok(Ok(pair)) => Ok(pair),
        Ok(Err(reason)) => Err(OidcError::AuthorizationDenied(reason)),
        Err(_) => Err(OidcError::Timeout),
    }
}

async fn login_callback(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    let result = if let Some(error) = params.get("error") {
        Err(error.clone())
    } else {
        match (params.get("code"), params.get("state")) {
            (Some(code), Some(state)) => Ok((code.clone(), state.clone())),
            _ => Err("redirect missing code or state".to_string()),
        }
    };

    if let Some(tx) = state.tx.lock().unwrap().take() {
        let _ = tx.send(result);
    }
    if let Some(shutdown) = state.shutdown.lock().unwrap().take() {
        let _ = shutdown.send(());
    }

    Html("<html><body>Login complete. You may close this window.</body></html>")
}

fn exchange_code(
    token_endpoint: &str,
    config: &ProviderConfig,
    code: &str,
    code_verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse, OidcError> {
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", config.client_id.as_str()),
        ("code_verifier", code_verifier),
    ];
    if let Some(secret) = &config.client_secret {
        params.push(("client_secret", secret.as_str()));
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(EXCHANGE_TIMEOUT_SECS))
        .build()
        .map_err(|e| OidcError::Exchange(e.to_string()))?;
    client
        .post(token_endpoint)
        .form(&params)
        .send()
        .map_err(|e| OidcError::Exchange(e.to_string()))?
        .error_for_status()
        .map_err(|e| OidcError::Exchange(e.to_string()))?
        .json()
        .map_err(|e| OidcError::Exchange(e.to_string()))
}

/// Check the fresh ID token against the OP's JWKS before it becomes the
/// basis of a PK Token.
fn validate_id_token(config: &ProviderConfig, id_token: &str, cic: &Cic) -> Result<(), OidcError> {
    let header = decode_header(id_token).map_err(|e| OidcError::TokenInvalid(e.to_string()))?;
    let kid = header
        .kid
        .ok_or_else(|| OidcError::TokenInvalid("ID token header has no kid".to_string()))?;

    let resolver = CachingKeyResolver::http()?;
    let op_key = resolver.resolve(&config.issuer, &kid)?;
    let decoding_key = DecodingKey::from_rsa_components(
        &URL_SAFE_NO_PAD.encode(op_key.n().to_bytes_be()),
        &URL_SAFE_NO_PAD.encode(op_key.e().to_bytes_be()),
    )
    .map_err(|e| OidcError::TokenInvalid(e.to_string()))?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[&config.client_id]);
    validation.set_issuer(&[&config.issuer]);
    validation.leeway = 60;

    let data = decode::<serde_json::Value>(id_token, &decoding_key, &validation)
        .map_err(|e| OidcError::TokenInvalid(e.to_string()))?;

    match data.claims.get("nonce").and_then(|v| v.as_str()) {
        Some(nonce) if nonce == cic.commitment() => Ok(()),
        _ => Err(OidcError::NonceMismatch),
    }
}

fn random_b64url(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

fn open_browser(url: &str) {
    let launcher = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    let _ = std::process::Command::new(launcher)
        .arg(url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_loopback_walks_port_list() {
        // Occupy the first port, expect the second.
        let ports = [17831, 17832];
        let _holder = std::net::TcpListener::bind(("127.0.0.1", ports[0])).unwrap();
        let (_listener, port) = bind_loopback(&ports).unwrap();
        assert_eq!(port, ports[1]);
    }

    #[test]
    fn test_bind_loopback_fails_when_all_taken() {
        let ports = [17841];
        let _holder = std::net::TcpListener::bind(("127.0.0.1", ports[0])).unwrap();
        assert!(matches!(bind_loopback(&ports), Err(OidcError::NoPort)));
    }

    #[test]
    fn test_code_challenge_is_s256_of_verifier() {
        let verifier = random_b64url(32);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        assert_eq!(challenge.len(), 43);
        assert_ne!(challenge, verifier);
    }

    #[test]
    fn test_redirect_delivers_code_and_shuts_down() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let driver = std::thread::spawn(move || {
            // Give the server a moment to start accepting.
            std::thread::sleep(Duration::from_millis(200));
            let url = format!(
                "http://127.0.0.1:{}{}?code=abc&state=xyz",
                port, REDIRECT_CALLBACK_PATH
            );
            reqwest::blocking::get(url).map(|r| r.status().is_success())
        });

        let (code, state) = wait_for_redirect(listener, Duration::from_secs(10)).unwrap();
        assert_eq!(code, "abc");
        assert_eq!(state, "xyz");
        assert!(driver.join().unwrap().unwrap());
    }

    #[test]
    fn test_redirect_times_out_without_callback() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let err = wait_for_redirect(listener, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, OidcError::Timeout));
    }
}
