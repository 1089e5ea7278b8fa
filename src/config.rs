//! Provider configuration.
//!
//! The login side reads `OPKSSH_PROVIDERS` (semicolon-separated
//! `alias,issuer,client-id,client-secret,scopes` entries) and
//! `OPKSSH_DEFAULT`; the verify side reads `/etc/opk/providers` with one
//! `<issuer> <client-id> <expiration>` entry per line. Both are loaded once
//! at entry into immutable values and passed down explicitly.

use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::errors::ErrorCode;
use crate::files::Fs;

pub const PROVIDERS_ENV: &str = "OPKSSH_PROVIDERS";
pub const DEFAULT_PROVIDER_ENV: &str = "OPKSSH_DEFAULT";
pub const SERVER_PROVIDERS_PATH: &str = "/etc/opk/providers";
pub const DEFAULT_LOG_DIR: &str = "/var/log";

/// Loopback ports tried in order for the redirect listener.
pub const DEFAULT_REDIRECT_PORTS: [u16; 3] = [3000, 10001, 11110];

const DEFAULT_SCOPES: [&str; 3] = ["openid", "profile", "email"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid provider client-ID value got ({0})")]
    InvalidClientId(String),

    #[error("invalid provider issuer value. Expected issuer to start with 'https://'")]
    InvalidIssuer,

    #[error("no providers configured; set {PROVIDERS_ENV}")]
    NoProviders,

    #[error("unknown provider alias {0}")]
    UnknownAlias(String),

    #[error("malformed providers entry on line {0}")]
    MalformedLine(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConfigError::Io(_) => ErrorCode::IoError,
            _ => ErrorCode::ConfigurationError,
        }
    }
}

/// One configured OP, parsed from an `OPKSSH_PROVIDERS` entry or a
/// `--provider` argument.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderConfig {
    pub alias: Option<String>,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
    pub redirect_ports: Vec<u16>,
    pub gq_sign: bool,
}

impl ProviderConfig {
    /// Parse `alias,issuer,client-id,client-secret,scopes` (alias present
    /// only when `has_alias`). The client ID is checked here; the issuer
    /// scheme is checked when the config becomes a provider.
    pub fn from_string(input: &str, has_alias: bool) -> Result<Self, ConfigError> {
        let mut fields = input.split(',').map(str::trim);

        let alias = if has_alias {
            fields.next().map(str::to_string).filter(|a| !a.is_empty())
        } else {
            None
        };
        let issuer = fields.next().unwrap_or_default().to_string();
        let client_id = fields.next().unwrap_or_default().to_string();
        if client_id.is_empty() {
            return Err(ConfigError::InvalidClientId(client_id));
        }
        let client_secret = fields.next().map(str::to_string).filter(|s| !s.is_empty());
        let scopes = match fields.next() {
            Some(s) if !s.is_empty() => s.split_whitespace().map(str::to_string).collect(),
            _ => DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        };

        Ok(ProviderConfig {
            alias,
            issuer,
            client_id,
            client_secret,
            scopes,
            redirect_ports: DEFAULT_REDIRECT_PORTS.to_vec(),
            gq_sign: false,
        })
    }
}

/// Login-side configuration, loaded once from the environment.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub providers: Vec<ProviderConfig>,
    pub default_alias: Option<String>,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let providers = match std::env::var(PROVIDERS_ENV) {
            Ok(value) if !value.trim().is_empty() => value
                .split(';')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| ProviderConfig::from_string(entry, true))
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        let default_alias = std::env::var(DEFAULT_PROVIDER_ENV)
            .ok()
            .filter(|a| !a.is_empty());
        Ok(ClientConfig {
            providers,
            default_alias,
        })
    }

    fn by_alias(&self, alias: &str) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.alias.as_deref() == Some(alias))
    }
}

/// Outcome of provider selection: either a single choice, or the candidate
/// list for an external chooser when nothing disambiguates.
#[derive(Debug)]
pub enum DeterminedProvider {
    Single(ProviderConfig),
    Chooser(Vec<ProviderConfig>),
}

/// Resolution order: explicit `--provider` config string, then alias
/// argument, then `OPKSSH_DEFAULT`, then a lone configured provider; with
/// several left the caller gets the list.
pub fn determine_provider(
    config: &ClientConfig,
    provider_arg: Option<&str>,
) -> Result<DeterminedProvider, ConfigError> {
    if let Some(arg) = provider_arg {
        if arg.contains(',') {
            return Ok(DeterminedProvider::Single(ProviderConfig::from_string(
                arg, false,
            )?));
        }
        return config
            .by_alias(arg)
            .cloned()
            .map(DeterminedProvider::Single)
            .ok_or_else(|| ConfigError::UnknownAlias(arg.to_string()));
    }

    if let Some(alias) = &config.default_alias {
        return config
            .by_alias(alias)
            .cloned()
            .map(DeterminedProvider::Single)
            .ok_or_else(|| ConfigError::UnknownAlias(alias.clone()));
    }

    match config.providers.as_slice() {
        [] => Err(ConfigError::NoProviders),
        [single] => Ok(DeterminedProvider::Single(single.clone())),
        many => Ok(DeterminedProvider::Chooser(many.to_vec())),
    }
}

/// One `/etc/opk/providers` line on the verify side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProvider {
    pub issuer: String,
    pub client_id: String,
    /// Token-lifetime policy label (`24h`, `oidc`, ...). Carried for
    /// operators; the verify path enforces the token's own `exp`.
    pub expiration: String,
}

pub fn load_server_providers(
    fs: &dyn Fs,
    path: &Path,
) -> Result<Vec<ServerProvider>, ConfigError> {
    let content = fs.read_to_string(path)?;
    let mut providers = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [issuer, client_id] => providers.push(ServerProvider {
                issuer: issuer.to_string(),
                client_id: client_id.to_string(),
                expiration: "24h".to_string(),
            }),
            [issuer, client_id, expiration] => providers.push(ServerProvider {
                issuer: issuer.to_string(),
                client_id: client_id.to_string(),
                expiration: expiration.to_string(),
            }),
            _ => return Err(ConfigError::MalformedLine(idx + 1)),
        }
    }
    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::MemFs;
    use std::sync::Mutex;

    // Environment-variable tests share the process environment.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_provider_string_with_alias() {
        let config = ProviderConfig::from_string(
            "op1,https://example.com/tokens-1/,client-id1234,,",
            true,
        )
        .unwrap();
        assert_eq!(config.alias.as_deref(), Some("op1"));
        assert_eq!(config.issuer, "https://example.com/tokens-1/");
        assert_eq!(config.client_id, "client-id1234");
        assert_eq!(config.client_secret, None);
        let provider = config.to_provider(false).unwrap();
        assert_eq!(provider.issuer(), "https://example.com/tokens-1/");
    }

    #[test]
    fn test_provider_string_authentik_style() {
        let config = ProviderConfig::from_string(
            "authentik,https://authentik.io/application/o/opkssh/,client_id,,openid profile email",
            true,
        )
        .unwrap();
        let provider = config.to_provider(false).unwrap();
        assert_eq!(provider.issuer(), "https://authentik.io/application/o/opkssh/");
    }

    #[test]
    fn test_provider_string_google_style_without_alias() {
        let config = ProviderConfig::from_string(
            "https://accounts.google.com,206584157355-7cbe4s640tvm7naoludob4ut1emii7sf.apps.googleusercontent.com,NOT-aREAL_3a_GOOGLE-CLIENTSECRET",
            false,
        )
        .unwrap();
        assert!(config.client_secret.is_some());
        let provider = config.to_provider(false).unwrap();
        assert_eq!(provider.issuer(), "https://accounts.google.com");
    }

    #[test]
    fn test_provider_string_two_fields_without_alias() {
        let config = ProviderConfig::from_string(
            "https://gitlab.com,8d8b7024572c7fd501f64374dec6bba37096783dfcd792b3988104be08cb6923",
            false,
        )
        .unwrap();
        assert_eq!(config.to_provider(false).unwrap().issuer(), "https://gitlab.com");
    }

    #[test]
    fn test_alias_present_but_not_expected_fails_on_issuer() {
        // The alias is consumed as the issuer, which then fails validation.
        let config = ProviderConfig::from_string(
            "exampleOp,https://token.example.com/,client_id,,openid profile email,",
            false,
        )
        .unwrap();
        let err = config.to_provider(false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid provider issuer value. Expected issuer to start with 'https://'"
        );
    }

    #[test]
    fn test_alias_expected_but_missing_fails_on_client_id() {
        // The issuer is consumed as the alias, shifting every field left.
        let err = ProviderConfig::from_string(
            "https://token.example.com/,client_id,,openid profile email,",
            true,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid provider client-ID value got ()");
    }

    #[test]
    fn test_localhost_issuer_allowed_for_testing() {
        let config =
            ProviderConfig::from_string("http://localhost:8080/realms/test,cid,,", false).unwrap();
        assert!(config.to_provider(false).is_ok());
    }

    #[test]
    fn test_default_scopes_applied_when_empty() {
        let config =
            ProviderConfig::from_string("op1,https://example.com/,cid,,", true).unwrap();
        assert_eq!(config.scopes, vec!["openid", "profile", "email"]);
    }

    #[test]
    fn test_determine_provider_from_env_default() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var(
            PROVIDERS_ENV,
            "op1,https://example.com/tokens-1/,client-id1234,,;op2,https://auth.issuer/tokens-2/,client-id5678,,",
        );
        std::env::set_var(DEFAULT_PROVIDER_ENV, "op2");
        let config = ClientConfig::from_env().unwrap();
        std::env::remove_var(PROVIDERS_ENV);
        std::env::remove_var(DEFAULT_PROVIDER_ENV);

        match determine_provider(&config, None).unwrap() {
            DeterminedProvider::Single(p) => {
                assert_eq!(p.issuer, "https://auth.issuer/tokens-2/")
            }
            other => panic!("expected a single provider, got {other:?}"),
        }
    }

    #[test]
    fn test_provider_arg_takes_precedence() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var(
            PROVIDERS_ENV,
            "op1,https://example.com/tokens-1/,client-id1234,,",
        );
        std::env::set_var(DEFAULT_PROVIDER_ENV, "op1");
        let config = ClientConfig::from_env().unwrap();
        std::env::remove_var(PROVIDERS_ENV);
        std::env::remove_var(DEFAULT_PROVIDER_ENV);

        match determine_provider(
            &config,
            Some("https://auth.issuer/tokens-2/,client-id5678,,"),
        )
        .unwrap()
        {
            DeterminedProvider::Single(p) => {
                assert_eq!(p.issuer, "https://auth.issuer/tokens-2/")
            }
            other => panic!("expected a single provider, got {other:?}"),
        }
    }

    #[test]
    fn test_many_providers_without_default_yields_chooser() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var(
            PROVIDERS_ENV,
            "op1,https://example.com/tokens-1/,client-id1234,,;\
             op2,https://auth.issuer/tokens-2/,client-id5678,,;\
             op3,https://openidprovider.openidconnect/tokens-3/,client-id91011,,",
        );
        std::env::remove_var(DEFAULT_PROVIDER_ENV);
        let config = ClientConfig::from_env().unwrap();
        std::env::remove_var(PROVIDERS_ENV);

        match determine_provider(&config, None).unwrap() {
            DeterminedProvider::Chooser(list) => assert_eq!(list.len(), 3),
            other => panic!("expected a chooser, got {other:?}"),
        }

        // An alias argument disambiguates the same configuration.
        match determine_provider(&config, Some("op2")).unwrap() {
            DeterminedProvider::Single(p) => {
                assert_eq!(p.issuer, "https://auth.issuer/tokens-2/")
            }
            other => panic!("expected a single provider, got {other:?}"),
        }
    }

    #[test]
    fn test_single_provider_without_default_is_used() {
        let config = ClientConfig {
            providers: vec![ProviderConfig::from_string(
                "op1,https://example.com/tokens-1/,client-id1234,,",
                true,
            )
            .unwrap()],
            default_alias: None,
        };
        assert!(matches!(
            determine_provider(&config, None).unwrap(),
            DeterminedProvider::Single(_)
        ));
    }

    #[test]
    fn test_server_providers_file() {
        let fs = MemFs::new();
        let path = Path::new(SERVER_PROVIDERS_PATH);
        fs.write(
            path,
            b"# system providers\nhttps://op.test/ cid 24h\nhttps://accounts.google.com web-client oidc\n",
        )
        .unwrap();
        let providers = load_server_providers(&fs, path).unwrap();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].issuer, "https://op.test/");
        assert_eq!(providers[1].expiration, "oidc");
    }

    #[test]
    fn test_server_providers_rejects_short_line() {
        let fs = MemFs::new();
        let path = Path::new(SERVER_PROVIDERS_PATH);
        fs.write(path, b"https://op.test/\n").unwrap();
        assert!(matches!(
            load_server_providers(&fs, path),
            Err(ConfigError::MalformedLine(1))
        ));
    }
}
