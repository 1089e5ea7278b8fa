//! opkssh: SSH access from OpenID Connect identities.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use opkssh::audit::{AuditLog, LOG_FILE_NAME};
use opkssh::config::{
    load_server_providers, ClientConfig, DEFAULT_LOG_DIR, SERVER_PROVIDERS_PATH,
};
use opkssh::files::RealFs;
use opkssh::login::{run_login, LoginOptions};
use opkssh::oidc::CachingKeyResolver;
use opkssh::policy::readhome::{read_home_policy, SudoHomeLoader};
use opkssh::policy::{MatcherKind, PolicyEngine, PolicyEntry, SYSTEM_POLICY_PATH};
use opkssh::ssh::KeyAlg;
use opkssh::verify::{run_verify, VerifyContext};

#[derive(Parser)]
#[command(name = "opkssh")]
#[command(about = "SSH authentication from OpenID Connect identities")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in at an OpenID Provider and write an SSH key and certificate
    Login {
        /// Provider alias, or a full `issuer,client-id,...` config string
        #[arg(long)]
        provider: Option<String>,

        /// Directory receiving opkssh.log
        #[arg(long, default_value = DEFAULT_LOG_DIR)]
        log_dir: PathBuf,

        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        disable_browser_open: bool,

        /// Print the ID token claims after login
        #[arg(long)]
        print_id_token: bool,

        /// Ephemeral key algorithm (ed25519 or ecdsa)
        #[arg(long, default_value = "ed25519")]
        key_type: String,
    },

    /// AuthorizedKeysCommand entrypoint: verify a presented certificate
    Verify {
        user: String,
        key_blob: String,
        key_type: String,
    },

    /// Privilege-separated read of a user's ~/.ssh/auth_id
    Readhome { user: String },

    /// Add a policy entry to /etc/opk/auth_id
    Add {
        user: String,
        identity: String,
        issuer: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opkssh=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Commands::Login {
            provider,
            log_dir,
            disable_browser_open,
            print_id_token,
            key_type,
        } => login_cmd(
            provider,
            log_dir,
            disable_browser_open,
            print_id_token,
            &key_type,
        ),
        Commands::Verify {
            user,
            key_blob,
            key_type,
        } => verify_cmd(&user, &key_blob, &key_type),
        Commands::Readhome { user } => readhome_cmd(&user),
        Commands::Add {
            user,
            identity,
            issuer,
        } => add_cmd(&user, &identity, &issuer),
    }
}

fn login_cmd(
    provider: Option<String>,
    log_dir: PathBuf,
    disable_browser_open: bool,
    print_id_token: bool,
    key_type: &str,
) -> ExitCode {
    let Some(key_alg) = KeyAlg::from_name(key_type) else {
        error!(key_type, "unsupported key type");
        return ExitCode::FAILURE;
    };

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "provider configuration is invalid");
            return ExitCode::FAILURE;
        }
    };

    let opts = LoginOptions {
        provider_arg: provider,
        log_dir,
        disable_browser_open,
        print_id_token,
        key_alg,
    };

    match run_login(&config, None, Arc::new(RealFs), &opts) {
        Ok(result) => {
            println!("{}", result.identity);
            println!("Wrote key to {}", result.key_path.display());
            println!("Wrote certificate to {}", result.cert_path.display());
            if let Some(claims) = result.id_token_claims {
                match serde_json::to_string_pretty(&claims) {
                    Ok(pretty) => println!("{pretty}"),
                    Err(e) => error!(error = %e, "cannot render ID token claims"),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "login failed");
            ExitCode::FAILURE
        }
    }
}

fn verify_cmd(user: &str, key_blob: &str, key_type: &str) -> ExitCode {
    let fs = Arc::new(RealFs);

    let providers =
        match load_server_providers(fs.as_ref(), Path::new(SERVER_PROVIDERS_PATH)) {
            Ok(providers) => providers,
            Err(e) => {
                error!(error = %e, "cannot load {}", SERVER_PROVIDERS_PATH);
                return ExitCode::FAILURE;
            }
        };

    let home_loader = match SudoHomeLoader::current_exe() {
        Ok(loader) => loader,
        Err(e) => {
            error!(error = %e, "cannot locate own binary for readhome");
            return ExitCode::FAILURE;
        }
    };

    let resolver = match CachingKeyResolver::http() {
        Ok(resolver) => resolver,
        Err(e) => {
            error!(error = %e, "cannot build the JWKS client");
            return ExitCode::FAILURE;
        }
    };

    let ctx = VerifyContext {
        providers,
        resolver: Box::new(resolver),
        policy: PolicyEngine::new(fs.clone(), SYSTEM_POLICY_PATH, Box::new(home_loader)),
        audit: Arc::new(AuditLog::new(
            fs,
            Path::new(DEFAULT_LOG_DIR).join(LOG_FILE_NAME),
        )),
    };

    match run_verify(&ctx, user, key_blob, key_type) {
        Ok(line) => {
            // The single line sshd consumes; nothing else may reach stdout.
            println!("{line}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(user, code = %e.code(), error = %e, "verification denied");
            ExitCode::FAILURE
        }
    }
}

fn readhome_cmd(user: &str) -> ExitCode {
    match read_home_policy(user) {
        Ok(content) => {
            print!("{content}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(user, error = %e, "readhome failed");
            ExitCode::FAILURE
        }
    }
}

fn add_cmd(user: &str, identity: &str, issuer: &str) -> ExitCode {
    let kind = if identity.contains('@') {
        MatcherKind::Email
    } else {
        MatcherKind::Sub
    };
    let engine = PolicyEngine::new(
        Arc::new(RealFs),
        SYSTEM_POLICY_PATH,
        Box::new(opkssh::policy::NoHomePolicy),
    );
    match engine.add_entry(&PolicyEntry {
        principal: user.to_string(),
        kind,
        value: identity.to_string(),
        issuer: issuer.to_string(),
    }) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "cannot update {}", SYSTEM_POLICY_PATH);
            ExitCode::FAILURE
        }
    }
}
