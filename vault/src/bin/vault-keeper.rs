use clap::Parser;
use fabric_vault::keeper::app_manager::{AppManager, AppManagerError};
use fabric_vault::keeper::ca::CertificateAuthority;
use fabric_vault::keeper::config::{ApplicationConfig, KeeperPaths};
use fabric_vault::keeper::keyring::OsKeyring;
use fabric_vault::logging;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const EXIT_CONFIG: u8 = 2;
const EXIT_CA: u8 = 3;

/// Keeper: runs in the operator's protected environment and keeps every
/// agent of the managed applications converged on the declared state.
#[derive(Debug, Parser)]
#[command(name = "vault-keeper", about, version)]
struct Cli {
    /// Keeper root directory holding the CA store and per-app layouts.
    #[arg(long, env = "VAULT_ROOT_DIR")]
    root_dir: Option<PathBuf>,

    /// Applications to manage; default is every app under the root.
    #[arg(long = "app", value_delimiter = ',')]
    apps: Vec<String>,

    /// Contact agents once and exit.
    #[arg(long, env = "VAULT_RUN_ONCE")]
    run_once: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    logging::install();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install rustls crypto provider");

    let cli = Cli::parse();
    let paths = KeeperPaths::new(&cli.root_dir.unwrap_or_else(KeeperPaths::default_root));

    let apps = if cli.apps.is_empty() {
        match paths.discover_apps() {
            Ok(apps) => apps,
            Err(err) => {
                error!(root = %paths.root().display(), %err, "cannot read keeper root");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    } else {
        cli.apps
    };

    if apps.is_empty() {
        error!(root = %paths.root().display(), "no applications configured");
        return ExitCode::from(EXIT_CONFIG);
    }

    let ca = match CertificateAuthority::load_or_init(&paths.ca_dir()) {
        Ok(ca) => Arc::new(ca),
        Err(err) => {
            error!(%err, "certificate authority unavailable");
            return ExitCode::from(EXIT_CA);
        }
    };
    let keys = Arc::new(OsKeyring::new());

    let mut managers = Vec::new();
    for app in &apps {
        let mut config = match ApplicationConfig::load(&paths.app_config(app)) {
            Ok(config) => config,
            Err(err) => {
                error!(app, %err, "configuration error");
                return ExitCode::from(EXIT_CONFIG);
            }
        };
        config.run_once |= cli.run_once;

        match AppManager::new(config, &paths, ca.clone(), keys.clone()) {
            Ok(manager) => managers.push(manager),
            Err(AppManagerError::Config(err)) => {
                error!(app, %err, "configuration error");
                return ExitCode::from(EXIT_CONFIG);
            }
            Err(AppManagerError::Ca(err)) => {
                error!(app, %err, "certificate authority error");
                return ExitCode::from(EXIT_CA);
            }
        }
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_token.cancel();
        }
    });

    let mut handles = Vec::new();
    for manager in managers {
        let app = manager.app_name().to_string();
        info!(app, "starting application manager");
        handles.push(tokio::spawn(manager.run(shutdown.child_token())));
    }

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(AppManagerError::Config(err))) => {
                error!(%err, "configuration error");
                return ExitCode::from(EXIT_CONFIG);
            }
            Ok(Err(AppManagerError::Ca(err))) => {
                error!(%err, "certificate authority error");
                return ExitCode::from(EXIT_CA);
            }
            Err(err) => error!(%err, "application manager panicked"),
        }
    }

    ExitCode::SUCCESS
}
