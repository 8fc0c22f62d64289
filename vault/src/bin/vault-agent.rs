use clap::Parser;
use fabric_vault::agent::core::{AgentConfig, PrimaryAgentInfo};
use fabric_vault::agent::registrar::DEFAULT_REGISTRAR_PORT;
use fabric_vault::agent::run;
use fabric_vault::logging;
use fabric_vault::rpc::plugins::PluginRegistry;
use fabric_vault::utils::naming;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Agent: runs inside an application container on a fabric node and
/// serves one keeper.
#[derive(Debug, Parser)]
#[command(name = "vault-agent", about, version)]
struct Cli {
    #[arg(long, env = "VAULT_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: IpAddr,

    #[arg(long, env = "VAULT_BIND_PORT", default_value = "8888")]
    bind_port: u16,

    /// Where managed objects are stored.
    #[arg(long, env = "VAULT_WORKING_DIR", default_value = "/tmp")]
    working_dir: PathBuf,

    /// Component name; derived from the container hostname when omitted.
    #[arg(long, env = "VAULT_COMPONENT_NAME")]
    component: Option<String>,

    /// Application name; derived from the container hostname when
    /// omitted.
    #[arg(long, env = "VAULT_APP_NAME")]
    app: Option<String>,

    /// Addresses allowed to connect, comma separated.
    #[arg(long, env = "VAULT_WHITELIST_ADDRESSES", value_delimiter = ',')]
    whitelist_addresses: Vec<IpAddr>,

    /// Demand keeper connections signed for this fabric address.
    #[arg(long, env = "VAULT_KEEPER_ADDRESS")]
    keeper_address: Option<String>,

    /// Run as a subordinate that registers with a primary agent.
    #[arg(long, env = "VAULT_SUBORDINATE")]
    subordinate: bool,

    #[arg(long, env = "VAULT_PRIMARY_ADDRESS")]
    primary_address: Option<String>,

    #[arg(long, env = "VAULT_PRIMARY_PORT", default_value_t = DEFAULT_REGISTRAR_PORT)]
    primary_port: u16,

    /// Run the registrar so subordinates can announce themselves.
    #[arg(long, env = "VAULT_REGISTRAR")]
    registrar: bool,

    #[arg(long, env = "VAULT_REGISTRAR_PORT", default_value_t = DEFAULT_REGISTRAR_PORT)]
    registrar_port: u16,

    /// Serve staged files to pod-local components from this directory.
    #[arg(long, env = "VAULT_FILESERVER_DIR")]
    fileserver_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    logging::install();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install rustls crypto provider");

    let cli = Cli::parse();
    let (component_name, app_name) = naming::resolve_identity(cli.component, cli.app);
    info!(component = %component_name, app = %app_name, "agent identity resolved");

    let mut config = AgentConfig::new(&component_name, &app_name, &cli.working_dir);
    config.bind_address = cli.bind_address;
    config.bind_port = cli.bind_port;
    config.keeper_address = cli.keeper_address;
    config.subordinate = cli.subordinate;
    config.enable_registrar = cli.registrar;
    config.registrar_port = cli.registrar_port;
    config.fileserver_dir = cli.fileserver_dir;

    // Without signature auth the source whitelist is the only gate; keep
    // it on and default it to loopback rather than listening wide open.
    config.whitelisted_addresses = cli.whitelist_addresses;
    if config.keeper_address.is_none() {
        config.verify_source_address = true;
        if config.whitelisted_addresses.is_empty() {
            config.whitelisted_addresses = vec![IpAddr::from([127, 0, 0, 1])];
        }
    }

    if cli.subordinate {
        let Some(primary_address) = cli.primary_address else {
            error!("--primary-address is required in subordinate mode");
            return ExitCode::from(2);
        };
        config.primary = Some(PrimaryAgentInfo {
            name: "primary".to_string(),
            address: primary_address,
            port: cli.primary_port,
        });
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_token.cancel();
        }
    });

    match run::run(config, PluginRegistry::default(), shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "agent stopped");
            ExitCode::FAILURE
        }
    }
}
