//! Agent run loop: owns the listening transport and rebinds it when the
//! keeper upgrades the channel to TLS.

use super::core::{Agent, AgentConfig, AgentControl};
use super::enrollment::EnrollmentError;
use super::registrar::{self, RegistrarError, RegistrarProxyResolver};
use crate::rpc::plugins::PluginRegistry;
use crate::transport::auth::SignatureVerifier;
use crate::transport::server::{
    EncryptedSocketServerTransport, NoProxy, ProxyResolver, ServerTransportConfig,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Settle time between answering `upgrade_to_ssl` and tearing the
/// plaintext listener down, so the response still flushes.
const UPGRADE_SETTLE: Duration = Duration::from_millis(300);

#[derive(Error, Debug)]
pub enum AgentRunError {
    #[error(transparent)]
    Registrar(#[from] RegistrarError),

    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

enum Outcome {
    Finished(std::io::Result<()>),
    Upgrade,
}

/// Run an agent until `shutdown` fires. Serves the plaintext transport
/// first; an `upgrade_to_ssl` call rebinds on the adjacent port under
/// mutual TLS and shuts the plaintext listener down.
pub async fn run(
    config: AgentConfig,
    plugin_registry: PluginRegistry,
    shutdown: CancellationToken,
) -> Result<(), AgentRunError> {
    let (control_tx, mut control_rx) = mpsc::channel::<AgentControl>(4);
    let agent = Agent::new(config, plugin_registry, control_tx);
    let config = agent.config().clone();

    info!(
        component = %config.component_name,
        app = %config.app_name,
        subordinate = config.subordinate,
        "starting agent"
    );

    let registrar_runner = match agent.registrar_state() {
        Some(state) => Some(registrar::Runner::start(
            state,
            config.bind_address,
            config.registrar_port,
        )?),
        None => None,
    };

    if agent.sub_client().is_some() {
        let registering = agent.clone();
        tokio::spawn(async move {
            if let Some(client) = registering.sub_client() {
                client.lock().await.register().await;
            }
        });
    }

    let resolver: Arc<dyn ProxyResolver> = match agent.registrar_state() {
        Some(state) => Arc::new(RegistrarProxyResolver(state)),
        None => Arc::new(NoProxy),
    };

    let auth = config
        .keeper_address
        .as_ref()
        .map(|address| Arc::new(SignatureVerifier::new(address)));

    let mut port = config.bind_port;
    let mut tls = None;

    let result = loop {
        let transport = Arc::new(EncryptedSocketServerTransport::new(
            ServerTransportConfig {
                bind_address: config.bind_address,
                port,
                whitelisted_addresses: config.whitelisted_addresses.clone(),
                verify_source_address: config.verify_source_address,
                auth: auth.clone(),
                tls: tls.clone(),
            },
            agent.dispatcher(),
            resolver.clone(),
        ));

        let serve_token = shutdown.child_token();
        let outcome = {
            let serve_fut = transport.serve(serve_token.clone());
            tokio::pin!(serve_fut);
            loop {
                tokio::select! {
                    result = &mut serve_fut => break Outcome::Finished(result),
                    control = control_rx.recv() => {
                        if let Some(AgentControl::UpgradeToTls) = control {
                            tokio::time::sleep(UPGRADE_SETTLE).await;
                            serve_token.cancel();
                            let _ = (&mut serve_fut).await;
                            break Outcome::Upgrade;
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::Finished(result) => break result.map_err(AgentRunError::from),
            Outcome::Upgrade => {
                match agent.enrollment().tls_server_config() {
                    Ok(server_config) => {
                        port = config.bind_port + 1;
                        tls = Some(server_config);
                        info!(port, "plaintext listener stopped, rebinding under tls");
                    }
                    Err(err) => {
                        error!(%err, "tls upgrade failed, keeping plaintext listener");
                    }
                }
            }
        }
    };

    if let Some(runner) = registrar_runner {
        runner.stop().await;
    }
    result
}
