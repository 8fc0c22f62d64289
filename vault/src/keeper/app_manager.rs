//! Per-application lifecycle: owns the agent set, the per-agent task
//! pipeline and the connection state machine.

use super::ca::{CaError, CertificateAuthority};
use super::config::{ApplicationConfig, ConfigError, KeeperPaths};
use super::discovery::{discovery_loop, NodeDirectoryClient};
use super::enroll::{enroll_agent, EnrollError};
use super::keyring::{signer_for, SigningKeyError, SigningKeyProvider};
use super::sync::sync_objects;
use super::tasks::{ConnectionPhase, FailureReason, KeeperTaskKind};
use super::AgentIdentity;
use crate::agent::api::{AgentApi, AgentCallError, RpcAgentClient, SubAgentInfo};
use crate::event::channel::pub_sub;
use crate::event::AgentSetEvent;
use crate::state::{FsEntryStateManager, RemoteStateDirective};
use crate::transport::client::EncryptedSocketClientTransport;
use crate::transport::tls::{self, TlsSetupError};
use crate::transport::FailureSymbol;
use crate::utils::retry::backoff;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum AppManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ca(#[from] CaError),
}

/// Everything one agent cycle needs, shared across per-agent tasks.
struct CycleContext {
    app: ApplicationConfig,
    specs: HashMap<String, ComponentSpec>,
    ca: Arc<CertificateAuthority>,
    keys: Arc<dyn SigningKeyProvider>,
    keeper_cert_pem: String,
    keeper_key_pem: String,
}

/// Resolved view of one configured component.
pub struct ComponentSpec {
    pub name: String,
    pub remote_workdir: PathBuf,
    pub directives: Vec<RemoteStateDirective>,
    pub staging: PathBuf,
    pub common_dir: PathBuf,
    pub pipeline: Vec<KeeperTaskKind>,
}

impl ComponentSpec {
    fn build_managers(&self) -> Vec<FsEntryStateManager> {
        self.directives
            .iter()
            .map(|directive| {
                FsEntryStateManager::new(
                    directive.clone(),
                    &self.staging,
                    Some(&self.common_dir),
                    &self.remote_workdir,
                )
            })
            .collect()
    }
}

/// Keeper-side state for one agent address.
pub struct AgentRuntime {
    address: String,
    component: Option<String>,
    managers: HashMap<String, Vec<FsEntryStateManager>>,
    enrolled: HashSet<String>,
    client: Option<RpcAgentClient>,
    pub phase: ConnectionPhase,
    retry_attempt: u32,
}

impl AgentRuntime {
    fn new(address: &str) -> Self {
        AgentRuntime {
            address: address.to_string(),
            component: None,
            managers: HashMap::new(),
            enrolled: HashSet::new(),
            client: None,
            phase: ConnectionPhase::Discovered,
            retry_attempt: 0,
        }
    }
}

pub struct AppManager {
    ctx: Arc<CycleContext>,
    agents: HashMap<String, AgentRuntime>,
}

impl AppManager {
    pub fn new(
        config: ApplicationConfig,
        paths: &KeeperPaths,
        ca: Arc<CertificateAuthority>,
        keys: Arc<dyn SigningKeyProvider>,
    ) -> Result<Self, AppManagerError> {
        config.validate()?;

        let mut specs = HashMap::new();
        for (name, component) in &config.components {
            let pipeline = if component.tasks.is_empty() {
                KeeperTaskKind::default_pipeline()
            } else {
                component
                    .tasks
                    .iter()
                    .filter_map(|t| KeeperTaskKind::parse(t))
                    .collect()
            };
            specs.insert(
                name.clone(),
                ComponentSpec {
                    name: name.clone(),
                    remote_workdir: component.remote_workdir.clone(),
                    directives: config.resolved_directives(name),
                    staging: paths.component_staging(&config.app_name, name),
                    common_dir: paths.common_files(&config.app_name),
                    pipeline,
                },
            );
        }

        // Early visibility: compute local hashes once at startup so
        // missing objects show up before the first agent is reached.
        for spec in specs.values() {
            for mut manager in spec.build_managers() {
                if let Err(err) = manager.validate_local_object() {
                    warn!(component = %spec.name, %err, "local object check");
                }
            }
        }

        let keeper_cn = format!("keeper.{}.com", config.app_name);
        let (keeper_cert_pem, keeper_key_pem) = ca.issue_identity(&keeper_cn)?;

        Ok(AppManager {
            ctx: Arc::new(CycleContext {
                app: config,
                specs,
                ca,
                keys,
                keeper_cert_pem,
                keeper_key_pem,
            }),
            agents: HashMap::new(),
        })
    }

    pub fn app_name(&self) -> &str {
        &self.ctx.app.app_name
    }

    /// Poll until shutdown: resolve the agent set, run one pipeline cycle
    /// per agent in parallel, sleep the polling interval.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), AppManagerError> {
        let explicit = !self.ctx.app.agents.is_empty();
        let mut addresses = self.ctx.app.agents.clone();

        let (publisher, mut discovered) = pub_sub::<AgentSetEvent>();
        if !explicit {
            let client = NodeDirectoryClient::new(&self.ctx.app.node_directory);
            tokio::spawn(discovery_loop(
                client,
                self.ctx.app.app_name.clone(),
                publisher,
                shutdown.child_token(),
            ));
        }

        loop {
            if !explicit {
                while let Some(event) = discovered.try_recv() {
                    addresses = event.addresses;
                }
            }

            if addresses.is_empty() {
                debug!(app = %self.ctx.app.app_name, "no agents known yet");
            } else {
                self.run_cycle(&addresses).await;
            }

            if self.ctx.app.run_once {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.app.polling_interval) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// One polling cycle: each agent gets its own task; a failing agent
    /// never affects the others.
    async fn run_cycle(&mut self, addresses: &[String]) {
        // Forget agents that fell out of the set.
        self.agents.retain(|address, _| {
            addresses.iter().any(|a| a == address)
        });

        let mut handles = Vec::with_capacity(addresses.len());
        for address in addresses {
            let mut runtime = self
                .agents
                .remove(address)
                .unwrap_or_else(|| AgentRuntime::new(address));
            let ctx = self.ctx.clone();
            handles.push(tokio::spawn(async move {
                run_agent_cycle(ctx, &mut runtime).await;
                runtime
            }));
        }

        for handle in handles {
            if let Ok(runtime) = handle.await {
                self.agents.insert(runtime.address.clone(), runtime);
            }
        }
    }
}

#[derive(Error, Debug)]
enum CycleError {
    #[error("transport failed on {0}")]
    Transport(FailureSymbol),

    #[error(transparent)]
    SigningKey(#[from] SigningKeyError),

    #[error(transparent)]
    Call(#[from] AgentCallError),

    #[error(transparent)]
    Enroll(#[from] EnrollError),

    #[error(transparent)]
    Tls(#[from] TlsSetupError),

    #[error("agent reported no component name")]
    NoComponent,
}

impl CycleError {
    fn failure_reason(&self) -> FailureReason {
        match self {
            CycleError::Transport(symbol) => FailureReason::Transport(*symbol),
            CycleError::Enroll(_) => FailureReason::Enrollment,
            other => FailureReason::Task(other.to_string()),
        }
    }
}

/// Run the pipeline for one agent. Only a failure after the connection
/// reached `READY` earns one in-cycle retry with exponential backoff;
/// anything that dies earlier waits for the next polling interval.
async fn run_agent_cycle(ctx: Arc<CycleContext>, runtime: &mut AgentRuntime) {
    loop {
        match agent_cycle(&ctx, runtime).await {
            Ok(()) => {
                runtime.phase = ConnectionPhase::Disconnected;
                runtime.retry_attempt = 0;
                return;
            }
            Err(err) => {
                error!(agent = %runtime.address, %err, "agent cycle failed");
                let was_ready = runtime.phase == ConnectionPhase::Ready;
                runtime.phase = ConnectionPhase::Failed(err.failure_reason());
                runtime.client = None;

                if !was_ready || runtime.retry_attempt >= 1 {
                    runtime.retry_attempt = 0;
                    return;
                }
                let delay = backoff(runtime.retry_attempt, RETRY_BACKOFF_CAP);
                runtime.retry_attempt += 1;
                debug!(agent = %runtime.address, ?delay, "retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn agent_cycle(ctx: &CycleContext, runtime: &mut AgentRuntime) -> Result<(), CycleError> {
    let address = runtime.address.clone();

    // Reuse the open transport when the config keeps connections alive.
    let mut client = match runtime.client.take().filter(|c| c.transport().connected()) {
        Some(client) => client,
        None => {
            runtime.phase = ConnectionPhase::Connecting;
            let tls_cn = runtime
                .component
                .as_ref()
                .filter(|c| runtime.enrolled.contains(*c))
                .map(|c| common_name(ctx, c));
            let client = connect_endpoint(ctx, &address, None, tls_cn.as_deref(), None).await?;
            runtime.phase = match tls_cn {
                Some(_) => ConnectionPhase::TlsConnected,
                None => ConnectionPhase::Encrypted,
            };
            client
        }
    };

    let state = client.get_state().await?;
    let component = state
        .get("component_name")
        .and_then(|c| c.as_str())
        .ok_or(CycleError::NoComponent)?
        .to_string();
    runtime.component = Some(component.clone());

    let identity = AgentIdentity::new(&ctx.app.app_name, &address, &component);
    debug!(%identity, "agent identified");

    let Some(spec) = ctx.specs.get(&component) else {
        warn!(agent = %address, %component, "no configuration for component, skipping agent");
        client.transport_mut().disconnect().await;
        return Ok(());
    };

    runtime
        .managers
        .entry(component.clone())
        .or_insert_with(|| spec.build_managers());

    let result = run_pipeline(ctx, runtime, &mut client, &component).await;

    match result {
        Ok(()) => {
            runtime.phase = ConnectionPhase::Ready;
            if ctx.app.stay_connected {
                runtime.client = Some(client);
            } else {
                client.transport_mut().disconnect().await;
            }
            Ok(())
        }
        Err(err) => {
            client.transport_mut().disconnect().await;
            Err(err)
        }
    }
}

async fn run_pipeline(
    ctx: &CycleContext,
    runtime: &mut AgentRuntime,
    client: &mut RpcAgentClient,
    component: &str,
) -> Result<(), CycleError> {
    let spec = &ctx.specs[component];

    for task in &spec.pipeline {
        // Enrollment still belongs to connection establishment; once the
        // data tasks start the agent counts as READY, which is what gates
        // the in-cycle retry on failure.
        if *task != KeeperTaskKind::EnrollSubordinates {
            runtime.phase = ConnectionPhase::Ready;
        }
        debug!(agent = %runtime.address, %task, "running task");
        match task {
            KeeperTaskKind::EnrollSubordinates => {
                enroll_primary_if_needed(ctx, runtime, client, component).await?;

                let subs = client.get_subagents().await?;
                for sub in subs {
                    if let Err(err) = handle_subordinate(ctx, runtime, &sub).await {
                        // One subordinate must not block the rest; its
                        // enrollment retries next cycle.
                        error!(
                            agent = %runtime.address,
                            subordinate = %sub.name,
                            %err,
                            "subordinate cycle failed"
                        );
                    }
                }
            }
            KeeperTaskKind::SyncObjects => {
                let managers = runtime
                    .managers
                    .get_mut(component)
                    .expect("managers created before the pipeline");
                sync_objects(client, managers).await?;
            }
            KeeperTaskKind::GetState => {
                let state = client.get_state().await?;
                info!(
                    agent = %runtime.address,
                    component,
                    enrolled = state.get("enrolled").and_then(|e| e.as_bool()).unwrap_or(false),
                    "state snapshot fetched"
                );
            }
        }
    }
    Ok(())
}

/// Scenario: an unenrolled agent answers on the plaintext port. Enroll
/// it, then move the conversation to the adjacent TLS port.
async fn enroll_primary_if_needed(
    ctx: &CycleContext,
    runtime: &mut AgentRuntime,
    client: &mut RpcAgentClient,
    component: &str,
) -> Result<(), CycleError> {
    if runtime.enrolled.contains(component) {
        return Ok(());
    }

    runtime.phase = ConnectionPhase::Enrolling;
    let cn = common_name(ctx, component);
    enroll_agent(client, &ctx.ca, &cn).await?;
    runtime.enrolled.insert(component.to_string());
    runtime.phase = ConnectionPhase::Enrolled;

    client.transport_mut().disconnect().await;
    let address = runtime.address.clone();
    *client = connect_endpoint(ctx, &address, None, Some(&cn), None).await?;
    runtime.phase = ConnectionPhase::TlsConnected;
    Ok(())
}

/// Full cycle for one subordinate, reached through its primary as proxy:
/// enroll if needed, then sync and snapshot.
async fn handle_subordinate(
    ctx: &CycleContext,
    runtime: &mut AgentRuntime,
    sub: &SubAgentInfo,
) -> Result<(), CycleError> {
    let component = sub.name.clone();
    let Some(spec) = ctx.specs.get(&component) else {
        warn!(subordinate = %component, "no configuration for subordinate, skipping");
        return Ok(());
    };

    runtime
        .managers
        .entry(component.clone())
        .or_insert_with(|| spec.build_managers());

    let primary_component = runtime.component.clone().unwrap_or_default();
    let outer_cn = runtime
        .enrolled
        .contains(&primary_component)
        .then(|| common_name(ctx, &primary_component));
    let sub_cn = common_name(ctx, &component);
    let address = runtime.address.clone();

    let enrolled = runtime.enrolled.contains(&component) || sub.enrolled;

    let mut client = connect_endpoint(
        ctx,
        &address,
        Some(&component),
        enrolled.then_some(sub_cn.as_str()),
        outer_cn.as_deref(),
    )
    .await?;

    if !enrolled {
        enroll_agent(&mut client, &ctx.ca, &sub_cn).await?;
        runtime.enrolled.insert(component.clone());

        client.transport_mut().disconnect().await;
        client = connect_endpoint(
            ctx,
            &address,
            Some(&component),
            Some(&sub_cn),
            outer_cn.as_deref(),
        )
        .await?;
    } else {
        runtime.enrolled.insert(component.clone());
    }

    let managers = runtime
        .managers
        .get_mut(&component)
        .expect("managers created above");
    sync_objects(&mut client, managers).await?;

    let state = client.get_state().await?;
    debug!(subordinate = %component, ?state, "subordinate state fetched");

    client.transport_mut().disconnect().await;
    Ok(())
}

fn common_name(ctx: &CycleContext, component: &str) -> String {
    format!("{component}.{}.com", ctx.app.app_name)
}

/// Open a transport to an endpoint, answering a signature challenge with
/// a key from the secret store when the agent demands one. The retry
/// happens exactly once.
async fn connect_endpoint(
    ctx: &CycleContext,
    address: &str,
    proxy_target: Option<&str>,
    tls_cn: Option<&str>,
    outer_tls_cn: Option<&str>,
) -> Result<RpcAgentClient, CycleError> {
    let port = match (proxy_target, outer_tls_cn, tls_cn) {
        // Direct TLS endpoints answer on the adjacent port; proxied
        // sessions always dial the primary, whose own mode decides.
        (None, _, Some(_)) => ctx.app.comms_port + 1,
        (Some(_), Some(_), _) => ctx.app.comms_port + 1,
        _ => ctx.app.comms_port,
    };

    let mut transport = EncryptedSocketClientTransport::new(address, port);
    if let Some(timeout) = ctx.app.rpc_timeout {
        transport = transport.with_data_timeout(timeout);
    }
    if let Some(target) = proxy_target {
        transport = transport.with_proxy_target(target);
    }
    if let Some(cn) = tls_cn {
        let config = tls::client_config(
            ctx.keeper_cert_pem.as_bytes(),
            ctx.keeper_key_pem.as_bytes(),
            ctx.ca.ca_cert_pem().as_bytes(),
        )?;
        transport = transport.with_tls(config, tls::server_name(cn)?);
    }
    if let Some(cn) = outer_tls_cn {
        let config = tls::client_config(
            ctx.keeper_cert_pem.as_bytes(),
            ctx.keeper_key_pem.as_bytes(),
            ctx.ca.ca_cert_pem().as_bytes(),
        )?;
        transport = transport.with_outer_tls(config, tls::server_name(cn)?);
    }

    transport.connect().await;

    if !transport.connected() {
        let symbol = transport.failed_on.unwrap_or(FailureSymbol::NoSocket);
        let demanded = match symbol {
            FailureSymbol::AuthAddressRequired | FailureSymbol::AuthDenied => {
                transport.auth_address.clone()
            }
            FailureSymbol::ProxyAuthAddressRequired | FailureSymbol::ProxyAuthDenied => {
                transport.proxy_auth_address.clone()
            }
            FailureSymbol::NoSocket => return Err(CycleError::Transport(symbol)),
        };

        let identity = demanded
            .or_else(|| ctx.app.signing_identity.clone())
            .ok_or(CycleError::Transport(symbol))?;

        info!(address, %identity, "agent demands a signed connection, loading key");
        let signer = signer_for(ctx.keys.as_ref(), &identity)?;
        transport.set_signer(signer);
        transport.connect().await;

        if !transport.connected() {
            let symbol = transport.failed_on.unwrap_or(FailureSymbol::NoSocket);
            error!(address, "cannot connect after retrying with authentication");
            return Err(CycleError::Transport(symbol));
        }
    }

    Ok(RpcAgentClient::new(transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keeper::keyring::tests::StaticKeyring;
    use std::collections::HashMap as StdHashMap;

    fn sample_config() -> ApplicationConfig {
        serde_yaml::from_str(
            r#"
app_name: demoapp
agents: ["127.0.0.1"]
components:
  web:
    remote_workdir: /app
    directives:
      - name: quotes.txt
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_manager_builds_specs_and_keeper_identity() {
        let tempdir = tempfile::tempdir().unwrap();
        let paths = KeeperPaths::new(tempdir.path());
        let ca = Arc::new(CertificateAuthority::load_or_init(&paths.ca_dir()).unwrap());

        let manager = AppManager::new(
            sample_config(),
            &paths,
            ca.clone(),
            Arc::new(StaticKeyring(StdHashMap::new())),
        )
        .unwrap();

        assert_eq!(manager.app_name(), "demoapp");
        assert!(ca.has_leaf("keeper.demoapp.com"));

        let spec = &manager.ctx.specs["web"];
        assert_eq!(spec.remote_workdir, PathBuf::from("/app"));
        assert_eq!(spec.pipeline, KeeperTaskKind::default_pipeline());
        assert_eq!(spec.directives.len(), 1);
    }

    #[tokio::test]
    async fn test_pre_ready_failure_does_not_retry_in_cycle() {
        let tempdir = tempfile::tempdir().unwrap();
        let paths = KeeperPaths::new(tempdir.path());
        let ca = Arc::new(CertificateAuthority::load_or_init(&paths.ca_dir()).unwrap());

        let mut config = sample_config();
        // A port nobody listens on: the connect attempt fails long before
        // the agent could have reached READY.
        config.comms_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let manager = AppManager::new(
            config,
            &paths,
            ca,
            Arc::new(StaticKeyring(StdHashMap::new())),
        )
        .unwrap();

        let mut runtime = AgentRuntime::new("127.0.0.1");
        let start = std::time::Instant::now();
        run_agent_cycle(manager.ctx.clone(), &mut runtime).await;

        assert!(matches!(runtime.phase, ConnectionPhase::Failed(_)));
        assert_eq!(runtime.retry_attempt, 0);
        // The backoff-retry branch sleeps at least a second; a pre-READY
        // failure must return without it.
        assert!(
            start.elapsed() < Duration::from_millis(900),
            "pre-READY failure backed off and retried"
        );
    }

    #[test]
    fn test_component_spec_builds_one_manager_per_directive() {
        let tempdir = tempfile::tempdir().unwrap();
        let spec = ComponentSpec {
            name: "web".to_string(),
            remote_workdir: PathBuf::from("/app"),
            directives: vec![
                RemoteStateDirective::new("a", Default::default()),
                RemoteStateDirective::new("b", Default::default()),
            ],
            staging: tempdir.path().to_path_buf(),
            common_dir: tempdir.path().join("common"),
            pipeline: KeeperTaskKind::default_pipeline(),
        };

        let managers = spec.build_managers();
        assert_eq!(managers.len(), 2);
        assert_eq!(
            managers[0].absolute_remote_path(),
            PathBuf::from("/app/a")
        );
    }
}
