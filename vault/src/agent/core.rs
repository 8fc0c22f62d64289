//! The agent itself: configuration, RPC method implementations, and the
//! wiring between dispatcher, enrollment, registrar and transport.

use super::api::{methods, ObjectCrc, ObjectWrite, SubAgentInfo};
use super::enrollment::Enrollment;
use super::registrar::{RegistrarState, SubAgentClient};
use crate::fs_tree::hash;
use crate::rpc::dispatch::{method, Dispatcher, RequestContext};
use crate::rpc::jsonrpc::RpcError;
use crate::rpc::plugins::{self, PluginRegistry};
use crate::transport::stream::{self, FileChunk, FILE_CHUNK_METHOD};
use fs::file::deleter::FileDeleter;
use fs::file::writer::FileWriter;
use fs::file::LocalFile;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Reachability details of the primary agent fronting this container's
/// application.
#[derive(Debug, Clone)]
pub struct PrimaryAgentInfo {
    pub name: String,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind_address: IpAddr,
    pub bind_port: u16,
    pub working_dir: PathBuf,
    pub component_name: String,
    pub app_name: String,
    pub whitelisted_addresses: Vec<IpAddr>,
    pub verify_source_address: bool,
    /// Require keepers to sign for this fabric address before the
    /// handshake proceeds.
    pub keeper_address: Option<String>,
    pub subordinate: bool,
    pub primary: Option<PrimaryAgentInfo>,
    pub enable_registrar: bool,
    pub registrar_port: u16,
    pub fileserver_dir: Option<PathBuf>,
    /// Command prefix used to install plugin packages.
    pub package_manager: Vec<String>,
}

impl AgentConfig {
    pub fn new(component_name: &str, app_name: &str, working_dir: &Path) -> Self {
        AgentConfig {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            bind_port: 8888,
            working_dir: working_dir.to_path_buf(),
            component_name: component_name.to_string(),
            app_name: app_name.to_string(),
            whitelisted_addresses: Vec::new(),
            verify_source_address: false,
            keeper_address: None,
            subordinate: false,
            primary: None,
            enable_registrar: false,
            registrar_port: super::registrar::DEFAULT_REGISTRAR_PORT,
            fileserver_dir: None,
            package_manager: vec![
                "apt-get".to_string(),
                "install".to_string(),
                "-y".to_string(),
            ],
        }
    }
}

/// Signals from RPC methods to the agent run loop.
#[derive(Debug)]
pub enum AgentControl {
    /// Rebind the listener on the adjacent port under mutual TLS and shut
    /// the plaintext listener down.
    UpgradeToTls,
}

pub struct Agent {
    config: AgentConfig,
    dispatcher: Arc<Dispatcher>,
    plugin_registry: PluginRegistry,
    enrollment: Enrollment,
    registrar: Option<Arc<RegistrarState>>,
    control_tx: mpsc::Sender<AgentControl>,
    sub_client: Option<tokio::sync::Mutex<SubAgentClient>>,
    files: LocalFile,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        plugin_registry: PluginRegistry,
        control_tx: mpsc::Sender<AgentControl>,
    ) -> Arc<Agent> {
        let registrar = config
            .enable_registrar
            .then(|| RegistrarState::new(&config.app_name, config.fileserver_dir.clone()));

        let sub_client = config.primary.as_ref().filter(|_| config.subordinate).map(|primary| {
            let info = SubAgentInfo {
                name: config.component_name.clone(),
                app_name: config.app_name.clone(),
                role: "NotAssigned".to_string(),
                enrolled: false,
                address: Some(own_address(&config)),
                port: config.bind_port,
            };
            tokio::sync::Mutex::new(SubAgentClient::new(&primary.address, primary.port, info))
        });

        let enrollment = Enrollment::new(&config.component_name, &config.app_name);

        let agent = Arc::new(Agent {
            config,
            dispatcher: Arc::new(Dispatcher::new()),
            plugin_registry,
            enrollment,
            registrar,
            control_tx,
            sub_client,
            files: LocalFile,
        });
        agent.register_methods();
        agent
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn enrollment(&self) -> &Enrollment {
        &self.enrollment
    }

    pub fn registrar_state(&self) -> Option<Arc<RegistrarState>> {
        self.registrar.clone()
    }

    pub fn sub_client(&self) -> Option<&tokio::sync::Mutex<SubAgentClient>> {
        self.sub_client.as_ref()
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.config.working_dir.join(p)
        }
    }

    fn register_methods(self: &Arc<Self>) {
        macro_rules! register {
            ($name:expr, $handler:ident) => {{
                let agent = Arc::clone(self);
                self.dispatcher.add_method(
                    $name,
                    Arc::new(method(move |params, ctx| {
                        let agent = agent.clone();
                        async move { agent.$handler(params, ctx).await }
                    })),
                );
            }};
        }

        register!(methods::GET_METHODS, get_methods);
        register!(methods::GET_STATE, get_state);
        register!(methods::GET_ALL_OBJECT_HASHES, get_all_object_hashes);
        register!(methods::GET_DIRECTORY_HASHES, get_directory_hashes);
        register!(methods::WRITE_OBJECT, write_object);
        register!(methods::WRITE_OBJECTS, write_objects);
        register!(methods::REMOVE_OBJECTS, remove_objects);
        register!(methods::GET_SUBAGENTS, get_subagents);
        register!(methods::GENERATE_CSR, generate_csr);
        register!(methods::INSTALL_CERT, install_cert);
        register!(methods::INSTALL_CA_CERT, install_ca_cert);
        register!(methods::UPGRADE_TO_SSL, upgrade_to_ssl);
        register!(methods::LOAD_PLUGINS, load_plugins);
        register!(methods::LIST_SERVER_DETAILS, list_server_details);
        register!(methods::CONNECT_SHELL, connect_shell);
        register!(methods::DISCONNECT_SHELL, disconnect_shell);
        register!(FILE_CHUNK_METHOD, file_chunk);
    }

    async fn get_methods(
        &self,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        Ok(json!(self.dispatcher.method_names()))
    }

    async fn get_state(
        &self,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        let primary = self.config.primary.as_ref().map(|p| {
            json!({"name": p.name, "address": p.address, "port": p.port})
        });
        Ok(json!({
            "component_name": self.config.component_name,
            "app_name": self.config.app_name,
            "working_dir": self.config.working_dir,
            "bind_port": self.config.bind_port,
            "subordinate": self.config.subordinate,
            "enable_registrar": self.config.enable_registrar,
            "verify_source_address": self.config.verify_source_address,
            "whitelisted_addresses": self.config.whitelisted_addresses,
            "enrolled": self.enrollment.is_enrolled(),
            "methods": self.dispatcher.method_names(),
            "plugins": self.dispatcher.plugin_names(),
            "primary_agent": primary,
        }))
    }

    async fn get_all_object_hashes(
        &self,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        struct Params {
            paths: Vec<String>,
        }
        let params: Params = parse_params(params)?;

        info!(count = params.paths.len(), "returning crc for objects");
        let mut report = Vec::with_capacity(params.paths.len());
        for name in params.paths {
            let path = self.resolve(&name);
            let crc32 = tokio::task::spawn_blocking(move || hash::object_crc(&path))
                .await
                .map_err(internal)?
                .map_err(internal)?;
            report.push(ObjectCrc { name, crc32 });
        }
        Ok(json!(report))
    }

    async fn get_directory_hashes(
        &self,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        struct Params {
            path: String,
        }
        let params: Params = parse_params(params)?;

        let path = self.resolve(&params.path);
        let hashes = tokio::task::spawn_blocking(move || hash::directory_hashes(&path))
            .await
            .map_err(internal)?
            .map_err(internal)?;
        Ok(serde_json::to_value(hashes).map_err(internal)?)
    }

    async fn write_object(
        &self,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        let object: ObjectWrite = parse_params(params)?;
        self.write_object_impl(object).await?;
        Ok(Value::Null)
    }

    async fn write_objects(
        &self,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        struct Params {
            objects: Vec<ObjectWrite>,
        }
        let params: Params = parse_params(params)?;
        for object in params.objects {
            self.write_object_impl(object).await?;
        }
        Ok(Value::Null)
    }

    async fn write_object_impl(&self, object: ObjectWrite) -> Result<(), RpcError> {
        let path = self.resolve(&object.path);
        let data = hex::decode(&object.data)
            .map_err(|e| RpcError::InvalidParams(format!("data is not hex: {e}")))?;

        info!(path = %path.display(), bytes = data.len(), "writing object");

        if object.is_dir && data.is_empty() {
            tokio::fs::create_dir_all(&path).await.map_err(internal)?;
            return Ok(());
        }

        // A directory payload is always a tree archive. A file payload is
        // written verbatim unless explicitly flagged compressed; content
        // sniffing would corrupt files that merely look like gzip.
        let extract = object.is_dir
            || (object.compressed && data.starts_with(&[0x1f, 0x8b]));
        let files = self.files.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RpcError> {
            if extract {
                std::fs::create_dir_all(&path).map_err(internal)?;
                let decoder = flate2::read::GzDecoder::new(&data[..]);
                let mut archive = tar::Archive::new(decoder);
                archive.unpack(&path).map_err(internal)?;
            } else {
                files.write(&path, &data).map_err(internal)?;
            }
            Ok(())
        })
        .await
        .map_err(internal)?
    }

    async fn remove_objects(
        &self,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        struct Params {
            paths: Vec<String>,
        }
        let params: Params = parse_params(params)?;

        for name in params.paths {
            let path = self.resolve(&name);
            info!(path = %path.display(), "removing object");
            let files = self.files.clone();
            tokio::task::spawn_blocking(move || files.delete(&path))
                .await
                .map_err(internal)?
                .map_err(internal)?;
        }
        Ok(Value::Null)
    }

    /// Transport bulk-stream sink; one-way, so failures only log.
    async fn file_chunk(
        &self,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        let chunk: FileChunk = parse_params(params)?;
        if let Err(err) = stream::apply_chunk(&self.config.working_dir, &chunk).await {
            error!(path = %chunk.path, %err, "failed to apply streamed chunk");
        }
        Ok(Value::Null)
    }

    async fn get_subagents(
        &self,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        let sub_agents: Vec<SubAgentInfo> = self
            .registrar
            .as_ref()
            .map(|r| r.sub_agents())
            .unwrap_or_default();
        Ok(json!({ "sub_agents": sub_agents }))
    }

    async fn generate_csr(
        &self,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        let csr = self.enrollment.generate_csr().await.map_err(internal)?;
        Ok(json!({ "csr": csr }))
    }

    async fn install_cert(
        &self,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        struct Params {
            cert: String,
        }
        let params: Params = parse_params(params)?;
        self.enrollment
            .install_cert(params.cert.as_bytes())
            .map_err(internal)?;

        // A subordinate tells its primary the moment it holds a leaf, so
        // the keeper sees `enrolled` flip on the next get_subagents.
        if let Some(sub_client) = &self.sub_client {
            sub_client.lock().await.update(true).await;
        }
        Ok(Value::Null)
    }

    async fn install_ca_cert(
        &self,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        struct Params {
            cert: String,
        }
        let params: Params = parse_params(params)?;
        self.enrollment
            .install_ca_cert(params.cert.as_bytes())
            .map_err(internal)?;
        Ok(Value::Null)
    }

    async fn upgrade_to_ssl(
        &self,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        // Validate the staged material now so the caller gets the error
        // inline; the run loop rebinds right after this response flushes.
        self.enrollment.tls_server_config().map_err(internal)?;
        info!("upgrading listener to tls");
        self.control_tx
            .send(AgentControl::UpgradeToTls)
            .await
            .map_err(internal)?;
        Ok(Value::Null)
    }

    async fn load_plugins(
        &self,
        params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        #[derive(Deserialize)]
        struct Params {
            directory: String,
        }
        let params: Params = parse_params(params)?;
        let directory = self.resolve(&params.directory);
        info!(directory = %directory.display(), "loading plugins");

        let loaded = plugins::load_plugins(
            &self.dispatcher,
            &self.plugin_registry,
            &directory,
            &self.config.package_manager,
        )
        .await
        .map_err(internal)?;
        Ok(json!(loaded))
    }

    async fn list_server_details(
        &self,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        Ok(json!({
            "working_dir": self.config.working_dir,
            "plugins": self.dispatcher.plugin_names(),
            "registrar_enabled": self.config.enable_registrar,
        }))
    }

    #[cfg(target_family = "unix")]
    async fn connect_shell(
        &self,
        _params: Option<Value>,
        ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        let connection = ctx
            .connection
            .ok_or_else(|| RpcError::Internal("no connection for shell".to_string()))?;

        let session = crate::transport::pty::spawn_shell().map_err(internal)?;
        info!(peer = %connection.peer(), pid = session.child_pid(), "shell attached");

        connection.attach_pty(session).await;
        connection.proxy_pty().await;
        Ok(Value::Null)
    }

    #[cfg(not(target_family = "unix"))]
    async fn connect_shell(
        &self,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        Err(RpcError::Internal("shell unsupported on this platform".to_string()))
    }

    #[cfg(target_family = "unix")]
    async fn disconnect_shell(
        &self,
        _params: Option<Value>,
        ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        if let Some(connection) = ctx.connection {
            info!(peer = %connection.peer(), "disconnecting shell");
            connection.detach_pty().await;
        }
        Ok(Value::Null)
    }

    #[cfg(not(target_family = "unix"))]
    async fn disconnect_shell(
        &self,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        Ok(Value::Null)
    }
}

fn own_address(config: &AgentConfig) -> String {
    if config.bind_address.is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        config.bind_address.to_string()
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let params = params.unwrap_or(Value::Null);
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

fn internal(err: impl std::fmt::Display) -> RpcError {
    RpcError::Internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::jsonrpc::Request;

    fn test_agent(working_dir: &Path) -> Arc<Agent> {
        let (control_tx, _control_rx) = mpsc::channel(4);
        let mut config = AgentConfig::new("web", "demoapp", working_dir);
        config.enable_registrar = true;
        Agent::new(config, PluginRegistry::default(), control_tx)
    }

    async fn call(agent: &Agent, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = Request::new(method, params, 1);
        agent
            .dispatcher()
            .dispatch(request, RequestContext::test_context())
            .await
            .expect("request carries an id")
            .into_result()
    }

    #[tokio::test]
    async fn test_hashes_resolve_against_working_dir() {
        let tempdir = tempfile::tempdir().unwrap();
        std::fs::write(tempdir.path().join("quotes.txt"), "alpha").unwrap();
        let agent = test_agent(tempdir.path());

        let value = call(
            &agent,
            methods::GET_ALL_OBJECT_HASHES,
            json!({"paths": ["quotes.txt", "missing.txt"]}),
        )
        .await
        .unwrap();

        let report: Vec<ObjectCrc> = serde_json::from_value(value).unwrap();
        assert_eq!(report[0].crc32, 0xd0e0396a);
        assert_eq!(report[1].crc32, 0);
    }

    #[tokio::test]
    async fn test_write_object_lands_file_with_parents() {
        let tempdir = tempfile::tempdir().unwrap();
        let agent = test_agent(tempdir.path());

        call(
            &agent,
            methods::WRITE_OBJECT,
            serde_json::to_value(ObjectWrite::file("nested/deep/quotes.txt", b"alpha")).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(
            std::fs::read(tempdir.path().join("nested/deep/quotes.txt")).unwrap(),
            b"alpha"
        );
    }

    #[tokio::test]
    async fn test_write_object_creates_empty_directory() {
        let tempdir = tempfile::tempdir().unwrap();
        let agent = test_agent(tempdir.path());

        call(
            &agent,
            methods::WRITE_OBJECT,
            serde_json::to_value(ObjectWrite::empty_dir("hollow")).unwrap(),
        )
        .await
        .unwrap();

        assert!(tempdir.path().join("hollow").is_dir());
    }

    #[tokio::test]
    async fn test_write_object_extracts_tarball() {
        let tempdir = tempfile::tempdir().unwrap();
        let agent = test_agent(tempdir.path());

        // Build a small gzip'd tar in memory.
        let mut archive_bytes = Vec::new();
        {
            let encoder =
                flate2::write::GzEncoder::new(&mut archive_bytes, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "inner/quotes.txt", &b"alpha"[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        call(
            &agent,
            methods::WRITE_OBJECT,
            serde_json::to_value(ObjectWrite::tarball("unpacked", &archive_bytes)).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(
            std::fs::read(tempdir.path().join("unpacked/inner/quotes.txt")).unwrap(),
            b"alpha"
        );
    }

    #[tokio::test]
    async fn test_remove_objects_tolerates_missing() {
        let tempdir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tempdir.path().join("tree/kid")).unwrap();
        let agent = test_agent(tempdir.path());

        call(
            &agent,
            methods::REMOVE_OBJECTS,
            json!({"paths": ["tree", "never-existed"]}),
        )
        .await
        .unwrap();

        assert!(!tempdir.path().join("tree").exists());
    }

    #[tokio::test]
    async fn test_get_state_reports_identity() {
        let tempdir = tempfile::tempdir().unwrap();
        let agent = test_agent(tempdir.path());

        let state = call(&agent, methods::GET_STATE, Value::Null).await.unwrap();
        assert_eq!(state["component_name"], "web");
        assert_eq!(state["app_name"], "demoapp");
        assert_eq!(state["enrolled"], false);
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let tempdir = tempfile::tempdir().unwrap();
        let agent = test_agent(tempdir.path());

        let err = call(&agent, "not_a_method", Value::Null).await.unwrap_err();
        assert!(matches!(err, RpcError::MethodNotFound(_)));
    }
}
