//! Registrar: the small HTTP server a primary agent runs so subordinates
//! in the same application can announce themselves, plus the client side
//! a subordinate uses to register and push enrollment updates.

use super::api::SubAgentInfo;
use crate::fs_tree::entry::FsTreeError;
use crate::fs_tree::LazyReader;
use crate::transport::server::ProxyResolver;
use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_REGISTRAR_PORT: u16 = 2080;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum RegistrarError {
    #[error("could not bind registrar: {0}")]
    Bind(std::io::Error),

    #[error("registrar did not start within {0:?}")]
    StartupTimeout(Duration),

    #[error("registrar startup channel closed")]
    StartupChannelClosed,
}

/// Shared registrar state: the in-memory subordinate list and the
/// optional fileserver root.
pub struct RegistrarState {
    app_name: String,
    fileserver_dir: Option<PathBuf>,
    sub_agents: Mutex<Vec<SubAgentInfo>>,
}

impl RegistrarState {
    pub fn new(app_name: &str, fileserver_dir: Option<PathBuf>) -> Arc<Self> {
        Arc::new(RegistrarState {
            app_name: app_name.to_string(),
            fileserver_dir,
            sub_agents: Mutex::new(Vec::new()),
        })
    }

    pub fn sub_agents(&self) -> Vec<SubAgentInfo> {
        self.sub_agents.lock().unwrap().clone()
    }

    fn upsert(&self, incoming: SubAgentInfo) {
        let mut agents = self.sub_agents.lock().unwrap();
        match agents.iter_mut().find(|a| a.name == incoming.name) {
            Some(existing) => *existing = incoming,
            None => agents.push(incoming),
        }
    }
}

/// Lets the server transport pipe proxied sessions to registered
/// subordinates by name.
pub struct RegistrarProxyResolver(pub Arc<RegistrarState>);

impl ProxyResolver for RegistrarProxyResolver {
    fn resolve(&self, target: &str) -> Option<SocketAddr> {
        let agents = self.0.sub_agents.lock().unwrap();
        let agent = agents.iter().find(|a| a.name == target)?;
        let ip: IpAddr = agent.address.as_ref()?.parse().ok()?;
        // An enrolled subordinate has moved its listener to the adjacent
        // TLS port.
        let port = if agent.enrolled {
            agent.port + 1
        } else {
            agent.port
        };
        Some(SocketAddr::new(ip, port))
    }
}

async fn handle_register(
    state: web::Data<Arc<RegistrarState>>,
    body: web::Json<SubAgentInfo>,
) -> HttpResponse {
    let sub_agent = body.into_inner();
    if sub_agent.app_name != state.app_name {
        warn!(
            name = %sub_agent.name,
            app = %sub_agent.app_name,
            "rejecting registration from another application"
        );
        return HttpResponse::Forbidden().finish();
    }
    info!(name = %sub_agent.name, role = %sub_agent.role, "new sub agent registered");
    state.upsert(sub_agent);
    HttpResponse::Accepted().finish()
}

async fn handle_update(
    state: web::Data<Arc<RegistrarState>>,
    body: web::Json<SubAgentInfo>,
) -> HttpResponse {
    let sub_agent = body.into_inner();
    info!(name = %sub_agent.name, enrolled = sub_agent.enrolled, "sub agent updated");
    state.upsert(sub_agent);
    HttpResponse::Accepted().finish()
}

/// Serve staged files to components of the same application. Only
/// private-network peers that resolve to this application may download.
async fn handle_download(
    state: web::Data<Arc<RegistrarState>>,
    request: HttpRequest,
    file_name: web::Path<String>,
) -> HttpResponse {
    let Some(dir) = &state.fileserver_dir else {
        return HttpResponse::NotFound().finish();
    };

    // Downloads are pod-internal. Never serve a peer outside the private
    // network, whatever got exposed on the node's firewall.
    let private_peer = request
        .peer_addr()
        .map(|a| a.ip())
        .is_some_and(|ip| is_private(&ip));
    if !private_peer {
        return HttpResponse::Forbidden().body("Unauthorized");
    }

    let file_name = file_name.into_inner();
    if file_name.contains("..") || file_name.contains('/') {
        return HttpResponse::Forbidden().body("Unauthorized");
    }

    let mut reader = LazyReader::new(&dir.join(&file_name));
    match reader.read(None).await {
        Ok(bytes) => HttpResponse::Ok()
            .insert_header((
                "Content-disposition",
                format!("attachment; filename={file_name}"),
            ))
            .body(bytes),
        Err(FsTreeError::FileTooLarge(_)) => {
            HttpResponse::PayloadTooLarge().body(format!("File <{file_name}> exceeds the in-band ceiling"))
        }
        Err(_) => HttpResponse::NotFound().body(format!("File <{file_name}> does not exist")),
    }
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Owns the registrar thread and its actix server handle.
pub struct Runner {
    handle: ServerHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Runner {
    /// Spawn the registrar on its own thread with its own runtime, the
    /// way a status HTTP server is kept out of the agent's event loop.
    pub fn start(
        state: Arc<RegistrarState>,
        bind_address: IpAddr,
        port: u16,
    ) -> Result<Runner, RegistrarError> {
        let (startup_tx, startup_rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("registrar".to_string())
            .spawn(move || {
                let system = actix_web::rt::System::new();
                system.block_on(async move {
                    let data = web::Data::new(state);
                    let server = HttpServer::new(move || {
                        App::new()
                            .app_data(data.clone())
                            .route("/register", web::post().to(handle_register))
                            .route("/update", web::post().to(handle_update))
                            .route("/file/{file_name}", web::get().to(handle_download))
                    })
                    .workers(1)
                    .disable_signals()
                    .bind((bind_address, port));

                    match server {
                        Err(err) => {
                            let _ = startup_tx.send(Err(err));
                        }
                        Ok(server) => {
                            let server = server.run();
                            let _ = startup_tx.send(Ok(server.handle()));
                            if let Err(err) = server.await {
                                error!(%err, "registrar server stopped with error");
                            }
                        }
                    }
                });
            })
            .expect("registrar thread spawns");

        let handle = startup_rx
            .recv_timeout(STARTUP_TIMEOUT)
            .map_err(|err| match err {
                std::sync::mpsc::RecvTimeoutError::Timeout => {
                    RegistrarError::StartupTimeout(STARTUP_TIMEOUT)
                }
                std::sync::mpsc::RecvTimeoutError::Disconnected => {
                    RegistrarError::StartupChannelClosed
                }
            })?
            .map_err(RegistrarError::Bind)?;

        info!(%bind_address, port, "registrar listening");
        Ok(Runner {
            handle,
            thread: Some(thread),
        })
    }

    pub async fn stop(mut self) {
        self.handle.stop(true).await;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Subordinate-side client: announce ourselves to the primary until it
/// accepts, and push updates when our enrollment state changes.
pub struct SubAgentClient {
    http: reqwest::Client,
    primary_url: String,
    pub info: SubAgentInfo,
}

impl SubAgentClient {
    pub fn new(primary_address: &str, primary_port: u16, info: SubAgentInfo) -> Self {
        SubAgentClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .expect("reqwest client builds"),
            primary_url: format!("http://{primary_address}:{primary_port}"),
            info,
        }
    }

    /// Retry registration every few seconds until the primary answers
    /// with 202.
    pub async fn register(&self) {
        loop {
            match self.post("/register").await {
                Ok(status) if status == reqwest::StatusCode::ACCEPTED => {
                    info!("successfully registered with primary agent");
                    return;
                }
                Ok(status) => warn!(%status, "primary refused registration, retrying"),
                Err(err) => warn!(%err, "unable to reach primary agent, retrying"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    /// One-shot update; enrollment changes are not worth blocking on.
    pub async fn update(&mut self, enrolled: bool) {
        self.info.enrolled = enrolled;
        if let Err(err) = self.post("/update").await {
            warn!(%err, "unable to push update to primary agent");
        }
    }

    async fn post(&self, path: &str) -> Result<reqwest::StatusCode, reqwest::Error> {
        self.http
            .post(format!("{}{path}", self.primary_url))
            .json(&self.info)
            .send()
            .await
            .map(|r| r.status())
    }
}
