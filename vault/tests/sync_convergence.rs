//! End-to-end reconciliation over a real transport and a real agent:
//! STRICT convergence after one poll, idempotence on the next.

use fabric_vault::agent::api::{AgentApi, RpcAgentClient};
use fabric_vault::agent::core::{Agent, AgentConfig};
use fabric_vault::fs_tree::hash;
use fabric_vault::keeper::sync::sync_objects;
use fabric_vault::rpc::plugins::PluginRegistry;
use fabric_vault::state::{FsEntryStateManager, RemoteStateDirective, SyncStrategy};
use fabric_vault::transport::client::EncryptedSocketClientTransport;
use fabric_vault::transport::server::{
    EncryptedSocketServerTransport, NoProxy, ServerTransportConfig,
};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn start_agent(working_dir: &Path) -> (u16, CancellationToken) {
    let port = free_port();
    let (control_tx, _control_rx) = mpsc::channel(4);
    let mut config = AgentConfig::new("web", "demoapp", working_dir);
    config.bind_address = IpAddr::from([127, 0, 0, 1]);
    config.bind_port = port;
    let agent = Agent::new(config, PluginRegistry::default(), control_tx);

    let shutdown = CancellationToken::new();
    let server = Arc::new(EncryptedSocketServerTransport::new(
        ServerTransportConfig {
            bind_address: IpAddr::from([127, 0, 0, 1]),
            port,
            whitelisted_addresses: vec![],
            verify_source_address: false,
            auth: None,
            tls: None,
        },
        agent.dispatcher(),
        Arc::new(NoProxy),
    ));
    tokio::spawn(server.serve(shutdown.clone()));
    (port, shutdown)
}

async fn connect(port: u16) -> RpcAgentClient {
    let mut transport = EncryptedSocketClientTransport::new("127.0.0.1", port);
    for _ in 0..50 {
        transport.connect().await;
        if transport.connected() {
            return RpcAgentClient::new(transport);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("could not connect to agent, failed on {:?}", transport.failed_on);
}

fn managers_for(staging: &Path, remote_root: &Path, name: &str) -> Vec<FsEntryStateManager> {
    vec![FsEntryStateManager::new(
        RemoteStateDirective::new(name, SyncStrategy::Strict),
        staging,
        None,
        remote_root,
    )]
}

#[tokio::test]
async fn test_strict_directory_converges_in_one_poll() {
    let staging = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();

    let local_dir = staging.path().join("racing");
    fs::create_dir_all(local_dir.join("cars")).unwrap();
    fs::write(local_dir.join("apex.txt"), "late").unwrap();
    fs::write(local_dir.join("cars/fast.txt"), "zoom").unwrap();

    let (port, _shutdown) = start_agent(remote.path());
    let mut client = connect(port).await;

    let mut managers = managers_for(staging.path(), remote.path(), "racing");
    let report = sync_objects(&mut client, &mut managers).await.unwrap();
    assert!(report.written > 0);

    // Convergence: after exactly one successful poll the remote tree
    // hashes identically to the local one.
    let local_crc = hash::crc_directory(&local_dir, 0).unwrap();
    let remote_crc = hash::crc_directory(&remote.path().join("racing"), 0).unwrap();
    assert_eq!(local_crc, remote_crc);
    assert!(managers[0].in_sync);

    // Idempotence: a second consecutive poll with unchanged local state
    // performs zero writes and zero removes.
    let second = sync_objects(&mut client, &mut managers).await.unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.removed, 0);
    assert_eq!(second.streamed, 0);

    client.into_transport().disconnect().await;
}

#[tokio::test]
async fn test_strict_removes_remote_extras() {
    let staging = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();

    let local_dir = staging.path().join("dir");
    fs::create_dir_all(&local_dir).unwrap();
    fs::write(local_dir.join("a"), "alpha").unwrap();
    fs::write(local_dir.join("b"), "beta").unwrap();

    // Remote starts as a superset: same a/b plus extra c/d.
    let remote_dir = remote.path().join("dir");
    fs::create_dir_all(remote_dir.join("c")).unwrap();
    fs::write(remote_dir.join("a"), "alpha").unwrap();
    fs::write(remote_dir.join("b"), "beta").unwrap();
    fs::write(remote_dir.join("c/d"), "extra").unwrap();

    let (port, _shutdown) = start_agent(remote.path());
    let mut client = connect(port).await;

    let mut managers = managers_for(staging.path(), remote.path(), "dir");
    let report = sync_objects(&mut client, &mut managers).await.unwrap();

    assert_eq!(report.removed, 1);
    assert_eq!(report.written, 0);
    assert!(!remote_dir.join("c").exists());
    assert_eq!(
        hash::crc_directory(&local_dir, 0).unwrap(),
        hash::crc_directory(&remote_dir, 0).unwrap()
    );

    client.into_transport().disconnect().await;
}

#[tokio::test]
async fn test_single_file_cold_sync() {
    let staging = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    fs::write(staging.path().join("quotes.txt"), "alpha").unwrap();

    let (port, _shutdown) = start_agent(remote.path());
    let mut client = connect(port).await;

    let mut managers = managers_for(staging.path(), remote.path(), "quotes.txt");
    let report = sync_objects(&mut client, &mut managers).await.unwrap();

    assert_eq!(report.written, 1);
    assert_eq!(
        fs::read(remote.path().join("quotes.txt")).unwrap(),
        b"alpha"
    );
    assert!(managers[0].in_sync);
    assert_eq!(managers[0].remote_crc, 0xd0e0396a);

    client.into_transport().disconnect().await;
}

#[tokio::test]
async fn test_streamed_transfer_reassembles() {
    let staging = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();

    // Big enough to span several chunks without slowing the suite down.
    let content: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(staging.path().join("blob.bin"), &content).unwrap();

    let (port, _shutdown) = start_agent(remote.path());
    let mut client = connect(port).await;

    client
        .stream_files(vec![(
            staging.path().join("blob.bin"),
            remote.path().join("blob.bin"),
        )])
        .await
        .unwrap();

    // One-way frames: give the agent a moment to drain them.
    for _ in 0..50 {
        if remote.path().join("blob.bin").exists()
            && fs::metadata(remote.path().join("blob.bin")).unwrap().len()
                == content.len() as u64
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(fs::read(remote.path().join("blob.bin")).unwrap(), content);

    client.into_transport().disconnect().await;
}
