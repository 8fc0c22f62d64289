//! Agent discovery through the fabric's public node directory.

use crate::event::channel::EventPublisher;
use crate::event::AgentSetEvent;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cadence of node-directory polling.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("node directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("node directory answered with status {0}")]
    Status(u16),

    #[error("node directory reply malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct LocationReply {
    status: String,
    #[serde(default)]
    data: Vec<NodeLocation>,
}

#[derive(Debug, Deserialize)]
struct NodeLocation {
    ip: String,
}

pub struct NodeDirectoryClient {
    http: reqwest::Client,
    base: String,
}

impl NodeDirectoryClient {
    pub fn new(base: &str) -> Self {
        NodeDirectoryClient {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// Addresses the application is deployed on. Transient directory
    /// trouble (429 and 5xx) is retried a few times with a growing pause.
    pub async fn app_locations(&self, app_name: &str) -> Result<Vec<String>, DiscoveryError> {
        let url = format!("{}/apps/location/{app_name}", self.base);

        let mut attempt = 0;
        let reply = loop {
            let response = self.http.get(&url).send().await?;
            let status = response.status();

            if status.is_success() {
                break response.json::<LocationReply>().await?;
            }

            attempt += 1;
            let retryable = status.as_u16() == 429 || status.is_server_error();
            if !retryable || attempt >= RETRIES {
                return Err(DiscoveryError::Status(status.as_u16()));
            }
            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
        };

        if reply.status != "success" {
            return Err(DiscoveryError::Malformed(format!(
                "status `{}`",
                reply.status
            )));
        }

        // Entries carry `host:port`; the comms port comes from the app
        // config instead.
        Ok(reply
            .data
            .into_iter()
            .filter_map(|node| {
                node.ip
                    .split(':')
                    .next()
                    .filter(|host| !host.is_empty())
                    .map(str::to_string)
            })
            .collect())
    }
}

/// Keep polling the directory and publish the address set whenever it
/// changes.
pub async fn discovery_loop(
    client: NodeDirectoryClient,
    app_name: String,
    publisher: EventPublisher<AgentSetEvent>,
    shutdown: CancellationToken,
) {
    let mut last: Option<Vec<String>> = None;
    loop {
        match client.app_locations(&app_name).await {
            Ok(addresses) => {
                if last.as_ref() != Some(&addresses) {
                    debug!(app = %app_name, ?addresses, "agent set changed");
                    if publisher
                        .publish(AgentSetEvent {
                            app_name: app_name.clone(),
                            addresses: addresses.clone(),
                        })
                        .is_err()
                    {
                        return;
                    }
                    last = Some(addresses);
                }
            }
            Err(err) => warn!(app = %app_name, %err, "node directory poll failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_reply_parses_fabric_shape() {
        let raw = r#"{"status":"success","data":[{"ip":"1.2.3.4:16127","name":"node-a"},{"ip":"5.6.7.8"}]}"#;
        let reply: LocationReply = serde_json::from_str(raw).unwrap();
        assert_eq!(reply.status, "success");
        assert_eq!(reply.data.len(), 2);
        assert_eq!(reply.data[0].ip, "1.2.3.4:16127");
    }

    #[tokio::test]
    async fn test_app_locations_strips_ports() {
        // Serve one canned reply on a local listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let body = r#"{"status":"success","data":[{"ip":"1.2.3.4:16127"}]}"#;
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                body.len()
            );
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(reply.as_bytes()).await.unwrap();
        });

        let client = NodeDirectoryClient::new(&format!("http://{addr}"));
        let locations = client.app_locations("demoapp").await.unwrap();
        assert_eq!(locations, vec!["1.2.3.4"]);
    }
}
