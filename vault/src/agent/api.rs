//! Wire surface of an agent: method names, parameter/reply shapes, and
//! the typed client the keeper drives them through.

use crate::rpc::jsonrpc::{serialize_request, Message, Request, RpcError};
use crate::transport::client::EncryptedSocketClientTransport;
use crate::transport::stream;
use crate::transport::TransportError;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

pub mod methods {
    pub const GET_METHODS: &str = "get_methods";
    pub const GET_STATE: &str = "get_state";
    pub const GET_ALL_OBJECT_HASHES: &str = "get_all_object_hashes";
    pub const GET_DIRECTORY_HASHES: &str = "get_directory_hashes";
    pub const WRITE_OBJECT: &str = "write_object";
    pub const WRITE_OBJECTS: &str = "write_objects";
    pub const REMOVE_OBJECTS: &str = "remove_objects";
    pub const GET_SUBAGENTS: &str = "get_subagents";
    pub const GENERATE_CSR: &str = "generate_csr";
    pub const INSTALL_CERT: &str = "install_cert";
    pub const INSTALL_CA_CERT: &str = "install_ca_cert";
    pub const UPGRADE_TO_SSL: &str = "upgrade_to_ssl";
    pub const LOAD_PLUGINS: &str = "load_plugins";
    pub const LIST_SERVER_DETAILS: &str = "list_server_details";
    pub const CONNECT_SHELL: &str = "connect_shell";
    pub const DISCONNECT_SHELL: &str = "disconnect_shell";
}

/// Hash report for one object. A missing object reports 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCrc {
    pub name: String,
    pub crc32: u32,
}

/// One object delivery. `data` is hex; a compressed payload is a gzip'd
/// tar extracted into `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectWrite {
    pub path: String,
    pub is_dir: bool,
    pub data: String,
    #[serde(default)]
    pub compressed: bool,
}

impl ObjectWrite {
    pub fn file(path: &str, contents: &[u8]) -> Self {
        ObjectWrite {
            path: path.to_string(),
            is_dir: false,
            data: hex::encode(contents),
            compressed: false,
        }
    }

    pub fn empty_dir(path: &str) -> Self {
        ObjectWrite {
            path: path.to_string(),
            is_dir: true,
            data: String::new(),
            compressed: false,
        }
    }

    pub fn tarball(path: &str, archive: &[u8]) -> Self {
        ObjectWrite {
            path: path.to_string(),
            is_dir: true,
            data: hex::encode(archive),
            compressed: true,
        }
    }
}

/// Registration record for a subordinate agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentInfo {
    pub name: String,
    pub app_name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub enrolled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub port: u16,
}

#[derive(Error, Debug)]
pub enum AgentCallError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("unexpected reply shape: {0}")]
    Shape(String),

    #[error("local i/o error: {0}")]
    Local(String),
}

/// Everything the keeper's task pipeline needs from a connected agent.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentApi: Send {
    async fn get_methods(&mut self) -> Result<Vec<String>, AgentCallError>;
    async fn get_state(&mut self) -> Result<Value, AgentCallError>;
    async fn get_all_object_hashes(
        &mut self,
        paths: Vec<String>,
    ) -> Result<Vec<ObjectCrc>, AgentCallError>;
    async fn get_directory_hashes(
        &mut self,
        path: String,
    ) -> Result<BTreeMap<String, u32>, AgentCallError>;
    async fn write_object(&mut self, object: ObjectWrite) -> Result<(), AgentCallError>;
    async fn write_objects(&mut self, objects: Vec<ObjectWrite>) -> Result<(), AgentCallError>;
    async fn remove_objects(&mut self, paths: Vec<String>) -> Result<(), AgentCallError>;
    async fn stream_files(
        &mut self,
        pairs: Vec<(PathBuf, PathBuf)>,
    ) -> Result<(), AgentCallError>;
    async fn get_subagents(&mut self) -> Result<Vec<SubAgentInfo>, AgentCallError>;
    async fn generate_csr(&mut self) -> Result<String, AgentCallError>;
    async fn install_cert(&mut self, cert_pem: String) -> Result<(), AgentCallError>;
    async fn install_ca_cert(&mut self, cert_pem: String) -> Result<(), AgentCallError>;
    async fn upgrade_to_ssl(&mut self) -> Result<(), AgentCallError>;
}

/// JSON-RPC client over one encrypted transport. Responses are matched by
/// id; interleaved notifications (PTY output) are handed to an optional
/// sink.
pub struct RpcAgentClient {
    transport: EncryptedSocketClientTransport,
    next_id: u64,
    notification_sink: Option<Box<dyn FnMut(Request) + Send>>,
}

impl RpcAgentClient {
    pub fn new(transport: EncryptedSocketClientTransport) -> Self {
        RpcAgentClient {
            transport,
            next_id: 1,
            notification_sink: None,
        }
    }

    pub fn transport(&self) -> &EncryptedSocketClientTransport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut EncryptedSocketClientTransport {
        &mut self.transport
    }

    pub fn into_transport(self) -> EncryptedSocketClientTransport {
        self.transport
    }

    pub fn set_notification_sink(&mut self, sink: Box<dyn FnMut(Request) + Send>) {
        self.notification_sink = Some(sink);
    }

    pub async fn notify(&mut self, method: &str, params: Value) -> Result<(), AgentCallError> {
        let frame = serialize_request(&Request::notification(method, params));
        self.transport.send_frame(&frame).await?;
        Ok(())
    }

    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, AgentCallError> {
        let id = self.next_id;
        self.next_id += 1;

        let frame = serialize_request(&Request::new(method, params, id));
        self.transport.send_frame(&frame).await?;

        loop {
            let reply = self.transport.recv_frame().await?;
            match Message::parse(&reply) {
                Ok(Message::Response(response)) if response.id == Some(id) => {
                    return Ok(response.into_result()?);
                }
                Ok(Message::Response(response)) => {
                    debug!(got = ?response.id, expected = id, "skipping stale response");
                }
                Ok(Message::Request(notification)) => match &mut self.notification_sink {
                    Some(sink) => sink(notification),
                    None => debug!(method = %notification.method, "dropping notification"),
                },
                Err(err) => {
                    return Err(AgentCallError::Shape(err.to_string()));
                }
            }
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, AgentCallError> {
        serde_json::from_value(value).map_err(|e| AgentCallError::Shape(e.to_string()))
    }
}

#[async_trait]
impl AgentApi for RpcAgentClient {
    async fn get_methods(&mut self) -> Result<Vec<String>, AgentCallError> {
        let value = self.call(methods::GET_METHODS, Value::Null).await?;
        Self::parse(value)
    }

    async fn get_state(&mut self) -> Result<Value, AgentCallError> {
        self.call(methods::GET_STATE, Value::Null).await
    }

    async fn get_all_object_hashes(
        &mut self,
        paths: Vec<String>,
    ) -> Result<Vec<ObjectCrc>, AgentCallError> {
        let value = self
            .call(methods::GET_ALL_OBJECT_HASHES, json!({ "paths": paths }))
            .await?;
        Self::parse(value)
    }

    async fn get_directory_hashes(
        &mut self,
        path: String,
    ) -> Result<BTreeMap<String, u32>, AgentCallError> {
        let value = self
            .call(methods::GET_DIRECTORY_HASHES, json!({ "path": path }))
            .await?;
        Self::parse(value)
    }

    async fn write_object(&mut self, object: ObjectWrite) -> Result<(), AgentCallError> {
        let params = serde_json::to_value(object).expect("object serializes");
        self.call(methods::WRITE_OBJECT, params).await?;
        Ok(())
    }

    async fn write_objects(&mut self, objects: Vec<ObjectWrite>) -> Result<(), AgentCallError> {
        self.call(methods::WRITE_OBJECTS, json!({ "objects": objects }))
            .await?;
        Ok(())
    }

    async fn remove_objects(&mut self, paths: Vec<String>) -> Result<(), AgentCallError> {
        self.call(methods::REMOVE_OBJECTS, json!({ "paths": paths }))
            .await?;
        Ok(())
    }

    async fn stream_files(
        &mut self,
        pairs: Vec<(PathBuf, PathBuf)>,
    ) -> Result<(), AgentCallError> {
        stream::stream_files(&mut self.transport, &pairs)
            .await
            .map_err(|err| match err {
                stream::StreamError::Transport(t) => AgentCallError::Transport(t),
                stream::StreamError::Local(e) => AgentCallError::Local(e.to_string()),
            })
    }

    async fn get_subagents(&mut self) -> Result<Vec<SubAgentInfo>, AgentCallError> {
        let value = self.call(methods::GET_SUBAGENTS, Value::Null).await?;
        let list = value
            .get("sub_agents")
            .cloned()
            .ok_or_else(|| AgentCallError::Shape("missing sub_agents".to_string()))?;
        Self::parse(list)
    }

    async fn generate_csr(&mut self) -> Result<String, AgentCallError> {
        let value = self.call(methods::GENERATE_CSR, Value::Null).await?;
        value
            .get("csr")
            .and_then(|csr| csr.as_str())
            .map(str::to_string)
            .ok_or_else(|| AgentCallError::Shape("missing csr".to_string()))
    }

    async fn install_cert(&mut self, cert_pem: String) -> Result<(), AgentCallError> {
        self.call(methods::INSTALL_CERT, json!({ "cert": cert_pem }))
            .await?;
        Ok(())
    }

    async fn install_ca_cert(&mut self, cert_pem: String) -> Result<(), AgentCallError> {
        self.call(methods::INSTALL_CA_CERT, json!({ "cert": cert_pem }))
            .await?;
        Ok(())
    }

    async fn upgrade_to_ssl(&mut self) -> Result<(), AgentCallError> {
        self.call(methods::UPGRADE_TO_SSL, Value::Null).await?;
        Ok(())
    }
}
