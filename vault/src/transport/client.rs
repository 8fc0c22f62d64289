//! Keeper-side transport: dials one agent, runs the handshake, then
//! exchanges encrypted frames.

use super::auth::{AuthChallenge, AuthResponse, FailureFrame, SignatureSigner};
use super::crypto::{seal_session_key, EncryptionProbe, SessionKey};
use super::framing::SeparatorCodec;
use super::server::Preamble;
use super::socket::BoxedStream;
use super::{FailureSymbol, TransportError, HANDSHAKE_TIMEOUT_SECS};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

struct Connection {
    framed: Framed<BoxedStream, SeparatorCodec>,
    session: SessionKey,
}

type TlsTarget = (Arc<ClientConfig>, ServerName<'static>);

/// Client transport with in-place encryption. Connection failures are
/// reported through [`failed_on`](Self::failed_on) so the caller can fetch
/// the right signing key and retry; frame-level errors after connection
/// are returned inline.
pub struct EncryptedSocketClientTransport {
    address: String,
    port: u16,
    proxy_target: Option<String>,
    signer: Option<SignatureSigner>,
    /// TLS with the agent this transport ultimately talks to.
    tls: Option<TlsTarget>,
    /// TLS with the primary carrying a proxied session, when the primary
    /// itself has been enrolled.
    outer_tls: Option<TlsTarget>,
    data_timeout: Option<Duration>,
    connection: Option<Connection>,

    /// Symbol describing why the last `connect` did not end in an
    /// encrypted channel.
    pub failed_on: Option<FailureSymbol>,
    /// Identity the agent demanded a signature for.
    pub auth_address: Option<String>,
    /// Identity a proxied subordinate demanded a signature for.
    pub proxy_auth_address: Option<String>,
}

impl EncryptedSocketClientTransport {
    pub fn new(address: &str, port: u16) -> Self {
        EncryptedSocketClientTransport {
            address: address.to_string(),
            port,
            proxy_target: None,
            signer: None,
            tls: None,
            outer_tls: None,
            data_timeout: None,
            connection: None,
            failed_on: None,
            auth_address: None,
            proxy_auth_address: None,
        }
    }

    /// Route this transport through a primary agent to the named
    /// subordinate.
    pub fn with_proxy_target(mut self, target: &str) -> Self {
        self.proxy_target = Some(target.to_string());
        self
    }

    /// Upgrade to mutually-authenticated TLS; `server_name` is the agent's
    /// enrolled common name.
    pub fn with_tls(mut self, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        self.tls = Some((config, server_name));
        self
    }

    /// TLS for the keeper → primary leg of a proxied session.
    pub fn with_outer_tls(
        mut self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Self {
        self.outer_tls = Some((config, server_name));
        self
    }

    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = Some(timeout);
        self
    }

    pub fn set_signer(&mut self, signer: SignatureSigner) {
        self.signer = Some(signer);
    }

    pub fn connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_proxied(&self) -> bool {
        self.proxy_target.is_some()
    }

    /// Dial and run the handshake. On failure the transport stays
    /// disconnected and `failed_on` carries the reason.
    pub async fn connect(&mut self) {
        if self.connected() {
            return;
        }
        self.failed_on = None;

        match self.establish().await {
            Ok(connection) => {
                debug!(address = %self.address, port = self.port, "transport encrypted");
                self.connection = Some(connection);
            }
            Err(err) => {
                let symbol = err.failure_symbol();
                warn!(address = %self.address, port = self.port, %err, "connect failed");
                self.failed_on = Some(symbol);
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.framed.close().await;
        }
    }

    async fn establish(&mut self) -> Result<Connection, TransportError> {
        let step = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);

        let tcp = timeout(step, TcpStream::connect((self.address.as_str(), self.port)))
            .await
            .map_err(|_| TransportError::Timeout("tcp connect"))?
            .map_err(|e| TransportError::NoSocket(e.to_string()))?;
        let mut stream: BoxedStream = Box::new(tcp);

        // A proxied session tells the primary where to pipe before
        // anything else happens for the subordinate; everything after
        // this frame (its TLS included) runs end-to-end.
        if let Some(target) = &self.proxy_target {
            if let Some((config, server_name)) = self.outer_tls.clone() {
                stream = wrap_tls(stream, config, server_name, step).await?;
            }
            let preamble = serde_json::to_vec(&Preamble {
                proxy_target: Some(target.clone()),
            })
            .expect("preamble serializes");
            let mut raw = preamble;
            raw.extend_from_slice(super::framing::SEPARATOR);
            tokio::io::AsyncWriteExt::write_all(&mut stream, &raw).await?;
        }

        if let Some((config, server_name)) = self.tls.clone() {
            stream = wrap_tls(stream, config, server_name, step).await?;
        }

        let mut framed = Framed::new(stream, SeparatorCodec::default());

        // The serving agent consumes a hello as the first frame of its
        // session, proxied or not.
        let hello = serde_json::to_vec(&Preamble::default()).expect("preamble serializes");
        framed.send(Bytes::from(hello)).await?;

        let public_key_pem = self.await_public_key(&mut framed, step).await?;

        let session = SessionKey::generate();
        let envelope = seal_session_key(&public_key_pem, &session)
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
        let envelope = serde_json::to_vec(&envelope).expect("envelope serializes");
        framed.send(Bytes::from(envelope)).await?;

        let probe_frame = Self::next_frame(&mut framed, step, "encryption probe").await?;
        let probe: EncryptionProbe = serde_json::from_slice(
            &session
                .decrypt_frame(&probe_frame)
                .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?,
        )
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

        if probe.text != super::crypto::TEST_MESSAGE {
            return Err(TransportError::HandshakeFailed(
                "unexpected encryption probe".to_string(),
            ));
        }

        let response = EncryptionProbe::response_to(&probe);
        let response = serde_json::to_vec(&response).expect("probe serializes");
        framed.send(Bytes::from(session.encrypt_frame(&response))).await?;

        Ok(Connection { framed, session })
    }

    /// Consume pre-handshake frames until the agent's RSA public key
    /// arrives, answering a signature challenge on the way.
    async fn await_public_key(
        &mut self,
        framed: &mut Framed<BoxedStream, SeparatorCodec>,
        step: Duration,
    ) -> Result<String, TransportError> {
        loop {
            let frame = Self::next_frame(framed, step, "public key").await?;

            if frame.starts_with(b"-----BEGIN PUBLIC KEY") {
                return Ok(String::from_utf8_lossy(&frame).into_owned());
            }

            if let Ok(challenge) = serde_json::from_slice::<AuthChallenge>(&frame) {
                self.record_demanded_address(&challenge.address);
                let response = match &self.signer {
                    Some(signer) => signer.answer(&challenge),
                    // No key loaded: answer unsigned so the agent reports
                    // the typed symbol instead of silently dropping us.
                    None => AuthResponse {
                        address: challenge.address.clone(),
                        signature: String::new(),
                    },
                };
                let response = serde_json::to_vec(&response).expect("response serializes");
                framed.send(Bytes::from(response)).await?;
                continue;
            }

            if let Ok(failure) = serde_json::from_slice::<FailureFrame>(&frame) {
                return Err(self.map_failure(&failure));
            }

            return Err(TransportError::HandshakeFailed(
                "unexpected pre-handshake frame".to_string(),
            ));
        }
    }

    fn record_demanded_address(&mut self, address: &str) {
        if self.proxy_target.is_some() {
            self.proxy_auth_address = Some(address.to_string());
        } else {
            self.auth_address = Some(address.to_string());
        }
    }

    fn map_failure(&self, failure: &FailureFrame) -> TransportError {
        let demanded = self
            .demanded_address()
            .unwrap_or_default()
            .to_string();
        let symbol = FailureSymbol::parse(&failure.error).unwrap_or(FailureSymbol::NoSocket);
        let symbol = if self.proxy_target.is_some() {
            symbol.through_proxy()
        } else {
            symbol
        };
        match symbol {
            FailureSymbol::AuthAddressRequired => TransportError::AuthAddressRequired(demanded),
            FailureSymbol::AuthDenied => TransportError::AuthDenied(demanded),
            FailureSymbol::ProxyAuthAddressRequired => {
                TransportError::ProxyAuthAddressRequired(demanded)
            }
            FailureSymbol::ProxyAuthDenied => TransportError::ProxyAuthDenied(demanded),
            FailureSymbol::NoSocket => TransportError::NoSocket(failure.error.clone()),
        }
    }

    fn demanded_address(&self) -> Option<&str> {
        if self.proxy_target.is_some() {
            self.proxy_auth_address.as_deref()
        } else {
            self.auth_address.as_deref()
        }
    }

    async fn next_frame(
        framed: &mut Framed<BoxedStream, SeparatorCodec>,
        step: Duration,
        what: &'static str,
    ) -> Result<Bytes, TransportError> {
        match timeout(step, framed.next()).await {
            Err(_) => Err(TransportError::Timeout(what)),
            Ok(None) => Err(TransportError::NoSocket("connection closed".to_string())),
            Ok(Some(Err(e))) => Err(TransportError::NoSocket(e.to_string())),
            Ok(Some(Ok(frame))) => Ok(frame),
        }
    }

    /// Send one encrypted frame.
    pub async fn send_frame(&mut self, plaintext: &[u8]) -> Result<(), TransportError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| TransportError::NoSocket("not connected".to_string()))?;
        let frame = connection.session.encrypt_frame(plaintext);
        connection.framed.send(Bytes::from(frame)).await?;
        Ok(())
    }

    /// Receive and decrypt one frame. Honors the configured data timeout,
    /// if any; a timeout poisons the connection.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let data_timeout = self.data_timeout;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| TransportError::NoSocket("not connected".to_string()))?;
        let session = connection.session;

        let next = connection.framed.next();
        let frame = match data_timeout {
            Some(limit) => match timeout(limit, next).await {
                Err(_) => {
                    self.connection = None;
                    self.failed_on = Some(FailureSymbol::NoSocket);
                    return Err(TransportError::Timeout("rpc response"));
                }
                Ok(inner) => inner,
            },
            None => next.await,
        };

        let frame = match frame {
            None => {
                self.connection = None;
                return Err(TransportError::NoSocket("connection closed".to_string()));
            }
            Some(Err(e)) => {
                self.connection = None;
                return Err(TransportError::NoSocket(e.to_string()));
            }
            Some(Ok(frame)) => frame,
        };

        session
            .decrypt_frame(&frame)
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))
    }

    pub fn peer_description(&self) -> String {
        match &self.proxy_target {
            Some(target) => format!("{}:{} (proxy to {target})", self.address, self.port),
            None => format!("{}:{}", self.address, self.port),
        }
    }
}

async fn wrap_tls(
    stream: BoxedStream,
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    step: Duration,
) -> Result<BoxedStream, TransportError> {
    let connector = TlsConnector::from(config);
    let tls = timeout(step, connector.connect(server_name, stream))
        .await
        .map_err(|_| TransportError::Timeout("tls handshake"))?
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Box::new(tls))
}

impl Drop for EncryptedSocketClientTransport {
    fn drop(&mut self) {
        if self.connection.is_some() {
            info!(peer = %self.peer_description(), "transport dropped while connected");
        }
    }
}
