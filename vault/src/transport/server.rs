//! Agent-side transport: accepts keeper connections, runs the handshake,
//! decrypts frames and feeds them to the RPC dispatcher.

use super::auth::{AuthResponse, FailureFrame, SignatureVerifier};
use super::crypto::{open_session_key, EncryptionProbe, KeyExchangeEnvelope, SessionKey};
use super::framing::SeparatorCodec;
use super::socket::Socket;
use super::{FailureSymbol, TransportError, HANDSHAKE_TIMEOUT_SECS, REJECT_DELAY_SECS};
use crate::rpc::dispatch::{Dispatcher, RequestContext};
use crate::rpc::jsonrpc::{serialize_request, serialize_response, Message, Request};
use bytes::Bytes;
use futures::stream::StreamExt;
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First frame every client sends: either a request to be piped to a
/// subordinate, or an empty hello for a direct session.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Preamble {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_target: Option<String>,
}

/// Resolves a subordinate name to the address the primary can reach it
/// on. Backed by the registrar on a primary agent.
pub trait ProxyResolver: Send + Sync {
    fn resolve(&self, target: &str) -> Option<SocketAddr>;
}

/// Resolver for agents that front nobody.
pub struct NoProxy;

impl ProxyResolver for NoProxy {
    fn resolve(&self, _target: &str) -> Option<SocketAddr> {
        None
    }
}

pub struct ServerTransportConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Peers allowed to connect when `verify_source_address` is on.
    pub whitelisted_addresses: Vec<IpAddr>,
    pub verify_source_address: bool,
    /// Demand a signed nonce for this fabric address before handshaking.
    pub auth: Option<Arc<SignatureVerifier>>,
    /// Present when the listener has been upgraded to TLS.
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

pub struct EncryptedSocketServerTransport {
    config: ServerTransportConfig,
    dispatcher: Arc<Dispatcher>,
    proxy_resolver: Arc<dyn ProxyResolver>,
}

impl EncryptedSocketServerTransport {
    pub fn new(
        config: ServerTransportConfig,
        dispatcher: Arc<Dispatcher>,
        proxy_resolver: Arc<dyn ProxyResolver>,
    ) -> Self {
        EncryptedSocketServerTransport {
            config,
            dispatcher,
            proxy_resolver,
        }
    }

    /// Accept and serve connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener =
            TcpListener::bind((self.config.bind_address, self.config.port)).await?;
        info!(
            address = %self.config.bind_address,
            port = self.config.port,
            tls = self.config.tls.is_some(),
            "transport listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((tcp, peer)) = accepted else { continue };
                    let server = self.clone();
                    let connection_shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(tcp, peer, connection_shutdown).await {
                            debug!(%peer, %err, "connection ended with error");
                        }
                    });
                }
                _ = shutdown.cancelled() => break,
            }
        }
        Ok(())
    }

    async fn handle_connection(
        &self,
        tcp: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        debug!(%peer, "peer connected");

        if self.config.verify_source_address
            && !self.config.whitelisted_addresses.contains(&peer.ip())
        {
            // Slow the caller down before dropping; instant rejects make
            // address scanning cheap.
            tokio::time::sleep(Duration::from_secs(REJECT_DELAY_SECS)).await;
            warn!(%peer, "rejecting connection from non-whitelisted address");
            return Ok(());
        }

        let socket = match &self.config.tls {
            None => Socket::Plain(tcp),
            Some(tls_config) => {
                // The config's client verifier enforces both the CA chain
                // and the expected peer common name; a wrong-identity
                // certificate fails inside this accept.
                let acceptor = TlsAcceptor::from(tls_config.clone());
                let stream = timeout(
                    Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
                    acceptor.accept(tcp),
                )
                .await
                .map_err(|_| TransportError::Timeout("tls accept"))?
                .map_err(|e| TransportError::Tls(e.to_string()))?;
                Socket::Tls(Box::new(stream.into()))
            }
        };

        let mut framed = Framed::new(socket, SeparatorCodec::default());
        let step = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);

        let preamble_frame = next_frame(&mut framed, step, "preamble").await?;
        let preamble: Preamble = serde_json::from_slice(&preamble_frame)
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

        if let Some(target) = preamble.proxy_target {
            return self.pipe_to_subordinate(framed, peer, &target).await;
        }

        if let Some(verifier) = &self.config.auth {
            self.challenge_peer(&mut framed, peer, verifier).await?;
        }

        let session = agent_handshake(&mut framed).await?;
        debug!(%peer, "channel encrypted");

        self.serve_session(framed, peer, session, shutdown).await;
        Ok(())
    }

    /// Signature gate. On a missing or bad signature the peer gets the
    /// typed symbol and the connection closes.
    async fn challenge_peer(
        &self,
        framed: &mut Framed<Socket, SeparatorCodec>,
        peer: SocketAddr,
        verifier: &SignatureVerifier,
    ) -> Result<(), TransportError> {
        let step = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
        let challenge = verifier.challenge();
        let frame = serde_json::to_vec(&challenge).expect("challenge serializes");
        framed.send(Bytes::from(frame)).await?;

        let answer = next_frame(framed, step, "auth response").await?;
        let response: Option<AuthResponse> = serde_json::from_slice(&answer).ok();

        let denial = match response {
            None => Some(FailureSymbol::AuthAddressRequired),
            Some(ref response) if response.signature.is_empty() => {
                Some(FailureSymbol::AuthAddressRequired)
            }
            Some(ref response) => match verifier.verify(&challenge, response) {
                Ok(()) => None,
                Err(err) => {
                    warn!(%peer, %err, "signature verification failed");
                    Some(FailureSymbol::AuthDenied)
                }
            },
        };

        if let Some(symbol) = denial {
            let failure = FailureFrame {
                error: symbol.to_string(),
            };
            let frame = serde_json::to_vec(&failure).expect("failure serializes");
            framed.send(Bytes::from(frame)).await?;
            let _ = framed.close().await;
            return Err(match symbol {
                FailureSymbol::AuthDenied => {
                    TransportError::AuthDenied(verifier.address().to_string())
                }
                _ => TransportError::AuthAddressRequired(verifier.address().to_string()),
            });
        }

        debug!(%peer, address = verifier.address(), "peer signature verified");
        Ok(())
    }

    /// Blind byte pipe to a subordinate: frames are forwarded verbatim in
    /// both directions so the keeper's session with the subordinate stays
    /// end-to-end encrypted.
    async fn pipe_to_subordinate(
        &self,
        framed: Framed<Socket, SeparatorCodec>,
        peer: SocketAddr,
        target: &str,
    ) -> Result<(), TransportError> {
        let Some(address) = self.proxy_resolver.resolve(target) else {
            warn!(%peer, target, "unknown proxy target");
            let mut framed = framed;
            let failure = FailureFrame {
                error: FailureSymbol::NoSocket.to_string(),
            };
            let frame = serde_json::to_vec(&failure).expect("failure serializes");
            framed.send(Bytes::from(frame)).await?;
            let _ = framed.close().await;
            return Ok(());
        };

        info!(%peer, target, %address, "piping connection to subordinate");

        let mut upstream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::NoSocket(e.to_string()))?;

        // Bytes the framer already buffered belong to the subordinate.
        let downstream_parts = framed.into_parts();
        if !downstream_parts.read_buf.is_empty() {
            tokio::io::AsyncWriteExt::write_all(&mut upstream, &downstream_parts.read_buf).await?;
        }

        let mut downstream = downstream_parts.io;
        match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
            Ok((up, down)) => debug!(%peer, target, up, down, "proxy pipe closed"),
            Err(err) => debug!(%peer, target, %err, "proxy pipe failed"),
        }
        Ok(())
    }

    /// Post-handshake frame loop. Each request is dispatched on its own
    /// task; responses and notifications funnel through the writer half.
    async fn serve_session(
        &self,
        framed: Framed<Socket, SeparatorCodec>,
        peer: SocketAddr,
        session: SessionKey,
        shutdown: CancellationToken,
    ) {
        let (mut sink, mut stream) = framed.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);

        let writer = tokio::spawn(async move {
            while let Some(plaintext) = outbound_rx.recv().await {
                let frame = session.encrypt_frame(&plaintext);
                if sink.send(Bytes::from(frame)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let handle = ConnectionHandle::new(peer, outbound_tx.clone());

        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = shutdown.cancelled() => break,
            };
            let Some(Ok(frame)) = frame else { break };

            let plaintext = match session.decrypt_frame(&frame) {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    error!(%peer, %err, "dropping connection: undecryptable frame");
                    break;
                }
            };

            let message = match Message::parse(&plaintext) {
                Ok(message) => message,
                Err(err) => {
                    warn!(%peer, %err, "ignoring unparseable frame");
                    continue;
                }
            };

            match message {
                Message::Request(request) if request.method == "pty_input" => {
                    #[cfg(target_family = "unix")]
                    handle.feed_pty_input(&request).await;
                    #[cfg(not(target_family = "unix"))]
                    let _ = request;
                }
                // Notifications run in arrival order; streamed file
                // chunks depend on it. Calls get their own task so a
                // long-running method (an attached shell) never stalls
                // the read loop, and responses may complete out of
                // order.
                Message::Request(request) if request.is_notification() => {
                    let mut ctx = RequestContext::new(peer);
                    ctx.connection = Some(handle.clone());
                    let _ = self.dispatcher.dispatch(request, ctx).await;
                }
                Message::Request(request) => {
                    let dispatcher = self.dispatcher.clone();
                    let outbound = outbound_tx.clone();
                    let mut ctx = RequestContext::new(peer);
                    ctx.connection = Some(handle.clone());
                    tokio::spawn(async move {
                        if let Some(response) = dispatcher.dispatch(request, ctx).await {
                            let _ = outbound.send(serialize_response(&response)).await;
                        }
                    });
                }
                Message::Response(_) => {
                    debug!(%peer, "ignoring unsolicited response frame");
                }
            }
        }

        #[cfg(target_family = "unix")]
        handle.detach_pty().await;
        drop(outbound_tx);
        let _ = writer.await;
        debug!(%peer, "session closed");
    }
}

#[cfg(target_family = "unix")]
struct PtyBinding {
    input_tx: mpsc::Sender<Vec<u8>>,
    finished: tokio::sync::watch::Receiver<bool>,
}

/// Cloneable handle onto one live connection, given to RPC methods that
/// need to push frames (PTY output) or bind a PTY session to the peer.
#[derive(Clone)]
pub struct ConnectionHandle {
    peer: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    #[cfg(target_family = "unix")]
    pty: Arc<tokio::sync::Mutex<Option<PtyBinding>>>,
}

impl ConnectionHandle {
    fn new(peer: SocketAddr, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        ConnectionHandle {
            peer,
            outbound,
            #[cfg(target_family = "unix")]
            pty: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a one-way request to the peer.
    pub async fn notify(&self, request: &Request) {
        let _ = self.outbound.send(serialize_request(request)).await;
    }
}

#[cfg(target_family = "unix")]
impl ConnectionHandle {
    /// Bind a spawned PTY to this connection and start pumping bytes.
    pub async fn attach_pty(&self, session: super::pty::PtySession) {
        let (input_tx, input_rx) = mpsc::channel(32);
        let (finished_tx, finished_rx) = tokio::sync::watch::channel(false);

        let mut binding = self.pty.lock().await;
        *binding = Some(PtyBinding {
            input_tx,
            finished: finished_rx,
        });

        tokio::spawn(super::pty::pump(
            session,
            self.outbound.clone(),
            input_rx,
            finished_tx,
        ));
    }

    /// Drop the PTY binding; the pump notices the closed input channel and
    /// reaps the shell.
    pub async fn detach_pty(&self) {
        self.pty.lock().await.take();
    }

    /// Wait until the bound shell ends, by exit or detach.
    pub async fn proxy_pty(&self) {
        let finished = match self.pty.lock().await.as_ref() {
            Some(binding) => binding.finished.clone(),
            None => return,
        };
        let mut finished = finished;
        while !*finished.borrow() {
            if finished.changed().await.is_err() {
                break;
            }
        }
    }

    async fn feed_pty_input(&self, request: &Request) {
        let data = request
            .params
            .as_ref()
            .and_then(|p| p.get("data"))
            .and_then(|d| d.as_str())
            .and_then(|hex_data| hex::decode(hex_data).ok());

        let Some(data) = data else {
            warn!(peer = %self.peer, "pty_input frame without data");
            return;
        };

        if let Some(binding) = self.pty.lock().await.as_ref() {
            let _ = binding.input_tx.send(data).await;
        }
    }
}

/// Modes 1→2 of the channel: generate the connection's RSA keypair, trade
/// it for the AES session key, prove the channel works.
async fn agent_handshake(
    framed: &mut Framed<Socket, SeparatorCodec>,
) -> Result<SessionKey, TransportError> {
    let step = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);

    let (private_key, public_pem) = tokio::task::spawn_blocking(super::crypto::generate_rsa_keypair)
        .await
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

    framed.send(Bytes::from(public_pem.into_bytes())).await?;

    let exchange = next_frame(framed, step, "key exchange").await?;
    let envelope: KeyExchangeEnvelope = serde_json::from_slice(&exchange)
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
    let session = open_session_key(&private_key, &envelope)
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

    let probe = EncryptionProbe::challenge();
    let probe_frame = serde_json::to_vec(&probe).expect("probe serializes");
    framed
        .send(Bytes::from(session.encrypt_frame(&probe_frame)))
        .await?;

    let answer = next_frame(framed, step, "probe response").await?;
    let answer: EncryptionProbe = serde_json::from_slice(
        &session
            .decrypt_frame(&answer)
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?,
    )
    .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

    if !answer.answers(&probe) {
        return Err(TransportError::HandshakeFailed(
            "encryption probe mismatch".to_string(),
        ));
    }
    Ok(session)
}

async fn next_frame(
    framed: &mut Framed<Socket, SeparatorCodec>,
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
