//! Socket transport between Keeper and Agent.
//!
//! A transport is a full-duplex, separator-framed message channel that is
//! upgraded in place: plain TCP, then AES-EAX encryption negotiated through
//! an RSA key exchange, optionally gated by a signature challenge, and
//! finally mutually-authenticated TLS on the adjacent port once an agent
//! is enrolled.

pub mod auth;
pub mod client;
pub mod crypto;
pub mod framing;
#[cfg(target_family = "unix")]
pub mod pty;
pub mod server;
mod socket;
pub mod stream;
pub mod tls;

use std::fmt::{Display, Formatter};
use std::io;
use thiserror::Error;

/// Delay applied to a peer that fails the source-address whitelist before
/// the connection is dropped.
pub(crate) const REJECT_DELAY_SECS: u64 = 3;

/// Per-step handshake timeout.
pub(crate) const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Typed failure symbols surfaced out-of-band through a transport's
/// `failed_on` field. These never travel inside RPC results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSymbol {
    NoSocket,
    AuthAddressRequired,
    AuthDenied,
    ProxyAuthAddressRequired,
    ProxyAuthDenied,
}

impl Display for FailureSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            FailureSymbol::NoSocket => "NO_SOCKET",
            FailureSymbol::AuthAddressRequired => "AUTH_ADDRESS_REQUIRED",
            FailureSymbol::AuthDenied => "AUTH_DENIED",
            FailureSymbol::ProxyAuthAddressRequired => "PROXY_AUTH_ADDRESS_REQUIRED",
            FailureSymbol::ProxyAuthDenied => "PROXY_AUTH_DENIED",
        };
        write!(f, "{symbol}")
    }
}

impl FailureSymbol {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NO_SOCKET" => Some(FailureSymbol::NoSocket),
            "AUTH_ADDRESS_REQUIRED" => Some(FailureSymbol::AuthAddressRequired),
            "AUTH_DENIED" => Some(FailureSymbol::AuthDenied),
            "PROXY_AUTH_ADDRESS_REQUIRED" => Some(FailureSymbol::ProxyAuthAddressRequired),
            "PROXY_AUTH_DENIED" => Some(FailureSymbol::ProxyAuthDenied),
            _ => None,
        }
    }

    /// Remaps the plain auth symbols onto their proxy variants, used by a
    /// client whose frames travel through a primary agent.
    pub fn through_proxy(self) -> Self {
        match self {
            FailureSymbol::AuthAddressRequired => FailureSymbol::ProxyAuthAddressRequired,
            FailureSymbol::AuthDenied => FailureSymbol::ProxyAuthDenied,
            other => other,
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no socket: `{0}`")]
    NoSocket(String),

    #[error("signing key required for address `{0}`")]
    AuthAddressRequired(String),

    #[error("authentication denied for address `{0}`")]
    AuthDenied(String),

    #[error("signing key required for proxied address `{0}`")]
    ProxyAuthAddressRequired(String),

    #[error("authentication denied for proxied address `{0}`")]
    ProxyAuthDenied(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("tls error: {0}")]
    Tls(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::NoSocket(err.to_string())
    }
}

impl TransportError {
    /// The out-of-band symbol this error surfaces as, if any.
    pub fn failure_symbol(&self) -> FailureSymbol {
        match self {
            TransportError::AuthAddressRequired(_) => FailureSymbol::AuthAddressRequired,
            TransportError::AuthDenied(_) => FailureSymbol::AuthDenied,
            TransportError::ProxyAuthAddressRequired(_) => FailureSymbol::ProxyAuthAddressRequired,
            TransportError::ProxyAuthDenied(_) => FailureSymbol::ProxyAuthDenied,
            _ => FailureSymbol::NoSocket,
        }
    }
}
