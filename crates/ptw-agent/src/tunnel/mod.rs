//! Reverse tunnel to the proxy

mod forward;
mod session;

pub use session::{SshConnector, SshTunnel};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Called once when the remote forward is confirmed live
pub type OnEstablished = Box<dyn FnOnce() + Send>;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The proxy rejected our key
    #[error("Authentication rejected by proxy")]
    AuthenticationFailed,

    /// Connection, DNS, timeout or forwarding failure
    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// The stored private key could not be used
    #[error("Invalid identity: {0}")]
    InvalidKey(#[from] russh_keys::Error),
}

impl TunnelError {
    pub(crate) fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }
}

/// Everything needed to open one tunnel session
///
/// Built fresh for every session and never changed afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelParameters {
    pub proxy_host: String,
    pub proxy_user: String,
    pub proxy_port: u16,
    /// PKCS#8 PEM of the identity
    pub private_key: String,
    pub bind_host: String,
    /// Port the directory reserved for us on the proxy
    pub remote_port: u16,
    /// Local port of the published service
    pub forward_port: u16,
    /// Proxy-side port the liveness forward targets
    pub health_port: u16,
}

impl fmt::Debug for TunnelParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelParameters")
            .field("proxy_host", &self.proxy_host)
            .field("proxy_user", &self.proxy_user)
            .field("proxy_port", &self.proxy_port)
            .field("private_key", &"<redacted>")
            .field("bind_host", &self.bind_host)
            .field("remote_port", &self.remote_port)
            .field("forward_port", &self.forward_port)
            .field("health_port", &self.health_port)
            .finish()
    }
}

/// One tunnel session
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Connect, set up the forwards, and keep the session alive until
    /// [`stop`](Self::stop) is called or the transport goes away
    async fn start(&self, on_established: OnEstablished) -> Result<(), TunnelError>;

    /// Ask the keepalive loop to exit on its next wake. Also honored when
    /// called before the loop was entered.
    fn stop(&self);

    /// Whether the keepalive loop was entered and not stopped
    fn is_running(&self) -> bool;
}

/// Builds tunnel sessions
pub trait TunnelConnector: Send + Sync {
    fn connect(&self, params: TunnelParameters) -> Result<Arc<dyn TunnelSession>, TunnelError>;
}
