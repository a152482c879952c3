//! SSH tunnel session
//!
//! Opens a key-authenticated session to the proxy, requests the reverse
//! forward that publishes the local service, adds the auxiliary liveness
//! forward, then idles in a keepalive loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Msg};
use russh::{Channel, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;

use ptw_core::config::AgentConfig;

use super::forward;
use super::{OnEstablished, TunnelConnector, TunnelError, TunnelParameters, TunnelSession};

/// Address the proxy binds our reverse forward to
const REMOTE_BIND_ADDRESS: &str = "127.0.0.1";

/// Timing shared by every session a connector builds
#[derive(Debug, Clone, Copy)]
struct SessionTiming {
    /// Bound on TCP connect + handshake, and separately on authentication
    connect_timeout: Duration,
    /// SSH-level keepalive
    keepalive_interval: Duration,
    /// Wake interval of the keepalive loop
    poll_interval: Duration,
}

/// Builds [`SshTunnel`] sessions
#[derive(Debug, Clone)]
pub struct SshConnector {
    timing: SessionTiming,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, keepalive_interval: Duration, poll_interval: Duration) -> Self {
        Self {
            timing: SessionTiming {
                connect_timeout,
                keepalive_interval,
                poll_interval,
            },
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.connect_timeout,
            config.keepalive_interval,
            config.poll_interval,
        )
    }
}

impl TunnelConnector for SshConnector {
    fn connect(&self, params: TunnelParameters) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        Ok(Arc::new(SshTunnel::new(params, self.timing)?))
    }
}

/// A reverse tunnel over one SSH session
pub struct SshTunnel {
    params: TunnelParameters,
    key: Arc<KeyPair>,
    timing: SessionTiming,
    running: AtomicBool,
    stopped: AtomicBool,
    /// Local end of the liveness forward, 0 until bound
    liveness_port: AtomicU16,
}

impl SshTunnel {
    fn new(params: TunnelParameters, timing: SessionTiming) -> Result<Self, TunnelError> {
        let key = russh_keys::decode_secret_key(&params.private_key, None)?;

        Ok(Self {
            params,
            key: Arc::new(key),
            timing,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            liveness_port: AtomicU16::new(0),
        })
    }

    /// Parameters this session was built from
    pub fn params(&self) -> &TunnelParameters {
        &self.params
    }

    /// Local port of the liveness forward, once the session is up
    pub fn liveness_port(&self) -> Option<u16> {
        match self.liveness_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    async fn open(&self) -> Result<client::Handle<ClientHandler>, TunnelError> {
        let params = &self.params;
        let proxy = format!("{}:{}", params.proxy_host, params.proxy_port);

        let ssh_config = Arc::new(Config {
            keepalive_interval: Some(self.timing.keepalive_interval),
            ..Default::default()
        });
        let handler = ClientHandler {
            bind_host: params.bind_host.clone(),
            forward_port: params.forward_port,
        };

        tracing::debug!("Connecting to {}", proxy);
        let mut session = tokio::time::timeout(
            self.timing.connect_timeout,
            client::connect(ssh_config, proxy.as_str(), handler),
        )
        .await
        .map_err(|_| TunnelError::transport(anyhow::anyhow!("Connection to {} timed out", proxy)))?
        .map_err(|e| TunnelError::Transport(e.context(format!("Failed to connect to {}", proxy))))?;

        tracing::debug!("Authenticating as user '{}'", params.proxy_user);
        let authenticated = tokio::time::timeout(
            self.timing.connect_timeout,
            session.authenticate_publickey(&params.proxy_user, Arc::clone(&self.key)),
        )
        .await
        .map_err(|_| TunnelError::transport(anyhow::anyhow!("Authentication at {} timed out", proxy)))?
        .map_err(TunnelError::transport)?;

        if !authenticated {
            return Err(TunnelError::AuthenticationFailed);
        }

        Ok(session)
    }

    /// Wake every poll interval until stopped or disconnected, serving the
    /// liveness forward in between
    async fn keepalive(
        &self,
        session: &Arc<client::Handle<ClientHandler>>,
        liveness: &TcpListener,
    ) {
        let mut ticker = tokio::time::interval(self.timing.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.stopped.load(Ordering::SeqCst) {
                        tracing::info!("Tunnel stopped, leaving keepalive loop");
                        break;
                    }
                    if session.is_closed() {
                        tracing::warn!("Connection to proxy lost");
                        break;
                    }
                }
                accepted = liveness.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let session = Arc::clone(session);
                        let host = self.params.bind_host.clone();
                        let port = self.params.health_port;
                        tokio::spawn(async move {
                            open_liveness(&session, host, port, socket, peer).await;
                        });
                    }
                    Err(e) => tracing::warn!("Local forward accept failed: {}", e),
                },
            }
        }
    }
}

/// Port the proxy actually listens on for our forward
///
/// The proxy only reports a port when it picked one itself.
fn forwarded_port(bound: u32, requested: u16) -> u32 {
    if bound == 0 {
        u32::from(requested)
    } else {
        bound
    }
}

/// Carry one local connection to `host:port` on the proxy side
async fn open_liveness(
    session: &client::Handle<ClientHandler>,
    host: String,
    port: u16,
    socket: TcpStream,
    peer: SocketAddr,
) {
    match session
        .channel_open_direct_tcpip(
            host.clone(),
            u32::from(port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
    {
        Ok(channel) => {
            if let Err(e) = forward::pipe(socket, channel).await {
                tracing::debug!("Liveness forward closed: {}", e);
            }
        }
        Err(e) => tracing::debug!("Liveness channel to {}:{} refused: {}", host, port, e),
    }
}

#[async_trait]
impl TunnelSession for SshTunnel {
    async fn start(&self, on_established: OnEstablished) -> Result<(), TunnelError> {
        let params = &self.params;
        let mut session = self.open().await?;

        let bound = session
            .tcpip_forward(REMOTE_BIND_ADDRESS, u32::from(params.remote_port))
            .await
            .map_err(|e| {
                TunnelError::Transport(anyhow::Error::new(e).context(format!(
                    "Proxy refused remote forward of port {}",
                    params.remote_port
                )))
            })?;
        let remote_port = forwarded_port(bound, params.remote_port);

        // Indicate to our caller that we have established the connection successfully
        on_established();
        tracing::info!(
            "Established remote forwarding at port {} -> {}:{}",
            remote_port,
            params.bind_host,
            params.forward_port
        );

        let liveness = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(TunnelError::transport)?;
        let local_port = liveness
            .local_addr()
            .map_err(TunnelError::transport)?
            .port();
        self.liveness_port.store(local_port, Ordering::SeqCst);
        tracing::info!(
            "Established local forwarding at port {} -> {}:{}",
            local_port,
            params.bind_host,
            params.health_port
        );

        tracing::info!("Entering keepalive loop");
        self.running
            .store(!self.stopped.load(Ordering::SeqCst), Ordering::SeqCst);
        let session = Arc::new(session);
        self.keepalive(&session, &liveness).await;

        if !session.is_closed() {
            if let Err(e) = session
                .disconnect(Disconnect::ByApplication, "closing", "en")
                .await
            {
                tracing::debug!("Disconnect failed: {}", e);
            }
        }

        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// SSH client handler for the tunnel
struct ClientHandler {
    /// Where forwarded connections are delivered
    bind_host: String,
    forward_port: u16,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// The proxy is identified through the directory, not a known-hosts file
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Proxy host key: {}", server_public_key.fingerprint());
        Ok(true)
    }

    /// A client connected to our port on the proxy
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            "Forwarded connection on {}:{} from {}:{}",
            connected_address,
            connected_port,
            originator_address,
            originator_port
        );

        let target = format!("{}:{}", self.bind_host, self.forward_port);
        tokio::spawn(async move {
            if let Err(e) = forward::deliver(channel, &target).await {
                tracing::warn!("Forwarded connection to {} failed: {}", target, e);
            }
        });

        Ok(())
    }
}
