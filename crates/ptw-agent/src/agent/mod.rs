//! The publishing agent
//!
//! Drives one connection cycle after another: wait for the local service,
//! prepare the directory, open the tunnel, and keep it open. Each failure
//! class has its own fixed wait (see [`RetryPolicy`]); only unexpected
//! failures end the agent.

mod local;
mod policy;
mod prepare;

pub use local::{LocalEndpoint, TcpEndpoint};
pub use policy::{AgentEvent, AgentPhase, RetryPolicy, Transition};
pub use prepare::{prepare_directory, PrepareMode};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ptw_core::config::AgentConfig;
use ptw_core::status::{directory_failure, CONNECTION_ESTABLISHED};
use ptw_core::{Config, StoreError};

use crate::directory::{DirectoryClient, DirectoryError, DirectoryTransport};
use crate::identity::{Identity, IdentityError, IdentityManager};
use crate::tunnel::{TunnelConnector, TunnelError, TunnelParameters, TunnelSession};

/// Agent errors, classified by how the agent reacts to them
#[derive(Debug, Error)]
pub enum AgentError {
    /// Nothing accepts connections at the published address yet
    #[error("Local service at {address} unavailable: {source}")]
    LocalUnavailable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The proxy rejected our key
    #[error("Authentication rejected by proxy")]
    AuthenticationFailed,

    #[error(transparent)]
    Directory(DirectoryError),

    /// Connection to the proxy failed or dropped before the forward was up
    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// Anything else; ends the agent
    #[error("Unexpected error: {0}")]
    Unexpected(#[source] anyhow::Error),

    #[error("Agent did not stop within {0:?}")]
    StopTimedOut(Duration),
}

impl From<DirectoryError> for AgentError {
    fn from(err: DirectoryError) -> Self {
        if err.is_remote() {
            Self::Directory(err)
        } else {
            Self::Unexpected(err.into())
        }
    }
}

impl From<IdentityError> for AgentError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Directory(err) => err.into(),
            other => Self::Unexpected(other.into()),
        }
    }
}

impl From<TunnelError> for AgentError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::AuthenticationFailed => Self::AuthenticationFailed,
            TunnelError::Transport(source) => Self::Transport(source),
            other @ TunnelError::InvalidKey(_) => Self::Unexpected(other.into()),
        }
    }
}

impl From<StoreError> for AgentError {
    fn from(err: StoreError) -> Self {
        Self::Unexpected(err.into())
    }
}

/// Stops a running agent from another task
#[derive(Clone, Default)]
pub struct AgentController {
    cancel: CancellationToken,
    session: Arc<Mutex<Option<Arc<dyn TunnelSession>>>>,
}

impl AgentController {
    /// Interrupt any wait or local check and stop the current session
    ///
    /// The session leaves its keepalive loop on its next wake; in-flight I/O
    /// is not interrupted.
    pub fn stop(&self) {
        tracing::info!("Stop requested");
        self.cancel.cancel();
        if let Some(session) = self.slot().as_ref() {
            session.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once [`stop`](Self::stop) has been called
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    fn attach(&self, session: Arc<dyn TunnelSession>) {
        *self.slot() = Some(session);
    }

    fn detach(&self) {
        self.slot().take();
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn TunnelSession>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for AgentController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentController")
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

/// The publishing agent
pub struct Agent {
    config: AgentConfig,
    store: Config,
    directory: DirectoryClient,
    identity: IdentityManager,
    connector: Arc<dyn TunnelConnector>,
    local: Arc<dyn LocalEndpoint>,
    policy: RetryPolicy,
    controller: AgentController,
    phase: Arc<watch::Sender<AgentPhase>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        store: Config,
        transport: Arc<dyn DirectoryTransport>,
        connector: Arc<dyn TunnelConnector>,
    ) -> Self {
        let local = Arc::new(TcpEndpoint::new(
            config.local_address(),
            config.connect_timeout,
        ));
        let (phase, _) = watch::channel(AgentPhase::Idle);

        Self {
            directory: DirectoryClient::new(transport, store.clone()),
            identity: IdentityManager::new(store.clone(), config.key_bits),
            policy: RetryPolicy::new(config.retry.clone()),
            config,
            store,
            connector,
            local,
            controller: AgentController::default(),
            phase: Arc::new(phase),
        }
    }

    /// Probe `endpoint` instead of connecting to `bind_host:forward_port`
    pub fn with_local_endpoint(mut self, endpoint: Arc<dyn LocalEndpoint>) -> Self {
        self.local = endpoint;
        self
    }

    pub fn controller(&self) -> AgentController {
        self.controller.clone()
    }

    pub fn phase(&self) -> AgentPhase {
        *self.phase.borrow()
    }

    /// Follow phase changes
    pub fn subscribe(&self) -> watch::Receiver<AgentPhase> {
        self.phase.subscribe()
    }

    pub fn store(&self) -> &Config {
        &self.store
    }

    pub fn directory(&mut self) -> &mut DirectoryClient {
        &mut self.directory
    }

    /// One preparation pass outside the connection cycle
    pub async fn prepare(&mut self, mode: PrepareMode) -> Result<(), AgentError> {
        prepare_directory(
            &mut self.directory,
            &self.identity,
            &self.store,
            &self.config.service_domain,
            mode,
        )
        .await
    }

    /// The identity the directory has on record, rotated if needed
    pub async fn ensure_identity(&mut self) -> Result<Identity, AgentError> {
        Ok(self.identity.ensure_valid_identity(&mut self.directory).await?)
    }

    /// Run connection cycles until stopped or an unexpected failure
    pub async fn run(&mut self) -> Result<(), AgentError> {
        tracing::info!(
            "Publishing {} through {}:{}",
            self.config.local_address(),
            self.config.proxy_host,
            self.config.proxy_port
        );
        self.enter(AgentPhase::Idle);
        let mut event = AgentEvent::Started;

        loop {
            let transition = self.policy.next(self.phase(), &event);
            self.enter(transition.next);

            match transition.next {
                AgentPhase::Stopped => {
                    tracing::info!("Agent stopped");
                    return Ok(());
                }
                AgentPhase::Terminated => {
                    let err = match event {
                        AgentEvent::Failed(err) => err,
                        other => AgentError::Unexpected(anyhow::anyhow!(
                            "No transition after {:?}",
                            other
                        )),
                    };
                    tracing::error!("Agent terminated: {}", err);
                    return Err(err);
                }
                _ => {}
            }

            if let Some(wait) = transition.wait {
                if let AgentEvent::Failed(err) = &event {
                    tracing::warn!("{}; retrying in {:?}", err, wait);
                } else {
                    tracing::info!("Reconnecting in {:?}", wait);
                }
                if !self.pause(wait).await {
                    event = AgentEvent::StopRequested;
                    continue;
                }
            }

            let reconnect = matches!(event, AgentEvent::SessionEnded);
            event = if self.controller.is_stopped() {
                AgentEvent::StopRequested
            } else {
                self.step(transition.next, reconnect).await
            };
        }
    }

    /// Run on a background task
    pub fn spawn(mut self) -> AgentHandle {
        let controller = self.controller();
        let phase = self.subscribe();
        let task = tokio::spawn(async move { self.run().await });

        AgentHandle {
            controller,
            phase,
            task,
        }
    }

    fn enter(&self, phase: AgentPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!("Agent phase {} -> {}", previous, phase);
        }
    }

    /// Sleep unless stopped first; false when stopped
    async fn pause(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = self.controller.stopped() => false,
        }
    }

    async fn step(&mut self, phase: AgentPhase, reconnect: bool) -> AgentEvent {
        match phase {
            AgentPhase::CheckingLocal => self.check_local().await,
            AgentPhase::PreparingDirectory => {
                // New cycle, nothing cached may carry over
                self.directory.invalidate();
                match self.prepare(PrepareMode::Graceful).await {
                    Ok(()) => AgentEvent::DirectoryPrepared,
                    Err(err) => AgentEvent::Failed(err),
                }
            }
            AgentPhase::StartingTunnel => {
                if reconnect {
                    self.directory.invalidate();
                }
                match self.start_tunnel().await {
                    Ok(event) => event,
                    Err(err) => AgentEvent::Failed(err),
                }
            }
            other => AgentEvent::Failed(AgentError::Unexpected(anyhow::anyhow!(
                "Nothing to run in phase {}",
                other
            ))),
        }
    }

    async fn check_local(&self) -> AgentEvent {
        tracing::debug!("Checking local service at {}", self.config.local_address());
        tokio::select! {
            result = self.local.check() => match result {
                Ok(()) => AgentEvent::LocalReachable,
                Err(source) => AgentEvent::Failed(AgentError::LocalUnavailable {
                    address: self.config.local_address(),
                    source,
                }),
            },
            _ = self.controller.stopped() => AgentEvent::StopRequested,
        }
    }

    /// Identity and remote port, both confirmed by the directory
    async fn resolve_target(&mut self) -> Result<TunnelParameters, AgentError> {
        let identity = self.ensure_identity().await?;
        let info = self.directory.connection_info(false).await?;

        Ok(TunnelParameters {
            proxy_host: self.config.proxy_host.clone(),
            proxy_user: self.config.proxy_user.clone(),
            proxy_port: self.config.proxy_port,
            private_key: identity.private_key,
            bind_host: self.config.bind_host.clone(),
            remote_port: info.remote_port,
            forward_port: self.config.forward_port,
            health_port: self.config.health_port,
        })
    }

    async fn start_tunnel(&mut self) -> Result<AgentEvent, AgentError> {
        let params = match self.resolve_target().await {
            Ok(params) => params,
            Err(AgentError::Directory(err)) => {
                self.store.record_error(&directory_failure(err.status_label()))?;
                return Err(AgentError::Directory(err));
            }
            Err(err) => return Err(err),
        };

        tracing::info!(
            "Starting tunnel to {} for remote port {}",
            params.proxy_host,
            params.remote_port
        );
        let session = self.connector.connect(params)?;

        self.controller.attach(Arc::clone(&session));
        if self.controller.is_stopped() {
            self.controller.detach();
            return Ok(AgentEvent::StopRequested);
        }

        let store = self.store.clone();
        let phase = Arc::clone(&self.phase);
        let result = session
            .start(Box::new(move || {
                if let Err(e) = store.record_success(CONNECTION_ESTABLISHED) {
                    tracing::warn!("Failed to record connection status: {}", e);
                }
                phase.send_replace(AgentPhase::Active);
                tracing::info!("Tunnel established");
            }))
            .await;
        self.controller.detach();
        result?;

        if self.controller.is_stopped() || !session.is_running() {
            Ok(AgentEvent::StopRequested)
        } else {
            tracing::warn!("Tunnel dropped");
            Ok(AgentEvent::SessionEnded)
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// An agent running on a background task
#[derive(Debug)]
pub struct AgentHandle {
    controller: AgentController,
    phase: watch::Receiver<AgentPhase>,
    task: JoinHandle<Result<(), AgentError>>,
}

impl AgentHandle {
    pub fn controller(&self) -> AgentController {
        self.controller.clone()
    }

    pub fn phase(&self) -> AgentPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentPhase> {
        self.phase.clone()
    }

    /// Resolves once the agent reached `phase`, or left its run loop
    pub async fn reached(&self, phase: AgentPhase) -> AgentPhase {
        let mut rx = self.phase.clone();
        let reached = rx
            .wait_for(|current| *current == phase || current.is_terminal())
            .await
            .map(|current| *current);
        reached.unwrap_or(AgentPhase::Terminated)
    }

    /// Resolves once the agent left its run loop
    pub async fn finished(&self) {
        let mut rx = self.phase.clone();
        let _ = rx.wait_for(|current| current.is_terminal()).await;
    }

    /// Wait for the agent to end on its own
    pub async fn join(self) -> Result<(), AgentError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(AgentError::Unexpected(e.into())),
        }
    }

    /// Stop the agent and wait up to `timeout` for it to finish
    pub async fn stop(self, timeout: Duration) -> Result<(), AgentError> {
        self.controller.stop();

        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(AgentError::Unexpected(e.into())),
            Err(_) => {
                tracing::warn!("Agent did not stop within {:?}, aborting", timeout);
                task.abort();
                Err(AgentError::StopTimedOut(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    use ptw_core::Field;

    use crate::test_support::{FakeDirectory, FlakyEndpoint, ScriptedConnector, SessionScript};

    const STOP_TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        directory: Arc<FakeDirectory>,
        connector: Arc<ScriptedConnector>,
        endpoint: Arc<FlakyEndpoint>,
        store: Config,
        agent: Agent,
    }

    /// Agent with a registered identity, so no key is generated while timed
    fn fixture(refusals: usize, script: Vec<SessionScript>) -> Fixture {
        let directory = FakeDirectory::new();
        let connector = ScriptedConnector::new(script);
        let endpoint = FlakyEndpoint::new(refusals);
        let store = Config::in_memory();

        let identity = Identity::generate(1024).unwrap();
        store.set(Field::PublicKey, Some(&identity.public_key)).unwrap();
        store.set(Field::PrivateKey, Some(&identity.private_key)).unwrap();
        directory.register_key(&identity.public_key);

        let config = AgentConfig {
            key_bits: 1024,
            ..AgentConfig::default()
        };
        let agent = Agent::new(config, store.clone(), directory.clone(), connector.clone())
            .with_local_endpoint(endpoint.clone());

        Fixture {
            directory,
            connector,
            endpoint,
            store,
            agent,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_stops() {
        let fx = fixture(0, vec![SessionScript::EstablishThenWait]);
        let handle = fx.agent.spawn();

        assert_eq!(handle.reached(AgentPhase::Active).await, AgentPhase::Active);
        let status = fx.store.status().unwrap();
        assert_eq!(status.success.as_deref(), Some(CONNECTION_ESTABLISHED));
        assert_eq!(status.error, None);

        let params = fx.connector.parameters();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].remote_port, 1234);
        assert_eq!(params[0].forward_port, 80);
        assert_eq!(params[0].proxy_user, "localtunnel");
        assert_eq!(
            params[0].private_key,
            fx.store.get(Field::PrivateKey).unwrap().unwrap()
        );

        let phase = handle.subscribe();
        handle.stop(STOP_TIMEOUT).await.unwrap();
        assert_eq!(*phase.borrow(), AgentPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_refusal_waits_once() {
        let fx = fixture(1, vec![SessionScript::EstablishThenWait]);
        let started = Instant::now();
        let handle = fx.agent.spawn();

        handle.reached(AgentPhase::Active).await;
        let elapsed = started.elapsed();

        assert_eq!(fx.endpoint.checks(), 2);
        assert!(elapsed >= Duration::from_secs(5), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(6), "{:?}", elapsed);
        handle.stop(STOP_TIMEOUT).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_retries_after_30s() {
        let fx = fixture(
            0,
            vec![SessionScript::RejectAuth, SessionScript::EstablishThenWait],
        );
        let started = Instant::now();
        let handle = fx.agent.spawn();

        assert_eq!(handle.reached(AgentPhase::Active).await, AgentPhase::Active);
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(30), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(31), "{:?}", elapsed);
        assert_eq!(fx.connector.sessions(), 2);
        // The whole cycle ran again
        assert_eq!(fx.endpoint.checks(), 2);
        assert_eq!(fx.directory.calls("/set_version"), 2);
        handle.stop(STOP_TIMEOUT).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_retries_like_auth() {
        let fx = fixture(
            0,
            vec![SessionScript::TransportFailure, SessionScript::EstablishThenWait],
        );
        let started = Instant::now();
        let handle = fx.agent.spawn();

        assert_eq!(handle.reached(AgentPhase::Active).await, AgentPhase::Active);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(fx.connector.sessions(), 2);
        handle.stop(STOP_TIMEOUT).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_directory_failure_is_recorded_and_retried() {
        let fx = fixture(0, vec![SessionScript::EstablishThenWait]);
        fx.directory.fail("/info", 403);
        let started = Instant::now();
        let handle = fx.agent.spawn();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let status = fx.store.status().unwrap();
        assert_eq!(status.error.as_deref(), Some("directory_failure.403"));
        assert_eq!(status.success, None);
        assert_eq!(fx.connector.sessions(), 0);
        assert_eq!(handle.phase(), AgentPhase::CheckingLocal);

        fx.directory.recover("/info");
        assert_eq!(handle.reached(AgentPhase::Active).await, AgentPhase::Active);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(
            fx.store.status().unwrap().success.as_deref(),
            Some(CONNECTION_ESTABLISHED)
        );
        handle.stop(STOP_TIMEOUT).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_reconnects_with_fresh_info() {
        let fx = fixture(
            0,
            vec![SessionScript::EstablishThenDrop, SessionScript::EstablishThenWait],
        );
        let handle = fx.agent.spawn();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.connector.sessions(), 1);
        assert_eq!(handle.phase(), AgentPhase::StartingTunnel);
        assert_eq!(fx.directory.calls("/info"), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.connector.sessions(), 2);
        assert_eq!(handle.phase(), AgentPhase::Active);
        // Connection info was fetched again for the new session
        assert_eq!(fx.directory.calls("/info"), 2);
        // Reconnects skip the local check and preparation
        assert_eq!(fx.endpoint.checks(), 1);
        assert_eq!(fx.directory.calls("/set_version"), 1);
        handle.stop(STOP_TIMEOUT).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_failure_terminates() {
        let fx = fixture(0, vec![SessionScript::Unexpected]);
        let handle = fx.agent.spawn();
        let phase = handle.subscribe();

        let err = handle.join().await.unwrap_err();

        assert!(matches!(err, AgentError::Unexpected(_)), "{:?}", err);
        assert_eq!(*phase.borrow(), AgentPhase::Terminated);
        assert_eq!(fx.connector.sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_retry_wait() {
        let fx = fixture(1000, vec![]);
        let handle = fx.agent.spawn();

        tokio::time::sleep(Duration::from_secs(12)).await;
        handle.stop(STOP_TIMEOUT).await.unwrap();

        assert_eq!(fx.endpoint.checks(), 3);
        assert_eq!(fx.connector.sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_run_returns_immediately() {
        let mut fx = fixture(0, vec![]);
        fx.agent.controller().stop();

        fx.agent.run().await.unwrap();

        assert_eq!(fx.agent.phase(), AgentPhase::Stopped);
        assert_eq!(fx.endpoint.checks(), 0);
        assert_eq!(fx.directory.total_calls(), 0);
    }

    #[test]
    fn test_error_classification() {
        let err: AgentError = DirectoryError::Store(StoreError::InvalidKey("x".into())).into();
        assert!(matches!(err, AgentError::Unexpected(_)));

        let err: AgentError = TunnelError::AuthenticationFailed.into();
        assert!(matches!(err, AgentError::AuthenticationFailed));
    }
}
