//! Agent phases and the transition table between them

use std::fmt;
use std::time::Duration;

use ptw_core::config::RetryConfig;

use super::AgentError;

/// Where the agent is in its connection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentPhase {
    Idle,
    CheckingLocal,
    PreparingDirectory,
    StartingTunnel,
    /// The remote forward is live
    Active,
    /// Stopped on request
    Stopped,
    /// Gave up after an unexpected failure
    Terminated,
}

impl AgentPhase {
    /// Whether the agent leaves its run loop in this phase
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Terminated)
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::CheckingLocal => "checking_local",
            Self::PreparingDirectory => "preparing_directory",
            Self::StartingTunnel => "starting_tunnel",
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Outcome of the step run in a phase
#[derive(Debug)]
pub enum AgentEvent {
    Started,
    LocalReachable,
    DirectoryPrepared,
    /// The session returned while still marked running
    SessionEnded,
    StopRequested,
    Failed(AgentError),
}

/// Next phase, and how long to wait before running it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: AgentPhase,
    pub wait: Option<Duration>,
}

impl Transition {
    fn now(next: AgentPhase) -> Self {
        Self { next, wait: None }
    }

    fn after(next: AgentPhase, wait: Duration) -> Self {
        Self {
            next,
            wait: Some(wait),
        }
    }
}

/// Maps `(phase, event)` to the next transition
///
/// Every wait is fixed; none grows between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retry: RetryConfig,
}

impl RetryPolicy {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    pub fn next(&self, phase: AgentPhase, event: &AgentEvent) -> Transition {
        use AgentEvent as E;
        use AgentPhase as P;

        match (phase, event) {
            (_, E::StopRequested) => Transition::now(P::Stopped),
            (P::Idle, E::Started) => Transition::now(P::CheckingLocal),
            (P::CheckingLocal, E::LocalReachable) => Transition::now(P::PreparingDirectory),
            (P::PreparingDirectory, E::DirectoryPrepared) => Transition::now(P::StartingTunnel),
            (P::StartingTunnel | P::Active, E::SessionEnded) => {
                Transition::after(P::StartingTunnel, self.retry.reconnect_delay)
            }
            (_, E::Failed(err)) => match err {
                AgentError::LocalUnavailable { .. } => {
                    Transition::after(P::CheckingLocal, self.retry.local_retry)
                }
                AgentError::Directory(_) => {
                    Transition::after(P::CheckingLocal, self.retry.directory_retry)
                }
                AgentError::AuthenticationFailed | AgentError::Transport(_) => {
                    Transition::after(P::CheckingLocal, self.retry.auth_retry)
                }
                AgentError::Unexpected(_) | AgentError::StopTimedOut(_) => {
                    Transition::now(P::Terminated)
                }
            },
            _ => Transition::now(P::Terminated),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
