//! ptw-agent: publish a local service through a reverse SSH tunnel
//!
//! The agent keeps one outbound SSH session to a public proxy, with a remote
//! forward that exposes the local service. Licensing, identity and naming
//! are coordinated with a remote directory service over HTTP.

pub mod agent;
pub mod directory;
pub mod identity;
pub mod tunnel;

#[cfg(test)]
mod test_support;

pub use agent::{Agent, AgentController, AgentError, AgentHandle, AgentPhase, PrepareMode};
pub use directory::{DirectoryClient, DirectoryError, HttpTransport};
pub use identity::{Identity, IdentityManager};
pub use tunnel::{SshConnector, TunnelError};
