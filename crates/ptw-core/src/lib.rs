//! ptw-core: Configuration and persistent state for the publish-to-web agent
//!
//! This crate provides the agent configuration file, the key-value store
//! contract all persisted agent state lives in, and the typed field table
//! layered on top of it.

pub mod config;
pub mod error;
pub mod status;
pub mod store;

pub use error::{ConfigError, StoreError};
pub use status::AgentStatus;
pub use store::{Config, ConfigStore, DirStore, Field, MemoryStore};
