//! Externally observable agent status
//!
//! A supervisor reads `ptw/success` and `ptw/error` to learn how the most
//! recent connection cycle went without parsing logs.

use std::fmt;

use crate::error::StoreError;
use crate::store::{Config, Field};

/// Success code: the directory accepted our name, version and identity
pub const DIRECTORY_CONFIGURED: &str = "directory_configured";

/// Success code: the reverse forward is live
pub const CONNECTION_ESTABLISHED: &str = "connection_established";

/// Prefix of every directory failure code
pub const DIRECTORY_FAILURE_PREFIX: &str = "directory_failure";

/// Build the error code for a directory failure, e.g. `directory_failure.403`
pub fn directory_failure(label: impl fmt::Display) -> String {
    format!("{}.{}", DIRECTORY_FAILURE_PREFIX, label)
}

/// Outcome of the current connection cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStatus {
    pub success: Option<String>,
    pub error: Option<String>,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "success={} error={}",
            self.success.as_deref().unwrap_or("-"),
            self.error.as_deref().unwrap_or("-")
        )
    }
}

impl Config {
    /// Read the persisted status pair
    pub fn status(&self) -> Result<AgentStatus, StoreError> {
        Ok(AgentStatus {
            success: self.get(Field::Success)?,
            error: self.get(Field::Error)?,
        })
    }

    /// Clear both status fields at the start of a cycle
    pub fn reset_status(&self) -> Result<(), StoreError> {
        self.delete(Field::Success)?;
        self.delete(Field::Error)
    }

    pub fn record_success(&self, code: &str) -> Result<(), StoreError> {
        tracing::debug!("Status success: {}", code);
        self.set(Field::Success, Some(code))
    }

    pub fn record_error(&self, code: &str) -> Result<(), StoreError> {
        tracing::debug!("Status error: {}", code);
        self.set(Field::Error, Some(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_failure_code() {
        assert_eq!(directory_failure(403), "directory_failure.403");
        assert_eq!(directory_failure("unreachable"), "directory_failure.unreachable");
    }

    #[test]
    fn test_record_and_reset() {
        let config = Config::in_memory();
        assert_eq!(config.status().unwrap(), AgentStatus::default());

        config.record_success(DIRECTORY_CONFIGURED).unwrap();
        config.record_error(&directory_failure(500)).unwrap();

        let status = config.status().unwrap();
        assert_eq!(status.success.as_deref(), Some("directory_configured"));
        assert_eq!(status.error.as_deref(), Some("directory_failure.500"));

        config.reset_status().unwrap();
        assert_eq!(config.status().unwrap(), AgentStatus::default());
    }

    #[test]
    fn test_display() {
        let status = AgentStatus {
            success: Some(CONNECTION_ESTABLISHED.to_string()),
            error: None,
        };
        assert_eq!(status.to_string(), "success=connection_established error=-");
    }
}
