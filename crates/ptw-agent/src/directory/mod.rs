//! Remote directory service
//!
//! The directory is the service of record for licensing, identity
//! fingerprints, node names and per-license settings (SMTP relay, account
//! limits). Every call except license creation is scoped by the license key.

mod client;
mod transport;

pub use client::{ConnectionInfo, DirectoryClient, DirectoryMap, HARDWARE_ID_PREFIX};
pub use transport::{DirectoryTransport, HttpResponse, HttpTransport};

use std::fmt;

use ptw_core::StoreError;
use thiserror::Error;

/// Which directory call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryErrorKind {
    CreateLicenseFailed,
    FetchInfoFailed,
    SetNodeNameFailed,
    SetVersionFailed,
    RegisterIdentityFailed,
    SmtpConfigFailed,
    LimitsFailed,
    UsageReportFailed,
}

impl fmt::Display for DirectoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::CreateLicenseFailed => "Failed to create license in directory",
            Self::FetchInfoFailed => "Failed to get connection info from directory",
            Self::SetNodeNameFailed => "Failed to set new node name in directory",
            Self::SetVersionFailed => "Failed to set version in directory",
            Self::RegisterIdentityFailed => "Failed to register identity with directory",
            Self::SmtpConfigFailed => "Failed to get SMTP config from directory",
            Self::LimitsFailed => "Failed to get limits from directory",
            Self::UsageReportFailed => "Failed to report usage to directory",
        };
        f.write_str(message)
    }
}

/// Errors talking to the directory
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory answered with an unexpected HTTP status
    #[error("{kind}! HTTP Status {status}")]
    Status { kind: DirectoryErrorKind, status: u16 },

    /// No HTTP response arrived (DNS, refused, timeout, TLS)
    #[error("{kind}: directory unreachable: {source}")]
    Unreachable {
        kind: DirectoryErrorKind,
        #[source]
        source: anyhow::Error,
    },

    /// The response body could not be decoded
    #[error("{kind}: invalid response: {message}")]
    InvalidResponse {
        kind: DirectoryErrorKind,
        message: String,
    },

    /// Persisting a value the directory issued failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl DirectoryError {
    /// The failed call, if the error came from one
    pub fn kind(&self) -> Option<DirectoryErrorKind> {
        match self {
            Self::Status { kind, .. }
            | Self::Unreachable { kind, .. }
            | Self::InvalidResponse { kind, .. } => Some(*kind),
            Self::Store(_) => None,
        }
    }

    /// HTTP status of the failed call, if the directory answered
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Label used in the `directory_failure.<label>` status code
    pub fn status_label(&self) -> String {
        match self {
            Self::Status { status, .. } => status.to_string(),
            Self::Unreachable { .. } => "unreachable".to_string(),
            Self::InvalidResponse { .. } => "invalid_response".to_string(),
            Self::Store(_) => "unexpected".to_string(),
        }
    }

    /// Whether this is a failure of the remote side rather than a local one
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}
