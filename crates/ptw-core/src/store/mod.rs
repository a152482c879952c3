//! Persistent key-value state
//!
//! All state the agent persists (keys, identifiers, status flags, values
//! mirrored from the directory) lives in a string key-value store. The
//! [`Config`] wrapper maps a fixed set of typed fields onto store keys.

mod dir;
mod memory;

pub use dir::DirStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use crate::error::StoreError;

/// A string key-value store
///
/// Absence of a key is a regular `None`, never an error. Deleting a key
/// that does not exist succeeds.
pub trait ConfigStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove `key`
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Fields of the agent's persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    HardwareId,
    LicenseKey,
    /// Node name the operator wants, not the one the directory reports
    NodeName,
    PrivateKey,
    PublicKey,
    Success,
    Error,
    SmtpHost,
    SmtpSender,
    SmtpUser,
    SmtpPass,
    AccountLimit,
    ActiveAccounts,
}

const ALL_FIELDS: [Field; 13] = [
    Field::HardwareId,
    Field::LicenseKey,
    Field::NodeName,
    Field::PrivateKey,
    Field::PublicKey,
    Field::Success,
    Field::Error,
    Field::SmtpHost,
    Field::SmtpSender,
    Field::SmtpUser,
    Field::SmtpPass,
    Field::AccountLimit,
    Field::ActiveAccounts,
];

const ENABLED_KEY: &str = "ptw/control/enabled";
const SUPPORT_IDENTIFIER_KEY: &str = "system/support_identifier";
const CHANNEL_KEY: &str = "system/channel";
const RELEASE_NUMBER_KEY: &str = "system/release_number";

impl Field {
    /// The store key backing this field
    pub fn key(self) -> &'static str {
        match self {
            Field::HardwareId => "ptw/hardware_id",
            Field::LicenseKey => "ptw/license",
            Field::NodeName => "ptw/node_name",
            Field::PrivateKey => "ptw/publish_to_web_key_private",
            Field::PublicKey => "ptw/publish_to_web_key_public",
            Field::Success => "ptw/success",
            Field::Error => "ptw/error",
            Field::SmtpHost => "smtp/host",
            Field::SmtpSender => "smtp/sender",
            Field::SmtpUser => "smtp/username",
            Field::SmtpPass => "smtp/password",
            Field::AccountLimit => "system/account_limit",
            Field::ActiveAccounts => "system/active_accounts",
        }
    }

    /// All fields, in declaration order
    pub fn all() -> impl Iterator<Item = Field> {
        ALL_FIELDS.into_iter()
    }
}

/// Typed view over a [`ConfigStore`]
///
/// Cheap to clone; every clone shares the same store.
#[derive(Clone)]
pub struct Config {
    store: Arc<dyn ConfigStore>,
}

impl Config {
    /// Wrap an existing store
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    /// Config backed by a fresh [`MemoryStore`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Read a field
    pub fn get(&self, field: Field) -> Result<Option<String>, StoreError> {
        self.store.get(field.key())
    }

    /// Write a field; `None` and the empty string delete it
    pub fn set(&self, field: Field, value: Option<&str>) -> Result<(), StoreError> {
        match value {
            Some(value) if !value.is_empty() => self.store.set(field.key(), value),
            _ => self.store.delete(field.key()),
        }
    }

    /// Delete a field
    pub fn delete(&self, field: Field) -> Result<(), StoreError> {
        self.store.delete(field.key())
    }

    /// Whether publishing has been switched on for this installation
    pub fn enabled(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(ENABLED_KEY)?.is_some())
    }

    /// Support identifier of this installation, if set and non-blank
    pub fn support_identifier(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(SUPPORT_IDENTIFIER_KEY)?
            .filter(|id| !id.trim().is_empty()))
    }

    /// `<channel>/<release number>`, or `"unknown"` if either part is missing
    pub fn system_version(&self) -> Result<String, StoreError> {
        let channel = self.store.get(CHANNEL_KEY)?;
        let release = self.store.get(RELEASE_NUMBER_KEY)?;

        match (channel, release) {
            (Some(channel), Some(release))
                if !channel.trim().is_empty() && !release.trim().is_empty() =>
            {
                Ok(format!("{}/{}", channel, release))
            }
            _ => Ok("unknown".to_string()),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_keys() {
        assert_eq!(Field::HardwareId.key(), "ptw/hardware_id");
        assert_eq!(Field::LicenseKey.key(), "ptw/license");
        assert_eq!(Field::PublicKey.key(), "ptw/publish_to_web_key_public");
        assert_eq!(Field::SmtpUser.key(), "smtp/username");
        assert_eq!(Field::AccountLimit.key(), "system/account_limit");
    }

    #[test]
    fn test_every_field_has_a_unique_key() {
        let keys: std::collections::HashSet<_> = Field::all().map(Field::key).collect();
        assert_eq!(keys.len(), ALL_FIELDS.len());
        assert!(keys.iter().all(|key| !key.is_empty()));
    }

    #[test]
    fn test_set_and_get() {
        let config = Config::in_memory();
        config.set(Field::NodeName, Some("alpha")).unwrap();

        assert_eq!(config.get(Field::NodeName).unwrap().as_deref(), Some("alpha"));
        assert_eq!(
            config.store().get("ptw/node_name").unwrap().as_deref(),
            Some("alpha")
        );
    }

    #[test]
    fn test_none_and_empty_delete() {
        let config = Config::in_memory();

        config.set(Field::SmtpHost, Some("mail")).unwrap();
        config.set(Field::SmtpHost, None).unwrap();
        assert!(config.get(Field::SmtpHost).unwrap().is_none());

        config.set(Field::SmtpHost, Some("mail")).unwrap();
        config.set(Field::SmtpHost, Some("")).unwrap();
        assert!(config.get(Field::SmtpHost).unwrap().is_none());
    }

    #[test]
    fn test_enabled() {
        let config = Config::in_memory();
        assert!(!config.enabled().unwrap());

        config.store().set("ptw/control/enabled", "true").unwrap();
        assert!(config.enabled().unwrap());
    }

    #[test]
    fn test_support_identifier_ignores_blank() {
        let config = Config::in_memory();
        assert_eq!(config.support_identifier().unwrap(), None);

        config.store().set("system/support_identifier", "  ").unwrap();
        assert_eq!(config.support_identifier().unwrap(), None);

        config.store().set("system/support_identifier", "ABC-123").unwrap();
        assert_eq!(config.support_identifier().unwrap().as_deref(), Some("ABC-123"));
    }

    #[test]
    fn test_system_version() {
        let config = Config::in_memory();
        assert_eq!(config.system_version().unwrap(), "unknown");

        config.store().set("system/channel", "stable").unwrap();
        assert_eq!(config.system_version().unwrap(), "unknown");

        config.store().set("system/release_number", "42").unwrap();
        assert_eq!(config.system_version().unwrap(), "stable/42");
    }
}
