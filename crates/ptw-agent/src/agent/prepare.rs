//! Directory preparation
//!
//! Brings the directory in line with this installation before a tunnel is
//! opened: node name, software version, identity, and the per-license
//! settings the directory hands back (SMTP relay, account limits), plus the
//! usage report. The outcome is recorded in the agent status.

use serde_json::Value;

use ptw_core::status::{directory_failure, DIRECTORY_CONFIGURED};
use ptw_core::{Config, Field, StoreError};

use crate::directory::{DirectoryClient, DirectoryMap};
use crate::identity::IdentityManager;

use super::AgentError;

/// Directory SMTP keys and where they are stored locally
const SMTP_FIELDS: [(&str, Field); 4] = [
    ("host", Field::SmtpHost),
    ("sender", Field::SmtpSender),
    ("user", Field::SmtpUser),
    ("password", Field::SmtpPass),
];

/// Directory limit key for the account limit
const ACCOUNT_LIMIT: &str = "accounts";

/// How directory failures are surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMode {
    /// Record the failure in the status and carry on
    Graceful,
    /// Record the failure and return it
    Strict,
}

/// Run every preparation step and record the outcome
///
/// Failures that are not directory failures are recorded as
/// `directory_failure.unexpected` and always returned.
pub async fn prepare_directory(
    directory: &mut DirectoryClient,
    identity: &IdentityManager,
    config: &Config,
    service_domain: &str,
    mode: PrepareMode,
) -> Result<(), AgentError> {
    config.reset_status()?;

    match synchronize(directory, identity, config, service_domain).await {
        Ok(()) => {
            config.record_success(DIRECTORY_CONFIGURED)?;
            tracing::info!("Directory configured");
            Ok(())
        }
        Err(AgentError::Directory(err)) => {
            config.record_error(&directory_failure(err.status_label()))?;
            tracing::warn!("Directory preparation failed: {}", err);
            match mode {
                PrepareMode::Graceful => Ok(()),
                PrepareMode::Strict => Err(AgentError::Directory(err)),
            }
        }
        Err(err) => {
            config.record_error(&directory_failure("unexpected"))?;
            tracing::error!("Directory preparation failed unexpectedly: {}", err);
            Err(err)
        }
    }
}

async fn synchronize(
    directory: &mut DirectoryClient,
    identity: &IdentityManager,
    config: &Config,
    service_domain: &str,
) -> Result<(), AgentError> {
    reconcile_node_name(directory, config, service_domain).await?;

    let version = config.system_version()?;
    let support_identifier = config.support_identifier()?;
    directory
        .set_version(&version, support_identifier.as_deref())
        .await?;

    identity.ensure_valid_identity(directory).await?;

    let smtp = directory.smtp_config().await?;
    for (key, field) in SMTP_FIELDS {
        store_value(config, field, &smtp, key)?;
    }

    let limits = directory.limits().await?;
    store_value(config, Field::AccountLimit, &limits, ACCOUNT_LIMIT)?;

    let active_accounts = config.get(Field::ActiveAccounts)?;
    directory.report_usage(active_accounts.as_deref()).await?;

    Ok(())
}

/// Push the locally configured node name when the directory has another one
async fn reconcile_node_name(
    directory: &mut DirectoryClient,
    config: &Config,
    service_domain: &str,
) -> Result<(), AgentError> {
    let Some(desired) = config.get(Field::NodeName)? else {
        return Ok(());
    };

    let info = directory.connection_info(false).await?;
    let current = info
        .node_name
        .as_deref()
        .map(|name| short_name(name, service_domain));

    if current == Some(short_name(&desired, service_domain)) {
        tracing::debug!("Node name '{}' already set", desired);
        return Ok(());
    }

    tracing::info!("Changing node name from {:?} to '{}'", info.node_name, desired);
    directory.set_node_name(&desired).await?;
    Ok(())
}

/// `foo.<domain>` → `foo`; anything else unchanged
fn short_name<'a>(name: &'a str, domain: &str) -> &'a str {
    name.strip_suffix(domain)
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(name)
}

/// Store `map[key]` in `field`; missing or null deletes
fn store_value(config: &Config, field: Field, map: &DirectoryMap, key: &str) -> Result<(), StoreError> {
    let value = match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
    };
    config.set(field, value.as_deref())
}
