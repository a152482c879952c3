//! License-scoped directory client

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ptw_core::{Config, Field};

use super::transport::{DirectoryTransport, HttpResponse};
use super::{DirectoryError, DirectoryErrorKind};

/// Prefix of generated hardware ids
pub const HARDWARE_ID_PREFIX: &str = "aal";

/// JSON object returned by the settings endpoints
pub type DirectoryMap = serde_json::Map<String, serde_json::Value>;

/// Tunnel coordinates the directory assigns to this license
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Port on the proxy reserved for our reverse forward
    #[serde(rename = "port")]
    pub remote_port: u16,
    /// SHA-1 of the public key the directory has on record
    #[serde(default)]
    pub pubkey_sha1: Option<String>,
    /// Canonical node name, usually `<name>.<service domain>`
    #[serde(default)]
    pub node_name: Option<String>,
}

#[derive(Deserialize)]
struct IssuedLicense {
    license_key: String,
}

/// Client for the directory HTTP API
///
/// Holds the connection info cache. Every write made through the client
/// drops the cache, so the next read goes to the directory.
pub struct DirectoryClient {
    transport: Arc<dyn DirectoryTransport>,
    config: Config,
    hardware_id: Option<String>,
    info: Option<ConnectionInfo>,
}

impl DirectoryClient {
    /// Create a client that persists issued identifiers in `config`
    pub fn new(transport: Arc<dyn DirectoryTransport>, config: Config) -> Self {
        Self {
            transport,
            config,
            hardware_id: None,
            info: None,
        }
    }

    /// Hardware id of this installation, generated and persisted on first use
    pub fn hardware_id(&mut self) -> Result<String, DirectoryError> {
        if let Some(id) = &self.hardware_id {
            return Ok(id.clone());
        }

        let id = match self.config.get(Field::HardwareId)? {
            Some(id) => id,
            None => {
                let id = format!("{}-{}", HARDWARE_ID_PREFIX, uuid::Uuid::new_v4());
                tracing::info!("Generated new hardware id {}", id);
                self.config.set(Field::HardwareId, Some(&id))?;
                id
            }
        };

        self.hardware_id = Some(id.clone());
        Ok(id)
    }

    /// License key, requested from the directory and persisted if missing
    pub async fn license_key(&mut self) -> Result<String, DirectoryError> {
        if let Some(key) = self.config.get(Field::LicenseKey)? {
            return Ok(key);
        }

        let hardware_id = self.hardware_id()?;
        tracing::info!("Requesting license for hardware id {}", hardware_id);

        let kind = DirectoryErrorKind::CreateLicenseFailed;
        let response = self
            .get(kind, "/create_license", &[("hardware_id", hardware_id)])
            .await?;
        expect_success(kind, &response)?;
        let issued: IssuedLicense = parse(kind, &response)?;

        self.config.set(Field::LicenseKey, Some(&issued.license_key))?;
        tracing::info!("License issued by directory");
        Ok(issued.license_key)
    }

    /// Connection info, served from cache unless `refresh` is set
    pub async fn connection_info(&mut self, refresh: bool) -> Result<ConnectionInfo, DirectoryError> {
        if !refresh {
            if let Some(info) = &self.info {
                return Ok(info.clone());
            }
        }

        tracing::info!("Retrieving connection info from directory");
        let kind = DirectoryErrorKind::FetchInfoFailed;
        let license_key = self.license_key().await?;
        let response = self
            .get(kind, "/info", &[("license_key", license_key)])
            .await?;

        if response.status != 200 {
            return Err(DirectoryError::Status {
                kind,
                status: response.status,
            });
        }

        let info: ConnectionInfo = parse(kind, &response)?;
        self.info = Some(info.clone());
        Ok(info)
    }

    /// Drop cached connection info so the next read refetches
    pub fn invalidate(&mut self) {
        self.info = None;
    }

    /// Rename this node in the directory
    pub async fn set_node_name(&mut self, name: &str) -> Result<(), DirectoryError> {
        tracing::info!("Setting node name to {}", name);
        let kind = DirectoryErrorKind::SetNodeNameFailed;
        let license_key = self.license_key().await?;
        let response = self
            .post(
                kind,
                "/set_node_name",
                &[("license_key", license_key), ("node_name", name.to_string())],
            )
            .await?;
        expect_success(kind, &response)?;

        self.invalidate();
        Ok(())
    }

    /// Report the installed software version
    pub async fn set_version(
        &mut self,
        version: &str,
        support_identifier: Option<&str>,
    ) -> Result<(), DirectoryError> {
        tracing::debug!("Reporting version {}", version);
        let kind = DirectoryErrorKind::SetVersionFailed;
        let license_key = self.license_key().await?;

        let mut form = vec![("license_key", license_key), ("version", version.to_string())];
        if let Some(identifier) = support_identifier {
            form.push(("support_identifier", identifier.to_string()));
        }

        let response = self.post(kind, "/set_version", &form).await?;
        expect_success(kind, &response)
    }

    /// Report the number of active accounts; nothing is sent when unknown
    pub async fn report_usage(&mut self, active_accounts: Option<&str>) -> Result<(), DirectoryError> {
        let Some(active_accounts) = active_accounts else {
            tracing::debug!("No usage to report");
            return Ok(());
        };

        let kind = DirectoryErrorKind::UsageReportFailed;
        let license_key = self.license_key().await?;
        let response = self
            .post(
                kind,
                "/usage",
                &[
                    ("license_key", license_key),
                    ("active_accounts", active_accounts.to_string()),
                ],
            )
            .await?;
        expect_success(kind, &response)
    }

    /// SMTP relay settings for this license
    pub async fn smtp_config(&mut self) -> Result<DirectoryMap, DirectoryError> {
        self.fetch_map(DirectoryErrorKind::SmtpConfigFailed, "/smtp_config")
            .await
    }

    /// Account limits for this license
    pub async fn limits(&mut self) -> Result<DirectoryMap, DirectoryError> {
        self.fetch_map(DirectoryErrorKind::LimitsFailed, "/limits").await
    }

    /// Register a new public key for this license
    pub async fn register_public_key(&mut self, public_key: &str) -> Result<(), DirectoryError> {
        tracing::info!("Registering new identity with directory");
        let kind = DirectoryErrorKind::RegisterIdentityFailed;
        let license_key = self.license_key().await?;
        let response = self
            .post(
                kind,
                "/set_public_key",
                &[
                    ("license_key", license_key),
                    ("public_key", public_key.to_string()),
                ],
            )
            .await?;
        expect_success(kind, &response)?;

        self.invalidate();
        Ok(())
    }

    async fn fetch_map(
        &mut self,
        kind: DirectoryErrorKind,
        path: &str,
    ) -> Result<DirectoryMap, DirectoryError> {
        let license_key = self.license_key().await?;
        let response = self.get(kind, path, &[("license_key", license_key)]).await?;

        if response.status != 200 {
            return Err(DirectoryError::Status {
                kind,
                status: response.status,
            });
        }

        parse(kind, &response)
    }

    async fn get(
        &self,
        kind: DirectoryErrorKind,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<HttpResponse, DirectoryError> {
        self.transport
            .get(path, query)
            .await
            .map_err(|source| DirectoryError::Unreachable { kind, source })
    }

    async fn post(
        &self,
        kind: DirectoryErrorKind,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<HttpResponse, DirectoryError> {
        self.transport
            .post_form(path, form)
            .await
            .map_err(|source| DirectoryError::Unreachable { kind, source })
    }
}

fn expect_success(kind: DirectoryErrorKind, response: &HttpResponse) -> Result<(), DirectoryError> {
    if response.is_success() {
        Ok(())
    } else {
        Err(DirectoryError::Status {
            kind,
            status: response.status,
        })
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    kind: DirectoryErrorKind,
    response: &HttpResponse,
) -> Result<T, DirectoryError> {
    serde_json::from_str(&response.body).map_err(|e| DirectoryError::InvalidResponse {
        kind,
        message: e.to_string(),
    })
}
