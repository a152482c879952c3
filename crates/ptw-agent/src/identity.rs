//! SSH identity lifecycle
//!
//! The agent's RSA keypair authenticates it to the proxy and proves its
//! origin to the directory. The directory reports the SHA-1 of the public key
//! it has on record; whenever the stored pair is missing, inconsistent, or
//! differs from that record, a new pair is generated and registered.

use std::fmt;

use russh_keys::key::{KeyPair, SignatureHash};
use russh_keys::PublicKeyBase64;
use sha1::{Digest, Sha1};
use thiserror::Error;

use ptw_core::{Config, Field, StoreError};

use crate::directory::{DirectoryClient, DirectoryError};

/// Key type prefix of the OpenSSH public key line
const PUBLIC_KEY_TYPE: &str = "ssh-rsa";

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Key generation produced nothing
    #[error("Failed to generate a {0} bit RSA key")]
    Generation(usize),

    /// A key could not be encoded or decoded
    #[error("Key error: {0}")]
    Key(#[from] russh_keys::Error),

    /// Key generation task panicked or was cancelled
    #[error("Key generation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// SHA-1 hex digest of an OpenSSH public key line, as the directory computes it
pub fn fingerprint(public_key: &str) -> String {
    hex::encode(Sha1::digest(public_key.as_bytes()))
}

/// An RSA keypair in its stored form
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    /// `ssh-rsa <base64>`
    pub public_key: String,
    /// PKCS#8 PEM
    pub private_key: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl Identity {
    /// Generate a fresh keypair. CPU heavy; run off the async executor.
    pub fn generate(bits: usize) -> Result<Self, IdentityError> {
        let key = KeyPair::generate_rsa(bits, SignatureHash::SHA2_256)
            .ok_or(IdentityError::Generation(bits))?;

        let mut pem = Vec::new();
        russh_keys::encode_pkcs8_pem(&key, &mut pem)?;
        let private_key = String::from_utf8_lossy(&pem).trim().to_string();

        let public = key.clone_public_key()?;
        let public_key = format!("{} {}", PUBLIC_KEY_TYPE, public.public_key_base64());

        Ok(Self {
            public_key,
            private_key,
        })
    }

    /// SHA-1 of the public key line
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }

    /// Decode the private key for SSH authentication
    pub fn key_pair(&self) -> Result<KeyPair, russh_keys::Error> {
        russh_keys::decode_secret_key(&self.private_key, None)
    }

    /// Whether the public key is the one derived from the private key
    pub fn is_consistent(&self) -> bool {
        let Ok(key) = self.key_pair() else {
            return false;
        };
        let Ok(public) = key.clone_public_key() else {
            return false;
        };

        let derived = public.public_key_base64();
        self.public_key.split_whitespace().nth(1) == Some(derived.as_str())
    }
}

/// Keeps the stored identity in line with the directory
#[derive(Debug, Clone)]
pub struct IdentityManager {
    config: Config,
    key_bits: usize,
}

impl IdentityManager {
    pub fn new(config: Config, key_bits: usize) -> Self {
        Self { config, key_bits }
    }

    /// The stored keypair, if both halves are present
    pub fn stored(&self) -> Result<Option<Identity>, StoreError> {
        let public_key = self.config.get(Field::PublicKey)?;
        let private_key = self.config.get(Field::PrivateKey)?;

        Ok(match (public_key, private_key) {
            (Some(public_key), Some(private_key)) => Some(Identity {
                public_key,
                private_key,
            }),
            _ => None,
        })
    }

    /// Return an identity the directory knows about, rotating if needed
    ///
    /// A valid stored pair is returned without writes; the only directory
    /// read is the (cached) connection info.
    pub async fn ensure_valid_identity(
        &self,
        directory: &mut DirectoryClient,
    ) -> Result<Identity, IdentityError> {
        match self.stored()? {
            None => tracing::info!("No identity stored, issuing a new one"),
            Some(identity) if !identity.is_consistent() => {
                tracing::warn!("Stored public key does not match private key, re-keying")
            }
            Some(identity) => {
                let info = directory.connection_info(false).await?;
                let local = identity.fingerprint();

                if info.pubkey_sha1.as_deref() == Some(local.as_str()) {
                    tracing::debug!("Identity {} matches directory", local);
                    return Ok(identity);
                }

                tracing::warn!(
                    "Identity {} differs from directory record {:?}, re-keying",
                    local,
                    info.pubkey_sha1
                );
            }
        }

        self.rotate(directory).await
    }

    /// Generate, register, then persist a new keypair
    ///
    /// Nothing is written when registration fails.
    async fn rotate(&self, directory: &mut DirectoryClient) -> Result<Identity, IdentityError> {
        let bits = self.key_bits;
        let identity = tokio::task::spawn_blocking(move || Identity::generate(bits)).await??;
        tracing::info!("Generated {} bit identity {}", bits, identity.fingerprint());

        directory.register_public_key(&identity.public_key).await?;

        self.config.set(Field::PrivateKey, Some(&identity.private_key))?;
        self.config.set(Field::PublicKey, Some(&identity.public_key))?;

        Ok(identity)
    }
}
