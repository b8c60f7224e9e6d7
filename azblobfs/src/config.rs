//! Resolved storage account settings.

use std::time::Duration;

use thiserror::Error;

use crate::cadapter::azure::{AzureBlobBackend, Endpoint};
use crate::cadapter::client::ContainerAccess;
use crate::cadapter::signer::{Credential, CredentialError, Signer};
use crate::vfs::config::FsConfig;

pub const DEFAULT_HOST: &str = "blob.core.windows.net";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEV_ACCOUNT: &str = "devstoreaccount1";
pub const DEV_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
pub const DEV_HOST: &str = "127.0.0.1:10000";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("cannot build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub account: String,
    pub key: String,
    pub host: String,
    pub https: bool,
    pub path_style: bool,
    pub timeout: Duration,
    pub container_access: ContainerAccess,
}

impl StorageConfig {
    pub fn new(account: impl Into<String>, key: impl Into<String>, host: Option<String>) -> Self {
        Self {
            account: account.into(),
            key: key.into(),
            host: host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            https: false,
            path_style: false,
            timeout: DEFAULT_TIMEOUT,
            container_access: ContainerAccess::Private,
        }
    }

    /// The local storage emulator with its well-known account.
    pub fn dev_storage() -> Self {
        Self::new(DEV_ACCOUNT, DEV_KEY, Some(DEV_HOST.to_string()))
    }

    pub fn credential(&self) -> Result<Credential, ConfigError> {
        if self.key.trim().is_empty() {
            return Err(ConfigError::Missing("account key"));
        }
        Ok(Credential::new(self.account.clone(), &self.key)?)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.https, self.path_style)
    }

    pub fn fs_config(&self) -> FsConfig {
        FsConfig {
            container_access: self.container_access,
            ..FsConfig::default()
        }
    }

    pub fn connect(&self) -> Result<AzureBlobBackend, ConfigError> {
        let signer = Signer::new(self.credential()?);
        Ok(AzureBlobBackend::new(signer, &self.endpoint(), self.timeout)?)
    }
}
