//! Token metadata collaborator

use crate::error::MetadataError;
use caryatid_sdk::async_trait;
use dexwatch_common::AssetClass;
use serde::Deserialize;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Registry facts about a native asset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetInfo {
    pub ticker: Option<String>,
    pub display_name: Option<String>,
    pub decimals: u8,
    pub is_verified: bool,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, asset: &AssetClass) -> Result<AssetInfo, MetadataError>;
}

/// Lookups disabled
pub struct NoMetadata;

#[async_trait]
impl MetadataSource for NoMetadata {
    async fn fetch(&self, _asset: &AssetClass) -> Result<AssetInfo, MetadataError> {
        Err(MetadataError::Unavailable)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryProperty<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    name: Option<RegistryProperty<String>>,
    ticker: Option<RegistryProperty<String>>,
    decimals: Option<RegistryProperty<u8>>,
}

impl From<RegistryEntry> for AssetInfo {
    fn from(entry: RegistryEntry) -> Self {
        AssetInfo {
            ticker: entry.ticker.map(|p| p.value),
            display_name: entry.name.map(|p| p.value),
            decimals: entry.decimals.map(|p| p.value).unwrap_or_default(),
            is_verified: true,
        }
    }
}

/// Cardano token registry client; subjects are `policy ++ name` in hex
pub struct TokenRegistry {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl TokenRegistry {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn subject_url(&self, asset: &AssetClass) -> String {
        format!("{}/{}", self.url, asset.unit())
    }
}

#[async_trait]
impl MetadataSource for TokenRegistry {
    async fn fetch(&self, asset: &AssetClass) -> Result<AssetInfo, MetadataError> {
        let url = self.subject_url(asset);
        let response = timeout(self.timeout, self.client.get(&url).send())
            .await
            .map_err(|_| MetadataError::Timeout)??;

        // Unregistered tokens are simply unverified
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("No registry entry for {}", asset.unit());
            return Ok(AssetInfo::default());
        }

        let entry: RegistryEntry = timeout(self.timeout, response.error_for_status()?.json())
            .await
            .map_err(|_| MetadataError::Timeout)??;
        Ok(entry.into())
    }
}
