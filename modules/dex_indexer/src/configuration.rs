use anyhow::{anyhow, Result};
use config::Config;
use dexwatch_common::{BlockHash, Dex, Point, Slot, SlotConfig};
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    Memory,
    Fjall,
}

/// Per-protocol analyzer switch
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DexConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub start_slot: Slot,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DexIndexerConfig {
    pub txs_subscribe_topic: String,
    pub sync_command_publisher_topic: String,
    pub events_publish_topic: String,

    pub store: StoreKind,
    pub database_path: PathBuf,
    pub clear_on_start: bool,

    pub max_resolve_attempts: u32,
    pub resolve_backoff_ms: u64,
    pub job_concurrency: usize,
    pub job_attempts: u32,

    pub metadata_url: String,
    pub metadata_timeout_secs: u64,

    pub start_slot: Slot,
    pub start_hash: String,
    pub shelley_start_slot: Slot,
    pub shelley_start_time: u64,

    #[serde(default)]
    pub dexes: HashMap<String, DexConfig>,
    #[serde(default)]
    pub backup_dexes: HashMap<String, String>,
}

impl DexIndexerConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    /// Resume point used when no cursor has been saved yet
    pub fn default_start(&self) -> Result<Point> {
        if self.start_hash.is_empty() {
            return Ok(Point::Origin);
        }
        let hash: BlockHash = self
            .start_hash
            .parse()
            .map_err(|e| anyhow!("Invalid start-hash '{}': {e}", self.start_hash))?;
        Ok(Point::Specific {
            slot: self.start_slot,
            hash,
        })
    }

    pub fn slot_config(&self) -> SlotConfig {
        SlotConfig {
            shelley_start_slot: self.shelley_start_slot,
            shelley_start_time: self.shelley_start_time,
        }
    }

    pub fn resolve_backoff(&self) -> Duration {
        Duration::from_millis(self.resolve_backoff_ms)
    }

    /// Enabled protocols with their start slots
    pub fn enabled_dexes(&self) -> Result<Vec<(Dex, Slot)>> {
        let mut enabled = Vec::new();
        for (name, dex_config) in &self.dexes {
            let dex: Dex = name.parse()?;
            if dex_config.enabled {
                enabled.push((dex, dex_config.start_slot));
            }
        }
        enabled.sort();
        Ok(enabled)
    }

    pub fn backup_dex_map(&self) -> Result<HashMap<Dex, Dex>> {
        self.backup_dexes
            .iter()
            .map(|(dex, alias)| Ok((dex.parse()?, alias.parse()?)))
            .collect()
    }
}

mod defaults {
    pub fn enabled() -> bool {
        true
    }
}
