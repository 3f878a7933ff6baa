//! Memory core configuration
//!
//! Sizing policy for the pools and containers. A process-wide copy is
//! installed once at startup and read by pools when they are created.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Memory configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Growth cap (bytes) for each block of an exact-size pool.
    #[serde(default = "default_exact_pool_block_bytes")]
    pub exact_pool_block_bytes: usize,

    /// Objects at or above this size grow two at a time.
    #[serde(default = "default_exact_pool_large_object_bytes")]
    pub exact_pool_large_object_bytes: usize,

    /// Target buffer size for relocatable pools.
    #[serde(default = "default_relocatable_buffer_bytes")]
    pub relocatable_buffer_bytes: usize,

    /// Track every exact-sized allocation per memory context.
    #[serde(default = "default_track_allocations")]
    pub track_allocations: bool,

    /// Drained undo data pools kept around for reuse.
    #[serde(default = "default_undo_pool_cache_limit")]
    pub undo_pool_cache_limit: usize,

    /// Nodes per buffer for CompactingMap.
    #[serde(default = "default_map_nodes_per_buffer")]
    pub map_nodes_per_buffer: usize,

    /// Nodes per buffer for CompactingHashTable.
    #[serde(default = "default_hash_nodes_per_buffer")]
    pub hash_nodes_per_buffer: usize,

    /// Minimum bucket count for CompactingHashTable.
    #[serde(default = "default_hash_initial_buckets")]
    pub hash_initial_buckets: usize,
}

fn default_exact_pool_block_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_exact_pool_large_object_bytes() -> usize {
    256 * 1024
}

fn default_relocatable_buffer_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_track_allocations() -> bool {
    cfg!(debug_assertions)
}

fn default_undo_pool_cache_limit() -> usize {
    192
}

fn default_map_nodes_per_buffer() -> usize {
    10000
}

fn default_hash_nodes_per_buffer() -> usize {
    20000
}

fn default_hash_initial_buckets() -> usize {
    64 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            exact_pool_block_bytes: default_exact_pool_block_bytes(),
            exact_pool_large_object_bytes: default_exact_pool_large_object_bytes(),
            relocatable_buffer_bytes: default_relocatable_buffer_bytes(),
            track_allocations: default_track_allocations(),
            undo_pool_cache_limit: default_undo_pool_cache_limit(),
            map_nodes_per_buffer: default_map_nodes_per_buffer(),
            hash_nodes_per_buffer: default_hash_nodes_per_buffer(),
            hash_initial_buckets: default_hash_initial_buckets(),
        }
    }
}

lazy_static! {
    static ref INSTALLED: RwLock<MemoryConfig> = RwLock::new(MemoryConfig::default());
}

impl MemoryConfig {
    /// Parses a TOML document; missing fields take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse memory config")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads an optional TOML file, overridden by `PHOTONDB_MEMORY__*`
    /// environment variables.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path.as_ref()).required(false));
        }
        let config: Self = builder
            .add_source(::config::Environment::with_prefix("PHOTONDB_MEMORY").separator("__"))
            .build()
            .context("failed to assemble memory config")?
            .try_deserialize()
            .context("failed to deserialize memory config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.exact_pool_block_bytes > 0, "exact_pool_block_bytes must be positive");
        anyhow::ensure!(self.relocatable_buffer_bytes > 0, "relocatable_buffer_bytes must be positive");
        anyhow::ensure!(self.map_nodes_per_buffer > 0, "map_nodes_per_buffer must be positive");
        anyhow::ensure!(self.hash_nodes_per_buffer > 0, "hash_nodes_per_buffer must be positive");
        anyhow::ensure!(self.hash_initial_buckets > 0, "hash_initial_buckets must be positive");
        Ok(())
    }

    /// Publishes this configuration process-wide.
    pub fn install(self) {
        tracing::info!(config = ?self, "Installing memory configuration");
        *INSTALLED.write() = self;
    }

    /// The currently installed configuration.
    pub fn current() -> MemoryConfig {
        INSTALLED.read().clone()
    }
}
