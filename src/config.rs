//! Store configuration and memory profiles
//!
//! Tunables are grouped the way `motedb`'s `DBConfig`/`WALConfig` are: a
//! plain data struct with a `Default` impl plus named presets for the
//! common deployment shapes.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Memory/durability profile applied to the KV engine on open.
///
/// - `IngestHeavy`: large memtables, deferred sync, favors write throughput
///   during bulk ingestion.
/// - `SafeServing`: balanced caches, sync on every commit, for long-running
///   query servers.
/// - `CloudRunLowMem`: small caches and memtables for memory-constrained
///   serverless environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    IngestHeavy,
    SafeServing,
    CloudRunLowMem,
}

impl Default for Profile {
    fn default() -> Self {
        Profile::SafeServing
    }
}

/// Top-level store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for the KV engine's WAL and SSTables. Required unless
    /// `in_memory` is set.
    pub data_dir: Option<PathBuf>,

    /// Directory for dictionary chunk snapshots. Defaults to
    /// `data_dir/dict` when unset and `data_dir` is present.
    pub dict_dir: Option<PathBuf>,

    /// Skip the WAL/SSTable layers entirely; everything lives in the active
    /// memtable. Intended for tests and ephemeral stores.
    pub in_memory: bool,

    /// Block cache size in bytes (decompressed SSTable data blocks).
    pub block_cache_size: usize,

    /// Index cache size in bytes (SSTable block indexes).
    pub index_cache_size: usize,

    /// Number of entries kept in each dictionary LRU (forward and reverse).
    pub lru_cache_size: usize,

    /// Whether SSTable data blocks are Snappy-compressed.
    pub compression: bool,

    /// fsync on every write batch commit (`Synchronous`-style durability)
    /// versus only on flush/close.
    pub sync_writes: bool,

    /// Number of dictionary shards. Zero disables sharding (a single
    /// dictionary instance); otherwise must be a power of two.
    pub num_dict_shards: usize,

    /// Memtable size threshold in bytes before it's queued for flush.
    pub memtable_size: usize,

    /// Maximum number of immutable memtables buffered ahead of flush.
    pub num_memtables: usize,

    /// Memory/durability profile preset this config was derived from.
    pub profile: Profile,

    /// Open the store read-only; writes are rejected.
    pub read_only: bool,

    /// Skip the advisory file lock normally taken on `data_dir`. Only for
    /// tests that open the same directory from multiple handles in one
    /// process.
    pub bypass_lock_guard: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            dict_dir: None,
            in_memory: true,
            block_cache_size: 16 * 1024 * 1024,
            index_cache_size: 4 * 1024 * 1024,
            lru_cache_size: 100_000,
            compression: true,
            sync_writes: false,
            num_dict_shards: 0,
            memtable_size: 4 * 1024 * 1024,
            num_memtables: 4,
            profile: Profile::default(),
            read_only: false,
            bypass_lock_guard: false,
        }
    }
}

impl StoreConfig {
    /// Validate the tunables, matching the rules enumerated in the
    /// configuration section of the design: `data_dir` required unless
    /// in-memory, cache sizes positive, `num_dict_shards` zero or a power
    /// of two.
    pub fn validate(&self) -> Result<()> {
        if !self.in_memory && self.data_dir.is_none() {
            return Err(StoreError::InvalidArgument(
                "data_dir is required unless in_memory is set".into(),
            ));
        }
        if self.block_cache_size == 0 {
            return Err(StoreError::InvalidArgument(
                "block_cache_size must be positive".into(),
            ));
        }
        if self.index_cache_size == 0 {
            return Err(StoreError::InvalidArgument(
                "index_cache_size must be positive".into(),
            ));
        }
        if self.lru_cache_size == 0 {
            return Err(StoreError::InvalidArgument(
                "lru_cache_size must be positive".into(),
            ));
        }
        if self.memtable_size == 0 {
            return Err(StoreError::InvalidArgument(
                "memtable_size must be positive".into(),
            ));
        }
        if self.num_dict_shards != 0 && !self.num_dict_shards.is_power_of_two() {
            return Err(StoreError::InvalidArgument(
                "num_dict_shards must be zero or a power of two".into(),
            ));
        }
        Ok(())
    }

    /// Resolved dictionary directory: explicit `dict_dir`, else
    /// `data_dir/dict`, else `None` for in-memory stores.
    pub fn resolved_dict_dir(&self) -> Option<PathBuf> {
        self.dict_dir
            .clone()
            .or_else(|| self.data_dir.as_ref().map(|d| d.join("dict")))
    }

    /// Ingest-heavy preset: large memtables, deferred sync, favors bulk
    /// write throughput over query latency.
    pub fn ingest_heavy(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            in_memory: false,
            block_cache_size: 8 * 1024 * 1024,
            index_cache_size: 2 * 1024 * 1024,
            lru_cache_size: 500_000,
            sync_writes: false,
            memtable_size: 32 * 1024 * 1024,
            num_memtables: 4,
            profile: Profile::IngestHeavy,
            ..Default::default()
        }
    }

    /// Safe-serving preset: balanced caches, sync on commit, for
    /// long-running query servers.
    pub fn safe_serving(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            in_memory: false,
            block_cache_size: 32 * 1024 * 1024,
            index_cache_size: 8 * 1024 * 1024,
            lru_cache_size: 200_000,
            sync_writes: true,
            memtable_size: 8 * 1024 * 1024,
            num_memtables: 2,
            profile: Profile::SafeServing,
            ..Default::default()
        }
    }

    /// Cloud-Run-low-mem preset: small caches and memtables for
    /// memory-constrained serverless environments.
    pub fn cloud_run_low_mem(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            in_memory: false,
            block_cache_size: 1024 * 1024,
            index_cache_size: 256 * 1024,
            lru_cache_size: 10_000,
            sync_writes: true,
            memtable_size: 1024 * 1024,
            num_memtables: 1,
            profile: Profile::CloudRunLowMem,
            ..Default::default()
        }
    }
}
