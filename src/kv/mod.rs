//! KV engine adapter: a thin, ordered byte-key store over a log-structured
//! memtable + WAL + SSTable layout, scoped down to what the rest of the
//! crate needs (ordered prefix scans, atomic batches, a block cache, an
//! optional sync-on-commit mode) rather than a general-purpose database.
//! Grounded in the teacher's `storage::lsm` module, restructured into
//! smaller single-purpose files (`memtable`, `wal`, `sstable`, `bloom`,
//! `cache`, `engine`) instead of one combined `engine.rs`.

pub mod bloom;
pub mod cache;
pub mod engine;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use engine::{KvEngine, PrefixScan, WriteOp};
