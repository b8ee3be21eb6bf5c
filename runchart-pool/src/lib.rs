//! # runchart-pool
//!
//! Multiplexes a bounded set of runners over many persisted machines.
//!
//! This crate provides:
//! - Machine stores (in-memory and file-backed)
//! - The runner pool with LRU eviction and flush discipline
//! - Configuration (YAML file plus environment overrides)

pub mod config;
pub mod error;
pub mod pool;
pub mod store;

pub use config::{Config, ConfigError, PoolConfig, StorageBackend, StorageConfig};
pub use error::PoolError;
pub use pool::{MachineKey, PooledRunner, RunnerPool};
pub use store::{FileStore, MachineStore, MemoryStore};
