//! The external distributed store, seen through a narrow trait.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

pub mod local;

pub use local::LocalStore;

use crate::error::StoreError;

/// Snapshot of one store entry. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub is_dir: bool,
    pub path: String,
    pub owner: String,
    pub group: String,
    pub permission: String,
    pub replication: u16,
    /// Milliseconds since the Unix epoch.
    pub modification_time: i64,
    pub block_size: u64,
    pub length: u64,
}

/// Storage engine behind the file RPCs.
///
/// Every path argument is a store path: absolute (`/genomes/hg19`) or relative to the caller's
/// home directory. `owner` is the authenticated username used for that resolution.
pub trait ExternalStore: Send + Sync {
    /// Opens `path` for writing, truncating it and creating missing parents.
    fn create(&self, path: &str, owner: &str) -> Result<Box<dyn Write + Send>, StoreError>;

    fn open(&self, path: &str, owner: &str) -> Result<Box<dyn Read + Send>, StoreError>;

    /// Status of a file, or of every child of a directory sorted by name.
    fn list_status(&self, path: &str, owner: &str) -> Result<Vec<FileStatus>, StoreError>;

    /// Returns `false` when `path` did not exist.
    fn delete(&self, path: &str, recursive: bool, owner: &str) -> Result<bool, StoreError>;

    fn mkdirs(&self, path: &str, owner: &str) -> Result<bool, StoreError>;

    /// Returns `false` when the source is missing or the destination is taken.
    fn rename(&self, src: &str, dst: &str, owner: &str) -> Result<bool, StoreError>;

    fn exists(&self, path: &str, owner: &str) -> Result<bool, StoreError>;

    /// Fully qualified store path for `path` as seen by `owner`.
    fn qualify(&self, path: &str, owner: &str) -> Result<String, StoreError>;
}
