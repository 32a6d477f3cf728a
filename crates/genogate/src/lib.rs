//! Genomics gateway: authenticated file sessions over a shared store and alignment pipelines
//! run through an external scheduler.
//!
//! [`Gateway`] is the whole RPC surface as a library API. Each public method is one remote
//! procedure taking the caller's [`Credential`] and returning an [`RpcResult`]; a wire transport
//! binds these methods to requests. `genogate-server` hosts a gateway with its background
//! workers and ships no transport of its own.

pub mod auth;
pub mod background;
pub mod catalog;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod handles;
pub mod jobs;
pub mod service;
pub mod store;

pub use auth::{Authenticator, Credential, IdentityProvider, Principal};
pub use catalog::{GenomeCatalog, GenomeEntry};
pub use config::{load_config, Config};
pub use error::{ConfigError, ErrorKind, GatewayError, Result, StartupError};
pub use handles::{FileHandle, HandleTable};
pub use jobs::{JobEvent, JobId, JobState, JobStatus, PipelineRequest};
pub use service::{Gateway, GatewayParts, RpcFault, RpcResult};
pub use store::{ExternalStore, FileStatus, LocalStore};
