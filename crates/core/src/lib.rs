//! compsync core library.
//!
//! This crate imports versioned components from remote scopes into a local
//! object store and a workspace: target resolution, history fetching,
//! divergence detection, lane reconciliation, three-way merging of local
//! changes and writing components to disk.

pub mod config;
pub mod db;
pub mod divergence;
pub mod errors;
pub mod fetch;
pub mod graph;
pub mod import;
pub mod lanes;
pub mod merge;
pub mod models;
pub mod objects;
pub mod options;
pub mod pool;
pub mod remote;
pub mod scope;
pub mod workspace;

// Re-exports for convenience.
pub use config::EngineConfig;
pub use errors::ImportError;
pub use import::{ImportSession, SessionContext};
pub use models::{ImportDetails, ImportResult, ImportStatus};
pub use objects::{ComponentId, Lane, LaneId, Ref, Version};
pub use options::{ImportOptions, MergeStrategy};
pub use scope::LocalScope;
