//! Target resolution and object retrieval.

pub mod fetcher;
pub mod targets;

pub use fetcher::{ComponentFetcher, FetchFailure, FetchOutcome, FetchSettings};
pub use targets::{flattened_dependencies, TargetResolver};
