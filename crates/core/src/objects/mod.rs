//! Identity and object model: ids, content-addressed versions, component
//! indexes and lanes.

pub mod component;
pub mod id;
pub mod lane;
pub mod version;

pub use component::{ModelComponent, Tag};
pub use id::{has_wildcard, keep_latest_versions, uniq_ids, ComponentId};
pub use lane::{Lane, LaneComponent, LaneId, LaneLog};
pub use version::{is_safe_relative_path, BuildStatus, Ref, SourceFile, Version, VersionBuilder, VersionLog};
