//! Shared domain value types for the purge pipeline.

mod entity;
mod target;

pub use entity::{ArchiveFilter, DatePeriod, EntityId, EntityKind, PostInfo, TaxonomyInfo, TermInfo};
pub use target::{PurgeTarget, TargetKind, TargetSet};
