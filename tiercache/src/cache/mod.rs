//! Cache tiers
//!
//! - ARC memory tier: adaptive recency/frequency eviction
//! - Tiered controller: routes between memory and the partition store
//! - Write-behind: bounded queue drained by a background flusher

pub mod arc;
pub mod tiered;
pub(crate) mod writer;

pub use arc::{ArcTier, Demoted};
pub use tiered::TieredCache;
