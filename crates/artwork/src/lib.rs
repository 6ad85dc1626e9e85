//! Artwork resolution and caching.
//!
//! Turns arbitrary image references into remote-displayable asset ids,
//! with a TTL + size-bounded cache persisted to a JSON index so warm
//! restarts avoid redundant registrations.

pub mod cache;
pub mod resolver;

pub use cache::{ArtworkCache, CacheError, ResolvedAsset};
pub use resolver::{AssetResolver, ResolveError};
