//! Pre-built image cache
//!
//! Images are keyed by (region, fingerprint hash). The local index is a
//! single JSON document; the provider's image tags are the source of truth
//! shared across independent processes.
//!
//! # Lookup
//!
//! | Local index | Upstream image | Result |
//! |-------------|----------------|--------|
//! | hit | exists | hit (last-used updated) |
//! | hit | gone | miss, entry evicted |
//! | miss | tagged image found | hit, entry recorded |
//! | miss | none | miss |

mod entry;
mod image_cache;

pub use entry::{CacheIndex, ImageCacheEntry, INDEX_VERSION};
pub use image_cache::{CacheHit, HitSource, ImageCache};
