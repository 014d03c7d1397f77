//! Paged metadata engine.
//!
//! Operates on the chunk-granularity bitmap region through the metadata
//! service's locked update primitive. Set/clear updates take the read-only
//! fast path when every entry in range already satisfies the mask — callers
//! depend on that distinction to tell read failures from write failures.

pub mod engine;

pub use engine::PagedEngine;
