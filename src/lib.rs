//! chainfix - chained-fixup and slide-info application for Mach-O images.
//!
//! This library implements the relocation machinery a loader runs between
//! mapping an image and calling its initializers: decoding chained-fixup
//! metadata, walking the per-page pointer chains, rebasing and binding every
//! slot in place, and sliding shared-cache data mappings through their
//! slide-info blobs (v1 through v5).
//!
//! # Features
//!
//! - All thirteen chained pointer formats, including arm64e authenticated
//!   pointers and 32-bit non-pointer escapes
//! - Exactly-once application enforced by a per-image load-state machine
//! - Weak-import misses bound to zero and re-patchable later
//! - Slide-info application for all five generations
//! - Symbol lookup and pointer signing injected as traits
//!
//! # Example
//!
//! ```no_run
//! use chainfix::{apply_image_fixups, LoadedImage, NullSigner, TableResolver};
//!
//! fn main() -> chainfix::Result<()> {
//!     let data = std::fs::read("/path/to/image.dylib").unwrap();
//!     let mut loaded = LoadedImage::map(&data)?;
//!
//!     let mut resolver = TableResolver::new();
//!     resolver.define("_malloc", 0x1_8000_1000);
//!
//!     let counts = apply_image_fixups(&mut loaded, 0x4000, &resolver, &NullSigner)?;
//!     println!("{} rebases, {} binds", counts.rebases, counts.binds);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dyld;
pub mod error;
pub mod fixup;
pub mod macho;
pub mod util;

// Re-export main types
pub use dyld::slide::{apply_mapping_slide, apply_slide, describe, SlideStats};
pub use error::{Error, Result};
pub use fixup::chain::{walk_chains, FixupCounts, FixupLocation};
pub use fixup::engine::{
    apply_cache_slide, apply_image_fixups, FirstMapperClaim, LoadState, LoadedImage, NullSigner,
    PointerSigner, ProcessLocalClaim, SymbolResolver, TableResolver,
};
pub use fixup::format::PointerFormat;
pub use fixup::imports::ImportEntry;
pub use macho::ImageContext;
