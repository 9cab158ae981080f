//! Dyld shared cache slide handling.
//!
//! A shared-cache data mapping stores pointers in an unslid form and ships a
//! per-mapping slide-info blob describing where they are. `structs` holds the
//! on-disk layouts of the five slide-info generations; `slide` walks them and
//! applies a slide in place.

pub mod slide;
pub mod structs;

pub use slide::*;
pub use structs::*;
