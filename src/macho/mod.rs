//! Mach-O file format handling.
//!
//! Types for parsing mapped Mach-O images: the header, segment table, and
//! the chained-fixups LINKEDIT blob.

pub mod constants;
pub mod context;
pub mod structs;

pub use constants::*;
pub use context::*;
pub use structs::*;
