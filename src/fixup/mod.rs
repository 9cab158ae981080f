//! Chained-fixup decoding, walking, and application.
//!
//! `format` is the per-word codec, `imports` the bind-target table, `chain`
//! the page-start walker and in-place applier, and `engine` the orchestrator
//! that ties them to the load-state machine.

pub mod chain;
pub mod engine;
pub mod format;
pub mod imports;

#[cfg(test)]
pub(crate) mod test_support;

pub use chain::*;
pub use engine::*;
pub use format::*;
pub use imports::*;
