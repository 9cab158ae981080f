//! Error types for fixup resolution.
//!
//! Every failure carries enough positional context (segment, page, byte
//! offset) to locate the offending word in the input without re-running the
//! walk under a debugger.

use thiserror::Error;

/// The main error type for fixup and slide operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Container Errors ====================
    // Structural damage found before any chain is walked: a record that
    // points outside its container, overlaps the next one, or lies about
    // its own size.
    #[error("malformed container at offset {offset:#x}: {reason}")]
    MalformedContainer { offset: usize, reason: String },

    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    // ==================== Fixup Chain Errors ====================
    #[error(
        "malformed fixup chain in segment {segment} page {page} at offset {offset:#x}: {reason}"
    )]
    MalformedFixupChain {
        segment: usize,
        page: usize,
        offset: u64,
        reason: String,
    },

    #[error("page start index {index} out of bounds (max: {max})")]
    PageStartOutOfBounds { index: usize, max: usize },

    // ==================== Binding Errors ====================
    #[error("unresolved symbol '{name}' (ordinal {ordinal})")]
    UnresolvedSymbol { ordinal: u32, name: String },

    // ==================== Unsupported Format Errors ====================
    #[error("unsupported pointer chain format: {0:#06x}")]
    UnsupportedPointerFormat(u16),

    #[error("unsupported import format: {0}")]
    UnsupportedImportFormat(u32),

    #[error("unsupported slide info version: {0}")]
    UnsupportedSlideVersion(u32),

    // ==================== Slide Info Errors ====================
    #[error("invalid slide info at offset {offset:#x}: {reason}")]
    InvalidSlideInfo { offset: u64, reason: String },

    // ==================== Load State Errors ====================
    #[error("image in state {state} cannot {operation} (fixups run exactly once)")]
    InvalidLoadState {
        state: &'static str,
        operation: &'static str,
    },
}

/// A specialized Result type for fixup operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a malformed-container error with a formatted message.
    #[inline]
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Error::MalformedContainer {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a malformed-chain error with full positional context.
    #[inline]
    pub fn bad_chain(segment: usize, page: usize, offset: u64, reason: impl Into<String>) -> Self {
        Error::MalformedFixupChain {
            segment,
            page,
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }

    /// Creates the unresolved-symbol error reported for a bind ordinal with
    /// no import-table entry.
    #[inline]
    pub fn out_of_range_ordinal(ordinal: u32, max: u32) -> Self {
        Error::UnresolvedSymbol {
            ordinal,
            name: format!("<out of range bind ordinal, max {max}>"),
        }
    }

    /// Returns true if this error poisons the whole process (a half-applied
    /// cache slide) rather than a single image.
    #[inline]
    pub fn is_process_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidSlideInfo { .. } | Error::UnsupportedSlideVersion(_)
        )
    }
}
