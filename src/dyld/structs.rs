//! Dyld shared cache slide-info structures.
//!
//! These match the on-disk format of Apple's dyld shared cache and are
//! parsed zero-copy with the `zerocopy` crate. Five slide-info generations
//! exist; all are still found in shipping caches.

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::fixup::format::AuthData;
use crate::macho::PtrAuthKey;

/// The page size for slide info calculations (typically 4KB or 16KB).
pub const PAGE_SIZE_4K: u32 = 0x1000;
/// 16KB page size for arm64.
pub const PAGE_SIZE_16K: u32 = 0x4000;

// =============================================================================
// Slide Info Constants
// =============================================================================

/// v2 page attribute bits.
pub const DYLD_CACHE_SLIDE_PAGE_ATTRS: u16 = 0xC000;
/// v2: page start is an index into the extras array.
pub const DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA: u16 = 0x8000;
/// v2: page has nothing to rebase.
pub const DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE: u16 = 0x4000;
/// v2: last extras entry for this page.
pub const DYLD_CACHE_SLIDE_PAGE_ATTR_END: u16 = 0x8000;

/// v3: page has nothing to rebase.
pub const DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE: u16 = 0xFFFF;

/// v4: page has nothing to rebase.
pub const DYLD_CACHE_SLIDE4_PAGE_NO_REBASE: u16 = 0xFFFF;
/// v4: mask for the start offset / extras index.
pub const DYLD_CACHE_SLIDE4_PAGE_INDEX: u16 = 0x7FFF;
/// v4: page start is an index into the extras array.
pub const DYLD_CACHE_SLIDE4_PAGE_USE_EXTRA: u16 = 0x8000;
/// v4: last extras entry for this page.
pub const DYLD_CACHE_SLIDE4_PAGE_EXTRA_END: u16 = 0x8000;

/// v5: page has nothing to rebase.
pub const DYLD_CACHE_SLIDE_V5_PAGE_ATTR_NO_REBASE: u16 = 0xFFFF;

// =============================================================================
// Mapping Structures
// =============================================================================

/// Extended mapping entry with per-mapping slide info.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingAndSlideInfo {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Slide info file offset
    pub slide_info_file_offset: u64,
    /// Slide info file size
    pub slide_info_file_size: u64,
    /// Flags
    pub flags: u64,
    /// Maximum memory protection
    pub max_prot: u32,
    /// Initial memory protection
    pub init_prot: u32,
}

impl DyldCacheMappingAndSlideInfo {
    /// Size of the structure in bytes.
    pub const SIZE: usize = 56;

    /// Returns true if this mapping carries slide info.
    pub fn has_slide_info(&self) -> bool {
        self.slide_info_file_size != 0
    }

    /// Decoded mapping flags.
    pub fn mapping_flags(&self) -> MappingFlags {
        MappingFlags::from_bits_truncate(self.flags)
    }
}

bitflags! {
    /// Flags for extended mapping entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u64 {
        /// Mapping contains authenticated pointers
        const AUTH_DATA = 1 << 0;
        /// Mapping contains dirty data
        const DIRTY_DATA = 1 << 1;
        /// Mapping contains const data
        const CONST_DATA = 1 << 2;
        /// Mapping is in TEXT region
        const TEXT_STUBS = 1 << 3;
    }
}

// =============================================================================
// Slide Info Headers
// =============================================================================

/// Slide info version 1 (32-bit bitmap caches).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo1 {
    /// Version (should be 1)
    pub version: u32,
    /// Offset to the table of contents (u16 entry indices, one per page)
    pub toc_offset: u32,
    /// Number of toc entries
    pub toc_count: u32,
    /// Offset to the bitmap entries
    pub entries_offset: u32,
    /// Number of bitmap entries
    pub entries_count: u32,
    /// Bytes per bitmap entry (128 covers one 4KB page of u32 slots)
    pub entries_size: u32,
}

impl DyldCacheSlideInfo1 {
    /// Size of the structure in bytes.
    pub const SIZE: usize = 24;
}

/// Slide info version 2 (standard arm64).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo2 {
    /// Version (should be 2)
    pub version: u32,
    /// Page size (typically 4KB)
    pub page_size: u32,
    /// Offset to page starts array
    pub page_starts_offset: u32,
    /// Number of page starts entries
    pub page_starts_count: u32,
    /// Offset to page extras
    pub page_extras_offset: u32,
    /// Number of page extras entries
    pub page_extras_count: u32,
    /// Mask for the delta field in a pointer
    pub delta_mask: u64,
    /// Value to add to rebased pointers
    pub value_add: u64,
}

impl DyldCacheSlideInfo2 {
    /// Size of the structure in bytes.
    pub const SIZE: usize = 40;

    /// Returns the mask for the value portion of a pointer.
    pub fn value_mask(&self) -> u64 {
        !self.delta_mask
    }

    /// Shift for the delta field. Deltas count 4-byte units, so the shift
    /// is two short of the mask position; the shifted result is a byte
    /// distance.
    pub fn delta_shift(&self) -> u32 {
        self.delta_mask.trailing_zeros() - 2
    }
}

/// Slide info version 3 (arm64e with PAC).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo3 {
    /// Version (should be 3)
    pub version: u32,
    /// Page size (typically 16KB)
    pub page_size: u32,
    /// Number of page starts entries
    pub page_starts_count: u32,
    /// Padding, present on disk
    pub _pad: u32,
    /// Value to add for authenticated pointers
    pub auth_value_add: u64,
    // Followed by page_starts array of u16
}

impl DyldCacheSlideInfo3 {
    /// Size of the structure in bytes.
    pub const SIZE: usize = 24;
}

/// Slide info version 4 (32-bit caches, v2 layout with 32-bit words).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo4 {
    /// Version (should be 4)
    pub version: u32,
    /// Page size (typically 4KB)
    pub page_size: u32,
    /// Offset to page starts array
    pub page_starts_offset: u32,
    /// Number of page starts entries
    pub page_starts_count: u32,
    /// Offset to page extras
    pub page_extras_offset: u32,
    /// Number of page extras entries
    pub page_extras_count: u32,
    /// Mask for the delta field (0xC0000000 in practice)
    pub delta_mask: u64,
    /// Value to add to rebased pointers (the cache base)
    pub value_add: u64,
}

impl DyldCacheSlideInfo4 {
    /// Size of the structure in bytes.
    pub const SIZE: usize = 40;

    /// Returns the mask for the value portion of a pointer.
    pub fn value_mask(&self) -> u32 {
        !(self.delta_mask as u32)
    }

    /// Shift for the delta field; see [`DyldCacheSlideInfo2::delta_shift`].
    pub fn delta_shift(&self) -> u32 {
        self.delta_mask.trailing_zeros() - 2
    }
}

/// Slide info version 5 (arm64e iOS 18+).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo5 {
    /// Version (should be 5)
    pub version: u32,
    /// Page size
    pub page_size: u32,
    /// Number of page starts entries
    pub page_starts_count: u32,
    /// Padding, present on disk
    pub _pad: u32,
    /// Value to add to pointers
    pub value_add: u64,
    // Followed by page_starts array of u16
}

impl DyldCacheSlideInfo5 {
    /// Size of the structure in bytes.
    pub const SIZE: usize = 24;
}

// =============================================================================
// Slide Pointers
// =============================================================================

/// Encoded pointer for slide info v3.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SlidePointer3(pub u64);

impl SlidePointer3 {
    /// Returns true if this is an authenticated pointer.
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Offset to the next rebase location, in 8-byte units.
    #[inline]
    pub fn offset_to_next(&self) -> u64 {
        (self.0 >> 51) & 0x7FF
    }

    /// For authenticated pointers: offset from the shared cache base.
    #[inline]
    pub fn auth_offset(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// For authenticated pointers: the PAC metadata.
    #[inline]
    pub fn auth_data(&self) -> AuthData {
        AuthData {
            diversity: ((self.0 >> 32) & 0xFFFF) as u16,
            addr_div: (self.0 >> 48) & 1 != 0,
            key: PtrAuthKey::from_bits(((self.0 >> 49) & 0x3) as u8),
        }
    }

    /// For plain pointers: the target with the packed top byte moved back
    /// to bits 56..63.
    #[inline]
    pub fn plain_value(&self) -> u64 {
        let value51 = self.0 & 0x0007_FFFF_FFFF_FFFF;
        let top8 = value51 & 0x0007_F800_0000_0000;
        let bottom43 = value51 & 0x0000_07FF_FFFF_FFFF;
        (top8 << 13) | bottom43
    }
}

/// Encoded pointer for slide info v5.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SlidePointer5(pub u64);

impl SlidePointer5 {
    /// Returns true if this is an authenticated pointer.
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Offset to the next rebase, in 8-byte units.
    #[inline]
    pub fn next(&self) -> u64 {
        (self.0 >> 52) & 0x7FF
    }

    /// The 34-bit runtime offset (both auth and non-auth).
    #[inline]
    pub fn runtime_offset(&self) -> u64 {
        self.0 & 0x3_FFFF_FFFF
    }

    /// For non-auth pointers: the high 8 bits.
    #[inline]
    pub fn high8(&self) -> u8 {
        ((self.0 >> 34) & 0xFF) as u8
    }

    /// For authenticated pointers: the PAC metadata. Only the IA and DA
    /// keys exist in this format.
    #[inline]
    pub fn auth_data(&self) -> AuthData {
        AuthData {
            diversity: ((self.0 >> 34) & 0xFFFF) as u16,
            addr_div: (self.0 >> 50) & 1 != 0,
            key: if (self.0 >> 51) & 1 != 0 {
                PtrAuthKey::DA
            } else {
                PtrAuthKey::IA
            },
        }
    }
}
