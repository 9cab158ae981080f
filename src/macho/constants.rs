//! Mach-O constants: magics, load commands, and the chained-fixup format
//! space (pointer formats, page-start escapes, import formats).

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 64-bit Mach-O magic (big-endian, needs byte swap)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

// =============================================================================
// File Types
// =============================================================================

/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Bundle
pub const MH_BUNDLE: u32 = 0x8;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

/// ARM64e (pointer authentication) CPU subtype
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// Compressed dyld info (opcode-based fixups, the pre-chained encoding)
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Used with linkedit_data_command, payload is export trie
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
/// Used with linkedit_data_command, payload is the chained fixups blob
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// =============================================================================
// Chained Fixups: Header
// =============================================================================

/// Only value of `dyld_chained_fixups_header.fixups_version` defined so far.
pub const DYLD_CHAINED_FIXUPS_VERSION: u32 = 0;

/// Import format: 4-byte entries, no addend.
pub const DYLD_CHAINED_IMPORT: u32 = 1;
/// Import format: 4-byte entries followed by a 32-bit addend.
pub const DYLD_CHAINED_IMPORT_ADDEND: u32 = 2;
/// Import format: 8-byte entries followed by a 64-bit addend.
pub const DYLD_CHAINED_IMPORT_ADDEND64: u32 = 3;

/// Symbol pool holds uncompressed C strings.
pub const DYLD_CHAINED_SYMBOL_UNCOMPRESSED: u32 = 0;

// =============================================================================
// Chained Fixups: Pointer Formats
// =============================================================================

/// arm64e, 8-byte stride, unauth rebase target is a vmaddr
pub const DYLD_CHAINED_PTR_ARM64E: u16 = 1;
/// 64-bit, 4-byte stride, target is a vmaddr
pub const DYLD_CHAINED_PTR_64: u16 = 2;
/// 32-bit, 4-byte stride, non-pointers co-opted into the chain
pub const DYLD_CHAINED_PTR_32: u16 = 3;
/// 32-bit shared-cache pointers
pub const DYLD_CHAINED_PTR_32_CACHE: u16 = 4;
/// 32-bit firmware, rebase only
pub const DYLD_CHAINED_PTR_32_FIRMWARE: u16 = 5;
/// 64-bit, target is a vm offset from the load address
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
/// arm64e kernel, 4-byte stride, unauth target is a vm offset
pub const DYLD_CHAINED_PTR_ARM64E_KERNEL: u16 = 7;
/// 64-bit kernel cache, rebase only, auth metadata inline
pub const DYLD_CHAINED_PTR_64_KERNEL_CACHE: u16 = 8;
/// arm64e userland, 8-byte stride, unauth target is a vm offset
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND: u16 = 9;
/// arm64e firmware, 4-byte stride, unauth target is a vmaddr
pub const DYLD_CHAINED_PTR_ARM64E_FIRMWARE: u16 = 10;
/// x86_64 kernel cache, 1-byte stride
pub const DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE: u16 = 11;
/// arm64e userland with 24-bit bind ordinals
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;
/// arm64e shared cache, rebase only, IA/DA keys only
pub const DYLD_CHAINED_PTR_ARM64E_SHARED_CACHE: u16 = 13;

// =============================================================================
// Chained Fixups: Page Starts
// =============================================================================

/// Page has no fixups.
pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xFFFF;
/// Page has multiple chain starts; value is an index into the overflow
/// entries of the same `page_start` array.
pub const DYLD_CHAINED_PTR_START_MULTI: u16 = 0x8000;
/// Set on the last overflow entry of a multi-start page.
pub const DYLD_CHAINED_PTR_START_LAST: u16 = 0x8000;

// =============================================================================
// Binding Ordinals
// =============================================================================

/// Lookup in images loaded before this one (negative special ordinal).
pub const BIND_SPECIAL_DYLIB_SELF: i32 = 0;
/// Lookup in the main executable.
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i32 = -1;
/// Flat namespace lookup.
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i32 = -2;
/// Weak coalesced lookup across all images.
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i32 = -3;

// =============================================================================
// Pointer Authentication Keys
// =============================================================================

/// PAC key encoded in the 2-bit `key` field of auth fixups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PtrAuthKey {
    /// Instruction key A
    IA = 0,
    /// Instruction key B
    IB = 1,
    /// Data key A
    DA = 2,
    /// Data key B
    DB = 3,
}

impl PtrAuthKey {
    /// Decodes the 2-bit on-disk key field.
    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => PtrAuthKey::IA,
            1 => PtrAuthKey::IB,
            2 => PtrAuthKey::DA,
            _ => PtrAuthKey::DB,
        }
    }

    /// Short name as printed by dyld diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            PtrAuthKey::IA => "IA",
            PtrAuthKey::IB => "IB",
            PtrAuthKey::DA => "DA",
            PtrAuthKey::DB => "DB",
        }
    }
}

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags relevant to fixup processing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The image is using two-level name space bindings
        const TWOLEVEL = 0x80;
        /// The final linked image contains external weak symbols
        const WEAK_DEFINES = 0x8000;
        /// The final linked image uses weak symbols
        const BINDS_TO_WEAK = 0x10000;
        /// The OS will load the main executable at a random address
        const PIE = 0x200000;
        /// The dylib is part of the dyld shared cache
        const DYLIB_IN_CACHE = 0x80000000;
    }
}
