//! Mach-O binary structures.
//!
//! These structures match the on-disk format of Mach-O files, including the
//! LC_DYLD_CHAINED_FIXUPS LINKEDIT blob.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;

// =============================================================================
// Header Structures
// =============================================================================

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// Magic number (MH_MAGIC_64)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    /// Returns true if this is a valid 64-bit Mach-O header.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    /// Returns true if this is an ARM64 binary.
    #[inline]
    pub fn is_arm64(&self) -> bool {
        self.cputype == CPU_TYPE_ARM64
    }

    /// Returns true if this is an ARM64e binary (with pointer authentication).
    #[inline]
    pub fn is_arm64e(&self) -> bool {
        self.is_arm64() && (self.cpusubtype & 0xFF) == CPU_SUBTYPE_ARM64E
    }

    /// Returns true if the image may contain weak-bind fixups.
    #[inline]
    pub fn binds_to_weak(&self) -> bool {
        MachOFlags::from_bits_truncate(self.flags).contains(MachOFlags::BINDS_TO_WEAK)
    }

    /// Returns the architecture as a string.
    pub fn arch_name(&self) -> &'static str {
        match self.cputype {
            CPU_TYPE_ARM64 => {
                if self.is_arm64e() {
                    "arm64e"
                } else {
                    "arm64"
                }
            }
            CPU_TYPE_X86_64 => "x86_64",
            CPU_TYPE_ARM => "arm",
            CPU_TYPE_X86 => "i386",
            _ => "unknown",
        }
    }
}

impl Default for MachHeader64 {
    fn default() -> Self {
        Self {
            magic: MH_MAGIC_64,
            cputype: 0,
            cpusubtype: 0,
            filetype: 0,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
            reserved: 0,
        }
    }
}

// =============================================================================
// Load Command Header
// =============================================================================

/// Generic load command header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    /// Type of load command
    pub cmd: u32,
    /// Size of load command
    pub cmdsize: u32,
}

impl LoadCommand {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segment Command
// =============================================================================

/// 64-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Amount of file to map
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 72;

    /// Returns the segment name as a string.
    pub fn name(&self) -> &str {
        let end = self.segname.iter().position(|&b| b == 0).unwrap_or(16);
        std::str::from_utf8(&self.segname[..end]).unwrap_or("")
    }

    /// Sets the segment name from a string.
    pub fn set_name(&mut self, name: &str) {
        self.segname = [0u8; 16];
        let bytes = name.as_bytes();
        let len = bytes.len().min(16);
        self.segname[..len].copy_from_slice(&bytes[..len]);
    }

    /// Returns true if this is the __LINKEDIT segment.
    #[inline]
    pub fn is_linkedit(&self) -> bool {
        &self.segname[..11] == b"__LINKEDIT\0"
    }

    /// Returns true if this segment is writable at runtime.
    #[inline]
    pub fn is_writable(&self) -> bool {
        // VM_PROT_WRITE
        (self.initprot & 0x2) != 0
    }
}

impl Default for SegmentCommand64 {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT_64,
            cmdsize: Self::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }
}

// =============================================================================
// Linkedit Data Command
// =============================================================================

/// Generic linkedit data command (LC_DYLD_CHAINED_FIXUPS, LC_DYLD_EXPORTS_TRIE).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LinkeditDataCommand {
    /// Command type
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset of the payload
    pub dataoff: u32,
    /// Payload size
    pub datasize: u32,
}

impl LinkeditDataCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;
}

impl Default for LinkeditDataCommand {
    fn default() -> Self {
        Self {
            cmd: 0,
            cmdsize: Self::SIZE as u32,
            dataoff: 0,
            datasize: 0,
        }
    }
}

// =============================================================================
// Chained Fixups Blob
// =============================================================================

/// Header at the start of the LC_DYLD_CHAINED_FIXUPS payload. All offsets
/// are relative to the start of the payload.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChainedFixupsHeader {
    /// Format version (currently 0)
    pub fixups_version: u32,
    /// Offset of dyld_chained_starts_in_image
    pub starts_offset: u32,
    /// Offset of the import table
    pub imports_offset: u32,
    /// Offset of the symbol name pool
    pub symbols_offset: u32,
    /// Number of import table entries
    pub imports_count: u32,
    /// DYLD_CHAINED_IMPORT*
    pub imports_format: u32,
    /// 0 = uncompressed name pool
    pub symbols_format: u32,
}

impl ChainedFixupsHeader {
    /// Size of this header.
    pub const SIZE: usize = 28;
}

/// Per-segment chain-start record. Followed on disk by
/// `page_start[page_count]`; only the first entry is part of the fixed
/// layout, the rest are read at [`Self::PAGE_STARTS_OFFSET`]` + 2 * i`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChainedStartsInSegment {
    /// Size of this record including all page_start entries
    pub size: u32,
    /// Page size for this segment (0x1000 or 0x4000)
    pub page_size: u16,
    /// DYLD_CHAINED_PTR_* format of every chain in the segment
    pub pointer_format: u16,
    /// VM offset of the segment from the image load address
    pub segment_offset: u64,
    /// For 32-bit formats: values above this are non-pointers
    pub max_valid_pointer: u32,
    /// Number of pages (and page_start entries, minus overflow)
    pub page_count: u16,
    /// First page_start entry (remaining entries follow on disk)
    pub page_start: [u16; 1],
}

impl ChainedStartsInSegment {
    /// Size of the fixed layout, including the first page_start entry.
    pub const SIZE: usize = 24;

    /// Byte offset of the `page_start` array within the record.
    pub const PAGE_STARTS_OFFSET: usize = 22;
}

/// 4-byte import entry (DYLD_CHAINED_IMPORT).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(transparent)]
pub struct ChainedImport(pub u32);

impl ChainedImport {
    /// Size of one entry.
    pub const SIZE: usize = 4;

    /// Raw 8-bit library ordinal field.
    #[inline]
    pub fn lib_ordinal_bits(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Library ordinal with negative special values folded back. Values
    /// above 0xF0 are sign-extended 8-bit encodings of the
    /// BIND_SPECIAL_DYLIB_* ordinals.
    #[inline]
    pub fn lib_ordinal(self) -> i32 {
        let bits = self.lib_ordinal_bits();
        if bits > 0xF0 {
            bits as i8 as i32
        } else {
            bits as i32
        }
    }

    /// True if a missing symbol binds to zero instead of failing.
    #[inline]
    pub fn weak_import(self) -> bool {
        (self.0 >> 8) & 0x1 != 0
    }

    /// Offset of the symbol name within the name pool.
    #[inline]
    pub fn name_offset(self) -> u32 {
        self.0 >> 9
    }
}

/// 8-byte import entry (DYLD_CHAINED_IMPORT_ADDEND).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChainedImportAddend {
    /// Same bit layout as [`ChainedImport`]
    pub import: u32,
    /// Signed addend applied to the resolved address
    pub addend: i32,
}

impl ChainedImportAddend {
    /// Size of one entry.
    pub const SIZE: usize = 8;
}

/// 16-byte import entry (DYLD_CHAINED_IMPORT_ADDEND64).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ChainedImportAddend64 {
    /// lib_ordinal:16 weak_import:1 reserved:15 name_offset:32
    pub raw: u64,
    /// Unsigned 64-bit addend
    pub addend: u64,
}

impl ChainedImportAddend64 {
    /// Size of one entry.
    pub const SIZE: usize = 16;

    /// Library ordinal with 16-bit negative special values folded back.
    #[inline]
    pub fn lib_ordinal(self) -> i32 {
        let bits = (self.raw & 0xFFFF) as u16;
        if bits > 0xFFF0 {
            bits as i16 as i32
        } else {
            bits as i32
        }
    }

    /// True if a missing symbol binds to zero instead of failing.
    #[inline]
    pub fn weak_import(self) -> bool {
        (self.raw >> 16) & 0x1 != 0
    }

    /// Offset of the symbol name within the name pool.
    #[inline]
    pub fn name_offset(self) -> u32 {
        (self.raw >> 32) as u32
    }
}

// =============================================================================
// Display Implementations
// =============================================================================

impl fmt::Display for MachHeader64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MachO {{ arch: {}, type: {:#x}, cmds: {}, flags: {:#x} }}",
            self.arch_name(),
            self.filetype,
            self.ncmds,
            self.flags
        )
    }
}

impl fmt::Display for SegmentCommand64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Segment {{ name: \"{}\", vm: {:#x}+{:#x}, file: {:#x}+{:#x} }}",
            self.name(),
            self.vmaddr,
            self.vmsize,
            self.fileoff,
            self.filesize
        )
    }
}
