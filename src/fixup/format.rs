//! Pointer-format codec for chained fixups.
//!
//! Each `DYLD_CHAINED_PTR_*` format packs a rebase target or a bind ordinal,
//! pointer-authentication metadata, and the distance to the next fixup into
//! one 32- or 64-bit on-disk word. This module decodes a raw word into a
//! [`DecodedFixup`] and encodes it back, bit-exact in both directions.

use crate::error::{Error, Result};
use crate::macho::constants::*;

// =============================================================================
// Pointer Format
// =============================================================================

/// Chain pointer format, from `dyld_chained_starts_in_segment.pointer_format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PointerFormat {
    /// arm64e userland pre-iOS 13.4: unauth rebase targets are vmaddrs
    Arm64e = DYLD_CHAINED_PTR_ARM64E,
    /// Generic 64-bit: rebase targets are vmaddrs
    Ptr64 = DYLD_CHAINED_PTR_64,
    /// Generic 32-bit, with non-pointers co-opted into chains
    Ptr32 = DYLD_CHAINED_PTR_32,
    /// 32-bit shared cache
    Ptr32Cache = DYLD_CHAINED_PTR_32_CACHE,
    /// 32-bit firmware, rebase only
    Ptr32Firmware = DYLD_CHAINED_PTR_32_FIRMWARE,
    /// Generic 64-bit: rebase targets are vm offsets
    Ptr64Offset = DYLD_CHAINED_PTR_64_OFFSET,
    /// arm64e kernel/firmware variant: 4-byte stride, offset targets
    Arm64eKernel = DYLD_CHAINED_PTR_ARM64E_KERNEL,
    /// 64-bit kernel cache, rebase only
    Ptr64KernelCache = DYLD_CHAINED_PTR_64_KERNEL_CACHE,
    /// arm64e userland: 8-byte stride, offset targets
    Arm64eUserland = DYLD_CHAINED_PTR_ARM64E_USERLAND,
    /// arm64e firmware: 4-byte stride, vmaddr targets
    Arm64eFirmware = DYLD_CHAINED_PTR_ARM64E_FIRMWARE,
    /// x86_64 kernel cache: 1-byte stride
    X86KernelCache = DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE,
    /// arm64e userland with 24-bit bind ordinals
    Arm64eUserland24 = DYLD_CHAINED_PTR_ARM64E_USERLAND24,
    /// arm64e shared cache, rebase only
    Arm64eSharedCache = DYLD_CHAINED_PTR_ARM64E_SHARED_CACHE,
}

impl PointerFormat {
    /// Decodes the on-disk format value.
    pub fn from_u16(value: u16) -> Result<Self> {
        Ok(match value {
            DYLD_CHAINED_PTR_ARM64E => PointerFormat::Arm64e,
            DYLD_CHAINED_PTR_64 => PointerFormat::Ptr64,
            DYLD_CHAINED_PTR_32 => PointerFormat::Ptr32,
            DYLD_CHAINED_PTR_32_CACHE => PointerFormat::Ptr32Cache,
            DYLD_CHAINED_PTR_32_FIRMWARE => PointerFormat::Ptr32Firmware,
            DYLD_CHAINED_PTR_64_OFFSET => PointerFormat::Ptr64Offset,
            DYLD_CHAINED_PTR_ARM64E_KERNEL => PointerFormat::Arm64eKernel,
            DYLD_CHAINED_PTR_64_KERNEL_CACHE => PointerFormat::Ptr64KernelCache,
            DYLD_CHAINED_PTR_ARM64E_USERLAND => PointerFormat::Arm64eUserland,
            DYLD_CHAINED_PTR_ARM64E_FIRMWARE => PointerFormat::Arm64eFirmware,
            DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE => PointerFormat::X86KernelCache,
            DYLD_CHAINED_PTR_ARM64E_USERLAND24 => PointerFormat::Arm64eUserland24,
            DYLD_CHAINED_PTR_ARM64E_SHARED_CACHE => PointerFormat::Arm64eSharedCache,
            other => return Err(Error::UnsupportedPointerFormat(other)),
        })
    }

    /// Bytes between chain positions; the `next` field counts in these units.
    #[inline]
    pub fn stride(self) -> u64 {
        match self {
            PointerFormat::Arm64e
            | PointerFormat::Arm64eUserland
            | PointerFormat::Arm64eUserland24
            | PointerFormat::Arm64eSharedCache => 8,
            PointerFormat::X86KernelCache => 1,
            _ => 4,
        }
    }

    /// Width of one on-disk relocation word.
    #[inline]
    pub fn word_size(self) -> usize {
        match self {
            PointerFormat::Ptr32 | PointerFormat::Ptr32Cache | PointerFormat::Ptr32Firmware => 4,
            _ => 8,
        }
    }

    /// True if unauthenticated rebase targets are full vmaddrs rather than
    /// vm offsets from the load address.
    #[inline]
    pub fn rebase_target_is_vmaddr(self) -> bool {
        matches!(
            self,
            PointerFormat::Arm64e
                | PointerFormat::Arm64eFirmware
                | PointerFormat::Ptr64
                | PointerFormat::Ptr32
                | PointerFormat::Ptr32Cache
                | PointerFormat::Ptr32Firmware
        )
    }

    /// True if the format can carry bind fixups at all.
    #[inline]
    pub fn supports_binds(self) -> bool {
        !matches!(
            self,
            PointerFormat::Ptr32Cache
                | PointerFormat::Ptr32Firmware
                | PointerFormat::Ptr64KernelCache
                | PointerFormat::X86KernelCache
                | PointerFormat::Arm64eSharedCache
        )
    }

    /// Human-readable name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            PointerFormat::Arm64e => "arm64e",
            PointerFormat::Ptr64 => "64",
            PointerFormat::Ptr32 => "32",
            PointerFormat::Ptr32Cache => "32-cache",
            PointerFormat::Ptr32Firmware => "32-firmware",
            PointerFormat::Ptr64Offset => "64-offset",
            PointerFormat::Arm64eKernel => "arm64e-kernel",
            PointerFormat::Ptr64KernelCache => "64-kernel-cache",
            PointerFormat::Arm64eUserland => "arm64e-userland",
            PointerFormat::Arm64eFirmware => "arm64e-firmware",
            PointerFormat::X86KernelCache => "x86_64-kernel-cache",
            PointerFormat::Arm64eUserland24 => "arm64e-userland24",
            PointerFormat::Arm64eSharedCache => "arm64e-shared-cache",
        }
    }
}

// =============================================================================
// Decoded Form
// =============================================================================

/// Pointer-authentication metadata carried by an auth fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthData {
    /// 16-bit diversity value
    pub diversity: u16,
    /// Blend the slot address into the diversifier
    pub addr_div: bool,
    /// Signing key
    pub key: PtrAuthKey,
}

/// One decoded relocation word, minus the chain link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainedPointer {
    /// A local pointer to rebase.
    Rebase {
        /// Target: vmaddr or vm offset, depending on the format
        target: u64,
        /// Top byte reinstated into bits 56..63 of the fixed-up value
        high8: u8,
        /// Cache level for kernel-cache formats, 0 elsewhere
        cache_level: u8,
        /// Present on authenticated slots
        auth: Option<AuthData>,
    },
    /// An imported-symbol binding.
    Bind {
        /// Index into the import table
        ordinal: u32,
        /// Inline addend, already sign-extended per the format's rule
        addend: i64,
        /// Present on authenticated slots
        auth: Option<AuthData>,
    },
}

impl ChainedPointer {
    /// True for bind fixups.
    #[inline]
    pub fn is_bind(&self) -> bool {
        matches!(self, ChainedPointer::Bind { .. })
    }

    /// The auth metadata, if the slot is signed.
    #[inline]
    pub fn auth(&self) -> Option<AuthData> {
        match self {
            ChainedPointer::Rebase { auth, .. } | ChainedPointer::Bind { auth, .. } => *auth,
        }
    }
}

/// A decoded word plus its chain link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFixup {
    /// The rebase or bind payload
    pub pointer: ChainedPointer,
    /// Distance to the next fixup, in stride units; 0 ends the chain
    pub next: u32,
}

// =============================================================================
// Raw Word Accessors
// =============================================================================

/// Raw arm64e chain word (formats 1, 7, 9, 10, 12).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Arm64eWord(pub u64);

impl Arm64eWord {
    #[inline]
    fn auth(self) -> bool {
        (self.0 >> 63) & 0x1 != 0
    }

    #[inline]
    fn bind(self) -> bool {
        (self.0 >> 62) & 0x1 != 0
    }

    #[inline]
    fn next(self) -> u32 {
        ((self.0 >> 51) & 0x7FF) as u32
    }

    #[inline]
    fn rebase_target(self) -> u64 {
        self.0 & 0x7FF_FFFF_FFFF
    }

    #[inline]
    fn rebase_high8(self) -> u8 {
        ((self.0 >> 43) & 0xFF) as u8
    }

    #[inline]
    fn auth_rebase_target(self) -> u64 {
        self.0 & 0xFFFF_FFFF
    }

    #[inline]
    fn bind_ordinal(self, wide: bool) -> u32 {
        if wide {
            (self.0 & 0xFF_FFFF) as u32
        } else {
            (self.0 & 0xFFFF) as u32
        }
    }

    /// 19-bit addend sign-extended the way dyld does it.
    #[inline]
    fn bind_addend(self) -> i64 {
        let mut addend = (self.0 >> 32) & 0x7FFFF;
        if addend & 0x40000 != 0 {
            addend |= 0xFFFF_FFFF_FFFC_0000;
        }
        addend as i64
    }

    #[inline]
    fn auth_data(self) -> AuthData {
        AuthData {
            diversity: ((self.0 >> 32) & 0xFFFF) as u16,
            addr_div: (self.0 >> 48) & 0x1 != 0,
            key: PtrAuthKey::from_bits(((self.0 >> 49) & 0x3) as u8),
        }
    }
}

/// Raw generic 64-bit chain word (formats 2 and 6).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Generic64Word(pub u64);

impl Generic64Word {
    #[inline]
    fn bind(self) -> bool {
        (self.0 >> 63) & 0x1 != 0
    }

    #[inline]
    fn next(self) -> u32 {
        ((self.0 >> 51) & 0xFFF) as u32
    }

    #[inline]
    fn rebase_target(self) -> u64 {
        self.0 & 0xF_FFFF_FFFF
    }

    #[inline]
    fn rebase_high8(self) -> u8 {
        ((self.0 >> 36) & 0xFF) as u8
    }

    #[inline]
    fn bind_ordinal(self) -> u32 {
        (self.0 & 0xFF_FFFF) as u32
    }

    /// The bind addend run through dyld's split sign-extension: the top 8
    /// bits shift into bits 32..39 of the value, the bottom 19 bits are
    /// sign-extended.
    #[inline]
    fn bind_addend(self) -> i64 {
        let addend27 = (self.0 >> 24) & 0x7FF_FFFF;
        let top8 = addend27 & 0x007_F80000;
        let bottom19 = addend27 & 0x000_07FFFF;
        let mut value = (top8 << 13) | bottom19;
        if bottom19 & 0x40000 != 0 {
            value |= 0x00FF_FFFF_FFF8_0000;
        }
        value as i64
    }
}

/// Raw generic 32-bit chain word (format 3).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Generic32Word(pub u32);

impl Generic32Word {
    #[inline]
    fn bind(self) -> bool {
        (self.0 >> 31) & 0x1 != 0
    }

    #[inline]
    fn next(self) -> u32 {
        (self.0 >> 26) & 0x1F
    }

    #[inline]
    fn rebase_target(self) -> u32 {
        self.0 & 0x03FF_FFFF
    }

    #[inline]
    fn bind_ordinal(self) -> u32 {
        self.0 & 0x000F_FFFF
    }

    #[inline]
    fn bind_addend(self) -> i64 {
        ((self.0 >> 20) & 0x3F) as i64
    }
}

/// Raw 64-bit kernel-cache chain word (formats 8 and 11).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Kernel64Word(pub u64);

impl Kernel64Word {
    #[inline]
    fn is_auth(self) -> bool {
        (self.0 >> 63) & 0x1 != 0
    }

    #[inline]
    fn next(self) -> u32 {
        ((self.0 >> 51) & 0xFFF) as u32
    }

    #[inline]
    fn target(self) -> u64 {
        self.0 & 0x3FFF_FFFF
    }

    #[inline]
    fn cache_level(self) -> u8 {
        ((self.0 >> 30) & 0x3) as u8
    }

    #[inline]
    fn auth_data(self) -> AuthData {
        AuthData {
            diversity: ((self.0 >> 32) & 0xFFFF) as u16,
            addr_div: (self.0 >> 48) & 0x1 != 0,
            key: PtrAuthKey::from_bits(((self.0 >> 49) & 0x3) as u8),
        }
    }
}

/// Raw arm64e shared-cache chain word (format 13).
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Cache64eWord(pub u64);

impl Cache64eWord {
    #[inline]
    fn auth(self) -> bool {
        (self.0 >> 63) & 0x1 != 0
    }

    #[inline]
    fn next(self) -> u32 {
        ((self.0 >> 52) & 0x7FF) as u32
    }

    #[inline]
    fn runtime_offset(self) -> u64 {
        self.0 & 0x3_FFFF_FFFF
    }

    #[inline]
    fn high8(self) -> u8 {
        ((self.0 >> 34) & 0xFF) as u8
    }

    #[inline]
    fn auth_data(self) -> AuthData {
        AuthData {
            diversity: ((self.0 >> 34) & 0xFFFF) as u16,
            addr_div: (self.0 >> 50) & 0x1 != 0,
            // Only IA and DA exist in this format
            key: if (self.0 >> 51) & 0x1 != 0 {
                PtrAuthKey::DA
            } else {
                PtrAuthKey::IA
            },
        }
    }
}

// =============================================================================
// Decode
// =============================================================================

/// Decodes one raw relocation word. 32-bit formats pass the word
/// zero-extended to u64.
pub fn decode(raw: u64, format: PointerFormat) -> Result<DecodedFixup> {
    let fixup = match format {
        PointerFormat::Arm64e
        | PointerFormat::Arm64eKernel
        | PointerFormat::Arm64eUserland
        | PointerFormat::Arm64eFirmware
        | PointerFormat::Arm64eUserland24 => {
            let word = Arm64eWord(raw);
            let wide = format == PointerFormat::Arm64eUserland24;
            let pointer = match (word.bind(), word.auth()) {
                (true, true) => ChainedPointer::Bind {
                    ordinal: word.bind_ordinal(wide),
                    addend: 0,
                    auth: Some(word.auth_data()),
                },
                (true, false) => ChainedPointer::Bind {
                    ordinal: word.bind_ordinal(wide),
                    addend: word.bind_addend(),
                    auth: None,
                },
                (false, true) => ChainedPointer::Rebase {
                    target: word.auth_rebase_target(),
                    high8: 0,
                    cache_level: 0,
                    auth: Some(word.auth_data()),
                },
                (false, false) => ChainedPointer::Rebase {
                    target: word.rebase_target(),
                    high8: word.rebase_high8(),
                    cache_level: 0,
                    auth: None,
                },
            };
            DecodedFixup {
                pointer,
                next: word.next(),
            }
        }

        PointerFormat::Ptr64 | PointerFormat::Ptr64Offset => {
            let word = Generic64Word(raw);
            let pointer = if word.bind() {
                ChainedPointer::Bind {
                    ordinal: word.bind_ordinal(),
                    addend: word.bind_addend(),
                    auth: None,
                }
            } else {
                ChainedPointer::Rebase {
                    target: word.rebase_target(),
                    high8: word.rebase_high8(),
                    cache_level: 0,
                    auth: None,
                }
            };
            DecodedFixup {
                pointer,
                next: word.next(),
            }
        }

        PointerFormat::Ptr32 => {
            let word = Generic32Word(raw as u32);
            let pointer = if word.bind() {
                ChainedPointer::Bind {
                    ordinal: word.bind_ordinal(),
                    addend: word.bind_addend(),
                    auth: None,
                }
            } else {
                ChainedPointer::Rebase {
                    target: word.rebase_target() as u64,
                    high8: 0,
                    cache_level: 0,
                    auth: None,
                }
            };
            DecodedFixup {
                pointer,
                next: word.next(),
            }
        }

        PointerFormat::Ptr32Cache => {
            let word = raw as u32;
            DecodedFixup {
                pointer: ChainedPointer::Rebase {
                    target: (word & 0x3FFF_FFFF) as u64,
                    high8: 0,
                    cache_level: 0,
                    auth: None,
                },
                next: word >> 30,
            }
        }

        PointerFormat::Ptr32Firmware => {
            let word = raw as u32;
            DecodedFixup {
                pointer: ChainedPointer::Rebase {
                    target: (word & 0x03FF_FFFF) as u64,
                    high8: 0,
                    cache_level: 0,
                    auth: None,
                },
                next: (word >> 26) & 0x3F,
            }
        }

        PointerFormat::Ptr64KernelCache | PointerFormat::X86KernelCache => {
            let word = Kernel64Word(raw);
            DecodedFixup {
                pointer: ChainedPointer::Rebase {
                    target: word.target(),
                    high8: 0,
                    cache_level: word.cache_level(),
                    auth: word.is_auth().then(|| word.auth_data()),
                },
                next: word.next(),
            }
        }

        PointerFormat::Arm64eSharedCache => {
            let word = Cache64eWord(raw);
            let pointer = if word.auth() {
                ChainedPointer::Rebase {
                    target: word.runtime_offset(),
                    high8: 0,
                    cache_level: 0,
                    auth: Some(word.auth_data()),
                }
            } else {
                ChainedPointer::Rebase {
                    target: word.runtime_offset(),
                    high8: word.high8(),
                    cache_level: 0,
                    auth: None,
                }
            };
            DecodedFixup {
                pointer,
                next: word.next(),
            }
        }
    };

    Ok(fixup)
}

// =============================================================================
// Encode
// =============================================================================

fn encode_auth_bits(auth: AuthData) -> u64 {
    ((auth.diversity as u64) << 32)
        | ((auth.addr_div as u64) << 48)
        | (((auth.key as u64) & 0x3) << 49)
        | (1 << 63)
}

/// Encodes a decoded fixup back into its on-disk word. The exact inverse of
/// [`decode`]; 32-bit formats return the word in the low half.
pub fn encode(fixup: &DecodedFixup, format: PointerFormat) -> Result<u64> {
    let next = fixup.next as u64;
    let word = match format {
        PointerFormat::Arm64e
        | PointerFormat::Arm64eKernel
        | PointerFormat::Arm64eUserland
        | PointerFormat::Arm64eFirmware
        | PointerFormat::Arm64eUserland24 => {
            let ordinal_mask = if format == PointerFormat::Arm64eUserland24 {
                0xFF_FFFF
            } else {
                0xFFFF
            };
            match fixup.pointer {
                ChainedPointer::Bind {
                    ordinal,
                    auth: Some(auth),
                    ..
                } => {
                    (ordinal as u64 & ordinal_mask)
                        | encode_auth_bits(auth)
                        | ((next & 0x7FF) << 51)
                        | (1 << 62)
                }
                ChainedPointer::Bind {
                    ordinal,
                    addend,
                    auth: None,
                } => {
                    (ordinal as u64 & ordinal_mask)
                        | (((addend as u64) & 0x7FFFF) << 32)
                        | ((next & 0x7FF) << 51)
                        | (1 << 62)
                }
                ChainedPointer::Rebase {
                    target,
                    auth: Some(auth),
                    ..
                } => (target & 0xFFFF_FFFF) | encode_auth_bits(auth) | ((next & 0x7FF) << 51),
                ChainedPointer::Rebase {
                    target,
                    high8,
                    auth: None,
                    ..
                } => {
                    (target & 0x7FF_FFFF_FFFF)
                        | ((high8 as u64) << 43)
                        | ((next & 0x7FF) << 51)
                }
            }
        }

        PointerFormat::Ptr64 | PointerFormat::Ptr64Offset => match fixup.pointer {
            ChainedPointer::Bind {
                ordinal, addend, ..
            } => {
                let value = addend as u64;
                let addend27 = ((value >> 13) & 0x007_F80000) | (value & 0x000_07FFFF);
                (ordinal as u64 & 0xFF_FFFF)
                    | (addend27 << 24)
                    | ((next & 0xFFF) << 51)
                    | (1 << 63)
            }
            ChainedPointer::Rebase { target, high8, .. } => {
                (target & 0xF_FFFF_FFFF) | ((high8 as u64) << 36) | ((next & 0xFFF) << 51)
            }
        },

        PointerFormat::Ptr32 => match fixup.pointer {
            ChainedPointer::Bind {
                ordinal, addend, ..
            } => {
                (ordinal as u64 & 0x000F_FFFF)
                    | (((addend as u64) & 0x3F) << 20)
                    | ((next & 0x1F) << 26)
                    | (1 << 31)
            }
            ChainedPointer::Rebase { target, .. } => {
                (target & 0x03FF_FFFF) | ((next & 0x1F) << 26)
            }
        },

        PointerFormat::Ptr32Cache => match fixup.pointer {
            ChainedPointer::Rebase { target, .. } => (target & 0x3FFF_FFFF) | ((next & 0x3) << 30),
            _ => return Err(Error::UnsupportedPointerFormat(format as u16)),
        },

        PointerFormat::Ptr32Firmware => match fixup.pointer {
            ChainedPointer::Rebase { target, .. } => (target & 0x03FF_FFFF) | ((next & 0x3F) << 26),
            _ => return Err(Error::UnsupportedPointerFormat(format as u16)),
        },

        PointerFormat::Ptr64KernelCache | PointerFormat::X86KernelCache => match fixup.pointer {
            ChainedPointer::Rebase {
                target,
                cache_level,
                auth,
                ..
            } => {
                let mut word = (target & 0x3FFF_FFFF)
                    | (((cache_level as u64) & 0x3) << 30)
                    | ((next & 0xFFF) << 51);
                if let Some(auth) = auth {
                    word |= encode_auth_bits(auth);
                }
                word
            }
            _ => return Err(Error::UnsupportedPointerFormat(format as u16)),
        },

        PointerFormat::Arm64eSharedCache => match fixup.pointer {
            ChainedPointer::Rebase {
                target,
                auth: Some(auth),
                ..
            } => {
                let key_is_data = match auth.key {
                    PtrAuthKey::DA => 1u64,
                    _ => 0,
                };
                (target & 0x3_FFFF_FFFF)
                    | ((auth.diversity as u64) << 34)
                    | ((auth.addr_div as u64) << 50)
                    | (key_is_data << 51)
                    | ((next & 0x7FF) << 52)
                    | (1 << 63)
            }
            ChainedPointer::Rebase {
                target,
                high8,
                auth: None,
                ..
            } => (target & 0x3_FFFF_FFFF) | ((high8 as u64) << 34) | ((next & 0x7FF) << 52),
            _ => return Err(Error::UnsupportedPointerFormat(format as u16)),
        },
    };

    Ok(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm64e_auth_rebase_roundtrip() {
        // key=2 (DA), addr_div=1, diversity=0x1234, target offset 0x8000
        let fixup = DecodedFixup {
            pointer: ChainedPointer::Rebase {
                target: 0x8000,
                high8: 0,
                cache_level: 0,
                auth: Some(AuthData {
                    diversity: 0x1234,
                    addr_div: true,
                    key: PtrAuthKey::DA,
                }),
            },
            next: 3,
        };
        let raw = encode(&fixup, PointerFormat::Arm64e).unwrap();
        assert_eq!(decode(raw, PointerFormat::Arm64e).unwrap(), fixup);

        // auth and bind bits are where dyld expects them
        assert_eq!((raw >> 63) & 1, 1);
        assert_eq!((raw >> 62) & 1, 0);
        assert_eq!((raw >> 49) & 0x3, 2);
        assert_eq!((raw >> 48) & 0x1, 1);
        assert_eq!((raw >> 32) & 0xFFFF, 0x1234);
    }

    #[test]
    fn test_arm64e_plain_rebase_roundtrip() {
        let fixup = DecodedFixup {
            pointer: ChainedPointer::Rebase {
                target: 0x1_8000_4010,
                high8: 0x80,
                cache_level: 0,
                auth: None,
            },
            next: 1,
        };
        let raw = encode(&fixup, PointerFormat::Arm64e).unwrap();
        assert_eq!(decode(raw, PointerFormat::Arm64e).unwrap(), fixup);
    }

    #[test]
    fn test_arm64e_bind_negative_addend() {
        let fixup = DecodedFixup {
            pointer: ChainedPointer::Bind {
                ordinal: 42,
                addend: -8,
                auth: None,
            },
            next: 0,
        };
        let raw = encode(&fixup, PointerFormat::Arm64e).unwrap();
        assert_eq!(decode(raw, PointerFormat::Arm64e).unwrap(), fixup);
    }

    #[test]
    fn test_userland24_wide_ordinal() {
        let fixup = DecodedFixup {
            pointer: ChainedPointer::Bind {
                ordinal: 0x12_3456,
                addend: 0,
                auth: None,
            },
            next: 5,
        };
        let raw = encode(&fixup, PointerFormat::Arm64eUserland24).unwrap();
        assert_eq!(decode(raw, PointerFormat::Arm64eUserland24).unwrap(), fixup);

        // The same ordinal does not survive the 16-bit format
        let narrow = encode(&fixup, PointerFormat::Arm64e).unwrap();
        let DecodedFixup {
            pointer: ChainedPointer::Bind { ordinal, .. },
            ..
        } = decode(narrow, PointerFormat::Arm64e).unwrap()
        else {
            panic!("expected bind");
        };
        assert_eq!(ordinal, 0x3456);
    }

    #[test]
    fn test_generic64_roundtrip() {
        for format in [PointerFormat::Ptr64, PointerFormat::Ptr64Offset] {
            let rebase = DecodedFixup {
                pointer: ChainedPointer::Rebase {
                    target: 0xF_0000_1234,
                    high8: 0xC0,
                    cache_level: 0,
                    auth: None,
                },
                next: 0xFFF,
            };
            let raw = encode(&rebase, format).unwrap();
            assert_eq!(decode(raw, format).unwrap(), rebase);

            let bind = DecodedFixup {
                pointer: ChainedPointer::Bind {
                    ordinal: 7,
                    addend: 0x30,
                    auth: None,
                },
                next: 2,
            };
            let raw = encode(&bind, format).unwrap();
            assert_eq!(decode(raw, format).unwrap(), bind);
        }
    }

    #[test]
    fn test_generic32_roundtrip() {
        let rebase = DecodedFixup {
            pointer: ChainedPointer::Rebase {
                target: 0x0200_0000,
                high8: 0,
                cache_level: 0,
                auth: None,
            },
            next: 4,
        };
        let raw = encode(&rebase, PointerFormat::Ptr32).unwrap();
        assert!(raw <= u32::MAX as u64);
        assert_eq!(decode(raw, PointerFormat::Ptr32).unwrap(), rebase);

        let bind = DecodedFixup {
            pointer: ChainedPointer::Bind {
                ordinal: 0xF_1234,
                addend: 0x3F,
                auth: None,
            },
            next: 0x1F,
        };
        let raw = encode(&bind, PointerFormat::Ptr32).unwrap();
        assert_eq!(decode(raw, PointerFormat::Ptr32).unwrap(), bind);
    }

    #[test]
    fn test_kernel_cache_auth_roundtrip() {
        let fixup = DecodedFixup {
            pointer: ChainedPointer::Rebase {
                target: 0x3FFF_0000,
                high8: 0,
                cache_level: 1,
                auth: Some(AuthData {
                    diversity: 0xBEEF,
                    addr_div: false,
                    key: PtrAuthKey::IB,
                }),
            },
            next: 9,
        };
        let raw = encode(&fixup, PointerFormat::Ptr64KernelCache).unwrap();
        assert_eq!(decode(raw, PointerFormat::Ptr64KernelCache).unwrap(), fixup);
    }

    #[test]
    fn test_shared_cache_keys_limited() {
        let auth = DecodedFixup {
            pointer: ChainedPointer::Rebase {
                target: 0x2_0000_0000,
                high8: 0,
                cache_level: 0,
                auth: Some(AuthData {
                    diversity: 0x5678,
                    addr_div: true,
                    key: PtrAuthKey::DA,
                }),
            },
            next: 1,
        };
        let raw = encode(&auth, PointerFormat::Arm64eSharedCache).unwrap();
        assert_eq!(decode(raw, PointerFormat::Arm64eSharedCache).unwrap(), auth);

        let plain = DecodedFixup {
            pointer: ChainedPointer::Rebase {
                target: 0x1234_5678,
                high8: 0xFF,
                cache_level: 0,
                auth: None,
            },
            next: 0,
        };
        let raw = encode(&plain, PointerFormat::Arm64eSharedCache).unwrap();
        assert_eq!(
            decode(raw, PointerFormat::Arm64eSharedCache).unwrap(),
            plain
        );
    }

    #[test]
    fn test_stride_table() {
        assert_eq!(PointerFormat::Arm64e.stride(), 8);
        assert_eq!(PointerFormat::Arm64eUserland24.stride(), 8);
        assert_eq!(PointerFormat::Arm64eKernel.stride(), 4);
        assert_eq!(PointerFormat::Ptr64.stride(), 4);
        assert_eq!(PointerFormat::X86KernelCache.stride(), 1);
    }

    #[test]
    fn test_unknown_format_rejected() {
        assert!(matches!(
            PointerFormat::from_u16(0x99),
            Err(Error::UnsupportedPointerFormat(0x99))
        ));
    }
}
