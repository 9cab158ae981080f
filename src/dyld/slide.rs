//! Slide-info application across cache data mappings.
//!
//! A shared-cache data mapping encodes its internal pointers through one of
//! five slide-info generations:
//! - v1: per-page bitmaps of 4-byte slots (32-bit caches)
//! - v2: delta-mask chains of 64-bit words
//! - v3: arm64e chains with pointer authentication
//! - v4: delta-mask chains of 32-bit words with non-pointer escapes
//! - v5: arm64e chains with a cache-base value_add (iOS 18+)
//!
//! Application adds one scalar slide to every encoded pointer, in place,
//! exactly once per mapping. All offsets are validated against the declared
//! slide-info and mapping sizes before anything is dereferenced.

use tracing::{debug, trace};
use zerocopy::FromBytes;

use crate::dyld::structs::*;
use crate::error::{Error, Result};
use crate::fixup::engine::PointerSigner;
use crate::util::{read_u16_le_at, read_u32_le_at, read_u64_le_at, write_u32_le_at, write_u64_le_at};

/// Fixed page size of v1 slide info.
const V1_PAGE_SIZE: usize = 0x1000;

fn invalid(offset: usize, reason: impl Into<String>) -> Error {
    Error::InvalidSlideInfo {
        offset: offset as u64,
        reason: reason.into(),
    }
}

fn read_u16_checked(data: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > data.len() {
        return Err(invalid(offset, "slide info truncated"));
    }
    Ok(read_u16_le_at(data, offset))
}

/// Reads the version word of a slide-info blob.
pub fn slide_info_version(slide_info: &[u8]) -> Result<u32> {
    if slide_info.len() < 4 {
        return Err(invalid(0, "slide info smaller than version word"));
    }
    Ok(read_u32_le_at(slide_info, 0))
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters returned by [`apply_slide`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SlideStats {
    /// Slide info version applied
    pub version: u32,
    /// Pages carrying rebases
    pub pages_rebased: usize,
    /// Pages marked no-rebase
    pub pages_no_rebase: usize,
    /// Plain pointers slid
    pub rebases: usize,
    /// Authenticated pointers slid and re-signed
    pub auth_rebases: usize,
    /// v4 non-pointer words carried through unchanged
    pub non_pointers: usize,
}

// =============================================================================
// Entry Points
// =============================================================================

/// Applies `slide` to every encoded pointer of one data mapping.
///
/// `mapping_addr` is the mapping's unslid base address; authenticated
/// pointers are re-signed against their slid slot address. The mapping must
/// be slid exactly once; this function has no idempotence guard of its own
/// (see the first-mapper claim in the orchestrator).
pub fn apply_slide(
    mapping: &mut [u8],
    mapping_addr: u64,
    slide_info: &[u8],
    slide: u64,
    signer: &dyn PointerSigner,
) -> Result<SlideStats> {
    let version = slide_info_version(slide_info)?;
    debug!(version, slide = format_args!("{slide:#x}"), "applying slide info");

    match version {
        1 => apply_v1(mapping, slide_info, slide),
        2 => apply_v2(mapping, slide_info, slide),
        3 => apply_v3(mapping, mapping_addr, slide_info, slide, signer),
        4 => apply_v4(mapping, slide_info, slide),
        5 => apply_v5(mapping, mapping_addr, slide_info, slide, signer),
        other => Err(Error::UnsupportedSlideVersion(other)),
    }
}

/// Applies slide to one mapping of a whole memory-mapped cache file, using
/// the mapping record to locate both the data and its slide info.
pub fn apply_mapping_slide(
    cache: &mut [u8],
    mapping: &DyldCacheMappingAndSlideInfo,
    slide: u64,
    signer: &dyn PointerSigner,
) -> Result<SlideStats> {
    let info_off = mapping.slide_info_file_offset as usize;
    let info_end = info_off
        .checked_add(mapping.slide_info_file_size as usize)
        .filter(|&end| end <= cache.len())
        .ok_or_else(|| invalid(info_off, "slide info extends past cache file"))?;
    let data_off = mapping.file_offset as usize;
    let data_end = data_off
        .checked_add(mapping.size as usize)
        .filter(|&end| end <= cache.len())
        .ok_or_else(|| invalid(data_off, "mapping extends past cache file"))?;

    // The slide info lives outside the data mapping but in the same file;
    // copy it out so the mapping can be mutated.
    let slide_info = cache[info_off..info_end].to_vec();
    apply_slide(
        &mut cache[data_off..data_end],
        mapping.address,
        &slide_info,
        slide,
        signer,
    )
}

// =============================================================================
// v1: Per-Page Bitmaps
// =============================================================================

fn apply_v1(mapping: &mut [u8], slide_info: &[u8], slide: u64) -> Result<SlideStats> {
    let info = DyldCacheSlideInfo1::read_from_prefix(slide_info)
        .map_err(|_| invalid(0, "failed to parse slide info v1"))?
        .0;

    let toc_offset = info.toc_offset as usize;
    let entries_offset = info.entries_offset as usize;
    let entry_size = info.entries_size as usize;
    if entry_size == 0 {
        return Err(invalid(0, "zero bitmap entry size"));
    }

    let mut stats = SlideStats {
        version: 1,
        ..Default::default()
    };

    for page in 0..info.toc_count as usize {
        let toc_entry = read_u16_checked(slide_info, toc_offset + page * 2)? as usize;
        let bitmap_offset = entries_offset + toc_entry * entry_size;
        let bitmap = slide_info
            .get(bitmap_offset..bitmap_offset + entry_size)
            .ok_or_else(|| invalid(bitmap_offset, "bitmap entry past slide info"))?;

        let page_offset = page * V1_PAGE_SIZE;
        let mut any = false;
        for (byte, &bits) in bitmap.iter().enumerate() {
            if bits == 0 {
                continue;
            }
            for bit in 0..8 {
                if bits & (1 << bit) == 0 {
                    continue;
                }
                let offset = page_offset + (byte * 8 + bit) * 4;
                if offset + 4 > mapping.len() {
                    return Err(invalid(offset, "v1 slot past mapping end"));
                }
                let value = read_u32_le_at(mapping, offset);
                write_u32_le_at(mapping, offset, value.wrapping_add(slide as u32));
                stats.rebases += 1;
                any = true;
            }
        }
        if any {
            stats.pages_rebased += 1;
        } else {
            stats.pages_no_rebase += 1;
        }
    }

    Ok(stats)
}

// =============================================================================
// v2: Delta-Mask Chains (64-bit)
// =============================================================================

fn apply_v2(mapping: &mut [u8], slide_info: &[u8], slide: u64) -> Result<SlideStats> {
    let info = DyldCacheSlideInfo2::read_from_prefix(slide_info)
        .map_err(|_| invalid(0, "failed to parse slide info v2"))?
        .0;
    if info.delta_mask == 0 || info.delta_mask.trailing_zeros() < 2 {
        return Err(invalid(0, format!("bad delta mask {:#x}", info.delta_mask)));
    }
    if info.page_size == 0 {
        return Err(invalid(0, "zero page size"));
    }

    let page_size = info.page_size as usize;
    let starts_offset = info.page_starts_offset as usize;
    let extras_offset = info.page_extras_offset as usize;

    let mut stats = SlideStats {
        version: 2,
        ..Default::default()
    };

    for page in 0..info.page_starts_count as usize {
        let start = read_u16_checked(slide_info, starts_offset + page * 2)?;
        if start == DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE {
            stats.pages_no_rebase += 1;
            continue;
        }

        let page_offset = page * page_size;
        if page_offset + page_size > mapping.len() {
            return Err(invalid(page_offset, "v2 page past mapping end"));
        }
        let page_content = &mut mapping[page_offset..page_offset + page_size];

        if start & DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA != 0 {
            let mut index = (start & !DYLD_CACHE_SLIDE_PAGE_ATTRS) as usize;
            loop {
                let extra = read_u16_checked(slide_info, extras_offset + index * 2)?;
                let chain_start = ((extra & !DYLD_CACHE_SLIDE_PAGE_ATTRS) as usize) * 4;
                walk_v2_chain(page_content, chain_start, &info, slide, &mut stats)?;
                if extra & DYLD_CACHE_SLIDE_PAGE_ATTR_END != 0 {
                    break;
                }
                index += 1;
            }
        } else {
            walk_v2_chain(page_content, start as usize * 4, &info, slide, &mut stats)?;
        }
        stats.pages_rebased += 1;
    }

    Ok(stats)
}

fn walk_v2_chain(
    page: &mut [u8],
    start: usize,
    info: &DyldCacheSlideInfo2,
    slide: u64,
    stats: &mut SlideStats,
) -> Result<()> {
    let value_mask = info.value_mask();
    let delta_shift = info.delta_shift();

    let mut offset = start;
    let mut delta = 1usize;
    while delta != 0 {
        if offset + 8 > page.len() {
            return Err(invalid(offset, "v2 chain runs off page"));
        }
        let raw = read_u64_le_at(page, offset);
        delta = ((raw & info.delta_mask) >> delta_shift) as usize;
        let mut value = raw & value_mask;
        if value != 0 {
            value = value.wrapping_add(info.value_add).wrapping_add(slide);
        }
        write_u64_le_at(page, offset, value);
        stats.rebases += 1;
        offset += delta;
    }
    Ok(())
}

// =============================================================================
// v3: arm64e Chains
// =============================================================================

fn apply_v3(
    mapping: &mut [u8],
    mapping_addr: u64,
    slide_info: &[u8],
    slide: u64,
    signer: &dyn PointerSigner,
) -> Result<SlideStats> {
    let info = DyldCacheSlideInfo3::read_from_prefix(slide_info)
        .map_err(|_| invalid(0, "failed to parse slide info v3"))?
        .0;
    if info.page_size == 0 {
        return Err(invalid(0, "zero page size"));
    }

    let page_size = info.page_size as usize;
    let mut stats = SlideStats {
        version: 3,
        ..Default::default()
    };

    for page in 0..info.page_starts_count as usize {
        // Page starts immediately follow the header, as byte offsets.
        let start = read_u16_checked(slide_info, DyldCacheSlideInfo3::SIZE + page * 2)?;
        if start == DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE {
            stats.pages_no_rebase += 1;
            continue;
        }

        let page_offset = page * page_size;
        if page_offset + page_size > mapping.len() {
            return Err(invalid(page_offset, "v3 page past mapping end"));
        }

        let mut offset = start as usize;
        let mut delta = 1usize;
        while delta != 0 {
            if offset + 8 > page_size {
                return Err(invalid(page_offset + offset, "v3 chain runs off page"));
            }
            let slot = page_offset + offset;
            let ptr = SlidePointer3(read_u64_le_at(mapping, slot));
            delta = ptr.offset_to_next() as usize * 8;

            let value = if ptr.is_auth() {
                let target = info
                    .auth_value_add
                    .wrapping_add(ptr.auth_offset() as u64)
                    .wrapping_add(slide);
                let auth = ptr.auth_data();
                stats.auth_rebases += 1;
                signer.sign(
                    target,
                    mapping_addr.wrapping_add(slide) + slot as u64,
                    auth.diversity,
                    auth.addr_div,
                    auth.key,
                )
            } else {
                stats.rebases += 1;
                ptr.plain_value().wrapping_add(slide)
            };
            write_u64_le_at(mapping, slot, value);

            trace!(slot, value = format_args!("{value:#x}"), "slid v3 pointer");
            offset += delta;
        }
        stats.pages_rebased += 1;
    }

    Ok(stats)
}

// =============================================================================
// v4: Delta-Mask Chains (32-bit) With Non-Pointer Escapes
// =============================================================================

fn apply_v4(mapping: &mut [u8], slide_info: &[u8], slide: u64) -> Result<SlideStats> {
    let info = DyldCacheSlideInfo4::read_from_prefix(slide_info)
        .map_err(|_| invalid(0, "failed to parse slide info v4"))?
        .0;
    if info.delta_mask == 0 || info.delta_mask.trailing_zeros() < 2 {
        return Err(invalid(0, format!("bad delta mask {:#x}", info.delta_mask)));
    }
    if info.page_size == 0 {
        return Err(invalid(0, "zero page size"));
    }

    let page_size = info.page_size as usize;
    let starts_offset = info.page_starts_offset as usize;
    let extras_offset = info.page_extras_offset as usize;

    let mut stats = SlideStats {
        version: 4,
        ..Default::default()
    };

    for page in 0..info.page_starts_count as usize {
        let start = read_u16_checked(slide_info, starts_offset + page * 2)?;
        if start == DYLD_CACHE_SLIDE4_PAGE_NO_REBASE {
            stats.pages_no_rebase += 1;
            continue;
        }

        let page_offset = page * page_size;
        if page_offset + page_size > mapping.len() {
            return Err(invalid(page_offset, "v4 page past mapping end"));
        }
        let page_content = &mut mapping[page_offset..page_offset + page_size];

        if start & DYLD_CACHE_SLIDE4_PAGE_USE_EXTRA != 0 {
            let mut index = (start & DYLD_CACHE_SLIDE4_PAGE_INDEX) as usize;
            loop {
                let extra = read_u16_checked(slide_info, extras_offset + index * 2)?;
                let chain_start = ((extra & DYLD_CACHE_SLIDE4_PAGE_INDEX) as usize) * 4;
                walk_v4_chain(page_content, chain_start, &info, slide, &mut stats)?;
                if extra & DYLD_CACHE_SLIDE4_PAGE_EXTRA_END != 0 {
                    break;
                }
                index += 1;
            }
        } else {
            walk_v4_chain(page_content, start as usize * 4, &info, slide, &mut stats)?;
        }
        stats.pages_rebased += 1;
    }

    Ok(stats)
}

fn walk_v4_chain(
    page: &mut [u8],
    start: usize,
    info: &DyldCacheSlideInfo4,
    slide: u64,
    stats: &mut SlideStats,
) -> Result<()> {
    let delta_mask = info.delta_mask as u32;
    let value_mask = info.value_mask();
    let delta_shift = info.delta_shift();

    let mut offset = start;
    let mut delta = 1usize;
    while delta != 0 {
        if offset + 4 > page.len() {
            return Err(invalid(offset, "v4 chain runs off page"));
        }
        let raw = read_u32_le_at(page, offset);
        delta = ((raw & delta_mask) >> delta_shift) as usize;
        let mut value = raw & value_mask;
        if value & 0xFFFF_8000 == 0 {
            // Small positive non-pointer, stored as-is
            stats.non_pointers += 1;
        } else if value & 0x3FFF_8000 == 0x3FFF_8000 {
            // Small negative non-pointer, top bits reconstituted
            value |= 0xC000_0000;
            stats.non_pointers += 1;
        } else {
            value = (value as u64)
                .wrapping_add(info.value_add)
                .wrapping_add(slide) as u32;
            stats.rebases += 1;
        }
        write_u32_le_at(page, offset, value);
        offset += delta;
    }
    Ok(())
}

// =============================================================================
// v5: arm64e Chains With value_add
// =============================================================================

fn apply_v5(
    mapping: &mut [u8],
    mapping_addr: u64,
    slide_info: &[u8],
    slide: u64,
    signer: &dyn PointerSigner,
) -> Result<SlideStats> {
    let info = DyldCacheSlideInfo5::read_from_prefix(slide_info)
        .map_err(|_| invalid(0, "failed to parse slide info v5"))?
        .0;
    if info.page_size == 0 {
        return Err(invalid(0, "zero page size"));
    }

    let page_size = info.page_size as usize;
    let mut stats = SlideStats {
        version: 5,
        ..Default::default()
    };

    for page in 0..info.page_starts_count as usize {
        let start = read_u16_checked(slide_info, DyldCacheSlideInfo5::SIZE + page * 2)?;
        if start == DYLD_CACHE_SLIDE_V5_PAGE_ATTR_NO_REBASE {
            stats.pages_no_rebase += 1;
            continue;
        }

        let page_offset = page * page_size;
        if page_offset + page_size > mapping.len() {
            return Err(invalid(page_offset, "v5 page past mapping end"));
        }

        let mut offset = start as usize;
        let mut delta = 1usize;
        while delta != 0 {
            if offset + 8 > page_size {
                return Err(invalid(page_offset + offset, "v5 chain runs off page"));
            }
            let slot = page_offset + offset;
            let ptr = SlidePointer5(read_u64_le_at(mapping, slot));
            delta = ptr.next() as usize * 8;

            let target = ptr
                .runtime_offset()
                .wrapping_add(info.value_add)
                .wrapping_add(slide);
            let value = if ptr.is_auth() {
                let auth = ptr.auth_data();
                stats.auth_rebases += 1;
                signer.sign(
                    target,
                    mapping_addr.wrapping_add(slide) + slot as u64,
                    auth.diversity,
                    auth.addr_div,
                    auth.key,
                )
            } else {
                stats.rebases += 1;
                target | ((ptr.high8() as u64) << 56)
            };
            write_u64_le_at(mapping, slot, value);
            offset += delta;
        }
        stats.pages_rebased += 1;
    }

    Ok(stats)
}

// =============================================================================
// Page Descriptors
// =============================================================================

/// Chain starts of one page, in a form transferable to a page-in linking
/// mechanism: every descriptor is independent, so pages can be slid lazily
/// and in any order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    /// Page index within the mapping
    pub page_index: usize,
    /// Byte offsets of chain starts within the page (v1: every slot is its
    /// own one-entry chain)
    pub chain_starts: Vec<u32>,
}

/// Extracts per-page chain descriptors without touching any mapping data.
/// Pages with nothing to rebase are omitted.
pub fn page_descriptors(slide_info: &[u8]) -> Result<Vec<PageDescriptor>> {
    let version = slide_info_version(slide_info)?;
    match version {
        1 => {
            let info = DyldCacheSlideInfo1::read_from_prefix(slide_info)
                .map_err(|_| invalid(0, "failed to parse slide info v1"))?
                .0;
            let entry_size = info.entries_size as usize;
            if entry_size == 0 {
                return Err(invalid(0, "zero bitmap entry size"));
            }
            let mut pages = Vec::new();
            for page in 0..info.toc_count as usize {
                let toc_entry =
                    read_u16_checked(slide_info, info.toc_offset as usize + page * 2)? as usize;
                let bitmap_offset = info.entries_offset as usize + toc_entry * entry_size;
                let bitmap = slide_info
                    .get(bitmap_offset..bitmap_offset + entry_size)
                    .ok_or_else(|| invalid(bitmap_offset, "bitmap entry past slide info"))?;
                let mut starts = Vec::new();
                for (byte, &bits) in bitmap.iter().enumerate() {
                    for bit in 0..8 {
                        if bits & (1 << bit) != 0 {
                            starts.push(((byte * 8 + bit) * 4) as u32);
                        }
                    }
                }
                if !starts.is_empty() {
                    pages.push(PageDescriptor {
                        page_index: page,
                        chain_starts: starts,
                    });
                }
            }
            Ok(pages)
        }

        2 => {
            let info = DyldCacheSlideInfo2::read_from_prefix(slide_info)
                .map_err(|_| invalid(0, "failed to parse slide info v2"))?
                .0;
            delta_mask_descriptors(
                slide_info,
                info.page_starts_offset as usize,
                info.page_starts_count as usize,
                info.page_extras_offset as usize,
                DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE,
                DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA,
                !DYLD_CACHE_SLIDE_PAGE_ATTRS,
                DYLD_CACHE_SLIDE_PAGE_ATTR_END,
            )
        }

        4 => {
            let info = DyldCacheSlideInfo4::read_from_prefix(slide_info)
                .map_err(|_| invalid(0, "failed to parse slide info v4"))?
                .0;
            delta_mask_descriptors(
                slide_info,
                info.page_starts_offset as usize,
                info.page_starts_count as usize,
                info.page_extras_offset as usize,
                DYLD_CACHE_SLIDE4_PAGE_NO_REBASE,
                DYLD_CACHE_SLIDE4_PAGE_USE_EXTRA,
                DYLD_CACHE_SLIDE4_PAGE_INDEX,
                DYLD_CACHE_SLIDE4_PAGE_EXTRA_END,
            )
        }

        3 | 5 => {
            // Identical start-table shape; only the header size differs.
            let (count, base, no_rebase) = if version == 3 {
                let info = DyldCacheSlideInfo3::read_from_prefix(slide_info)
                    .map_err(|_| invalid(0, "failed to parse slide info v3"))?
                    .0;
                (
                    info.page_starts_count as usize,
                    DyldCacheSlideInfo3::SIZE,
                    DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE,
                )
            } else {
                let info = DyldCacheSlideInfo5::read_from_prefix(slide_info)
                    .map_err(|_| invalid(0, "failed to parse slide info v5"))?
                    .0;
                (
                    info.page_starts_count as usize,
                    DyldCacheSlideInfo5::SIZE,
                    DYLD_CACHE_SLIDE_V5_PAGE_ATTR_NO_REBASE,
                )
            };
            let mut pages = Vec::new();
            for page in 0..count {
                let start = read_u16_checked(slide_info, base + page * 2)?;
                if start == no_rebase {
                    continue;
                }
                pages.push(PageDescriptor {
                    page_index: page,
                    chain_starts: vec![start as u32],
                });
            }
            Ok(pages)
        }

        other => Err(Error::UnsupportedSlideVersion(other)),
    }
}

#[allow(clippy::too_many_arguments)]
fn delta_mask_descriptors(
    slide_info: &[u8],
    starts_offset: usize,
    starts_count: usize,
    extras_offset: usize,
    no_rebase: u16,
    use_extra: u16,
    index_mask: u16,
    extra_end: u16,
) -> Result<Vec<PageDescriptor>> {
    let mut pages = Vec::new();
    for page in 0..starts_count {
        let start = read_u16_checked(slide_info, starts_offset + page * 2)?;
        if start == no_rebase {
            continue;
        }
        let mut starts = Vec::new();
        if start & use_extra != 0 {
            let mut index = (start & index_mask) as usize;
            loop {
                let extra = read_u16_checked(slide_info, extras_offset + index * 2)?;
                starts.push((extra & index_mask) as u32 * 4);
                if extra & extra_end != 0 {
                    break;
                }
                index += 1;
            }
        } else {
            starts.push(start as u32 * 4);
        }
        pages.push(PageDescriptor {
            page_index: page,
            chain_starts: starts,
        });
    }
    Ok(pages)
}

// =============================================================================
// Description
// =============================================================================

/// Summary of one slide-info blob for diagnostics.
#[derive(Debug, Clone)]
pub struct SlideInfoDescription {
    /// Slide info version
    pub version: u32,
    /// Page size in bytes
    pub page_size: u32,
    /// Total pages covered
    pub page_count: usize,
    /// Pages carrying rebases
    pub pages_with_rebases: usize,
    /// Total chain starts across all pages
    pub chain_starts: usize,
}

impl std::fmt::Display for SlideInfoDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "slide info v{}: {} pages of {:#x} bytes, {} with rebases, {} chains",
            self.version, self.page_count, self.page_size, self.pages_with_rebases, self.chain_starts
        )
    }
}

/// Describes a slide-info blob without applying it.
pub fn describe(slide_info: &[u8]) -> Result<SlideInfoDescription> {
    let version = slide_info_version(slide_info)?;
    let (page_size, page_count) = match version {
        1 => {
            let info = DyldCacheSlideInfo1::read_from_prefix(slide_info)
                .map_err(|_| invalid(0, "failed to parse slide info v1"))?
                .0;
            (V1_PAGE_SIZE as u32, info.toc_count as usize)
        }
        2 => {
            let info = DyldCacheSlideInfo2::read_from_prefix(slide_info)
                .map_err(|_| invalid(0, "failed to parse slide info v2"))?
                .0;
            (info.page_size, info.page_starts_count as usize)
        }
        3 => {
            let info = DyldCacheSlideInfo3::read_from_prefix(slide_info)
                .map_err(|_| invalid(0, "failed to parse slide info v3"))?
                .0;
            (info.page_size, info.page_starts_count as usize)
        }
        4 => {
            let info = DyldCacheSlideInfo4::read_from_prefix(slide_info)
                .map_err(|_| invalid(0, "failed to parse slide info v4"))?
                .0;
            (info.page_size, info.page_starts_count as usize)
        }
        5 => {
            let info = DyldCacheSlideInfo5::read_from_prefix(slide_info)
                .map_err(|_| invalid(0, "failed to parse slide info v5"))?
                .0;
            (info.page_size, info.page_starts_count as usize)
        }
        other => return Err(Error::UnsupportedSlideVersion(other)),
    };

    let pages = page_descriptors(slide_info)?;
    Ok(SlideInfoDescription {
        version,
        page_size,
        page_count,
        pages_with_rebases: pages.len(),
        chain_starts: pages.iter().map(|p| p.chain_starts.len()).sum(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixup::engine::NullSigner;
    use crate::macho::PtrAuthKey;
    use zerocopy::IntoBytes;

    const PAGE: usize = 0x1000;

    fn v2_info(starts: &[u16], extras: &[u16]) -> Vec<u8> {
        let header = DyldCacheSlideInfo2 {
            version: 2,
            page_size: PAGE as u32,
            page_starts_offset: DyldCacheSlideInfo2::SIZE as u32,
            page_starts_count: starts.len() as u32,
            page_extras_offset: (DyldCacheSlideInfo2::SIZE + starts.len() * 2) as u32,
            page_extras_count: extras.len() as u32,
            delta_mask: 0x00FF_0000_0000_0000,
            value_add: 0,
        };
        let mut blob = header.as_bytes().to_vec();
        for s in starts.iter().chain(extras) {
            blob.extend_from_slice(&s.to_le_bytes());
        }
        blob
    }

    /// Encodes a v2 word: 16-bit delta field at bit 48, byte delta = field*4.
    fn v2_word(value: u64, byte_delta: u64) -> u64 {
        value | ((byte_delta / 4) << 48)
    }

    #[test]
    fn test_v2_two_pointer_page() {
        // Two pointers 8 bytes apart, slide 0x10000000, value_add 0.
        let mut mapping = vec![0u8; PAGE];
        write_u64_le_at(&mut mapping, 0, v2_word(0x4000, 8));
        write_u64_le_at(&mut mapping, 8, v2_word(0x8000, 0));

        let info = v2_info(&[0], &[]);
        let stats = apply_slide(&mut mapping, 0, &info, 0x1000_0000, &NullSigner).unwrap();

        assert_eq!(stats.rebases, 2);
        assert_eq!(read_u64_le_at(&mapping, 0), 0x1000_4000);
        assert_eq!(read_u64_le_at(&mapping, 8), 0x1000_8000);
        // Trailing page bytes untouched
        assert_eq!(read_u64_le_at(&mapping, 16), 0);
    }

    #[test]
    fn test_v2_zero_value_not_biased() {
        // A zero word in the chain stays zero even with value_add set.
        let mut info = v2_info(&[0], &[]);
        // Patch value_add to a nonzero cache base
        info[32..40].copy_from_slice(&0x1_8000_0000u64.to_le_bytes());

        let mut mapping = vec![0u8; PAGE];
        write_u64_le_at(&mut mapping, 0, v2_word(0, 8));
        write_u64_le_at(&mut mapping, 8, v2_word(0x10, 0));

        apply_slide(&mut mapping, 0, &info, 0x2000, &NullSigner).unwrap();
        assert_eq!(read_u64_le_at(&mapping, 0), 0);
        assert_eq!(read_u64_le_at(&mapping, 8), 0x1_8000_2010);
    }

    #[test]
    fn test_v2_extras_pages() {
        // Page 0 uses the extras table: two chains, at 0x0 and 0x100.
        let starts = [DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA | 0];
        let extras = [
            0u16, // chain at 0x0
            (0x100 / 4) as u16 | DYLD_CACHE_SLIDE_PAGE_ATTR_END,
        ];
        let info = v2_info(&starts, &extras);

        let mut mapping = vec![0u8; PAGE];
        write_u64_le_at(&mut mapping, 0, v2_word(0x1000, 0));
        write_u64_le_at(&mut mapping, 0x100, v2_word(0x2000, 0));

        let stats = apply_slide(&mut mapping, 0, &info, 0x10, &NullSigner).unwrap();
        assert_eq!(stats.rebases, 2);
        assert_eq!(read_u64_le_at(&mapping, 0), 0x1010);
        assert_eq!(read_u64_le_at(&mapping, 0x100), 0x2010);
    }

    #[test]
    fn test_v2_no_rebase_page_skipped() {
        let info = v2_info(&[DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE, 0], &[]);
        let mut mapping = vec![0u8; 2 * PAGE];
        write_u64_le_at(&mut mapping, 0, 0xDEAD_BEEF);
        write_u64_le_at(&mut mapping, PAGE, v2_word(0x4000, 0));

        let stats = apply_slide(&mut mapping, 0, &info, 0x1000, &NullSigner).unwrap();
        assert_eq!(stats.pages_no_rebase, 1);
        assert_eq!(read_u64_le_at(&mapping, 0), 0xDEAD_BEEF);
        assert_eq!(read_u64_le_at(&mapping, PAGE), 0x5000);
    }

    fn v1_info(toc_count: usize, bitmap: &[u8]) -> Vec<u8> {
        assert_eq!(bitmap.len(), 128);
        let header = DyldCacheSlideInfo1 {
            version: 1,
            toc_offset: DyldCacheSlideInfo1::SIZE as u32,
            toc_count: toc_count as u32,
            entries_offset: (DyldCacheSlideInfo1::SIZE + toc_count * 2) as u32,
            entries_count: 1,
            entries_size: 128,
        };
        let mut blob = header.as_bytes().to_vec();
        for _ in 0..toc_count {
            blob.extend_from_slice(&0u16.to_le_bytes());
        }
        blob.extend_from_slice(bitmap);
        blob
    }

    #[test]
    fn test_v1_bitmap_slots() {
        // Bits for slots at byte offsets 0 and 44: j=0/k=0 and j=1/k=3.
        let mut bitmap = [0u8; 128];
        bitmap[0] = 1 << 0;
        bitmap[1] = 1 << 3;
        let info = v1_info(1, &bitmap);

        let mut mapping = vec![0u8; PAGE];
        write_u32_le_at(&mut mapping, 0, 0x8000_1000);
        write_u32_le_at(&mut mapping, 44, 0x8000_2000);
        write_u32_le_at(&mut mapping, 48, 0x8000_3000);

        let stats = apply_slide(&mut mapping, 0, &info, 0x4000, &NullSigner).unwrap();
        assert_eq!(stats.rebases, 2);
        assert_eq!(read_u32_le_at(&mapping, 0), 0x8000_5000);
        assert_eq!(read_u32_le_at(&mapping, 44), 0x8000_6000);
        // Unmarked slot untouched
        assert_eq!(read_u32_le_at(&mapping, 48), 0x8000_3000);
    }

    fn v3_info(starts: &[u16], auth_value_add: u64) -> Vec<u8> {
        let header = DyldCacheSlideInfo3 {
            version: 3,
            page_size: PAGE as u32,
            page_starts_count: starts.len() as u32,
            _pad: 0,
            auth_value_add,
        };
        let mut blob = header.as_bytes().to_vec();
        for s in starts {
            blob.extend_from_slice(&s.to_le_bytes());
        }
        blob
    }

    #[test]
    fn test_v3_plain_and_auth() {
        let info = v3_info(&[0], 0x1_8000_0000);

        let mut mapping = vec![0u8; PAGE];
        // Plain: top8 0x12 at bits 43..50, bottom bits 0x4000, next = 1 slot
        let plain = (1u64 << 51) | (0x12u64 << 43) | 0x4000;
        write_u64_le_at(&mut mapping, 0, plain);
        // Auth: key DA, addr_div, diversity 0x1234, offset 0x100, end of chain
        let auth =
            (1u64 << 63) | (2u64 << 49) | (1u64 << 48) | (0x1234u64 << 32) | 0x100;
        write_u64_le_at(&mut mapping, 8, auth);

        struct TagSigner;
        impl crate::fixup::engine::PointerSigner for TagSigner {
            fn sign(&self, target: u64, _: u64, d: u16, a: bool, k: PtrAuthKey) -> u64 {
                target | ((d as u64) << 40) | ((a as u64) << 62) | ((k as u64) << 60)
            }
        }

        let slide = 0x2000u64;
        let stats = apply_slide(&mut mapping, 0x1_8000_0000, &info, slide, &TagSigner).unwrap();
        assert_eq!(stats.rebases, 1);
        assert_eq!(stats.auth_rebases, 1);

        assert_eq!(
            read_u64_le_at(&mapping, 0),
            (0x12u64 << 56) | 0x4000 | slide
        );
        let signed = read_u64_le_at(&mapping, 8);
        assert_eq!(signed & 0xFF_FFFF_FFFF, 0x1_8000_0000 + 0x100 + slide);
        assert_eq!((signed >> 40) & 0xFFFF, 0x1234);
        assert_eq!((signed >> 60) & 0x3, PtrAuthKey::DA as u64);
    }

    fn v4_info(starts: &[u16], extras: &[u16], value_add: u64) -> Vec<u8> {
        let header = DyldCacheSlideInfo4 {
            version: 4,
            page_size: PAGE as u32,
            page_starts_offset: DyldCacheSlideInfo4::SIZE as u32,
            page_starts_count: starts.len() as u32,
            page_extras_offset: (DyldCacheSlideInfo4::SIZE + starts.len() * 2) as u32,
            page_extras_count: extras.len() as u32,
            delta_mask: 0xC000_0000,
            value_add,
        };
        let mut blob = header.as_bytes().to_vec();
        for s in starts.iter().chain(extras) {
            blob.extend_from_slice(&s.to_le_bytes());
        }
        blob
    }

    /// Encodes a v4 word: 2-bit delta field at bit 30, byte delta = field*4.
    fn v4_word(value: u32, byte_delta: u32) -> u32 {
        value | ((byte_delta / 4) << 30)
    }

    #[test]
    fn test_v4_non_pointer_escapes() {
        let info = v4_info(&[0], &[], 0x1000_0000);

        let mut mapping = vec![0u8; PAGE];
        // Small positive, small negative, then a real pointer.
        write_u32_le_at(&mut mapping, 0, v4_word(0x1234, 4));
        write_u32_le_at(&mut mapping, 4, v4_word(0x3FFF_9000, 4));
        write_u32_le_at(&mut mapping, 8, v4_word(0x0010_4000, 0));

        let stats = apply_slide(&mut mapping, 0, &info, 0x2000, &NullSigner).unwrap();
        assert_eq!(stats.non_pointers, 2);
        assert_eq!(stats.rebases, 1);

        assert_eq!(read_u32_le_at(&mapping, 0), 0x1234);
        assert_eq!(read_u32_le_at(&mapping, 4), 0xFFFF_9000);
        assert_eq!(read_u32_le_at(&mapping, 8), 0x1010_6000);
    }

    fn v5_info(starts: &[u16], value_add: u64) -> Vec<u8> {
        let header = DyldCacheSlideInfo5 {
            version: 5,
            page_size: PAGE as u32,
            page_starts_count: starts.len() as u32,
            _pad: 0,
            value_add,
        };
        let mut blob = header.as_bytes().to_vec();
        for s in starts {
            blob.extend_from_slice(&s.to_le_bytes());
        }
        blob
    }

    #[test]
    fn test_v5_value_add_and_high8() {
        let info = v5_info(&[0], 0x1_8000_0000);

        let mut mapping = vec![0u8; PAGE];
        // Plain pointer, runtime offset 0x4000, high8 0xFE, next one slot
        let plain = (1u64 << 52) | (0xFEu64 << 34) | 0x4000;
        write_u64_le_at(&mut mapping, 0, plain);
        // Auth pointer, runtime offset 0x100, IA key, chain end
        let auth = (1u64 << 63) | 0x100;
        write_u64_le_at(&mut mapping, 8, auth);

        let slide = 0x6000u64;
        let stats = apply_slide(&mut mapping, 0, &info, slide, &NullSigner).unwrap();
        assert_eq!(stats.rebases, 1);
        assert_eq!(stats.auth_rebases, 1);

        assert_eq!(
            read_u64_le_at(&mapping, 0),
            (0xFEu64 << 56) | (0x1_8000_0000 + 0x4000 + slide)
        );
        assert_eq!(read_u64_le_at(&mapping, 8), 0x1_8000_0000 + 0x100 + slide);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut blob = vec![0u8; 24];
        blob[..4].copy_from_slice(&9u32.to_le_bytes());
        let mut mapping = vec![0u8; PAGE];
        assert!(matches!(
            apply_slide(&mut mapping, 0, &blob, 0, &NullSigner),
            Err(Error::UnsupportedSlideVersion(9))
        ));
    }

    #[test]
    fn test_chain_off_page_rejected() {
        // Delta that steps past the page end.
        let info = v2_info(&[((PAGE - 8) / 4) as u16], &[]);
        let mut mapping = vec![0u8; PAGE];
        write_u64_le_at(&mut mapping, PAGE - 8, v2_word(0x4000, 16));

        let err = apply_slide(&mut mapping, 0, &info, 0, &NullSigner).unwrap_err();
        assert!(matches!(err, Error::InvalidSlideInfo { .. }));
        assert!(err.is_process_fatal());
    }

    #[test]
    fn test_versions_agree_on_equivalent_pages() {
        // The same logical pointer encoded per version slides to the same
        // final value: 0x1_8000_4000 + 0x2000 for the 64-bit generations.
        let slide = 0x2000u64;
        let expect64 = 0x1_8000_4000u64 + slide;

        let mut m2 = vec![0u8; PAGE];
        write_u64_le_at(&mut m2, 0, v2_word(0x1_8000_4000, 0));
        apply_slide(&mut m2, 0, &v2_info(&[0], &[]), slide, &NullSigner).unwrap();
        assert_eq!(read_u64_le_at(&m2, 0), expect64);

        let mut m3 = vec![0u8; PAGE];
        write_u64_le_at(&mut m3, 0, 0x1_8000_4000); // fits in 43 bits, top8 = 0
        apply_slide(&mut m3, 0, &v3_info(&[0], 0), slide, &NullSigner).unwrap();
        assert_eq!(read_u64_le_at(&m3, 0), expect64);

        let mut m5 = vec![0u8; PAGE];
        write_u64_le_at(&mut m5, 0, 0x1_8000_4000); // fits in 34 bits
        apply_slide(&mut m5, 0, &v5_info(&[0], 0), slide, &NullSigner).unwrap();
        assert_eq!(read_u64_le_at(&m5, 0), expect64);

        // 32-bit generations: 0x0010_4000 + slide.
        let expect32 = 0x0010_4000u32 + slide as u32;

        let mut bitmap = [0u8; 128];
        bitmap[0] = 1;
        let mut m1 = vec![0u8; PAGE];
        write_u32_le_at(&mut m1, 0, 0x0010_4000);
        apply_slide(&mut m1, 0, &v1_info(1, &bitmap), slide, &NullSigner).unwrap();
        assert_eq!(read_u32_le_at(&m1, 0), expect32);

        let mut m4 = vec![0u8; PAGE];
        write_u32_le_at(&mut m4, 0, v4_word(0x0010_4000, 0));
        apply_slide(&mut m4, 0, &v4_info(&[0], &[], 0), slide, &NullSigner).unwrap();
        assert_eq!(read_u32_le_at(&m4, 0), expect32);
    }

    #[test]
    fn test_page_descriptors_v2_extras() {
        let starts = [
            DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE,
            DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA | 0,
            8,
        ];
        let extras = [4u16, 16 | DYLD_CACHE_SLIDE_PAGE_ATTR_END];
        let info = v2_info(&starts, &extras);

        let pages = page_descriptors(&info).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page_index, 1);
        assert_eq!(pages[0].chain_starts, vec![16, 64]);
        assert_eq!(pages[1].page_index, 2);
        assert_eq!(pages[1].chain_starts, vec![32]);
    }

    #[test]
    fn test_describe_summary() {
        let info = v2_info(&[DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE, 0, 4], &[]);
        let desc = describe(&info).unwrap();
        assert_eq!(desc.version, 2);
        assert_eq!(desc.page_count, 3);
        assert_eq!(desc.pages_with_rebases, 2);
        assert_eq!(desc.chain_starts, 2);
    }

    #[test]
    fn test_apply_mapping_slide_slices_cache() {
        // A cache file with the data mapping at 0x1000 and slide info after.
        let info = v2_info(&[0], &[]);
        let mut cache = vec![0u8; 0x2000 + info.len()];
        write_u64_le_at(&mut cache, 0x1000, v2_word(0x4000, 0));
        cache[0x2000..].copy_from_slice(&info);

        let mapping = DyldCacheMappingAndSlideInfo {
            address: 0x1_8000_0000,
            size: PAGE as u64,
            file_offset: 0x1000,
            slide_info_file_offset: 0x2000,
            slide_info_file_size: info.len() as u64,
            flags: MappingFlags::DIRTY_DATA.bits(),
            max_prot: 3,
            init_prot: 3,
        };
        assert!(mapping.has_slide_info());
        assert_eq!(mapping.mapping_flags(), MappingFlags::DIRTY_DATA);

        let stats = apply_mapping_slide(&mut cache, &mapping, 0x1000, &NullSigner).unwrap();
        assert_eq!(stats.rebases, 1);
        assert_eq!(read_u64_le_at(&cache, 0x1000), 0x5000);
    }
}
