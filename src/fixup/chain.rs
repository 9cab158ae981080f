//! Chain walking and fixup application.
//!
//! Fixups are stored as in-place chains: each relocation word carries the
//! distance to the next one, and per-page chain-start tables locate the
//! first word of each page's chain. Walking reads the link before the word
//! is overwritten, so one pass both resolves and relinks nothing.

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::fixup::format::{self, ChainedPointer, DecodedFixup, PointerFormat};
use crate::macho::constants::*;
use crate::macho::structs::{ChainedFixupsHeader, ChainedStartsInSegment};
use crate::macho::{ImageContext, SegmentInfo};
use crate::util::{read_u32_le_at, read_u64_le_at, write_u32_le_at, write_u64_le_at};
use zerocopy::FromBytes;

use super::engine::PointerSigner;

// =============================================================================
// Parsed Chain Starts
// =============================================================================

/// Owned copy of one segment's chain-start table.
///
/// Owning the table lets the applier mutate the image data while iterating;
/// the LINKEDIT blob itself is never written.
#[derive(Debug, Clone)]
pub struct SegmentChains {
    /// Index of the segment in load-command order
    pub seg_index: usize,
    /// Page size for this segment
    pub page_size: u16,
    /// Format of every chain in the segment
    pub format: PointerFormat,
    /// VM offset of the segment from the image load address
    pub segment_offset: u64,
    /// 32-bit formats: values above this are non-pointers
    pub max_valid_pointer: u32,
    /// Number of pages covered
    pub page_count: u16,
    /// page_start entries, including multi-start overflow entries
    pub page_starts: Vec<u16>,
}

/// Parses the chained-fixups header out of the LINKEDIT blob.
pub fn parse_header(blob: &[u8]) -> Result<ChainedFixupsHeader> {
    let header = ChainedFixupsHeader::read_from_prefix(blob)
        .map_err(|_| Error::malformed(0, "chained fixups blob too small for header"))?
        .0;
    if header.fixups_version != DYLD_CHAINED_FIXUPS_VERSION {
        return Err(Error::malformed(
            0,
            format!("unknown chained fixups version {}", header.fixups_version),
        ));
    }
    Ok(header)
}

/// Parses `dyld_chained_starts_in_image` and every per-segment record into
/// owned [`SegmentChains`]. Segments with a zero seg_info offset have no
/// fixups and produce no entry.
pub fn parse_starts(image: &ImageContext) -> Result<Vec<SegmentChains>> {
    let blob = image.chained_fixups_data()?;
    let header = parse_header(blob)?;

    let starts_offset = header.starts_offset as usize;
    if starts_offset + 4 > blob.len() {
        return Err(Error::malformed(
            starts_offset,
            "chain starts offset past blob end",
        ));
    }
    let seg_count = read_u32_le_at(blob, starts_offset) as usize;
    if starts_offset + 4 + seg_count * 4 > blob.len() {
        return Err(Error::malformed(
            starts_offset,
            format!("chain starts table truncated ({seg_count} segments)"),
        ));
    }
    if seg_count > image.segment_count() {
        return Err(Error::malformed(
            starts_offset,
            format!(
                "chain starts name {seg_count} segments, image has {}",
                image.segment_count()
            ),
        ));
    }

    let mut segments = Vec::new();
    for seg_index in 0..seg_count {
        let info_offset = read_u32_le_at(blob, starts_offset + 4 + seg_index * 4) as usize;
        if info_offset == 0 {
            continue;
        }

        let record_offset = starts_offset + info_offset;
        let record = ChainedStartsInSegment::read_from_prefix(
            blob.get(record_offset..)
                .ok_or_else(|| Error::malformed(record_offset, "seg_info offset past blob end"))?,
        )
        .map_err(|_| Error::malformed(record_offset, "truncated chain starts record"))?
        .0;

        let record_size = record.size as usize;
        let starts_bytes = record_size
            .checked_sub(ChainedStartsInSegment::PAGE_STARTS_OFFSET)
            .ok_or_else(|| Error::malformed(record_offset, "chain starts record size too small"))?;
        if record_offset + record_size > blob.len() {
            return Err(Error::malformed(
                record_offset,
                "chain starts record extends past blob",
            ));
        }
        let entry_count = starts_bytes / 2;
        if (record.page_count as usize) > entry_count {
            return Err(Error::malformed(
                record_offset,
                format!(
                    "page_count {} exceeds {} page_start entries",
                    record.page_count, entry_count
                ),
            ));
        }
        if record.page_size == 0 || !record.page_size.is_power_of_two() {
            return Err(Error::malformed(
                record_offset,
                format!("bad page size {:#x}", record.page_size),
            ));
        }

        let starts_base = record_offset + ChainedStartsInSegment::PAGE_STARTS_OFFSET;
        let page_starts = (0..entry_count)
            .map(|i| read_u16_le(blob, starts_base + i * 2))
            .collect();

        segments.push(SegmentChains {
            seg_index,
            page_size: record.page_size,
            format: PointerFormat::from_u16(record.pointer_format)?,
            segment_offset: record.segment_offset,
            max_valid_pointer: record.max_valid_pointer,
            page_count: record.page_count,
            page_starts,
        });
    }

    Ok(segments)
}

#[inline]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Reports the pointer format of the first segment carrying fixups.
pub fn chained_pointer_format(image: &ImageContext) -> Result<Option<PointerFormat>> {
    if image.chained_fixups_command().is_none() {
        return Ok(None);
    }
    Ok(parse_starts(image)?.first().map(|s| s.format))
}

// =============================================================================
// Chain Iteration
// =============================================================================

/// One fixup position handed to a visitor before any mutation.
#[derive(Debug, Clone, Copy)]
pub struct FixupLocation {
    /// Segment index in load-command order
    pub segment: usize,
    /// Page index within the segment
    pub page: usize,
    /// File offset of the relocation word
    pub file_offset: usize,
    /// VM offset of the slot from the image load address
    pub vm_offset: u64,
    /// Raw on-disk word (pre-mutation value)
    pub raw: u64,
    /// Decoded form
    pub fixup: DecodedFixup,
    /// Format of the containing chain
    pub format: PointerFormat,
    /// True for 32-bit non-pointer chain members
    pub non_pointer: bool,
}

/// Resolves a chain position to a checked file offset. The word must lie
/// fully inside the segment's mapped file extent.
fn chain_file_offset(
    image: &ImageContext,
    seg: &SegmentInfo,
    chains: &SegmentChains,
    page: usize,
    vm_offset: u64,
) -> Result<usize> {
    let seg_vm_off = seg
        .command
        .vmaddr
        .checked_sub(image.preferred_load_address())
        .ok_or_else(|| {
            Error::bad_chain(
                chains.seg_index,
                page,
                vm_offset,
                "segment below image load address",
            )
        })?;
    let word = chains.format.word_size() as u64;
    let seg_end = seg_vm_off.checked_add(seg.command.filesize);
    let slot_end = vm_offset.checked_add(word);
    match (seg_end, slot_end) {
        (Some(seg_end), Some(slot_end)) if vm_offset >= seg_vm_off && slot_end <= seg_end => {}
        _ => {
            return Err(Error::bad_chain(
                chains.seg_index,
                page,
                vm_offset,
                "chain step lands outside segment",
            ));
        }
    }
    let file_offset = (seg.command.fileoff + (vm_offset - seg_vm_off)) as usize;
    if file_offset + chains.format.word_size() > image.as_bytes().len() {
        return Err(Error::bad_chain(
            chains.seg_index,
            page,
            vm_offset,
            "chain step past end of file",
        ));
    }
    Ok(file_offset)
}

/// Walks one chain, handing each decoded location to `visit`.
///
/// `visit` returns `false` to stop the whole walk. 32-bit non-pointer chain
/// members are skipped unless `notify_non_pointers` is set; either way their
/// link is followed. The chain must terminate within
/// `segment filesize / stride` steps.
fn walk_one_chain<F>(
    image: &ImageContext,
    chains: &SegmentChains,
    page: usize,
    offset_in_page: u64,
    notify_non_pointers: bool,
    visit: &mut F,
) -> Result<bool>
where
    F: FnMut(&FixupLocation) -> Result<bool>,
{
    let seg = image
        .segment_at(chains.seg_index)
        .ok_or_else(|| Error::bad_chain(chains.seg_index, page, 0, "no such segment"))?;
    let stride = chains.format.stride();
    let max_steps = seg.command.filesize / stride + 1;

    let mut vm_offset = chains
        .segment_offset
        .checked_add((page as u64) * (chains.page_size as u64) + offset_in_page)
        .ok_or_else(|| Error::bad_chain(chains.seg_index, page, 0, "chain start overflows"))?;
    let mut steps = 0u64;

    loop {
        if steps >= max_steps {
            return Err(Error::bad_chain(
                chains.seg_index,
                page,
                vm_offset,
                "chain does not terminate within segment bounds",
            ));
        }
        steps += 1;

        let file_offset = chain_file_offset(image, seg, chains, page, vm_offset)?;
        let raw = match chains.format.word_size() {
            4 => read_u32_le_at(image.as_bytes(), file_offset) as u64,
            _ => read_u64_le_at(image.as_bytes(), file_offset),
        };
        let fixup = format::decode(raw, chains.format)?;

        let non_pointer = chains.format == PointerFormat::Ptr32
            && matches!(
                fixup.pointer,
                ChainedPointer::Rebase { target, .. }
                    if target > chains.max_valid_pointer as u64
            );

        if !non_pointer || notify_non_pointers {
            let location = FixupLocation {
                segment: chains.seg_index,
                page,
                file_offset,
                vm_offset,
                raw,
                fixup,
                format: chains.format,
                non_pointer,
            };
            if !visit(&location)? {
                return Ok(false);
            }
        }

        if fixup.next == 0 {
            return Ok(true);
        }
        vm_offset = vm_offset
            .checked_add(fixup.next as u64 * stride)
            .ok_or_else(|| {
                Error::bad_chain(chains.seg_index, page, vm_offset, "chain step overflows")
            })?;
    }
}

/// Drives every chain of one segment through `visit`, handling the NONE,
/// MULTI, and LAST page-start encodings.
fn walk_segment_chains<F>(
    image: &ImageContext,
    chains: &SegmentChains,
    notify_non_pointers: bool,
    visit: &mut F,
) -> Result<bool>
where
    F: FnMut(&FixupLocation) -> Result<bool>,
{
    for page in 0..chains.page_count as usize {
        let entry = chains.page_starts[page];
        if entry == DYLD_CHAINED_PTR_START_NONE {
            continue;
        }
        if entry & DYLD_CHAINED_PTR_START_MULTI != 0 {
            let mut overflow = (entry & !DYLD_CHAINED_PTR_START_MULTI) as usize;
            loop {
                let e = *chains.page_starts.get(overflow).ok_or(
                    Error::PageStartOutOfBounds {
                        index: overflow,
                        max: chains.page_starts.len(),
                    },
                )?;
                let last = e & DYLD_CHAINED_PTR_START_LAST != 0;
                let offset_in_page = (e & !DYLD_CHAINED_PTR_START_LAST) as u64;
                if !walk_one_chain(image, chains, page, offset_in_page, notify_non_pointers, visit)?
                {
                    return Ok(false);
                }
                if last {
                    break;
                }
                overflow += 1;
            }
        } else if !walk_one_chain(image, chains, page, entry as u64, notify_non_pointers, visit)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Walks every fixup chain in the image read-only.
///
/// The visitor observes the raw pre-mutation word of every fixup; this is
/// the dump path and the same traversal the applier uses. Returns early if
/// the visitor asks to stop.
pub fn walk_chains<F>(image: &ImageContext, notify_non_pointers: bool, mut visit: F) -> Result<()>
where
    F: FnMut(&FixupLocation) -> Result<bool>,
{
    for chains in parse_starts(image)? {
        trace!(
            segment = chains.seg_index,
            format = chains.format.name(),
            pages = chains.page_count,
            "walking segment chains"
        );
        if !walk_segment_chains(image, &chains, notify_non_pointers, &mut visit)? {
            return Ok(());
        }
    }
    Ok(())
}

// =============================================================================
// Fixup Application
// =============================================================================

/// A resolved bind target: the symbol's address with the import-table
/// addend already folded in. A missing weak import resolves to zero.
#[derive(Debug, Clone, Copy)]
pub struct BindTarget {
    /// Resolved address (0 for a missing weak import)
    pub address: u64,
    /// True if the symbol was missing and the import was weak
    pub weak_missing: bool,
}

/// A bind slot left at zero because its weak import was missing; kept so a
/// later-arriving definition can be patched in. The chain word is destroyed
/// by application, so the slot carries everything a re-patch needs.
#[derive(Debug, Clone, Copy)]
pub struct WeakMissingSlot {
    /// File offset of the slot
    pub file_offset: usize,
    /// VM offset of the slot from the image load address
    pub vm_offset: u64,
    /// Import ordinal the slot binds to
    pub ordinal: u32,
    /// Inline addend from the chain word
    pub addend: i64,
    /// Auth metadata if the slot is signed
    pub auth: Option<crate::fixup::format::AuthData>,
    /// Format of the containing chain
    pub format: PointerFormat,
}

/// Counters returned by [`apply_chains`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FixupCounts {
    /// Pointers rebased
    pub rebases: usize,
    /// Symbols bound
    pub binds: usize,
    /// Non-pointer chain members reconstituted
    pub non_pointers: usize,
}

/// Computes the fixed-up value for one location. `base` is the image's
/// runtime load address (`preferred + slide`).
fn fixed_up_value(
    location: &FixupLocation,
    chains: &SegmentChains,
    preferred: u64,
    slide: u64,
    base: u64,
    targets: &[BindTarget],
    signer: &dyn PointerSigner,
) -> Result<(u64, bool)> {
    let loc_addr = base + location.vm_offset;
    let value = match location.fixup.pointer {
        ChainedPointer::Bind {
            ordinal,
            addend,
            auth,
        } => {
            let target = targets
                .get(ordinal as usize)
                .ok_or_else(|| Error::out_of_range_ordinal(ordinal, targets.len() as u32))?;
            let resolved = match auth {
                // Missing weak imports stay zero and unsigned
                Some(auth) if target.address != 0 => {
                    signer.sign(target.address, loc_addr, auth.diversity, auth.addr_div, auth.key)
                }
                Some(_) => 0,
                None => target.address.wrapping_add(addend as u64),
            };
            return Ok((resolved, true));
        }

        ChainedPointer::Rebase {
            target,
            high8,
            auth: Some(auth),
            ..
        } => {
            let _ = high8;
            signer.sign(base + target, loc_addr, auth.diversity, auth.addr_div, auth.key)
        }

        ChainedPointer::Rebase {
            target,
            high8,
            auth: None,
            ..
        } => {
            if location.non_pointer {
                // Reconstitute the biased non-pointer value
                let bias = (0x0400_0000 + chains.max_valid_pointer as u64) / 2;
                target.wrapping_sub(bias)
            } else if chains.format == PointerFormat::Arm64eSharedCache {
                (base + target) | ((high8 as u64) << 56)
            } else if chains.format.rebase_target_is_vmaddr() {
                let unpacked = ((high8 as u64) << 56) | target;
                let _ = preferred;
                unpacked.wrapping_add(slide)
            } else {
                let unpacked = ((high8 as u64) << 56) | target;
                base.wrapping_add(unpacked)
            }
        }
    };
    Ok((value, false))
}

/// Applies every chained fixup in place.
///
/// `targets` is the resolved import table in ordinal order; `slide` is the
/// difference between the runtime and preferred load addresses. Slots whose
/// weak import was missing are bound to zero and reported back for later
/// re-patching. The pre-mutation word is visible to [`walk_chains`] callers
/// only; application is single-pass and destructive.
pub fn apply_chains(
    image: &mut ImageContext,
    slide: u64,
    targets: &[BindTarget],
    signer: &dyn PointerSigner,
    weak_missing: &mut Vec<WeakMissingSlot>,
) -> Result<FixupCounts> {
    let preferred = image.preferred_load_address();
    let base = preferred.wrapping_add(slide);
    let mut counts = FixupCounts::default();

    for chains in parse_starts(image)? {
        // Collect first: the walk borrows the image data the writes mutate.
        let mut pending: Vec<FixupLocation> = Vec::new();
        walk_segment_chains(image, &chains, true, &mut |loc: &FixupLocation| {
            pending.push(*loc);
            Ok(true)
        })?;

        debug!(
            segment = chains.seg_index,
            format = chains.format.name(),
            fixups = pending.len(),
            "applying segment fixups"
        );

        for location in &pending {
            let (value, is_bind) =
                fixed_up_value(location, &chains, preferred, slide, base, targets, signer)?;

            if is_bind {
                counts.binds += 1;
                if let ChainedPointer::Bind {
                    ordinal,
                    addend,
                    auth,
                } = location.fixup.pointer
                {
                    if targets[ordinal as usize].weak_missing {
                        weak_missing.push(WeakMissingSlot {
                            file_offset: location.file_offset,
                            vm_offset: location.vm_offset,
                            ordinal,
                            addend,
                            auth,
                            format: location.format,
                        });
                    }
                }
            } else if location.non_pointer {
                counts.non_pointers += 1;
            } else {
                counts.rebases += 1;
            }

            match location.format.word_size() {
                4 => write_u32_le_at(image.as_bytes_mut(), location.file_offset, value as u32),
                _ => write_u64_le_at(image.as_bytes_mut(), location.file_offset, value),
            }
        }
    }

    Ok(counts)
}
