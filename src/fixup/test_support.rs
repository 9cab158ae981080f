//! Synthetic Mach-O images for fixup tests.

use zerocopy::IntoBytes;

use crate::fixup::format::{self, DecodedFixup, PointerFormat};
use crate::macho::constants::*;
use crate::macho::structs::*;
use crate::macho::ImageContext;

const PREFERRED: u64 = 0x1_0000_0000;
const PAGE_SIZE: usize = 0x1000;
const TEXT_SIZE: usize = 0x1000;

/// Builds a minimal dylib with a __TEXT segment, a __DATA segment carrying
/// encoded fixup chains, and a __LINKEDIT segment holding the chained-fixups
/// blob (starts tables + import table + name pool).
pub struct ImageBuilder {
    format: PointerFormat,
    max_valid_pointer: u32,
    /// chains per page index; more than one chain per page uses MULTI starts
    pages: Vec<(usize, Vec<Vec<DecodedFixup>>)>,
    imports: Vec<(u8, bool, String)>,
}

impl ImageBuilder {
    pub fn new(format: PointerFormat) -> Self {
        Self {
            format,
            // High enough that ordinary test targets read as pointers
            max_valid_pointer: if format.word_size() == 4 { 0x0800_0000 } else { 0 },
            pages: Vec::new(),
            imports: Vec::new(),
        }
    }

    pub fn max_valid_pointer(mut self, value: u32) -> Self {
        self.max_valid_pointer = value;
        self
    }

    /// Adds one chain to `page`; chains on the same page start 0x200 apart.
    pub fn chain(mut self, page: usize, fixups: &[DecodedFixup]) -> Self {
        match self.pages.iter_mut().find(|(p, _)| *p == page) {
            Some((_, chains)) => chains.push(fixups.to_vec()),
            None => self.pages.push((page, vec![fixups.to_vec()])),
        }
        self
    }

    pub fn import(mut self, lib: u8, weak: bool, name: &str) -> Self {
        self.imports.push((lib, weak, name.to_string()));
        self
    }

    pub fn build(self) -> ImageContext {
        let page_count = self
            .pages
            .iter()
            .map(|(p, _)| p + 1)
            .max()
            .unwrap_or(1);
        let data_size = page_count * PAGE_SIZE;
        let data_fileoff = TEXT_SIZE;
        let linkedit_fileoff = data_fileoff + data_size;

        // Page-start table, MULTI entries pointing into the overflow region.
        let mut starts = vec![DYLD_CHAINED_PTR_START_NONE; page_count];
        let mut overflow: Vec<u16> = Vec::new();
        for (page, chains) in &self.pages {
            if chains.len() == 1 {
                starts[*page] = 0;
            } else {
                starts[*page] =
                    DYLD_CHAINED_PTR_START_MULTI | (page_count + overflow.len()) as u16;
                for (i, _) in chains.iter().enumerate() {
                    let mut entry = (i * 0x200) as u16;
                    if i == chains.len() - 1 {
                        entry |= DYLD_CHAINED_PTR_START_LAST;
                    }
                    overflow.push(entry);
                }
            }
        }
        starts.extend_from_slice(&overflow);

        // LINKEDIT blob: header, starts-in-image, starts-in-segment, imports,
        // name pool.
        let starts_offset = 32usize;
        let seg_record_offset = starts_offset + 16; // seg_count + 3 offsets
        let seg_record_size = ChainedStartsInSegment::PAGE_STARTS_OFFSET + starts.len() * 2;
        let imports_offset = (seg_record_offset + seg_record_size + 7) & !7;

        let mut pool = vec![0u8];
        let mut import_words = Vec::new();
        for (lib, weak, name) in &self.imports {
            let name_offset = pool.len() as u32;
            pool.extend_from_slice(name.as_bytes());
            pool.push(0);
            import_words.push(*lib as u32 | ((*weak as u32) << 8) | (name_offset << 9));
        }
        let symbols_offset = imports_offset + import_words.len() * 4;

        let mut blob = vec![0u8; symbols_offset + pool.len()];
        let header = ChainedFixupsHeader {
            fixups_version: DYLD_CHAINED_FIXUPS_VERSION,
            starts_offset: starts_offset as u32,
            imports_offset: imports_offset as u32,
            symbols_offset: symbols_offset as u32,
            imports_count: import_words.len() as u32,
            imports_format: DYLD_CHAINED_IMPORT,
            symbols_format: DYLD_CHAINED_SYMBOL_UNCOMPRESSED,
        };
        blob[..ChainedFixupsHeader::SIZE].copy_from_slice(header.as_bytes());

        blob[starts_offset..starts_offset + 4].copy_from_slice(&3u32.to_le_bytes());
        let data_seg_info = (seg_record_offset - starts_offset) as u32;
        blob[starts_offset + 8..starts_offset + 12].copy_from_slice(&data_seg_info.to_le_bytes());

        let record = ChainedStartsInSegment {
            size: seg_record_size as u32,
            page_size: PAGE_SIZE as u16,
            pointer_format: self.format as u16,
            segment_offset: TEXT_SIZE as u64,
            max_valid_pointer: self.max_valid_pointer,
            page_count: page_count as u16,
            page_start: [starts[0]],
        };
        blob[seg_record_offset..seg_record_offset + ChainedStartsInSegment::SIZE]
            .copy_from_slice(record.as_bytes());
        let entries_base = seg_record_offset + ChainedStartsInSegment::PAGE_STARTS_OFFSET;
        for (i, entry) in starts.iter().enumerate().skip(1) {
            blob[entries_base + i * 2..entries_base + i * 2 + 2]
                .copy_from_slice(&entry.to_le_bytes());
        }

        for (i, word) in import_words.iter().enumerate() {
            blob[imports_offset + i * 4..imports_offset + i * 4 + 4]
                .copy_from_slice(&word.to_le_bytes());
        }
        blob[symbols_offset..].copy_from_slice(&pool);

        // File image: header + load commands in __TEXT, chain words in
        // __DATA, blob in __LINKEDIT.
        let mut file = vec![0u8; linkedit_fileoff + blob.len()];

        let ncmds = 4u32;
        let sizeofcmds = (3 * SegmentCommand64::SIZE + LinkeditDataCommand::SIZE) as u32;
        let mach_header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds,
            sizeofcmds,
            flags: 0,
            reserved: 0,
        };
        file[..MachHeader64::SIZE].copy_from_slice(mach_header.as_bytes());

        let mut offset = MachHeader64::SIZE;
        let mut put_segment = |file: &mut Vec<u8>,
                               offset: &mut usize,
                               name: &str,
                               vmaddr: u64,
                               fileoff: usize,
                               size: usize| {
            let mut seg = SegmentCommand64::default();
            seg.set_name(name);
            seg.vmaddr = vmaddr;
            seg.vmsize = size as u64;
            seg.fileoff = fileoff as u64;
            seg.filesize = size as u64;
            file[*offset..*offset + SegmentCommand64::SIZE].copy_from_slice(seg.as_bytes());
            *offset += SegmentCommand64::SIZE;
        };
        put_segment(&mut file, &mut offset, "__TEXT", PREFERRED, 0, TEXT_SIZE);
        put_segment(
            &mut file,
            &mut offset,
            "__DATA",
            PREFERRED + TEXT_SIZE as u64,
            data_fileoff,
            data_size,
        );
        put_segment(
            &mut file,
            &mut offset,
            "__LINKEDIT",
            PREFERRED + linkedit_fileoff as u64,
            linkedit_fileoff,
            blob.len(),
        );

        let le = LinkeditDataCommand {
            cmd: LC_DYLD_CHAINED_FIXUPS,
            cmdsize: LinkeditDataCommand::SIZE as u32,
            dataoff: linkedit_fileoff as u32,
            datasize: blob.len() as u32,
        };
        file[offset..offset + LinkeditDataCommand::SIZE].copy_from_slice(le.as_bytes());

        // Encode chain words at their in-page positions.
        let stride = self.format.stride() as usize;
        let word = self.format.word_size();
        for (page, chains) in &self.pages {
            for (i, fixups) in chains.iter().enumerate() {
                let mut pos = data_fileoff + page * PAGE_SIZE + i * 0x200;
                for fixup in fixups {
                    if pos + word > linkedit_fileoff {
                        break;
                    }
                    let raw = format::encode(fixup, self.format).unwrap();
                    file[pos..pos + word].copy_from_slice(&raw.to_le_bytes()[..word]);
                    pos += fixup.next as usize * stride;
                }
            }
        }

        file[linkedit_fileoff..].copy_from_slice(&blob);

        ImageContext::new(&file).unwrap()
    }
}
