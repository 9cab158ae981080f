//! Image context for reading and fixing up mapped Mach-O images.

use std::collections::HashMap;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};

// =============================================================================
// Bounded Record Walker
// =============================================================================

/// Visits `count` variable-length records packed end-to-end in
/// `container[start..end]`.
///
/// Before a record is handed to `visit`, its declared size (produced by
/// `size_of` from the record's header bytes) is checked: non-zero, aligned
/// to `align`, and `offset + size` neither overflows nor passes `end`. The
/// first violation aborts the walk; no later record is visited. `visit`
/// returns `false` to stop early.
pub fn walk_records<S, V>(
    container: &[u8],
    start: usize,
    end: usize,
    count: u32,
    align: usize,
    mut size_of: S,
    mut visit: V,
) -> Result<()>
where
    S: FnMut(&[u8], usize) -> Result<usize>,
    V: FnMut(usize, &[u8]) -> Result<bool>,
{
    let end = end.min(container.len());
    if start > end {
        return Err(Error::malformed(start, "record region starts past container"));
    }

    let mut offset = start;
    for _ in 0..count {
        let size = size_of(container, offset)?;
        if size == 0 {
            return Err(Error::malformed(offset, "record has zero size"));
        }
        if size % align != 0 {
            return Err(Error::malformed(
                offset,
                format!("record size {size} not aligned to {align}"),
            ));
        }
        let next = offset
            .checked_add(size)
            .ok_or_else(|| Error::malformed(offset, "record size overflows"))?;
        if next > end {
            return Err(Error::malformed(
                offset,
                format!("record extends past container end {end:#x}"),
            ));
        }
        if !visit(offset, &container[offset..next])? {
            return Ok(());
        }
        offset = next;
    }

    Ok(())
}

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command
    pub command: SegmentCommand64,
    /// Offset of the segment command in the file
    pub command_offset: usize,
    /// Index of this segment in load-command order
    pub index: usize,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns true if `vm_offset` (from the image load address) lands in
    /// this segment's mapped extent.
    #[inline]
    pub fn contains_vm_offset(&self, base: u64, vm_offset: u64) -> bool {
        let addr = base + vm_offset;
        addr >= self.command.vmaddr && addr < self.command.vmaddr + self.command.filesize
    }
}

// =============================================================================
// Image Context
// =============================================================================

/// Context for working with one mapped Mach-O image.
///
/// Holds the image bytes laid out at their file offsets, the parsed segment
/// table, and the location of the chained-fixups LINKEDIT blob. All fixup
/// mutation goes through this context so every write is bounds-checked.
#[derive(Debug)]
pub struct ImageContext {
    /// The Mach-O header
    pub header: MachHeader64,
    /// Mutable copy of the image data, indexed by file offset
    pub data: Vec<u8>,
    /// Segments in load-command order
    segments: Vec<SegmentInfo>,
    /// Segment lookup by name
    segment_indices: HashMap<String, usize>,
    /// LC_DYLD_CHAINED_FIXUPS payload location, if present
    chained_fixups: Option<LinkeditDataCommand>,
}

impl ImageContext {
    /// Creates an image context from raw Mach-O data.
    pub fn new(data: &[u8]) -> Result<Self> {
        if data.len() < MachHeader64::SIZE {
            return Err(Error::buffer_too_small(MachHeader64::SIZE, data.len()));
        }

        let header = MachHeader64::read_from_prefix(data)
            .map_err(|_| Error::InvalidMachoMagic(0))?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }

        let mut ctx = Self {
            header,
            data: data.to_vec(),
            segments: Vec::new(),
            segment_indices: HashMap::new(),
            chained_fixups: None,
        };

        ctx.parse_load_commands()?;

        Ok(ctx)
    }

    /// Parses the load commands we care about: segments and the chained
    /// fixups blob location. Load command sizes are 8-byte aligned in
    /// 64-bit images.
    fn parse_load_commands(&mut self) -> Result<()> {
        let end = MachHeader64::SIZE
            .checked_add(self.header.sizeofcmds as usize)
            .ok_or(Error::LoadCommandOverflow { offset: 0 })?;
        if end > self.data.len() {
            return Err(Error::LoadCommandOverflow {
                offset: MachHeader64::SIZE,
            });
        }

        let mut segments = Vec::new();
        let mut chained_fixups = None;
        let data_len = self.data.len() as u64;

        walk_records(
            &self.data,
            MachHeader64::SIZE,
            end,
            self.header.ncmds,
            8,
            |data, offset| {
                if offset + LoadCommand::SIZE > data.len() {
                    return Err(Error::LoadCommandOverflow { offset });
                }
                let lc = LoadCommand::read_from_prefix(&data[offset..])
                    .map_err(|_| Error::LoadCommandOverflow { offset })?
                    .0;
                Ok(lc.cmdsize as usize)
            },
            |offset, record| {
                let cmd = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
                match cmd {
                    LC_SEGMENT_64 => {
                        let seg = SegmentCommand64::read_from_prefix(record)
                            .map_err(|_| {
                                Error::malformed(offset, "truncated segment command")
                            })?
                            .0;
                        // The declared file extent must exist; every later
                        // chain-step bounds check trusts it.
                        match seg.fileoff.checked_add(seg.filesize) {
                            Some(end) if end <= data_len => {}
                            _ => {
                                return Err(Error::malformed(
                                    offset,
                                    format!(
                                        "segment {} file extent {:#x}+{:#x} past end of file",
                                        seg.name(),
                                        seg.fileoff,
                                        seg.filesize
                                    ),
                                ));
                            }
                        }
                        segments.push(SegmentInfo {
                            command: seg,
                            command_offset: offset,
                            index: segments.len(),
                        });
                    }
                    LC_DYLD_CHAINED_FIXUPS => {
                        let le = LinkeditDataCommand::read_from_prefix(record)
                            .map_err(|_| {
                                Error::malformed(offset, "truncated linkedit data command")
                            })?
                            .0;
                        chained_fixups = Some(le);
                    }
                    _ => {}
                }
                Ok(true)
            },
        )?;

        for seg in &segments {
            self.segment_indices
                .insert(seg.name().to_string(), seg.index);
        }
        self.segments = segments;
        self.chained_fixups = chained_fixups;

        Ok(())
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segment_indices
            .get(name)
            .map(|&idx| &self.segments[idx])
    }

    /// Returns a segment by load-command index.
    pub fn segment_at(&self, index: usize) -> Option<&SegmentInfo> {
        self.segments.get(index)
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.segments.iter()
    }

    /// Number of segments in the image.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The address the image was linked at: the __TEXT vmaddr.
    pub fn preferred_load_address(&self) -> u64 {
        self.segment("__TEXT")
            .or_else(|| self.segments.first())
            .map(|s| s.command.vmaddr)
            .unwrap_or(0)
    }

    /// Location of the LC_DYLD_CHAINED_FIXUPS payload, if the image has one.
    pub fn chained_fixups_command(&self) -> Option<&LinkeditDataCommand> {
        self.chained_fixups.as_ref()
    }

    /// The chained-fixups LINKEDIT payload bytes.
    pub fn chained_fixups_data(&self) -> Result<&[u8]> {
        let cmd = self
            .chained_fixups
            .as_ref()
            .ok_or_else(|| Error::malformed(0, "image has no chained fixups"))?;
        self.read_at(cmd.dataoff as usize, cmd.datasize as usize)
    }

    /// Returns true if this is an ARM64e binary (with pointer authentication).
    pub fn is_arm64e(&self) -> bool {
        self.header.is_arm64e()
    }

    /// Reads data at the specified file offset.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::malformed(offset, "read length overflows"))?;
        if end > self.data.len() {
            return Err(Error::buffer_too_small(end, self.data.len()));
        }
        Ok(&self.data[offset..end])
    }

    /// Reads a u32 at the specified file offset.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let bytes = self.read_at(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a u64 at the specified file offset.
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let bytes = self.read_at(offset, 8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Writes data at the specified file offset.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| Error::malformed(offset, "write length overflows"))?;
        if end > self.data.len() {
            return Err(Error::buffer_too_small(end, self.data.len()));
        }
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Writes a u32 at the specified file offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Writes a u64 at the specified file offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Writes a structure at the specified file offset.
    pub fn write_struct<T: IntoBytes + Immutable>(
        &mut self,
        offset: usize,
        value: &T,
    ) -> Result<()> {
        self.write_at(offset, value.as_bytes())
    }

    /// Converts a VM offset from the load address to a file offset, checking
    /// the target segment's mapped extent.
    pub fn vm_offset_to_file_offset(&self, vm_offset: u64) -> Option<usize> {
        let addr = self.preferred_load_address() + vm_offset;
        self.addr_to_offset(addr)
    }

    /// Converts a linked virtual address to a file offset.
    pub fn addr_to_offset(&self, addr: u64) -> Option<usize> {
        for seg in &self.segments {
            if addr >= seg.command.vmaddr && addr < seg.command.vmaddr + seg.command.filesize {
                let offset = seg.command.fileoff + (addr - seg.command.vmaddr);
                return Some(offset as usize);
            }
        }
        None
    }

    /// Returns true if the linked address is within this image.
    pub fn contains_addr(&self, addr: u64) -> bool {
        self.segments
            .iter()
            .any(|seg| addr >= seg.command.vmaddr && addr < seg.command.vmaddr + seg.command.vmsize)
    }

    /// Returns the raw data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the raw data as mutable.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_image(ncmds: u32, patch: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut data = vec![0u8; 0x1000];

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds,
            sizeofcmds: SegmentCommand64::SIZE as u32 * ncmds,
            flags: 0,
            reserved: 0,
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());

        let mut seg = SegmentCommand64::default();
        seg.set_name("__TEXT");
        seg.vmaddr = 0x1_0000_0000;
        seg.vmsize = 0x1000;
        seg.fileoff = 0;
        seg.filesize = 0x1000;
        data[MachHeader64::SIZE..MachHeader64::SIZE + SegmentCommand64::SIZE]
            .copy_from_slice(seg.as_bytes());

        patch(&mut data);
        data
    }

    #[test]
    fn test_parse_minimal_image() {
        let data = minimal_image(1, |_| {});
        let ctx = ImageContext::new(&data).unwrap();

        assert!(ctx.header.is_valid());
        assert_eq!(ctx.segment_count(), 1);
        assert!(ctx.segment("__TEXT").is_some());
        assert_eq!(ctx.preferred_load_address(), 0x1_0000_0000);
        assert!(ctx.chained_fixups_command().is_none());
    }

    #[test]
    fn test_zero_size_record_rejected() {
        let data = minimal_image(1, |d| {
            // Zero out the segment command's cmdsize
            d[MachHeader64::SIZE + 4..MachHeader64::SIZE + 8].copy_from_slice(&[0; 4]);
        });
        let err = ImageContext::new(&data).unwrap_err();
        assert!(matches!(err, Error::MalformedContainer { .. }));
    }

    #[test]
    fn test_record_past_container_rejected() {
        let data = minimal_image(1, |d| {
            // Claim the segment command runs past sizeofcmds
            let huge = 0x8000u32.to_le_bytes();
            d[MachHeader64::SIZE + 4..MachHeader64::SIZE + 8].copy_from_slice(&huge);
        });
        let err = ImageContext::new(&data).unwrap_err();
        assert!(matches!(err, Error::MalformedContainer { .. }));
    }

    #[test]
    fn test_segment_file_extent_past_eof_rejected() {
        let data = minimal_image(1, |d| {
            // Declare 1 MiB of __TEXT the 4 KiB file does not have
            let filesize_off = MachHeader64::SIZE + 48;
            d[filesize_off..filesize_off + 8].copy_from_slice(&0x10_0000u64.to_le_bytes());
        });
        let err = ImageContext::new(&data).unwrap_err();
        assert!(matches!(err, Error::MalformedContainer { .. }));
    }

    #[test]
    fn test_walk_records_stops_at_first_violation() {
        // Two records: first valid (8 bytes), second claims zero size.
        let container = [8u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut visited = 0;
        let result = walk_records(
            &container,
            0,
            16,
            2,
            4,
            |data, off| Ok(u32::from_le_bytes(data[off..off + 4].try_into().unwrap()) as usize),
            |_, _| {
                visited += 1;
                Ok(true)
            },
        );
        assert!(result.is_err());
        assert_eq!(visited, 1);
    }
}
