//! Import table of the chained-fixups blob.
//!
//! Bind fixups carry only an ordinal; the ordinal indexes this table, which
//! names the symbol, the library it comes from, whether the binding is weak,
//! and (in two of the three sub-formats) an inline addend.

use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::macho::constants::*;
use crate::macho::structs::{
    ChainedFixupsHeader, ChainedImport, ChainedImportAddend, ChainedImportAddend64,
};
use crate::util::memchr_null;

/// One entry of the import table, resolved to its symbol name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    /// Position in the import table; bind ordinals index by this
    pub ordinal: u32,
    /// Library ordinal; negative values are BIND_SPECIAL_DYLIB_* lookups
    pub lib_ordinal: i32,
    /// Missing symbol binds to zero instead of failing
    pub weak_import: bool,
    /// Symbol name from the name pool
    pub name: String,
    /// Inline addend (zero for DYLD_CHAINED_IMPORT)
    pub addend: i64,
}

impl ImportEntry {
    /// Human-readable library description for diagnostics.
    pub fn lib_description(&self) -> String {
        match self.lib_ordinal {
            BIND_SPECIAL_DYLIB_SELF => "this-image".to_string(),
            BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE => "main-executable".to_string(),
            BIND_SPECIAL_DYLIB_FLAT_LOOKUP => "flat-namespace".to_string(),
            BIND_SPECIAL_DYLIB_WEAK_LOOKUP => "weak-coalesce".to_string(),
            n => format!("dylib#{n}"),
        }
    }
}

/// Parses the whole import table out of the chained-fixups blob.
///
/// Every name offset is checked against the symbol pool extent before the
/// pool is dereferenced; a name offset past `datasize - symbols_offset` is
/// a string overflow. Table offsets past the blob are rejected up front.
pub fn parse_imports(blob: &[u8], header: &ChainedFixupsHeader) -> Result<Vec<ImportEntry>> {
    let imports_offset = header.imports_offset as usize;
    let symbols_offset = header.symbols_offset as usize;
    let count = header.imports_count;

    if count == 0 {
        return Ok(Vec::new());
    }
    if imports_offset > blob.len() || symbols_offset > blob.len() {
        return Err(Error::malformed(
            imports_offset.min(blob.len()),
            "malformed import table, imports/symbols offset past blob end",
        ));
    }
    let max_symbol_offset = blob.len() - symbols_offset;
    let pool = &blob[symbols_offset..];

    let entry_size = match header.imports_format {
        DYLD_CHAINED_IMPORT => ChainedImport::SIZE,
        DYLD_CHAINED_IMPORT_ADDEND => ChainedImportAddend::SIZE,
        DYLD_CHAINED_IMPORT_ADDEND64 => ChainedImportAddend64::SIZE,
        other => return Err(Error::UnsupportedImportFormat(other)),
    };

    let table_bytes = (count as usize)
        .checked_mul(entry_size)
        .ok_or_else(|| Error::malformed(imports_offset, "import table size overflows"))?;
    if imports_offset + table_bytes > blob.len() {
        return Err(Error::malformed(
            imports_offset,
            format!("malformed import table, {count} entries overflow blob"),
        ));
    }

    let mut entries = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let offset = imports_offset + i * entry_size;
        let (lib_ordinal, weak_import, name_offset, addend) = match header.imports_format {
            DYLD_CHAINED_IMPORT => {
                let imp = ChainedImport::read_from_prefix(&blob[offset..])
                    .map_err(|_| Error::malformed(offset, "truncated import entry"))?
                    .0;
                (imp.lib_ordinal(), imp.weak_import(), imp.name_offset(), 0)
            }
            DYLD_CHAINED_IMPORT_ADDEND => {
                let imp = ChainedImportAddend::read_from_prefix(&blob[offset..])
                    .map_err(|_| Error::malformed(offset, "truncated import entry"))?
                    .0;
                let bits = ChainedImport(imp.import);
                (
                    bits.lib_ordinal(),
                    bits.weak_import(),
                    bits.name_offset(),
                    imp.addend as i64,
                )
            }
            DYLD_CHAINED_IMPORT_ADDEND64 => {
                let imp = ChainedImportAddend64::read_from_prefix(&blob[offset..])
                    .map_err(|_| Error::malformed(offset, "truncated import entry"))?
                    .0;
                (
                    imp.lib_ordinal(),
                    imp.weak_import(),
                    imp.name_offset(),
                    imp.addend as i64,
                )
            }
            _ => unreachable!(),
        };

        if name_offset as usize > max_symbol_offset {
            return Err(Error::malformed(
                offset,
                format!("malformed import table, string overflow at entry {i}"),
            ));
        }
        let name_bytes = &pool[name_offset as usize..];
        let name = String::from_utf8_lossy(&name_bytes[..memchr_null(name_bytes)]).into_owned();

        entries.push(ImportEntry {
            ordinal: i as u32,
            lib_ordinal,
            weak_import,
            name,
            addend,
        });
    }

    Ok(entries)
}
