//! Resolves `LC_SYMTAB` and extracts symbol records and the string pool.
//!
//! Grounded on the teacher's `linux/module_reader.rs` (`dynstr_section_header`
//! lookup and `CStr::from_bytes_until_nul` string-pool slicing), adapted
//! from ELF's `.dynstr`/`Dyn` records to Mach-O's `nlist`/`nlist_64` and
//! `LC_SYMTAB`.

use super::commands::LoadCommandCache;
use crate::byte_stream::ByteRange;
use crate::primitives::{BitWidth, Endian};
use scroll::Pread;

const LC_SYMTAB: u32 = 0x2;

#[derive(Debug, thiserror::Error)]
pub enum SymtabError {
    #[error("LC_SYMTAB command body is smaller than the fixed symtab_command record")]
    Malformed,
    #[error("symbol table region [{symoff}, +{size}) is out of range for a container of size {container_size}")]
    SymtabOutOfRange {
        symoff: u32,
        size: u64,
        container_size: u64,
    },
    #[error("string pool region [{stroff}, +{strsize}) is out of range for a container of size {container_size}")]
    StringOutOfRange {
        stroff: u32,
        strsize: u32,
        container_size: u64,
    },
    #[error("n_strx {n_strx} is out of range for a string pool of size {pool_size}")]
    StrxOutOfRange { n_strx: u32, pool_size: usize },
    #[error("string at n_strx {0} is not valid UTF-8")]
    InvalidUtf8(u32),
    #[error("arithmetic overflow computing a symbol table range")]
    ArithOverflow,
}

/// `{symoff, nsyms, stroff, strsize}` resolved from `LC_SYMTAB`, with both
/// regions already validated to lie within the owning container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableRef {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

/// One symbol record, post-swap, independent of bit width (`n_value` is
/// always widened to `u64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRecord {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

pub(super) fn resolve(
    cache: &LoadCommandCache,
    range: ByteRange,
    stream_size: u64,
    bit_width: BitWidth,
    endian: Endian,
) -> Result<Option<SymbolTableRef>, SymtabError> {
    let Some(symtab_cmd) = super::commands::find_first(cache, LC_SYMTAB) else {
        return Ok(None);
    };
    if symtab_cmd.body.len() < 16 {
        return Err(SymtabError::Malformed);
    }

    // `symtab_cmd.body` is never byte-swapped by the generic command walker
    // (only the `{cmd, cmdsize}` prefix is), so these four fields are read
    // with the container's own endianness here.
    let scroll_endian = endian.to_scroll();
    let symoff: u32 = symtab_cmd.body.pread_with(0, scroll_endian).map_err(|_| SymtabError::Malformed)?;
    let nsyms: u32 = symtab_cmd.body.pread_with(4, scroll_endian).map_err(|_| SymtabError::Malformed)?;
    let stroff: u32 = symtab_cmd.body.pread_with(8, scroll_endian).map_err(|_| SymtabError::Malformed)?;
    let strsize: u32 = symtab_cmd.body.pread_with(12, scroll_endian).map_err(|_| SymtabError::Malformed)?;

    let symtab_ref = SymbolTableRef {
        symoff,
        nsyms,
        stroff,
        strsize,
    };

    let max_end = range.base().checked_add(range.size()).ok_or(SymtabError::ArithOverflow)?;
    let symtab_start = range.base().checked_add(symoff as u64).ok_or(SymtabError::ArithOverflow)?;
    let symtab_bytes = (nsyms as u64)
        .checked_mul(bit_width.symbol_record_size())
        .ok_or(SymtabError::ArithOverflow)?;
    let symtab_end = symtab_start.checked_add(symtab_bytes).ok_or(SymtabError::ArithOverflow)?;
    if symtab_end > max_end || symtab_end > stream_size {
        return Err(SymtabError::SymtabOutOfRange {
            symoff,
            size: symtab_bytes,
            container_size: range.size(),
        });
    }

    let string_start = range.base().checked_add(stroff as u64).ok_or(SymtabError::ArithOverflow)?;
    let string_end = string_start.checked_add(strsize as u64).ok_or(SymtabError::ArithOverflow)?;
    if string_end > max_end || string_end > stream_size {
        return Err(SymtabError::StringOutOfRange {
            stroff,
            strsize,
            container_size: range.size(),
        });
    }

    Ok(Some(symtab_ref))
}

/// Reads `bytes` as a tightly packed array of `nlist`/`nlist_64` records,
/// swapping fields per `endian`.
pub(super) fn read_records(bytes: &[u8], bit_width: BitWidth, endian: Endian) -> Vec<SymbolRecord> {
    let scroll_endian = endian.to_scroll();
    let record_size = bit_width.symbol_record_size() as usize;
    let mut records = Vec::with_capacity(bytes.len() / record_size.max(1));
    let mut offset = 0usize;
    while offset + record_size <= bytes.len() {
        let n_strx: u32 = bytes.pread_with(offset, scroll_endian).unwrap_or(0);
        let n_type: u8 = bytes[offset + 4];
        let n_sect: u8 = bytes[offset + 5];
        let record = match bit_width {
            BitWidth::W32 => {
                let n_desc: u16 = bytes.pread_with(offset + 6, scroll_endian).unwrap_or(0);
                let n_value: u32 = bytes.pread_with(offset + 8, scroll_endian).unwrap_or(0);
                SymbolRecord {
                    n_strx,
                    n_type,
                    n_sect,
                    n_desc,
                    n_value: n_value as u64,
                }
            }
            BitWidth::W64 => {
                let n_desc: u16 = bytes.pread_with(offset + 6, scroll_endian).unwrap_or(0);
                let n_value: u64 = bytes.pread_with(offset + 8, scroll_endian).unwrap_or(0);
                SymbolRecord {
                    n_strx,
                    n_type,
                    n_sect,
                    n_desc,
                    n_value,
                }
            }
        };
        records.push(record);
        offset += record_size;
    }
    records
}

/// Returns the NUL-terminated string at `n_strx` in `pool`, clamped to the
/// pool's length.
pub(super) fn string_at(pool: &[u8], n_strx: u32) -> Result<&str, super::ContainerError> {
    let start = n_strx as usize;
    if start > pool.len() {
        return Err(super::ContainerError::Symtab(SymtabError::StrxOutOfRange {
            n_strx,
            pool_size: pool.len(),
        }));
    }
    let slice = &pool[start..];
    let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    std::str::from_utf8(&slice[..end])
        .map_err(|_| super::ContainerError::Symtab(SymtabError::InvalidUtf8(n_strx)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_64_bit_records() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.push(0x0f); // n_type
        bytes.push(1); // n_sect
        bytes.extend_from_slice(&0u16.to_le_bytes()); // n_desc
        bytes.extend_from_slice(&0x4000u64.to_le_bytes()); // n_value
        let records = read_records(&bytes, BitWidth::W64, Endian::Little);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].n_strx, 5);
        assert_eq!(records[0].n_value, 0x4000);
    }

    #[test]
    fn string_at_clamps_to_nul() {
        let pool = b"\0hello\0world\0";
        assert_eq!(string_at(pool, 1).unwrap(), "hello");
        assert_eq!(string_at(pool, 7).unwrap(), "world");
    }

    #[test]
    fn string_at_rejects_out_of_range_index() {
        let pool = b"hello\0";
        assert!(string_at(pool, 100).is_err());
    }
}
