//! Fat (universal) binary arch-table enumerator.
//!
//! Grounded on `examples/other_examples/bf74f667_m4b-goblin__src-mach-fat.rs.rs`
//! (20-byte big-endian `FatArch` records following an 8-byte `FatHeader`)
//! and `examples/other_examples/8ff370d7_liamgoss-moscope__src-macho-fat.rs.rs`.

use crate::byte_stream::{ByteRange, ByteStream, StreamError};
use scroll::Pread;

/// Default ceiling on `nfat_arch`, deflecting hostile inputs that claim an
/// enormous arch count to force a huge allocation (spec §4.D).
pub const DEFAULT_ARCH_CEILING: u32 = 1024;

pub const SIZEOF_FAT_HEADER: u64 = 8;
pub const SIZEOF_FAT_ARCH: u64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum FatError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("nfat_arch {0} exceeds the configured ceiling {1}")]
    TooManyArches(u32, u32),
    #[error("fat arch {index} range is out of bounds or overlaps the fat header/arch table")]
    InvalidRange { index: u32 },
    #[error("fat arch {index} offset {offset:#x} is not aligned to 2^{align}")]
    MisalignedOffset { index: u32, offset: u64, align: u32 },
    #[error("fat arch {first} and {second} both declare cputype {cputype:#x}, cpusubtype {cpusubtype:#x}")]
    DuplicateFatArch {
        first: u32,
        second: u32,
        cputype: u32,
        cpusubtype: u32,
    },
    #[error("arithmetic overflow computing a fat arch range")]
    ArithOverflow,
    #[error("malformed fat header or arch record")]
    Malformed(#[from] scroll::Error),
}

/// `{cputype, cpusubtype, offset, size, align}` describing one slice inside
/// a fat binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

impl FatArch {
    fn read(bytes: &[u8], offset: &mut usize) -> Result<Self, scroll::Error> {
        Ok(FatArch {
            cputype: bytes.gread_with(offset, scroll::Endian::Big)?,
            cpusubtype: bytes.gread_with(offset, scroll::Endian::Big)?,
            offset: bytes.gread_with(offset, scroll::Endian::Big)?,
            size: bytes.gread_with(offset, scroll::Endian::Big)?,
            align: bytes.gread_with(offset, scroll::Endian::Big)?,
        })
    }
}

/// Reads the fat-arch table from `stream` (which must already be known to
/// start with a fat magic) and returns each arch paired with the bounded
/// sub-range of the file it occupies, in file (arch-table) order.
///
/// A malformed arch anywhere in the table fails the whole enumeration;
/// `error.index` (where present) tells the caller which arch was bad so it
/// can re-open just the arches before it, matching scenario S3 in spec §8.
pub fn iterate_fat(
    stream: &dyn ByteStream,
    ceiling: u32,
) -> Result<Vec<(FatArch, ByteRange)>, FatError> {
    // The fat header's magic is always big-endian; the caller has already
    // classified it via `magic::classify` before choosing to call this.
    let header_bytes = stream.read_at(0, SIZEOF_FAT_HEADER)?;
    let nfat_arch: u32 = header_bytes.pread_with(4, scroll::Endian::Big)?;

    if nfat_arch > ceiling {
        return Err(FatError::TooManyArches(nfat_arch, ceiling));
    }

    let table_size = crate::primitives::checked_mul_u64(nfat_arch as u64, SIZEOF_FAT_ARCH)
        .ok_or(FatError::ArithOverflow)?;
    let table_bytes = stream.read_at(SIZEOF_FAT_HEADER, table_size)?;
    let table_end = crate::primitives::checked_add_u64(SIZEOF_FAT_HEADER, table_size)
        .ok_or(FatError::ArithOverflow)?;
    // The fat header plus arch table occupies [0, table_end); no arch's
    // range may overlap it.
    let reserved = ByteRange::new(0, table_end, table_end.max(stream.size()))
        .map_err(|_| FatError::ArithOverflow)?;

    let mut arches = Vec::with_capacity(nfat_arch as usize);
    let mut seen: Vec<(u32, u32)> = Vec::with_capacity(nfat_arch as usize);
    let mut cursor = 0usize;

    for index in 0..nfat_arch {
        let arch = FatArch::read(&table_bytes, &mut cursor).map_err(FatError::Malformed)?;

        if let Some(min_align) = 1u64.checked_shl(arch.align) {
            if arch.align < 32 && arch.offset as u64 % min_align != 0 {
                return Err(FatError::MisalignedOffset {
                    index,
                    offset: arch.offset as u64,
                    align: arch.align,
                });
            }
        }

        let key = (arch.cputype, arch.cpusubtype);
        if let Some(first) = seen.iter().position(|&k| k == key) {
            return Err(FatError::DuplicateFatArch {
                first: first as u32,
                second: index,
                cputype: arch.cputype,
                cpusubtype: arch.cpusubtype,
            });
        }
        seen.push(key);

        let range = ByteRange::new(arch.offset as u64, arch.size as u64, stream.size())
            .map_err(|_| FatError::InvalidRange { index })?;
        if !range.is_disjoint_from(reserved) {
            return Err(FatError::InvalidRange { index });
        }

        arches.push((arch, range));
    }

    Ok(arches)
}
