//! Classifies the first 16 bytes of a candidate binary.
//!
//! Grounded on the magic constants from
//! `examples/other_examples/415dd3ad_m4b-goblin__src-mach-header.rs.rs`
//! (`MH_MAGIC`/`MH_MAGIC_64`/`*_CIGAM*`) and
//! `examples/other_examples/bf74f667_m4b-goblin__src-mach-fat.rs.rs`
//! (`FAT_MAGIC`/`FAT_CIGAM`).

use crate::primitives::{BitWidth, Endian};

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_CIGAM: u32 = 0xcefa_edfe;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;

pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;
/// Fat-64: same leading bytes as a Java class file, disambiguated below by
/// requiring a plausible `nfat_arch`.
pub const FAT_MAGIC_64: u32 = 0xcafe_babf;
pub const FAT_CIGAM_64: u32 = 0xbfba_feca;

/// Arbitrarily large but plausible upper bound on `nfat_arch` used only to
/// disambiguate a fat-64 Mach-O header from a Java class file, both of
/// which begin with the big-endian bytes `CA FE BA BE`. A Java class file's
/// next four bytes are `minor_version`/`major_version`, which for any real
/// `.class` file produced since Java 1.0 decode to a `nfat_arch` far beyond
/// what any fat binary has ever shipped.
const PLAUSIBLE_JAVA_DISAMBIGUATION_CEILING: u32 = 0x0000_ffff;

/// Outcome of classifying a candidate file's leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Mach32 { endian: Endian },
    Mach64 { endian: Endian },
    Fat { is_64: bool, endian: Endian, nfat_arch: u32 },
    Dsc,
    Unknown,
}

impl Magic {
    pub fn bit_width(self) -> Option<BitWidth> {
        match self {
            Magic::Mach32 { .. } => Some(BitWidth::W32),
            Magic::Mach64 { .. } => Some(BitWidth::W64),
            Magic::Fat { is_64: true, .. } => Some(BitWidth::W64),
            Magic::Fat { is_64: false, .. } => Some(BitWidth::W32),
            Magic::Dsc | Magic::Unknown => None,
        }
    }

    pub fn endian(self) -> Option<Endian> {
        match self {
            Magic::Mach32 { endian } | Magic::Mach64 { endian } | Magic::Fat { endian, .. } => {
                Some(endian)
            }
            Magic::Dsc | Magic::Unknown => None,
        }
    }
}

/// Dyld shared cache files begin with one of a small family of ASCII magic
/// strings, all of which share this 12-byte prefix ("dyld_v1" padded, or
/// "dyld_v0" -- version-dependent tail, left unparsed here).
const DSC_MAGIC_PREFIX: &[u8] = b"dyld_v";

/// Classifies the leading 16 bytes of a candidate container.
///
/// Pure function: never reads past the given slice, never allocates.
pub fn classify(bytes: &[u8; 16]) -> Magic {
    let le = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    match le {
        MH_MAGIC => return Magic::Mach32 { endian: Endian::Little },
        MH_MAGIC_64 => return Magic::Mach64 { endian: Endian::Little },
        MH_CIGAM => return Magic::Mach32 { endian: Endian::Big },
        MH_CIGAM_64 => return Magic::Mach64 { endian: Endian::Big },
        _ => {}
    }

    // A canonical big-endian fat header reads back CIGAM when loaded as
    // little-endian, so le == FAT_CIGAM/FAT_CIGAM_64 identifies a
    // big-endian file and its nfat_arch must be read big-endian in turn.
    if le == FAT_CIGAM || le == FAT_CIGAM_64 {
        let nfat_arch = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if le == FAT_CIGAM_64 || nfat_arch <= PLAUSIBLE_JAVA_DISAMBIGUATION_CEILING {
            return Magic::Fat {
                is_64: le == FAT_CIGAM_64,
                endian: Endian::Big,
                nfat_arch,
            };
        }
    }
    if le == FAT_MAGIC || le == FAT_MAGIC_64 {
        let nfat_arch = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if le == FAT_MAGIC_64 || nfat_arch <= PLAUSIBLE_JAVA_DISAMBIGUATION_CEILING {
            return Magic::Fat {
                is_64: le == FAT_MAGIC_64,
                endian: Endian::Little,
                nfat_arch,
            };
        }
    }

    if bytes.starts_with(DSC_MAGIC_PREFIX) {
        return Magic::Dsc;
    }

    Magic::Unknown
}
