//! Reads Mach-O single-slice and fat binaries, and dyld shared caches,
//! down to the level a TBD (text-based stub) emitter needs: headers, load
//! commands, the symbol/string tables, and -- for a shared cache -- the
//! per-image virtual containers synthesised from its mapping table.
//!
//! This crate is the reader only. It never writes binaries, never
//! resolves imports, never links or disassembles, and never decides what
//! to do with a structural error beyond reporting it -- that judgment
//! belongs to a caller such as a TBD text writer or a CLI front end,
//! neither of which lives here.
//!
//! Start at [`open_file`] for a path of unknown shape, or reach directly
//! for [`container::Container::open`], [`fat::iterate_fat`], or
//! [`dsc::DscInfo::from_file`] when the shape is already known.

pub mod byte_stream;
pub mod container;
pub mod dsc;
pub mod error_list;
pub mod fat;
pub mod magic;
pub mod primitives;

pub use byte_stream::{ByteRange, ByteStream, FileByteStream, SliceByteStream, StreamError};
pub use container::{Container, ContainerError, LoadCommand, OpenOptions, SymbolRecord, SymbolTableRef};
pub use dsc::{dsc_iterate_images, DscError, DscImageError, DscImageInfo, DscInfo, DscMapping};
pub use error_list::{SoftErrorList, SoftErrorSublist};
pub use fat::{FatArch, FatError};
pub use magic::Magic;
pub use primitives::{BitWidth, Endian, RawHeader};

use std::path::Path;
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
pub enum OpenFileError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("file is too small to contain a recognisable magic")]
    TruncatedHeader,
    #[error("magic does not identify a Mach-O, fat, or dyld shared cache file")]
    UnknownMagic,
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Fat(#[from] FatError),
    #[error(transparent)]
    Dsc(#[from] DscError),
}

/// The result of [`open_file`]: zero or more [`Container`]s, or a decoded
/// shared cache, dispatched from the input's magic.
pub enum File {
    /// A plain single-architecture Mach-O.
    Slice(Container),
    /// A fat (universal) binary, one [`Container`] per arch, in
    /// fat-arch-table order.
    Fat(Vec<Container>),
    /// A dyld shared cache. Use [`dsc_iterate_images`] to walk its images.
    Dsc(DscInfo),
}

/// Opens `path`, classifies its magic, and dispatches to the matching
/// reader. Mirrors spec's entry point: "receives a path and a file
/// descriptor; classifies magic; opens one container, a fat set, or a
/// DSC accordingly."
pub fn open_file(path: &Path, options: OpenOptions) -> Result<File, OpenFileError> {
    let file = std::fs::File::open(path).map_err(StreamError::StreamRead)?;
    let stream: Rc<dyn ByteStream> = Rc::new(FileByteStream::from_file(file)?);
    open_stream(stream, options)
}

/// As [`open_file`], for a stream that is already open (tests, or a
/// caller holding its own file descriptor).
pub fn open_stream(stream: Rc<dyn ByteStream>, options: OpenOptions) -> Result<File, OpenFileError> {
    let size = stream.size();
    if size < 16 {
        return Err(OpenFileError::TruncatedHeader);
    }
    let header = stream.read_at(0, 16)?;
    let magic_bytes: [u8; 16] = header.try_into().expect("checked length above");

    match magic::classify(&magic_bytes) {
        Magic::Mach32 { .. } | Magic::Mach64 { .. } => {
            let range = ByteRange::new(0, size, size)?;
            Ok(File::Slice(open_container(stream, range, options)?))
        }
        Magic::Fat { .. } => {
            let arches = fat::iterate_fat(stream.as_ref(), fat::DEFAULT_ARCH_CEILING)?;
            let containers = arches
                .into_iter()
                .map(|(_, range)| open_container(stream.clone(), range, options))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(File::Fat(containers))
        }
        Magic::Dsc => Ok(File::Dsc(DscInfo::from_stream(stream, options)?)),
        Magic::Unknown => Err(OpenFileError::UnknownMagic),
    }
}

/// Picks the opener matching `options`' `AS_LIBRARY`/`AS_DYNAMIC_LIBRARY`
/// bits, mirroring the per-flag behavior `Container`'s three constructors
/// document individually.
fn open_container(stream: Rc<dyn ByteStream>, range: ByteRange, options: OpenOptions) -> Result<Container, ContainerError> {
    if options.contains(OpenOptions::AS_DYNAMIC_LIBRARY) {
        Container::open_as_dynamic_library(stream, range, options)
    } else if options.contains(OpenOptions::AS_LIBRARY) {
        Container::open_as_library(stream, range, options)
    } else {
        Container::open(stream, range, options)
    }
}
