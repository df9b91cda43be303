//! A single Mach-O slice: header, lazy load-command cache, lazy
//! symbol/string table caches.
//!
//! Grounded on `examples/original_source/src/mach-o/container.cc`'s
//! `container` class (owns a stream + base + size + header, caches load
//! commands/symbols/strings lazily) and the teacher's
//! `linux/module_reader.rs::ModuleReader` (owns memory + parsed header +
//! a decode context, exposes read-only accessors over it).

pub mod commands;
pub mod symtab;

use crate::byte_stream::{ByteRange, ByteStream, StreamError};
use crate::magic::{self, Magic};
use crate::primitives::{self, BitWidth, Endian, RawHeader};
use bitflags::bitflags;
use scroll::Pread;
use std::cell::OnceCell;
use std::rc::Rc;

pub use commands::{CommandsError, LoadCommand};
pub use symtab::{SymbolRecord, SymbolTableRef, SymtabError};

bitflags! {
    /// Option flags accepted by [`Container::open`] and its variants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenOptions: u32 {
        /// Downgrade certain field-level Mach-O validation errors to warnings.
        const IGNORE_INVALID_FIELDS = 1 << 0;
        /// Require library filetype on open.
        const AS_LIBRARY = 1 << 1;
        /// Require library filetype and well-formed `LC_ID_DYLIB`.
        const AS_DYNAMIC_LIBRARY = 1 << 2;
        /// Force big-endian interpretation regardless of magic. Diagnostic only.
        const BIG_ENDIAN_INPUT = 1 << 3;
        /// On DSC load, clear the per-image `pad` byte to 0.
        const ZERO_IMAGE_PADS = 1 << 4;
    }
}

/// Mach-O `filetype` values accepted by [`OpenOptions::AS_LIBRARY`].
const MH_DYLIB: u32 = 0x6;
const MH_DYLIB_STUB: u32 = 0x9;
/// Not a standard Mach-O filetype; dyld shared caches store library images
/// with this synthetic tag in some tbd-family tooling. Treated identically
/// to `MH_DYLIB` here since the core never writes one back out.
const MH_DYLIB_IN_CACHE: u32 = 0x100_0000 | MH_DYLIB;

const LC_ID_DYLIB: u32 = 0xd;
/// Size in bytes of a `dylib_command`: an 8-byte `load_command` prefix
/// followed by a 16-byte `dylib` record (name offset + 3 u32 timestamps).
const SIZEOF_DYLIB_COMMAND: u32 = 24;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("range is invalid or out of bounds")]
    InvalidRange,
    #[error("magic does not identify a Mach-O slice")]
    InvalidMagic,
    #[error("header is too small for the declared bit width")]
    HeaderTooSmall,
    #[error("ncmds and sizeofcmds disagree about whether any load commands are present")]
    InconsistentCommandCount,
    #[error("not a library: filetype {0:#x} is not dylib/dylib_stub/dylib_in_cache")]
    NotALibrary(u32),
    #[error("no LC_ID_DYLIB command present")]
    MissingIdDylib,
    #[error("LC_ID_DYLIB command is smaller than a dylib_command")]
    IdDylibTooSmall,
    #[error("LC_ID_DYLIB name offset {offset} does not fit within cmdsize {cmdsize}")]
    IdDylibNameOffsetOutOfRange { offset: u32, cmdsize: u32 },
    #[error("arithmetic overflow computing a container-relative range")]
    ArithOverflow,
    #[error(transparent)]
    Commands(#[from] CommandsError),
    #[error(transparent)]
    Symtab(#[from] SymtabError),
}

/// One opened Mach-O slice: a single-architecture view, either the whole
/// file or one arch of a fat binary or a synthesized DSC image.
///
/// All structural validation that does not require walking load commands
/// happens in `open`/`open_as_library`/`open_as_dynamic_library`; the
/// command block itself is read lazily (spec: fat archives frequently open
/// many containers whose commands are never read).
pub struct Container {
    stream: Rc<dyn ByteStream>,
    range: ByteRange,
    bit_width: BitWidth,
    endian: Endian,
    header: RawHeader,
    load_commands: OnceCell<commands::LoadCommandCache>,
    symtab: OnceCell<Option<SymbolTableRef>>,
    string_pool: OnceCell<Vec<u8>>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("range", &self.range)
            .field("bit_width", &self.bit_width)
            .field("endian", &self.endian)
            .field("header", &self.header)
            .field("load_commands", &self.load_commands)
            .field("symtab", &self.symtab)
            .field("string_pool", &self.string_pool)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Opens `range` of `stream` as a Mach-O slice, reading and validating
    /// only the fixed header. Does not read load commands.
    pub fn open(
        stream: Rc<dyn ByteStream>,
        range: ByteRange,
        options: OpenOptions,
    ) -> Result<Self, ContainerError> {
        let magic_bytes: [u8; 16] = {
            let bytes = stream.read_at(range.base(), 16.min(range.size()))?;
            if bytes.len() < 16 {
                return Err(ContainerError::HeaderTooSmall);
            }
            bytes.try_into().expect("checked length above")
        };

        let classified = magic::classify(&magic_bytes);
        let (bit_width, mut endian) = match classified {
            Magic::Mach32 { endian } => (BitWidth::W32, endian),
            Magic::Mach64 { endian } => (BitWidth::W64, endian),
            _ => return Err(ContainerError::InvalidMagic),
        };
        if options.contains(OpenOptions::BIG_ENDIAN_INPUT) {
            endian = Endian::Big;
        }

        let header_size = bit_width.header_size();
        if range.size() < header_size {
            return Err(ContainerError::HeaderTooSmall);
        }

        let header_bytes = stream.read_at(range.base(), header_size)?;
        // Fields are read as on-disk (little-endian) order first, then
        // funneled through `swap_header` if the container is big-endian,
        // mirroring `container.cc`'s read-then-swap-if-needed pattern.
        let mut header = RawHeader {
            cputype: header_bytes.pread_with(4, scroll::Endian::Little).map_err(|_| ContainerError::HeaderTooSmall)?,
            cpusubtype: header_bytes.pread_with(8, scroll::Endian::Little).map_err(|_| ContainerError::HeaderTooSmall)?,
            filetype: header_bytes.pread_with(12, scroll::Endian::Little).map_err(|_| ContainerError::HeaderTooSmall)?,
            ncmds: header_bytes.pread_with(16, scroll::Endian::Little).map_err(|_| ContainerError::HeaderTooSmall)?,
            sizeofcmds: header_bytes.pread_with(20, scroll::Endian::Little).map_err(|_| ContainerError::HeaderTooSmall)?,
            flags: header_bytes.pread_with(24, scroll::Endian::Little).map_err(|_| ContainerError::HeaderTooSmall)?,
        };
        if endian.is_big() {
            primitives::swap_header(&mut header);
        }

        if (header.ncmds > 0) != (header.sizeofcmds > 0) {
            if options.contains(OpenOptions::IGNORE_INVALID_FIELDS) {
                log::warn!(
                    "ncmds ({}) and sizeofcmds ({}) disagree about whether load commands are \
                     present; continuing because IGNORE_INVALID_FIELDS is set",
                    header.ncmds,
                    header.sizeofcmds,
                );
            } else {
                return Err(ContainerError::InconsistentCommandCount);
            }
        }

        Ok(Self {
            stream,
            range,
            bit_width,
            endian,
            header,
            load_commands: OnceCell::new(),
            symtab: OnceCell::new(),
            string_pool: OnceCell::new(),
        })
    }

    /// As [`Container::open`], additionally requiring a library filetype.
    pub fn open_as_library(
        stream: Rc<dyn ByteStream>,
        range: ByteRange,
        options: OpenOptions,
    ) -> Result<Self, ContainerError> {
        let container = Self::open(stream, range, options | OpenOptions::AS_LIBRARY)?;
        container.require_library()?;
        Ok(container)
    }

    /// As [`Container::open_as_library`], additionally requiring a
    /// well-formed `LC_ID_DYLIB` load command.
    pub fn open_as_dynamic_library(
        stream: Rc<dyn ByteStream>,
        range: ByteRange,
        options: OpenOptions,
    ) -> Result<Self, ContainerError> {
        let container =
            Self::open(stream, range, options | OpenOptions::AS_LIBRARY | OpenOptions::AS_DYNAMIC_LIBRARY)?;
        container.require_library()?;

        let id_dylib = container
            .find_first_command(LC_ID_DYLIB)?
            .ok_or(ContainerError::MissingIdDylib)?;
        if id_dylib.cmdsize < SIZEOF_DYLIB_COMMAND {
            return Err(ContainerError::IdDylibTooSmall);
        }
        let name_offset: u32 = id_dylib
            .body
            .pread_with(0, container.endian.to_scroll())
            .map_err(|_| ContainerError::IdDylibTooSmall)?;
        if name_offset < SIZEOF_DYLIB_COMMAND || name_offset >= id_dylib.cmdsize {
            return Err(ContainerError::IdDylibNameOffsetOutOfRange {
                offset: name_offset,
                cmdsize: id_dylib.cmdsize,
            });
        }

        Ok(container)
    }

    fn require_library(&self) -> Result<(), ContainerError> {
        match self.header.filetype {
            MH_DYLIB | MH_DYLIB_STUB | MH_DYLIB_IN_CACHE => Ok(()),
            other => Err(ContainerError::NotALibrary(other)),
        }
    }

    pub fn header(&self) -> RawHeader {
        self.header
    }

    pub fn bit_width(&self) -> BitWidth {
        self.bit_width
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn range(&self) -> ByteRange {
        self.range
    }

    pub fn stream(&self) -> &Rc<dyn ByteStream> {
        &self.stream
    }

    /// Lazily populates the load-command cache, then scans for the first
    /// command of kind `cmd`. Returns `Ok(None)` if no command of that kind
    /// is present; only validation failures are `Err`.
    pub fn find_first_command(&self, cmd: u32) -> Result<Option<LoadCommand<'_>>, ContainerError> {
        let cache = self.load_commands()?;
        Ok(commands::find_first(cache, cmd))
    }

    /// Applies `visitor` to each load command in file order.
    pub fn iterate_commands(
        &self,
        mut visitor: impl FnMut(LoadCommand<'_>),
    ) -> Result<(), ContainerError> {
        let cache = self.load_commands()?;
        for entry in commands::iter(cache) {
            visitor(entry);
        }
        Ok(())
    }

    fn load_commands(&self) -> Result<&commands::LoadCommandCache, ContainerError> {
        if let Some(cache) = self.load_commands.get() {
            return Ok(cache);
        }
        let built = commands::build(
            self.stream.as_ref(),
            self.range,
            self.bit_width,
            self.endian,
            self.header,
        )?;
        // Single-threaded per spec §5: `get()` above returning `None`
        // guarantees this `set` cannot race with another populator.
        let _ = self.load_commands.set(built);
        Ok(self.load_commands.get().expect("just populated"))
    }

    /// Lazily resolves `LC_SYMTAB` and returns a bounds-checked reference
    /// to the symbol and string tables. `Ok(None)` if no `LC_SYMTAB` is
    /// present.
    pub fn symbol_table(&self) -> Result<Option<SymbolTableRef>, ContainerError> {
        if let Some(cached) = self.symtab.get() {
            return Ok(*cached);
        }
        let cache = self.load_commands()?;
        let resolved = symtab::resolve(cache, self.range, self.stream.size(), self.bit_width, self.endian)?;
        let _ = self.symtab.set(resolved);
        Ok(*self.symtab.get().expect("just populated"))
    }

    /// Returns the raw symbol records for this container's symbol table,
    /// byte-swapped per the container's endianness. Empty if there is no
    /// symbol table.
    pub fn symbol_records(&self) -> Result<Vec<SymbolRecord>, ContainerError> {
        let Some(symtab) = self.symbol_table()? else {
            return Ok(Vec::new());
        };
        let bytes = self
            .stream
            .read_at(self.range.base() + symtab.symoff as u64, symtab.nsyms as u64 * self.bit_width.symbol_record_size())?;
        Ok(symtab::read_records(&bytes, self.bit_width, self.endian))
    }

    /// Returns the bounds-checked string pool backing this container's
    /// symbol table, populated on first use.
    pub fn string_pool(&self) -> Result<&[u8], ContainerError> {
        if let Some(pool) = self.string_pool.get() {
            return Ok(pool);
        }
        let Some(symtab) = self.symbol_table()? else {
            let _ = self.string_pool.set(Vec::new());
            return Ok(self.string_pool.get().expect("just populated"));
        };
        let bytes = self
            .stream
            .read_at(self.range.base() + symtab.stroff as u64, symtab.strsize as u64)?;
        let _ = self.string_pool.set(bytes);
        Ok(self.string_pool.get().expect("just populated"))
    }

    /// Returns the NUL-terminated string at `n_strx` in the string pool,
    /// clamped to `strsize`.
    pub fn string_at(&self, n_strx: u32) -> Result<&str, ContainerError> {
        let pool = self.string_pool()?;
        symtab::string_at(pool, n_strx)
    }
}
