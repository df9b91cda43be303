//! A seekable, bounded byte source, the foundation every other component
//! reads through.
//!
//! Grounded on the teacher's `linux/module_reader.rs::ModuleMemory` trait:
//! a minimal interface over "read `length` bytes at `offset`, bounds
//! checked", implemented once for an in-memory slice (tests, synthesized
//! DSC-image containers) and once for a real file.

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

/// A `{base, size}` pair in file coordinates.
///
/// Invariant: `base + size` does not overflow and lies within the owning
/// stream's length. Immutable once constructed -- [`ByteRange::new`] is the
/// only constructor and enforces the invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    base: u64,
    size: u64,
}

impl ByteRange {
    /// Builds a `ByteRange`, checking that `base + size` does not overflow
    /// and fits within `stream_size`.
    pub fn new(base: u64, size: u64, stream_size: u64) -> Result<Self, StreamError> {
        let end = base
            .checked_add(size)
            .ok_or(StreamError::OutOfRange {
                offset: base,
                length: size,
                size: stream_size,
            })?;
        if end > stream_size {
            return Err(StreamError::OutOfRange {
                offset: base,
                length: size,
                size: stream_size,
            });
        }
        Ok(Self { base, size })
    }

    pub fn base(self) -> u64 {
        self.base
    }

    pub fn size(self) -> u64 {
        self.size
    }

    pub fn end(self) -> u64 {
        // Cannot overflow: checked at construction.
        self.base + self.size
    }

    /// Whether `self` and `other` describe disjoint byte ranges.
    pub fn is_disjoint_from(self, other: ByteRange) -> bool {
        self.end() <= other.base || other.end() <= self.base
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("seek failed")]
    StreamSeek(#[source] std::io::Error),
    #[error("read failed")]
    StreamRead(#[source] std::io::Error),
    #[error("offset {offset} + length {length} is out of range for a stream of size {size}")]
    OutOfRange {
        offset: u64,
        length: u64,
        size: u64,
    },
}

/// A seekable, bounded byte source over a file or an in-memory buffer.
///
/// Implementations must not expose partial reads: `read_at` either returns
/// exactly `len` bytes or an error.
pub trait ByteStream {
    /// Reads exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>, StreamError>;

    /// Total length of the stream, in bytes.
    fn size(&self) -> u64;

    /// Returns a reference wrapped so that `subrange` can be implemented
    /// generically over any `ByteStream`.
    fn subrange(self: Rc<Self>, base: u64, size: u64) -> SubRange
    where
        Self: Sized + 'static,
    {
        SubRange {
            inner: self,
            base,
            size,
        }
    }
}

/// A file-backed [`ByteStream`].
///
/// `read_at` brackets the read with a save/restore of the file's cursor
/// position (spec §5: "every reader uses save/restore bracketing around
/// `read_at`") so that multiple readers sharing one `File` via `dup`-like
/// handles don't corrupt each other's position, at the cost of a lock per
/// read -- callers wanting concurrency should open independent file
/// descriptors instead.
pub struct FileByteStream {
    file: RefCell<File>,
    size: u64,
}

impl FileByteStream {
    pub fn open(path: &std::path::Path) -> Result<Self, StreamError> {
        let file = File::open(path).map_err(StreamError::StreamRead)?;
        Self::from_file(file)
    }

    pub fn from_file(file: File) -> Result<Self, StreamError> {
        let size = file.metadata().map_err(StreamError::StreamRead)?.len();
        Ok(Self {
            file: RefCell::new(file),
            size,
        })
    }
}

impl ByteStream for FileByteStream {
    fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>, StreamError> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(StreamError::OutOfRange {
                offset,
                length: len,
                size: self.size,
            });
        }

        let mut file = self.file.borrow_mut();
        let saved = file.stream_position().map_err(StreamError::StreamSeek)?;

        let result = (|| {
            file.seek(SeekFrom::Start(offset))
                .map_err(StreamError::StreamSeek)?;
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf).map_err(StreamError::StreamRead)?;
            Ok(buf)
        })();

        file.seek(SeekFrom::Start(saved))
            .map_err(StreamError::StreamSeek)?;

        result
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// An in-memory [`ByteStream`], backing unit tests and the DSC's
/// memory-mapped view (via [`crate::dsc::DscInfo`], which stores the
/// `memmap2::Mmap` and exposes it as a byte slice here).
pub struct SliceByteStream<B> {
    data: B,
}

impl<B: AsRef<[u8]>> SliceByteStream<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }
}

impl<B: AsRef<[u8]>> ByteStream for SliceByteStream<B> {
    fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>, StreamError> {
        let data = self.data.as_ref();
        let size = data.len() as u64;
        let end = offset.checked_add(len).filter(|&end| end <= size).ok_or(
            StreamError::OutOfRange {
                offset,
                length: len,
                size,
            },
        )?;
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn size(&self) -> u64 {
        self.data.as_ref().len() as u64
    }
}

/// A derived stream constrained to `[base, base+size)` of some underlying
/// stream; all offsets passed to `read_at` are relative to `base`.
pub struct SubRange {
    inner: Rc<dyn ByteStream>,
    base: u64,
    size: u64,
}

impl ByteStream for SubRange {
    fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>, StreamError> {
        offset
            .checked_add(len)
            .filter(|&end| end <= self.size)
            .ok_or(StreamError::OutOfRange {
                offset,
                length: len,
                size: self.size,
            })?;
        let absolute = self.base.checked_add(offset).ok_or(StreamError::OutOfRange {
            offset,
            length: len,
            size: self.size,
        })?;
        self.inner.read_at(absolute, len)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
