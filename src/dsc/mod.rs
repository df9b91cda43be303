//! Parses a dyld shared cache's header, mapping table, and image table,
//! and translates virtual addresses to file offsets through the mappings.
//!
//! Grounded on the overall shape of
//! `examples/other_examples/cfeb4be6_gimli-rs-object__src-read-macho-dyld_cache.rs.rs`
//! (header + mapping slice + image slice, `parse_magic`, translate through
//! mappings) and spec §6's bit-exact field list, which this crate treats as
//! authoritative over the real, version-dependent dyld header (the real
//! header gained a subcache table and a `.symbols` cache well after the
//! fields named here; that structure is explicitly out of scope, see
//! `DESIGN.md`).

pub mod images;

use crate::byte_stream::{ByteStream, FileByteStream, SliceByteStream, StreamError};
use crate::container::OpenOptions;
use scroll::Pread;
use std::path::Path;
use std::rc::Rc;

pub use images::{dsc_iterate_images, DscImageError};

const DSC_MAGIC_PREFIX: &[u8] = b"dyld_v";
const HEADER_FIXED_SIZE: u64 = 32;
const SIZEOF_MAPPING: u64 = 32;
const SIZEOF_IMAGE: u64 = 32;

#[derive(Debug, thiserror::Error)]
pub enum DscError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("magic does not identify a dyld shared cache")]
    NotACache,
    #[error("file is too small to hold a dyld shared cache header")]
    TruncatedHeader,
    #[error("mapping table [{offset}, +{count}*{size}) is out of range", size = SIZEOF_MAPPING)]
    TruncatedMappings { offset: u32, count: u32 },
    #[error("image table [{offset}, +{count}*{size}) is out of range", size = SIZEOF_IMAGE)]
    TruncatedImages { offset: u32, count: u32 },
    #[error("mappings {first} and {second} overlap in the virtual address space")]
    OverlappingMappings { first: usize, second: usize },
    #[error("I/O error opening or mapping the cache file")]
    ReadFail(#[source] std::io::Error),
    #[error("address {0:#x} does not fall within any mapping")]
    AddressNotMapped(u64),
    #[error("path at file offset {0:#x} is not valid UTF-8")]
    InvalidPath(u32),
    #[error("arithmetic overflow computing a dyld cache offset")]
    ArithOverflow,
}

/// `{address, size, fileOffset}`: one contiguous virtual-address-to-file
/// translation entry. Invariant: the full mapping table is non-overlapping
/// in address space (checked once, at load).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DscMapping {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
}

impl DscMapping {
    fn end(self) -> u64 {
        self.address + self.size
    }

    fn contains(self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }
}

/// `{address, modTime, inode, pathFileOffset, pad}` describing one image
/// embedded in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DscImageInfo {
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    pub path_file_offset: u32,
    pub pad: u32,
}

/// The bit this crate uses to memoize "already extracted" on a
/// [`DscImageInfo::pad`], matching
/// `E_DYLD_CACHE_IMAGE_INFO_PAD_ALREADY_EXTRACTED` in the original tool.
pub const IMAGE_INFO_PAD_ALREADY_EXTRACTED: u32 = 1 << 0;

impl DscImageInfo {
    pub fn is_extracted(self) -> bool {
        self.pad & IMAGE_INFO_PAD_ALREADY_EXTRACTED != 0
    }

    pub fn mark_extracted(&mut self) {
        self.pad |= IMAGE_INFO_PAD_ALREADY_EXTRACTED;
    }
}

/// Decoded dyld shared cache: a read-only byte view plus the mapping and
/// image tables. Synthesized containers created by
/// [`dsc_iterate_images`] borrow this struct's stream and must not outlive
/// it.
pub struct DscInfo {
    stream: Rc<dyn ByteStream>,
    /// Sorted by `address` at load time so [`DscInfo::translate`] can
    /// binary-search: real caches carry mappings across several subcaches,
    /// dozens in aggregate, so a one-time sort pays for itself.
    mappings: Vec<DscMapping>,
    images: Vec<std::cell::RefCell<DscImageInfo>>,
}

impl DscInfo {
    /// Opens and memory-maps `path`, then parses and validates the header,
    /// mapping table, and image table.
    pub fn from_file(path: &Path, options: OpenOptions) -> Result<Self, DscError> {
        let file = std::fs::File::open(path).map_err(DscError::ReadFail)?;
        // Safety: the mapping is read-only and the file is not expected to
        // be modified by another process while this process holds it open;
        // callers opening untrusted or actively-written caches should copy
        // the file first.
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(DscError::ReadFail)?;
        let stream: Rc<dyn ByteStream> = Rc::new(SliceByteStream::new(mmap));
        Self::from_stream(stream, options)
    }

    /// As [`DscInfo::from_file`], but reading through an already-open
    /// file descriptor via save/restore bracketed `read_at` instead of a
    /// memory map.
    pub fn from_file_stream(file: std::fs::File, options: OpenOptions) -> Result<Self, DscError> {
        let stream: Rc<dyn ByteStream> = Rc::new(FileByteStream::from_file(file)?);
        Self::from_stream(stream, options)
    }

    /// Parses a dyld shared cache already backed by `stream`. Exposed
    /// separately from [`DscInfo::from_file`] so tests (and synthetic
    /// caches) can supply a [`SliceByteStream`] directly.
    pub fn from_stream(stream: Rc<dyn ByteStream>, options: OpenOptions) -> Result<Self, DscError> {
        let size = stream.size();
        if size < 16 {
            return Err(DscError::TruncatedHeader);
        }
        let magic = stream.read_at(0, 16)?;
        if !magic.starts_with(DSC_MAGIC_PREFIX) {
            return Err(DscError::NotACache);
        }
        if size < HEADER_FIXED_SIZE {
            return Err(DscError::TruncatedHeader);
        }

        let header_bytes = stream.read_at(0, HEADER_FIXED_SIZE)?;
        let mapping_offset: u32 = header_bytes.pread_with(16, scroll::Endian::Little).unwrap();
        let mapping_count: u32 = header_bytes.pread_with(20, scroll::Endian::Little).unwrap();
        let image_offset: u32 = header_bytes.pread_with(24, scroll::Endian::Little).unwrap();
        let image_count: u32 = header_bytes.pread_with(28, scroll::Endian::Little).unwrap();

        let mappings = Self::read_mappings(stream.as_ref(), mapping_offset, mapping_count, size)?;
        let mut images = Self::read_images(stream.as_ref(), image_offset, image_count, size)?;
        if options.contains(OpenOptions::ZERO_IMAGE_PADS) {
            for image in &mut images {
                image.pad = 0;
            }
        }

        let mut sorted = mappings;
        sorted.sort_by_key(|m| m.address);
        for (i, pair) in sorted.windows(2).enumerate() {
            if pair[0].end() > pair[1].address {
                return Err(DscError::OverlappingMappings {
                    first: i,
                    second: i + 1,
                });
            }
        }

        Ok(Self {
            stream,
            mappings: sorted,
            images: images.into_iter().map(std::cell::RefCell::new).collect(),
        })
    }

    fn read_mappings(
        stream: &dyn ByteStream,
        offset: u32,
        count: u32,
        stream_size: u64,
    ) -> Result<Vec<DscMapping>, DscError> {
        let total = (count as u64)
            .checked_mul(SIZEOF_MAPPING)
            .ok_or(DscError::ArithOverflow)?;
        let end = (offset as u64).checked_add(total).ok_or(DscError::ArithOverflow)?;
        if end > stream_size {
            return Err(DscError::TruncatedMappings { offset, count });
        }
        let bytes = stream.read_at(offset as u64, total)?;
        let mut mappings = Vec::with_capacity(count as usize);
        let mut cursor = 0usize;
        for _ in 0..count {
            let address: u64 = bytes.pread_with(cursor, scroll::Endian::Little).unwrap();
            let size: u64 = bytes.pread_with(cursor + 8, scroll::Endian::Little).unwrap();
            let file_offset: u64 = bytes.pread_with(cursor + 16, scroll::Endian::Little).unwrap();
            // maxProt/initProt (cursor+24..28) are not exposed; the core
            // only needs the address-to-file translation.
            mappings.push(DscMapping {
                address,
                size,
                file_offset,
            });
            cursor += SIZEOF_MAPPING as usize;
        }
        Ok(mappings)
    }

    fn read_images(
        stream: &dyn ByteStream,
        offset: u32,
        count: u32,
        stream_size: u64,
    ) -> Result<Vec<DscImageInfo>, DscError> {
        let total = (count as u64)
            .checked_mul(SIZEOF_IMAGE)
            .ok_or(DscError::ArithOverflow)?;
        let end = (offset as u64).checked_add(total).ok_or(DscError::ArithOverflow)?;
        if end > stream_size {
            return Err(DscError::TruncatedImages { offset, count });
        }
        let bytes = stream.read_at(offset as u64, total)?;
        let mut images = Vec::with_capacity(count as usize);
        let mut cursor = 0usize;
        for _ in 0..count {
            let address: u64 = bytes.pread_with(cursor, scroll::Endian::Little).unwrap();
            let mod_time: u64 = bytes.pread_with(cursor + 8, scroll::Endian::Little).unwrap();
            let inode: u64 = bytes.pread_with(cursor + 16, scroll::Endian::Little).unwrap();
            let path_file_offset: u32 = bytes.pread_with(cursor + 24, scroll::Endian::Little).unwrap();
            // `pad` packs the "already extracted" memo bit in bit 0; the
            // remaining bits are reserved by the format and preserved.
            let pad: u32 = bytes.pread_with(cursor + 28, scroll::Endian::Little).unwrap();
            images.push(DscImageInfo {
                address,
                mod_time,
                inode,
                path_file_offset,
                pad,
            });
            cursor += SIZEOF_IMAGE as usize;
        }
        Ok(images)
    }

    pub fn stream(&self) -> &Rc<dyn ByteStream> {
        &self.stream
    }

    pub fn mappings(&self) -> &[DscMapping] {
        &self.mappings
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_at(&self, index: usize) -> Option<DscImageInfo> {
        self.images.get(index).map(|cell| *cell.borrow())
    }

    pub(crate) fn set_image_pad(&self, index: usize, pad: u32) {
        if let Some(cell) = self.images.get(index) {
            cell.borrow_mut().pad = pad;
        }
    }

    /// Looks up the mapping containing `address` via binary search over
    /// the (address-sorted) mapping table and returns the corresponding
    /// file offset.
    pub fn translate(&self, address: u64) -> Result<u64, DscError> {
        let idx = self
            .mappings
            .partition_point(|m| m.end() <= address);
        match self.mappings.get(idx) {
            Some(mapping) if mapping.contains(address) => {
                let delta = address - mapping.address;
                mapping
                    .file_offset
                    .checked_add(delta)
                    .ok_or(DscError::ArithOverflow)
            }
            _ => Err(DscError::AddressNotMapped(address)),
        }
    }

    /// Returns the NUL-terminated path for `image`, read from
    /// `image.path_file_offset`.
    pub fn image_path(&self, image: DscImageInfo) -> Result<String, DscError> {
        let remaining = self
            .stream
            .size()
            .checked_sub(image.path_file_offset as u64)
            .ok_or(DscError::ArithOverflow)?;
        // Paths are short; 1024 bytes comfortably covers any real dyld
        // image path while bounding the read.
        let probe_len = remaining.min(1024);
        let bytes = self.stream.read_at(image.path_file_offset as u64, probe_len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end])
            .map(str::to_owned)
            .map_err(|_| DscError::InvalidPath(image.path_file_offset))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dsc_header(mapping_offset: u32, mapping_count: u32, image_offset: u32, image_count: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"dyld_v1  arm64e\0");
        buf.extend_from_slice(&mapping_offset.to_le_bytes());
        buf.extend_from_slice(&mapping_count.to_le_bytes());
        buf.extend_from_slice(&image_offset.to_le_bytes());
        buf.extend_from_slice(&image_count.to_le_bytes());
        buf
    }

    fn mapping_record(address: u64, size: u64, file_offset: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&address.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&file_offset.to_le_bytes());
        buf.extend_from_slice(&7u32.to_le_bytes()); // maxProt
        buf.extend_from_slice(&3u32.to_le_bytes()); // initProt
        buf
    }

    fn image_record(address: u64, path_file_offset: u32, pad: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&address.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // modTime
        buf.extend_from_slice(&0u64.to_le_bytes()); // inode
        buf.extend_from_slice(&path_file_offset.to_le_bytes());
        buf.extend_from_slice(&pad.to_le_bytes());
        buf
    }

    fn two_image_cache() -> Vec<u8> {
        let mapping_offset = 32u32;
        let mapping_count = 1u32;
        let image_offset = mapping_offset + SIZEOF_MAPPING as u32;
        let image_count = 2u32;
        let paths_offset = image_offset + image_count * SIZEOF_IMAGE as u32;

        let mut file = dsc_header(mapping_offset, mapping_count, image_offset, image_count);
        file.extend(mapping_record(0x1000, 0x4000, 0x10000));
        file.extend(image_record(0x1500, paths_offset, 0));
        file.extend(image_record(0x2500, paths_offset + 7, 0));
        file.extend_from_slice(b"/a/one\0");
        file.extend_from_slice(b"/a/two\0");
        file
    }

    #[test]
    fn parses_header_mappings_and_images() {
        let file = two_image_cache();
        let stream: Rc<dyn ByteStream> = Rc::new(SliceByteStream::new(file));
        let dsc = DscInfo::from_stream(stream, OpenOptions::empty()).unwrap();
        assert_eq!(dsc.mappings().len(), 1);
        assert_eq!(dsc.image_count(), 2);
        assert_eq!(dsc.translate(0x2500).unwrap(), 0x11500);
        let image = dsc.image_at(1).unwrap();
        assert_eq!(dsc.image_path(image).unwrap(), "/a/two");
    }

    #[test]
    fn rejects_address_outside_any_mapping() {
        let file = two_image_cache();
        let stream: Rc<dyn ByteStream> = Rc::new(SliceByteStream::new(file));
        let dsc = DscInfo::from_stream(stream, OpenOptions::empty()).unwrap();
        assert!(matches!(
            dsc.translate(0x9000),
            Err(DscError::AddressNotMapped(0x9000))
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut file = dsc_header(32, 0, 32, 0);
        file[0] = b'X';
        let stream: Rc<dyn ByteStream> = Rc::new(SliceByteStream::new(file));
        assert!(matches!(
            DscInfo::from_stream(stream, OpenOptions::empty()),
            Err(DscError::NotACache)
        ));
    }
}
