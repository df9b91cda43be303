//! S5/S6 from spec.md §8: a dyld shared cache with two images, and an
//! image already marked "already extracted" via its `pad` bit.

use macho_tbd_core::byte_stream::{ByteStream, SliceByteStream};
use macho_tbd_core::error_list::SoftErrorList;
use macho_tbd_core::{dsc_iterate_images, DscImageError, DscInfo, OpenOptions};
use std::rc::Rc;

const SIZEOF_MAPPING: u32 = 32;
const SIZEOF_IMAGE: u32 = 32;
const LC_SEGMENT_64: u32 = 0x19;

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
    buf.extend_from_slice(&7u32.to_le_bytes());
    buf.extend_from_slice(&3u32.to_le_bytes());
    buf
}

fn image_record(address: u64, path_file_offset: u32, pad: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&address.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&path_file_offset.to_le_bytes());
    buf.extend_from_slice(&pad.to_le_bytes());
    buf
}

fn mach64_dylib_with_segment(total_size: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&0xfeed_facfu32.to_le_bytes());
    buf.extend_from_slice(&0x0100_000cu32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0x6u32.to_le_bytes()); // MH_DYLIB
    buf.extend_from_slice(&1u32.to_le_bytes());
    let cmdsize = 72u32;
    buf.extend_from_slice(&cmdsize.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());

    buf.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
    buf.extend_from_slice(&cmdsize.to_le_bytes());
    buf.extend_from_slice(&[0u8; 16]);
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&(total_size as u64).to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&(total_size as u64).to_le_bytes());
    buf.extend_from_slice(&7u32.to_le_bytes());
    buf.extend_from_slice(&3u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.resize(total_size as usize, 0);
    buf
}

/// One mapping `[0x1000, 0x5000) -> file offset 0x10000`, two images at
/// `0x1500` and `0x2500`, each a minimal 64-bit dylib with one segment.
fn two_image_cache(second_pad: u32) -> Vec<u8> {
    let mapping_offset = 32u32;
    let mapping_count = 1u32;
    let image_offset = mapping_offset + SIZEOF_MAPPING;
    let image_count = 2u32;
    let paths_offset = image_offset + image_count * SIZEOF_IMAGE;

    let mut file = dsc_header(mapping_offset, mapping_count, image_offset, image_count);
    file.extend(mapping_record(0x1000, 0x4000, 0x10000));
    file.extend(image_record(0x1500, paths_offset, 0));
    file.extend(image_record(0x2500, paths_offset + 7, second_pad));
    file.extend_from_slice(b"/a/one\0");
    file.extend_from_slice(b"/a/two\0");

    // Image bodies, addressed by translate(): 0x1500 -> 0x10500, 0x2500 -> 0x11500.
    file.resize(0x10500, 0);
    file.extend(mach64_dylib_with_segment(0x200));
    file.resize(0x11500, 0);
    file.extend(mach64_dylib_with_segment(0x200));
    file
}

#[test]
fn s5_two_images_translate_and_synthesise() {
    let file = two_image_cache(0);
    let stream: Rc<dyn ByteStream> = Rc::new(SliceByteStream::new(file));
    let dsc = DscInfo::from_stream(stream, OpenOptions::empty()).unwrap();

    assert_eq!(dsc.translate(0x2500).unwrap(), 0x11500);

    let mut paths = Vec::new();
    let mut errors: SoftErrorList<DscImageError> = SoftErrorList::default();
    dsc_iterate_images(&dsc, &mut (), errors.inserted_sublist(), |_image, path, container, _ctx| {
        paths.push(path.to_string());
        assert!(container.is_some(), "S5 expects a synthesised container for every fresh image");
        true
    })
    .unwrap();

    assert_eq!(paths, vec!["/a/one", "/a/two"]);
    assert!(errors.is_empty());
}

#[test]
fn s6_image_already_marked_extracted_is_not_resynthesised() {
    let file = two_image_cache(macho_tbd_core::dsc::IMAGE_INFO_PAD_ALREADY_EXTRACTED);
    let stream: Rc<dyn ByteStream> = Rc::new(SliceByteStream::new(file));
    let dsc = DscInfo::from_stream(stream, OpenOptions::empty()).unwrap();

    let mut containers_seen = Vec::new();
    let mut errors: SoftErrorList<DscImageError> = SoftErrorList::default();
    dsc_iterate_images(&dsc, &mut (), errors.inserted_sublist(), |_image, path, container, _ctx| {
        containers_seen.push((path.to_string(), container.is_some()));
        true
    })
    .unwrap();

    assert_eq!(containers_seen[0], ("/a/one".to_string(), true));
    assert_eq!(containers_seen[1], ("/a/two".to_string(), false));
}
