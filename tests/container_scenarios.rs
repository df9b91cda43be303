//! S1/S2 from spec.md §8: opening a single 64-bit LE dylib, and rejecting
//! a malformed command inside it.

use macho_tbd_core::{
    Container, ContainerError, File, OpenFileError, OpenOptions,
};
use std::io::Write;

const LC_ID_DYLIB: u32 = 0xd;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_DYLIB: u32 = 0x6;

fn mach64_header(ncmds: u32, sizeofcmds: u32, filetype: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
    buf.extend_from_slice(&0x0100_0007u32.to_le_bytes()); // cputype
    buf.extend_from_slice(&3u32.to_le_bytes()); // cpusubtype
    buf.extend_from_slice(&filetype.to_le_bytes());
    buf.extend_from_slice(&ncmds.to_le_bytes());
    buf.extend_from_slice(&sizeofcmds.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // flags
    buf.extend_from_slice(&0u32.to_le_bytes()); // reserved
    buf
}

fn id_dylib_command(name_offset: u32, cmdsize: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&LC_ID_DYLIB.to_le_bytes());
    buf.extend_from_slice(&cmdsize.to_le_bytes());
    buf.extend_from_slice(&name_offset.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // timestamp
    buf.extend_from_slice(&0u32.to_le_bytes()); // current_version
    buf.extend_from_slice(&0u32.to_le_bytes()); // compatibility_version
    buf.resize(cmdsize as usize, 0);
    buf
}

fn write_fixture(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(bytes).unwrap();
    tmp
}

#[test]
fn s1_single_64_bit_le_dylib_opens_as_dynamic_library() {
    let id_cmd = id_dylib_command(24, 32);
    let mut bytes = mach64_header(1, id_cmd.len() as u32, MH_DYLIB);
    bytes.extend(&id_cmd);
    let tmp = write_fixture(&bytes);

    let file = macho_tbd_core::open_file(tmp.path(), OpenOptions::AS_DYNAMIC_LIBRARY).unwrap();
    let File::Slice(container) = file else {
        panic!("expected a single Mach-O slice");
    };

    let id = container.find_first_command(LC_ID_DYLIB).unwrap().unwrap();
    assert_eq!(id.cmd, LC_ID_DYLIB);
    assert!(container.symbol_table().unwrap().is_none());
}

#[test]
fn s2_malformed_command_reports_too_small_on_walk_without_caching() {
    let mut bytes = mach64_header(1, 8, MH_DYLIB);
    bytes.extend_from_slice(&LC_ID_DYLIB.to_le_bytes());
    bytes.extend_from_slice(&4u32.to_le_bytes()); // cmdsize=4, below the 8-byte minimum
    let tmp = write_fixture(&bytes);

    let file = macho_tbd_core::open_file(tmp.path(), OpenOptions::empty()).unwrap();
    let File::Slice(container) = file else {
        panic!("expected a single Mach-O slice");
    };

    let first = container.find_first_command(LC_ID_DYLIB);
    assert!(matches!(
        first,
        Err(ContainerError::Commands(
            macho_tbd_core::container::CommandsError::LoadCommandTooSmall { .. }
        ))
    ));
    // A second attempt must not resurrect a partially populated cache.
    let second = container.find_first_command(LC_ID_DYLIB);
    assert!(second.is_err());
}

#[test]
fn opening_as_dynamic_library_without_an_id_dylib_command_fails() {
    let bytes = mach64_header(0, 0, MH_DYLIB);
    let tmp = write_fixture(&bytes);
    let err = Container::open_as_dynamic_library(
        std::rc::Rc::new(macho_tbd_core::FileByteStream::open(tmp.path()).unwrap()),
        macho_tbd_core::ByteRange::new(0, 32, 32).unwrap(),
        OpenOptions::empty(),
    )
    .unwrap_err();
    assert!(matches!(err, ContainerError::MissingIdDylib));
}

#[test]
fn unrecognised_magic_is_reported() {
    let tmp = write_fixture(&[0u8; 32]);
    assert!(matches!(
        macho_tbd_core::open_file(tmp.path(), OpenOptions::empty()),
        Err(OpenFileError::UnknownMagic)
    ));
}
