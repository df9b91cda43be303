//! Load-command walker: validates and iterates the command block, and
//! supports "find first of kind" with caching.
//!
//! Grounded on `examples/original_source/src/mach-o/container.cc`'s
//! `find_first_of_load_command`: the running-total-vs-`sizeofcmds` check
//! and the "last command must land exactly on the end" rule are carried
//! over unchanged in meaning, and
//! `examples/other_examples/2c508779_liamgoss-moscope__src-macho-load_commands.rs.rs`
//! for the `cmdsize < 8` / alignment bounds checks.

use crate::byte_stream::{ByteRange, ByteStream};
use crate::primitives::{self, BitWidth, Endian, LoadCommandPrefix, RawHeader};

#[derive(Debug, thiserror::Error)]
pub enum CommandsError {
    #[error(transparent)]
    Stream(#[from] crate::byte_stream::StreamError),
    #[error("load command at offset {offset} has cmdsize {cmdsize}, smaller than the 8-byte prefix")]
    LoadCommandTooSmall { offset: usize, cmdsize: u32 },
    #[error("load command block overflows or ends before sizeofcmds ({sizeofcmds})")]
    LoadCommandTooLarge { sizeofcmds: u32 },
    #[error("load command at offset {offset} has cmdsize {cmdsize} unaligned to {alignment}")]
    UnalignedCommand {
        offset: usize,
        cmdsize: u32,
        alignment: u32,
    },
    #[error("arithmetic overflow accumulating load command sizes")]
    ArithOverflow,
}

/// One load command, swapped, with its body borrowed from the container's
/// cached command block.
#[derive(Debug, Clone, Copy)]
pub struct LoadCommand<'a> {
    pub cmd: u32,
    pub cmdsize: u32,
    /// The command's body, i.e. everything after the 8-byte `{cmd,
    /// cmdsize}` prefix. Not byte-swapped: commands have widely varying
    /// internal layouts, so only the fixed prefix is swapped generically.
    pub body: &'a [u8],
}

#[derive(Debug)]
struct CommandEntry {
    cmd: u32,
    cmdsize: u32,
    /// Offset of `body` (i.e. just past the 8-byte prefix) within the
    /// cached block.
    body_start: usize,
}

/// The container's owned command-block cache: the raw bytes plus a
/// pre-validated index of every command's `{cmd, cmdsize, body_start}`.
/// Validation happens exactly once, when the cache is built.
#[derive(Debug)]
pub struct LoadCommandCache {
    raw: Vec<u8>,
    entries: Vec<CommandEntry>,
}

/// Reads and validates the command block for a container, returning the
/// populated cache. Called at most once per container (see
/// `Container::load_commands`).
pub(super) fn build(
    stream: &dyn ByteStream,
    range: ByteRange,
    bit_width: BitWidth,
    endian: Endian,
    header: RawHeader,
) -> Result<LoadCommandCache, CommandsError> {
    if header.ncmds == 0 || header.sizeofcmds == 0 {
        return Ok(LoadCommandCache {
            raw: Vec::new(),
            entries: Vec::new(),
        });
    }

    // `bit_width.header_size()` already accounts for the 64-bit header's
    // trailing 4-byte reserved field, so the command block starts right
    // after it.
    let load_command_base = range.base() + bit_width.header_size();
    let raw = stream.read_at(load_command_base, header.sizeofcmds as u64)?;

    let alignment = bit_width.command_alignment();
    let mut entries = Vec::with_capacity(header.ncmds as usize);
    let mut offset = 0usize;
    let mut size_used: u32 = 0;

    for i in 0..header.ncmds {
        if offset + 8 > raw.len() {
            return Err(CommandsError::LoadCommandTooLarge {
                sizeofcmds: header.sizeofcmds,
            });
        }

        let mut prefix = LoadCommandPrefix {
            cmd: u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap()),
            cmdsize: u32::from_le_bytes(raw[offset + 4..offset + 8].try_into().unwrap()),
        };
        if endian.is_big() {
            primitives::swap_load_command(&mut prefix);
        }

        if prefix.cmdsize < 8 {
            return Err(CommandsError::LoadCommandTooSmall {
                offset,
                cmdsize: prefix.cmdsize,
            });
        }
        if prefix.cmdsize % alignment != 0 {
            return Err(CommandsError::UnalignedCommand {
                offset,
                cmdsize: prefix.cmdsize,
                alignment,
            });
        }

        size_used = size_used
            .checked_add(prefix.cmdsize)
            .ok_or(CommandsError::ArithOverflow)?;
        let is_last = i == header.ncmds - 1;
        if size_used > header.sizeofcmds || (size_used == header.sizeofcmds && !is_last) {
            return Err(CommandsError::LoadCommandTooLarge {
                sizeofcmds: header.sizeofcmds,
            });
        }

        entries.push(CommandEntry {
            cmd: prefix.cmd,
            cmdsize: prefix.cmdsize,
            body_start: offset + 8,
        });

        offset += prefix.cmdsize as usize;
    }

    if size_used != header.sizeofcmds {
        return Err(CommandsError::LoadCommandTooLarge {
            sizeofcmds: header.sizeofcmds,
        });
    }

    Ok(LoadCommandCache { raw, entries })
}

fn entry_to_command<'a>(cache: &'a LoadCommandCache, entry: &CommandEntry) -> LoadCommand<'a> {
    let body_end = entry.body_start + (entry.cmdsize as usize - 8);
    LoadCommand {
        cmd: entry.cmd,
        cmdsize: entry.cmdsize,
        body: &cache.raw[entry.body_start..body_end],
    }
}

pub(super) fn find_first(cache: &LoadCommandCache, cmd: u32) -> Option<LoadCommand<'_>> {
    cache
        .entries
        .iter()
        .find(|entry| entry.cmd == cmd)
        .map(|entry| entry_to_command(cache, entry))
}

pub(super) fn iter(cache: &LoadCommandCache) -> impl Iterator<Item = LoadCommand<'_>> {
    cache.entries.iter().map(|entry| entry_to_command(cache, entry))
}
