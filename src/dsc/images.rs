//! Walks a dyld shared cache's image table; for each image, synthesises a
//! virtual Mach-O container rooted inside the mapped region and hands it
//! to a caller-supplied callback.
//!
//! Grounded on `examples/original_source/src/parse_dsc_for_main.c`'s
//! `dsc_iterate_images_callback`/`actually_parse_image` (the
//! `E_DYLD_CACHE_IMAGE_INFO_PAD_ALREADY_EXTRACTED` skip-if-already-marked
//! check, and "one bad image doesn't stop the loop" via
//! `handle_dsc_image_parse_result` deciding whether to continue).

use super::{DscError, DscImageInfo, DscInfo};
use crate::byte_stream::ByteRange;
use crate::container::{Container, ContainerError, OpenOptions};
use crate::error_list::SoftErrorSublist;

const LC_SEGMENT: u32 = 0x1;
const LC_SEGMENT_64: u32 = 0x19;

#[derive(Debug, thiserror::Error)]
pub enum DscImageError {
    #[error(transparent)]
    Dsc(#[from] DscError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("image at address {0:#x} has no LC_SEGMENT/LC_SEGMENT_64 command to bound its size")]
    NoSegmentBound(u64),
}

/// Walks `dsc`'s image table in table order, calling `callback(image,
/// path, container, ctx)` for each. `container` is `None` when the
/// image's `pad` bit 0 ("already extracted") was already set on entry --
/// the caller asked to skip synthesis-and-parse for it -- or when
/// synthesis failed, in which case the failure is recorded in `errors`
/// instead of aborting the walk.
///
/// Iteration stops as soon as `callback` returns `false`. A freshly
/// synthesised container that the callback processed has its `pad` bit 0
/// set afterwards, so a later re-run of the same walk treats it as
/// already extracted.
pub fn dsc_iterate_images<C>(
    dsc: &DscInfo,
    ctx: &mut C,
    mut errors: SoftErrorSublist<'_, DscImageError>,
    mut callback: impl FnMut(DscImageInfo, &str, Option<&Container>, &mut C) -> bool,
) -> Result<(), DscError> {
    for index in 0..dsc.image_count() {
        let image = dsc.image_at(index).expect("index within image_count()");

        let path = match dsc.image_path(image) {
            Ok(path) => path,
            Err(e) => {
                errors.push(DscImageError::Dsc(e));
                continue;
            }
        };

        let already_extracted = image.is_extracted();
        let container = if already_extracted {
            None
        } else {
            match synthesize_container(dsc, image) {
                Ok(container) => Some(container),
                Err(e) => {
                    errors.push(e);
                    None
                }
            }
        };

        let should_continue = callback(image, &path, container.as_ref(), ctx);

        if !already_extracted && container.is_some() {
            let mut marked = image;
            marked.mark_extracted();
            dsc.set_image_pad(index, marked.pad);
        }

        if !should_continue {
            break;
        }
    }
    Ok(())
}

/// Translates `image.address` through the cache's mapping table, opens an
/// unbounded probe container there to walk its load commands, then
/// reopens it bounded to the minimal extent its `LC_SEGMENT`/
/// `LC_SEGMENT_64` commands declare.
fn synthesize_container(dsc: &DscInfo, image: DscImageInfo) -> Result<Container, DscImageError> {
    let base_offset = dsc.translate(image.address)?;
    let stream = dsc.stream();
    let stream_size = stream.size();

    let probe_size = stream_size
        .checked_sub(base_offset)
        .ok_or(DscError::ArithOverflow)?;
    let probe_range = ByteRange::new(base_offset, probe_size, stream_size).map_err(DscError::from)?;
    let probe = Container::open(stream.clone(), probe_range, OpenOptions::empty())?;

    let mut max_end: Option<u64> = None;
    probe.iterate_commands(|cmd| {
        let extent = match cmd.cmd {
            LC_SEGMENT if cmd.body.len() >= 32 => {
                let fileoff = u32::from_le_bytes(cmd.body[24..28].try_into().unwrap()) as u64;
                let filesize = u32::from_le_bytes(cmd.body[28..32].try_into().unwrap()) as u64;
                Some(fileoff + filesize)
            }
            LC_SEGMENT_64 if cmd.body.len() >= 48 => {
                let fileoff = u64::from_le_bytes(cmd.body[32..40].try_into().unwrap());
                let filesize = u64::from_le_bytes(cmd.body[40..48].try_into().unwrap());
                Some(fileoff + filesize)
            }
            _ => None,
        };
        if let Some(extent) = extent {
            max_end = Some(max_end.map_or(extent, |prev| prev.max(extent)));
        }
    })?;

    let size = max_end.ok_or(DscImageError::NoSegmentBound(image.address))?;
    let bounded_range = ByteRange::new(base_offset, size, stream_size).map_err(DscError::from)?;
    Ok(Container::open(stream.clone(), bounded_range, OpenOptions::empty())?)
}
