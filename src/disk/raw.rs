use std::fs::File;
use std::path::Path;

use super::io::{PartitionIo, sparse_copy, write_at};
use crate::error::{Result, ToolError};
use crate::gadget::Filesystem;
use crate::layout::{GadgetTree, ResolvedContentKind, ResolvedVolume};

/// Copy every raw content item of `volume` to its absolute offset. The
/// `mbr` role structure is included: it lives at byte 0.
pub fn write_content(image: &Path, volume: &ResolvedVolume, gadget: &GadgetTree) -> Result<()> {
    for s in volume
        .structures
        .iter()
        .filter(|s| s.filesystem == Filesystem::None)
    {
        for item in &s.content {
            let ResolvedContentKind::Raw { name, image: src, .. } = &item.kind else {
                continue;
            };
            let label = name.as_deref().unwrap_or(&s.label);
            let at = s.offset + item.offset;
            log::debug!("copying {src} to {} at {at} ({} bytes)", volume.name, item.size);

            let path = gadget.path_of(src);
            let mut input = File::open(&path).map_err(|e| ToolError::io("copy", label, e))?;
            let mut window = PartitionIo::open(image, at, item.size)
                .map_err(|e| ToolError::io("copy", label, e))?;
            sparse_copy(&mut input, &mut window).map_err(|e| ToolError::io("copy", label, e))?;
        }
    }
    Ok(())
}

/// Apply every resolved offset-write of `volume`.
pub fn apply_offset_writes(image: &Path, volume: &ResolvedVolume) -> Result<()> {
    for (label, write) in volume.writes() {
        log::debug!(
            "offset-write {label}: {} at byte {}",
            write.value,
            write.location
        );
        write_at(image, write.location, &write.bytes())
            .map_err(|e| ToolError::io("offset-write", &label, e))?;
    }
    Ok(())
}
