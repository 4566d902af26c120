use std::collections::HashMap;

use super::{
    ContentSizer, ResolvedContent, ResolvedContentKind, ResolvedLayout, ResolvedStructure,
    ResolvedVolume, ResolvedWrite, SECTOR_SIZE, SizeSource,
};
use crate::error::LayoutError;
use crate::gadget::{
    ContentItem, Filesystem, GadgetSpec, MBR_BOOT_CODE_SIZE, OffsetWrite, Role, Schema,
    StructureSpec, VolumeSpec,
};
use crate::size::{ImageSizeSpec, MIB, SizeHint, align_up};

type Result<T> = std::result::Result<T, LayoutError>;

/// Headroom added to the packed content of a filesystem with no explicit size.
const FS_METADATA_HEADROOM: u64 = 8 * MIB;
/// Room for the backup GPT (header plus 32 sectors of entries), rounded up.
const GPT_BACKUP_RESERVE: u64 = 17 * 1024;

/// Compute offsets and sizes for every volume in `spec`.
///
/// Offsets and sizes are assigned first; `offset-write` references are
/// resolved in a second pass so they may name labels declared later.
pub fn resolve(
    spec: &GadgetSpec,
    sizer: &dyn ContentSizer,
    hints: Option<&ImageSizeSpec>,
) -> Result<ResolvedLayout> {
    let names = spec.volume_names();
    if let Some(hints) = hints {
        for selector in hints.unmatched_selectors(&names) {
            log::warn!("--image-size selector `{selector}` matches no volume, ignoring it");
        }
    }

    let mut volumes = Vec::with_capacity(spec.volumes.len());
    for (index, volume) in spec.volumes.iter().enumerate() {
        let hint = hints.map_or(SizeHint::None, |h| h.hint_for(index, &volume.name, &names));
        volumes.push(resolve_volume(index, volume, sizer, hint)?);
    }
    Ok(ResolvedLayout { volumes })
}

fn resolve_volume(
    index: usize,
    volume: &VolumeSpec,
    sizer: &dyn ContentSizer,
    hint: SizeHint,
) -> Result<ResolvedVolume> {
    let mut structures = Vec::with_capacity(volume.structures.len());
    let mut cursor = 0u64;
    for (i, spec) in volume.structures.iter().enumerate() {
        let resolved = place_structure(&volume.name, i, spec, cursor, sizer)?;
        cursor = resolved.end();
        structures.push(resolved);
    }

    check_structure_overlap(&volume.name, &structures)?;
    for s in &structures {
        check_content_overlap(&volume.name, s)?;
    }

    resolve_writes(volume, &mut structures)?;

    let farthest = structures.iter().map(|s| s.end()).max().unwrap_or(0);
    let reserve = match volume.schema {
        Schema::Gpt => GPT_BACKUP_RESERVE,
        Schema::Mbr => 0,
    };
    let minimum_size = align_up(farthest, 1024)
        .and_then(|size| size.checked_add(reserve))
        .ok_or_else(|| LayoutError::OutOfRange {
            volume: volume.name.clone(),
            label: volume.name.clone(),
        })?;

    let (size, size_source) = apply_hint(&volume.name, minimum_size, hint);

    let resolved = ResolvedVolume {
        name: volume.name.clone(),
        index,
        schema: volume.schema,
        bootloader: volume.bootloader,
        id: volume.id,
        structures,
        minimum_size,
        size,
        size_source,
    };
    check_write_ranges(&resolved)?;

    log::debug!(
        "volume {}: {} structures, {} bytes ({:?})",
        resolved.name,
        resolved.structures.len(),
        resolved.size,
        resolved.size_source
    );
    Ok(resolved)
}

fn apply_hint(volume: &str, minimum: u64, hint: SizeHint) -> (u64, SizeSource) {
    match hint {
        SizeHint::None => (minimum, SizeSource::Computed),
        SizeHint::Size(size) if size >= minimum => (size, SizeSource::Hint),
        SizeHint::Size(size) => {
            let reason = format!("hint {size} is below the minimum {minimum}");
            log::warn!("volume {volume}: ignoring --image-size, {reason}");
            (minimum, SizeSource::HintIgnored(reason))
        }
        SizeHint::Ambiguous(reason) => {
            log::warn!("volume {volume}: ignoring ambiguous --image-size, {reason}");
            (minimum, SizeSource::HintIgnored(reason))
        }
    }
}

fn place_structure(
    volume: &str,
    index: usize,
    spec: &StructureSpec,
    cursor: u64,
    sizer: &dyn ContentSizer,
) -> Result<ResolvedStructure> {
    let label = spec.display_label(index);
    let offset = match (spec.offset, spec.role()) {
        (Some(offset), _) => offset,
        (None, Some(Role::Mbr)) => 0,
        (None, _) => cursor,
    };

    let out_of_range = || LayoutError::OutOfRange {
        volume: volume.to_string(),
        label: label.clone(),
    };

    let content = place_content(volume, &label, spec, sizer)?;

    let size = match spec.size {
        Some(size) => size,
        None => infer_size(spec.filesystem, &content)
            .ok_or_else(|| LayoutError::MissingSize {
                volume: volume.to_string(),
                structure: label.clone(),
            })?
            .ok_or_else(out_of_range)?,
    };
    if offset.checked_add(size).is_none() {
        return Err(out_of_range());
    }

    if spec.role() == Some(Role::Mbr) && size > MBR_BOOT_CODE_SIZE {
        return Err(LayoutError::MbrTooLarge {
            volume: volume.to_string(),
            size,
        });
    }

    if spec.filesystem == Filesystem::None {
        for (i, item) in content.iter().enumerate() {
            if item.end() > size {
                let name = match &item.kind {
                    ResolvedContentKind::Raw { name: Some(n), .. } => n.clone(),
                    ResolvedContentKind::Raw { image, .. } => image.clone(),
                    ResolvedContentKind::Filesystem { .. } => format!("content[{i}]"),
                };
                return Err(LayoutError::DoesNotFit {
                    volume: volume.to_string(),
                    structure: label,
                    label: name,
                    overage: item.end() - size,
                });
            }
        }
    }

    Ok(ResolvedStructure {
        index,
        name: spec.name.clone(),
        label,
        kind: spec.kind,
        id: spec.id,
        filesystem: spec.filesystem,
        filesystem_label: spec.filesystem_label.clone(),
        offset,
        size,
        offset_write: None,
        content,
    })
}

fn place_content(
    volume: &str,
    structure: &str,
    spec: &StructureSpec,
    sizer: &dyn ContentSizer,
) -> Result<Vec<ResolvedContent>> {
    let mut out = Vec::with_capacity(spec.content.len());
    let mut cursor = 0u64;
    for item in &spec.content {
        let (path, explicit_offset, explicit_size) = match item {
            ContentItem::Filesystem { source, .. } => (source, None, None),
            ContentItem::Raw {
                image, offset, size, ..
            } => (image, *offset, *size),
        };
        let natural = sizer
            .size_of(path)
            .ok_or_else(|| LayoutError::MissingContent {
                volume: volume.to_string(),
                path: path.clone(),
            })?;
        let size = match explicit_size {
            Some(declared) if declared < natural => {
                let label = match item {
                    ContentItem::Raw { name: Some(n), .. } => n.clone(),
                    _ => structure.to_string(),
                };
                return Err(LayoutError::ContentTooLarge {
                    volume: volume.to_string(),
                    label,
                    path: path.clone(),
                    declared,
                    actual: natural,
                });
            }
            Some(declared) => declared,
            None => natural,
        };
        let offset = explicit_offset.unwrap_or(cursor);
        cursor = offset
            .checked_add(size)
            .ok_or_else(|| LayoutError::OutOfRange {
                volume: volume.to_string(),
                label: format!("{structure}: {path}"),
            })?;

        let kind = match item {
            ContentItem::Filesystem { source, target } => ResolvedContentKind::Filesystem {
                source: source.clone(),
                target: target.clone(),
            },
            ContentItem::Raw { name, image, .. } => ResolvedContentKind::Raw {
                name: name.clone(),
                image: image.clone(),
                offset_write: None,
            },
        };
        out.push(ResolvedContent { offset, size, kind });
    }
    Ok(out)
}

/// `None` without content to measure, `Some(None)` when the inferred size
/// overflows.
fn infer_size(filesystem: Filesystem, content: &[ResolvedContent]) -> Option<Option<u64>> {
    if content.is_empty() {
        return None;
    }
    let packed = content.iter().map(|c| c.end()).max().unwrap_or(0);
    Some(match filesystem {
        Filesystem::None => Some(packed),
        Filesystem::Ext4 | Filesystem::Vfat => packed
            .checked_add(packed / 2)
            .and_then(|p| p.checked_add(FS_METADATA_HEADROOM))
            .and_then(|p| align_up(p, MIB)),
    })
}

fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn check_structure_overlap(volume: &str, structures: &[ResolvedStructure]) -> Result<()> {
    for (i, a) in structures.iter().enumerate() {
        for b in &structures[i + 1..] {
            if overlaps((a.offset, a.end()), (b.offset, b.end())) {
                return Err(LayoutError::Overlap {
                    volume: volume.to_string(),
                    first: a.label.clone(),
                    second: b.label.clone(),
                });
            }
        }
    }
    Ok(())
}

fn content_label(structure: &ResolvedStructure, index: usize, content: &ResolvedContent) -> String {
    match &content.kind {
        ResolvedContentKind::Raw { name: Some(n), .. } => n.clone(),
        _ => format!("{}.content[{index}]", structure.label),
    }
}

fn check_content_overlap(volume: &str, structure: &ResolvedStructure) -> Result<()> {
    if structure.filesystem != Filesystem::None {
        return Ok(());
    }
    let items = &structure.content;
    for (i, a) in items.iter().enumerate() {
        for (j, b) in items.iter().enumerate().skip(i + 1) {
            if overlaps((a.offset, a.end()), (b.offset, b.end())) {
                return Err(LayoutError::Overlap {
                    volume: volume.to_string(),
                    first: content_label(structure, i, a),
                    second: content_label(structure, j, b),
                });
            }
        }
    }
    Ok(())
}

fn write_for(
    volume: &str,
    labels: &HashMap<&str, u64>,
    write: &OffsetWrite,
    referrer: &str,
    referrer_offset: u64,
) -> Result<ResolvedWrite> {
    let location = match write {
        OffsetWrite::Absolute(at) => *at,
        OffsetWrite::Relative { label, delta } => {
            let base = labels
                .get(label.as_str())
                .ok_or_else(|| LayoutError::UnresolvedLabel {
                    volume: volume.to_string(),
                    reference: write.to_string(),
                })?;
            base.checked_add(*delta)
                .ok_or_else(|| LayoutError::WriteOutOfRange {
                    volume: volume.to_string(),
                    label: referrer.to_string(),
                    location: *base,
                    reason: format!("{write} overflows the 64-bit byte range"),
                })?
        }
    };
    let value = u32::try_from(referrer_offset / SECTOR_SIZE).map_err(|_| {
        LayoutError::WriteOutOfRange {
            volume: volume.to_string(),
            label: referrer.to_string(),
            location,
            reason: format!("offset {referrer_offset} does not fit a 32-bit sector number"),
        }
    })?;
    Ok(ResolvedWrite { location, value })
}

fn resolve_writes(volume: &VolumeSpec, structures: &mut [ResolvedStructure]) -> Result<()> {
    let mut labels: HashMap<&str, u64> = HashMap::new();
    for s in structures.iter() {
        if let Some(name) = &s.name {
            labels.insert(name, s.offset);
        }
        for c in &s.content {
            if let ResolvedContentKind::Raw { name: Some(n), .. } = &c.kind {
                labels.insert(n, s.offset + c.offset);
            }
        }
    }

    let mut structure_writes = Vec::with_capacity(structures.len());
    let mut content_writes = Vec::with_capacity(structures.len());
    for (s, spec) in structures.iter().zip(&volume.structures) {
        let own = spec
            .offset_write
            .as_ref()
            .map(|w| write_for(&volume.name, &labels, w, &s.label, s.offset))
            .transpose()?;
        structure_writes.push(own);

        let mut per_item = Vec::with_capacity(s.content.len());
        for (i, (c, item)) in s.content.iter().zip(&spec.content).enumerate() {
            let resolved = match item {
                ContentItem::Raw {
                    offset_write: Some(write),
                    ..
                } => Some(write_for(
                    &volume.name,
                    &labels,
                    write,
                    &content_label(s, i, c),
                    s.offset + c.offset,
                )?),
                _ => None,
            };
            per_item.push(resolved);
        }
        content_writes.push(per_item);
    }

    for ((s, own), items) in structures
        .iter_mut()
        .zip(structure_writes)
        .zip(content_writes)
    {
        s.offset_write = own;
        for (c, w) in s.content.iter_mut().zip(items) {
            if let ResolvedContentKind::Raw { offset_write, .. } = &mut c.kind {
                *offset_write = w;
            }
        }
    }
    Ok(())
}

fn check_write_ranges(volume: &ResolvedVolume) -> Result<()> {
    for (label, write) in volume.writes() {
        let in_range = write
            .location
            .checked_add(4)
            .is_some_and(|end| end <= volume.size);
        if !in_range {
            return Err(LayoutError::WriteOutOfRange {
                volume: volume.name.clone(),
                label,
                location: write.location,
                reason: format!("image is only {} bytes", volume.size),
            });
        }
    }
    Ok(())
}
