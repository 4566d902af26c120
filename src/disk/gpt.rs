use gpt::{
    GptConfig,
    disk::LogicalBlockSize,
    partition_types::{OperatingSystem, Type},
};
use std::{fs::OpenOptions, path::Path};
use uuid::Uuid;

use super::ids::derive_uuid;
use super::mbr;
use crate::error::ToolError;
use crate::gadget::VolumeId;
use crate::layout::{ResolvedStructure, ResolvedVolume, SECTOR_SIZE};

/// Primary header plus 128 entries of 128 bytes.
pub const GPT_RESERVED_SECTORS: u64 = 34;

fn gpt_err(label: &str, detail: impl Into<String>) -> ToolError {
    ToolError::new("gpt", label, detail)
}

pub fn disk_guid(volume: &ResolvedVolume, seed: &str) -> Uuid {
    match volume.id {
        Some(VolumeId::Guid(guid)) => guid,
        _ => derive_uuid(seed, &[&volume.name, "disk"]),
    }
}

pub fn partition_guid(volume: &ResolvedVolume, s: &ResolvedStructure, seed: &str) -> Uuid {
    s.id.unwrap_or_else(|| derive_uuid(seed, &[&volume.name, &s.index.to_string(), "partition"]))
}

/// Write a GPT (primary, backup and protective MBR) for `volume`.
pub fn write_table(image: &Path, volume: &ResolvedVolume, seed: &str) -> Result<(), ToolError> {
    let size = std::fs::metadata(image)
        .map_err(|e| ToolError::io("gpt", &volume.name, e))?
        .len();
    if size < SECTOR_SIZE * GPT_RESERVED_SECTORS * 2 {
        return Err(gpt_err(&volume.name, format!("{size} bytes is too small for a GPT")));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image)
        .map_err(|e| ToolError::io("gpt", &volume.name, e))?;

    let mut gdisk = GptConfig::new()
        .writable(true)
        .logical_block_size(LogicalBlockSize::Lb512)
        .create_from_device(file, Some(disk_guid(volume, seed)))
        .map_err(|e| gpt_err(&volume.name, format!("failed to create GPT: {e}")))?;

    let header = gdisk.header();
    let first_usable = header.first_usable;
    let last_usable = header.last_usable;

    for (number, s) in volume.partitions() {
        if s.offset % SECTOR_SIZE != 0 {
            return Err(gpt_err(
                &s.label,
                format!("offset {} is not sector aligned", s.offset),
            ));
        }
        let first_lba = s.offset / SECTOR_SIZE;
        let len_lba = s.size.div_ceil(SECTOR_SIZE);
        if len_lba == 0 {
            return Err(gpt_err(&s.label, "partition has zero size"));
        }
        if first_lba < first_usable || first_lba + len_lba - 1 > last_usable {
            return Err(gpt_err(
                &s.label,
                format!(
                    "sectors {first_lba}..{} are outside the usable range {first_usable}..={last_usable}",
                    first_lba + len_lba
                ),
            ));
        }
        let guid = s
            .kind
            .gpt_guid()
            .ok_or_else(|| gpt_err(&s.label, format!("type {} has no GPT GUID", s.kind)))?;
        let part_type = Type {
            guid,
            os: OperatingSystem::None,
        };

        gdisk
            .add_partition_at(
                s.name.as_deref().unwrap_or(""),
                number,
                first_lba,
                len_lba,
                part_type,
                0,
            )
            .map_err(|e| gpt_err(&s.label, format!("failed to add partition: {e}")))?;
    }

    let mut partitions = gdisk.partitions().clone();
    for (number, s) in volume.partitions() {
        if let Some(p) = partitions.get_mut(&number) {
            p.part_guid = partition_guid(volume, s, seed);
        }
    }
    gdisk
        .update_partitions(partitions)
        .map_err(|e| gpt_err(&volume.name, format!("failed to set partition GUIDs: {e}")))?;

    gdisk
        .write()
        .map_err(|e| gpt_err(&volume.name, format!("failed to write GPT: {e}")))?;

    mbr::write_protective(image, &volume.name, size)?;
    log::debug!(
        "wrote gpt with {} partitions to {}",
        volume.partitions().count(),
        image.display()
    );
    Ok(())
}
