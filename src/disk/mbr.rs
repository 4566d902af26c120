//! Classic MBR partition tables, written in place.
//!
//! Only bytes 440..512 of sector 0 are touched: the disk signature, the four
//! 16-byte entries and the boot signature. The boot code area stays free for
//! the `mbr` role structure.

use std::path::Path;

use super::io::write_at;
use crate::error::ToolError;
use crate::layout::{ResolvedVolume, SECTOR_SIZE};

const SIGNATURE_OFFSET: u64 = 440;
const TABLE_OFFSET: usize = 446 - SIGNATURE_OFFSET as usize;
const ENTRY_SIZE: usize = 16;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
/// CHS fields are unused; LBA-only tools expect the max-value marker.
const CHS_UNUSED: [u8; 3] = [0xFE, 0xFF, 0xFF];
const BOOTABLE: u8 = 0x80;
pub const PROTECTIVE_TYPE: u8 = 0xEE;
/// Structures with this filesystem label get the active flag.
pub const BOOT_LABEL: &str = "system-boot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrEntry {
    pub bootable: bool,
    pub kind: u8,
    pub start_lba: u32,
    pub sectors: u32,
}

impl MbrEntry {
    fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = if self.bootable { BOOTABLE } else { 0 };
        raw[1..4].copy_from_slice(&CHS_UNUSED);
        raw[4] = self.kind;
        raw[5..8].copy_from_slice(&CHS_UNUSED);
        raw[8..12].copy_from_slice(&self.start_lba.to_le_bytes());
        raw[12..16].copy_from_slice(&self.sectors.to_le_bytes());
        raw
    }
}

/// Encode bytes 440..512 of sector 0.
pub fn encode_tail(signature: u32, entries: &[MbrEntry]) -> [u8; 72] {
    let mut tail = [0u8; 72];
    tail[..4].copy_from_slice(&signature.to_le_bytes());
    for (i, entry) in entries.iter().take(4).enumerate() {
        let at = TABLE_OFFSET + i * ENTRY_SIZE;
        tail[at..at + ENTRY_SIZE].copy_from_slice(&entry.encode());
    }
    tail[70..].copy_from_slice(&BOOT_SIGNATURE);
    tail
}

fn to_lba(volume: &str, label: &str, bytes: u64, what: &str) -> Result<u32, ToolError> {
    let sectors = bytes.div_ceil(SECTOR_SIZE);
    u32::try_from(sectors).map_err(|_| {
        ToolError::new(
            "mbr",
            label,
            format!("{what} {bytes} of volume {volume} exceeds the 32-bit sector range"),
        )
    })
}

/// Build the partition entries for an `mbr` schema volume.
pub fn entries_for(volume: &ResolvedVolume) -> Result<Vec<MbrEntry>, ToolError> {
    let mut entries = Vec::new();
    for (_, s) in volume.partitions() {
        if s.offset % SECTOR_SIZE != 0 {
            return Err(ToolError::new(
                "mbr",
                &s.label,
                format!("offset {} is not sector aligned", s.offset),
            ));
        }
        let kind = s.kind.mbr_code().ok_or_else(|| {
            ToolError::new("mbr", &s.label, format!("type {} has no MBR code", s.kind))
        })?;
        entries.push(MbrEntry {
            bootable: s.fs_label() == Some(BOOT_LABEL),
            kind,
            start_lba: to_lba(&volume.name, &s.label, s.offset, "offset")?,
            sectors: to_lba(&volume.name, &s.label, s.size, "size")?,
        });
    }
    if entries.len() > 4 {
        return Err(ToolError::new(
            "mbr",
            &volume.name,
            format!("{} partitions do not fit a 4-entry table", entries.len()),
        ));
    }
    Ok(entries)
}

/// Write an MBR partition table for `volume` into `image`.
pub fn write_table(image: &Path, volume: &ResolvedVolume, signature: u32) -> Result<(), ToolError> {
    let entries = entries_for(volume)?;
    let tail = encode_tail(signature, &entries);
    write_at(image, SIGNATURE_OFFSET, &tail).map_err(|e| ToolError::io("mbr", &volume.name, e))?;
    log::debug!(
        "wrote mbr table with {} entries to {}",
        entries.len(),
        image.display()
    );
    Ok(())
}

/// Write the protective MBR that precedes a GPT, covering the whole disk.
pub fn write_protective(image: &Path, label: &str, image_size: u64) -> Result<(), ToolError> {
    let sectors = (image_size / SECTOR_SIZE).saturating_sub(1);
    let entry = MbrEntry {
        bootable: false,
        kind: PROTECTIVE_TYPE,
        start_lba: 1,
        sectors: u32::try_from(sectors).unwrap_or(u32::MAX),
    };
    let tail = encode_tail(0, &[entry]);
    write_at(image, SIGNATURE_OFFSET, &tail).map_err(|e| ToolError::io("mbr", label, e))
}
