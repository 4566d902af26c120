//! Turning a resolved volume into an image file.

pub mod fs;
pub mod gpt;
pub mod ids;
pub mod io;
pub mod mbr;
pub mod raw;

use std::path::Path;

use crate::error::{Error, Result};
use crate::gadget::{Filesystem, Schema, VolumeId};
use crate::layout::{GadgetTree, ResolvedVolume};
use crate::tools::Tools;

/// Create (or truncate) a sparse image file of `size_bytes`.
pub fn allocate(path: &Path, size_bytes: u64) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::io(format!("failed to create parent directory: {}", parent.display()), e)
        })?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::io(format!("failed to create image {}", path.display()), e))?;
    file.set_len(size_bytes)
        .map_err(|e| Error::io(format!("failed to set size of {}", path.display()), e))?;
    Ok(())
}

/// Writes one volume's image, phase by phase.
pub struct VolumeBuilder<'a> {
    pub volume: &'a ResolvedVolume,
    pub image: &'a Path,
    /// Gadget description digest, seeds derived identifiers.
    pub seed: &'a str,
}

impl VolumeBuilder<'_> {
    pub fn allocate(&self) -> Result<()> {
        log::info!(
            "Allocating {} ({} bytes) at {}",
            self.volume.name,
            self.volume.size,
            self.image.display()
        );
        allocate(self.image, self.volume.size)
    }

    pub fn partition(&self) -> Result<()> {
        match self.volume.schema {
            Schema::Gpt => gpt::write_table(self.image, self.volume, self.seed)?,
            Schema::Mbr => {
                let signature = match self.volume.id {
                    Some(VolumeId::Signature(sig)) => sig,
                    _ => ids::derive_u32(self.seed, &[&self.volume.name, "disk"]),
                };
                mbr::write_table(self.image, self.volume, signature)?
            }
        }
        Ok(())
    }

    pub fn populate_filesystems(&self, tools: &Tools, gadget: &GadgetTree, work: &Path) -> Result<()> {
        let builder = fs::FsBuilder {
            tools,
            gadget,
            seed: self.seed,
        };
        for s in self
            .volume
            .structures
            .iter()
            .filter(|s| s.filesystem != Filesystem::None)
        {
            builder.build(self.image, self.volume, s, work)?;
        }
        Ok(())
    }

    pub fn write_raw(&self, gadget: &GadgetTree) -> Result<()> {
        raw::write_content(self.image, self.volume, gadget)?;
        raw::apply_offset_writes(self.image, self.volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::parse;
    use crate::layout::resolve;
    use tempfile::TempDir;

    #[test]
    fn allocate_creates_sparse_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("images/pc.img");
        allocate(&path, 4 << 20).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 << 20);
        allocate(&path, 1024).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);
    }

    #[test]
    fn mbr_volume_gets_table_and_boot_flag() {
        let dir = TempDir::new().unwrap();
        let spec = parse(
            r#"
volumes:
  pi:
    schema: mbr
    id: "0x0a0b0c0d"
    bootloader: u-boot
    structure:
      - {name: boot, type: "0C", filesystem: vfat, filesystem-label: system-boot, offset: 1M, size: 1M}
      - {name: data, type: "83", size: 2M}
"#,
        )
        .unwrap();
        let layout = resolve(&spec, &GadgetTree::new(dir.path()), None).unwrap();
        let volume = &layout.volumes[0];
        let image = dir.path().join("pi.img");
        let builder = VolumeBuilder {
            volume,
            image: &image,
            seed: "seed",
        };
        builder.allocate().unwrap();
        builder.partition().unwrap();

        let data = std::fs::read(&image).unwrap();
        assert_eq!(&data[440..444], &0x0a0b0c0du32.to_le_bytes());
        assert_eq!(&data[510..512], &[0x55, 0xAA]);
        let first = &data[446..462];
        assert_eq!(first[0], 0x80);
        assert_eq!(first[4], 0x0C);
        assert_eq!(u32::from_le_bytes(first[8..12].try_into().unwrap()), 2048);
        assert_eq!(u32::from_le_bytes(first[12..16].try_into().unwrap()), 2048);
        let second = &data[462..478];
        assert_eq!(second[0], 0);
        assert_eq!(second[4], 0x83);
        assert_eq!(u32::from_le_bytes(second[8..12].try_into().unwrap()), 4096);
        assert_eq!(u32::from_le_bytes(second[12..16].try_into().unwrap()), 4096);
    }

    #[test]
    fn gpt_volume_is_readable_back() {
        let dir = TempDir::new().unwrap();
        let spec = parse(
            r#"
volumes:
  pc:
    bootloader: grub
    structure:
      - name: bios
        type: DA,21686148-6449-6E6F-744E-656564454649
        offset: 1M
        size: 1M
      - name: data
        type: 0FC63DAF-8483-4772-8E79-3D69D8477DE4
        id: 11111111-2222-3333-4444-555555555555
        size: 2M
"#,
        )
        .unwrap();
        let layout = resolve(&spec, &GadgetTree::new(dir.path()), None).unwrap();
        let volume = &layout.volumes[0];
        let image = dir.path().join("pc.img");
        let builder = VolumeBuilder {
            volume,
            image: &image,
            seed: "seed",
        };
        builder.allocate().unwrap();
        builder.partition().unwrap();

        let disk = ::gpt::GptConfig::new()
            .writable(false)
            .open(&image)
            .unwrap();
        let parts = disk.partitions();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[&1].name, "bios");
        assert_eq!(parts[&1].first_lba, 2048);
        assert_eq!(parts[&1].last_lba, 4095);
        assert_eq!(parts[&2].first_lba, 4096);
        assert_eq!(
            parts[&2].part_guid.to_string(),
            "11111111-2222-3333-4444-555555555555"
        );
        assert_eq!(
            *disk.guid(),
            gpt::disk_guid(volume, "seed")
        );

        let data = std::fs::read(&image).unwrap();
        assert_eq!(data[446 + 4], mbr::PROTECTIVE_TYPE);
        assert_eq!(&data[510..512], &[0x55, 0xAA]);
    }

    #[test]
    fn gpt_rejects_partitions_over_the_header() {
        let dir = TempDir::new().unwrap();
        let spec = parse(
            r#"
volumes:
  pc:
    bootloader: grub
    structure:
      - {name: early, type: raw, size: 1M}
"#,
        )
        .unwrap();
        let layout = resolve(&spec, &GadgetTree::new(dir.path()), None).unwrap();
        let image = dir.path().join("pc.img");
        let builder = VolumeBuilder {
            volume: &layout.volumes[0],
            image: &image,
            seed: "seed",
        };
        builder.allocate().unwrap();
        let err = builder.partition().unwrap_err();
        assert!(matches!(err, Error::Tool(ref t) if t.tool == "gpt" && t.label == "early"));
    }
}
