//! Filesystem structures: stage content, run mkfs, splice into the image.

use std::fs::{File, FileTimes};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use walkdir::WalkDir;

use super::ids::{derive_u32, derive_uuid};
use super::io::{PartitionIo, sparse_copy};
use crate::error::{Error, Result, ToolError};
use crate::gadget::Filesystem;
use crate::layout::{GadgetTree, ResolvedContentKind, ResolvedStructure, ResolvedVolume};
use crate::prepare::copy_tree;
use crate::tools::{Cmd, Tools};

/// Timestamp (2010-01-01 UTC) stamped on staged files and handed to the
/// mkfs tools, so a filesystem does not record when it was built.
pub const FS_EPOCH: u64 = 1_262_304_000;

/// Inputs shared by every filesystem built for one run.
pub struct FsBuilder<'a> {
    pub tools: &'a Tools,
    pub gadget: &'a GadgetTree,
    /// Gadget description digest, seeds filesystem ids.
    pub seed: &'a str,
}

fn io_err(what: &str, path: &Path) -> impl FnOnce(std::io::Error) -> Error {
    let context = format!("{what} {}", path.display());
    move |e| Error::io(context, e)
}

/// Copy every content item of `s` into `staging`, honoring targets.
pub fn stage_content(gadget: &GadgetTree, s: &ResolvedStructure, staging: &Path) -> Result<()> {
    std::fs::create_dir_all(staging).map_err(io_err("failed to create", staging))?;
    for item in &s.content {
        let ResolvedContentKind::Filesystem { source, target } = &item.kind else {
            continue;
        };
        let src = gadget.path_of(source);
        let target_rel = target.trim_start_matches('/');
        if source.ends_with('/') {
            let dest = staging.join(target_rel);
            copy_tree(&src, &dest)?;
            continue;
        }

        let dest = if target.ends_with('/') || target_rel.is_empty() {
            let name = src.file_name().ok_or_else(|| {
                Error::io(
                    format!("content source {source} has no file name"),
                    std::io::Error::from(std::io::ErrorKind::InvalidInput),
                )
            })?;
            staging.join(target_rel).join(name)
        } else {
            staging.join(target_rel)
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
        }
        std::fs::copy(&src, &dest).map_err(io_err("failed to copy", &src))?;
    }
    pin_times(staging)
}

/// Set access and modification times of everything under `dir` to
/// [`FS_EPOCH`].
fn pin_times(dir: &Path) -> Result<()> {
    let time = SystemTime::UNIX_EPOCH + Duration::from_secs(FS_EPOCH);
    let times = FileTimes::new().set_accessed(time).set_modified(time);
    for entry in WalkDir::new(dir).contents_first(true) {
        let entry = entry.map_err(|e| {
            let msg = format!("failed to walk {}", dir.display());
            Error::io(msg, e.into())
        })?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let file = File::open(entry.path()).map_err(io_err("failed to open", entry.path()))?;
        file.set_times(times)
            .map_err(io_err("failed to set times on", entry.path()))?;
    }
    Ok(())
}

impl FsBuilder<'_> {
    /// Stage, create and populate the filesystem for `s`, then copy it into
    /// `image` at the structure's offset.
    pub fn build(
        &self,
        image: &Path,
        volume: &ResolvedVolume,
        s: &ResolvedStructure,
        work: &Path,
    ) -> Result<()> {
        let staging = work.join(format!("part{}", s.index));
        let part_img = work.join(format!("part{}.img", s.index));
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(io_err("failed to clear", &staging))?;
        }
        stage_content(self.gadget, s, &staging)?;

        let file = File::create(&part_img).map_err(io_err("failed to create", &part_img))?;
        file.set_len(s.size)
            .map_err(io_err("failed to size", &part_img))?;
        drop(file);

        log::info!(
            "Creating {} filesystem for {} ({} bytes)",
            s.filesystem,
            s.label,
            s.size
        );
        match s.filesystem {
            Filesystem::Ext4 => self.mkfs_ext4(volume, s, &staging, &part_img)?,
            Filesystem::Vfat => self.mkfs_vfat(volume, s, &staging, &part_img)?,
            Filesystem::None => return Ok(()),
        }

        splice(&part_img, image, s)
    }

    fn mkfs_ext4(
        &self,
        volume: &ResolvedVolume,
        s: &ResolvedStructure,
        staging: &Path,
        part_img: &Path,
    ) -> Result<()> {
        let uuid = derive_uuid(self.seed, &[&volume.name, &s.index.to_string(), "ext4"]);
        let hash_seed = derive_uuid(self.seed, &[&volume.name, &s.index.to_string(), "hash"]);
        let epoch = FS_EPOCH.to_string();
        let mut cmd = Cmd::new(&self.tools.mkfs_ext4)
            .label(&s.label)
            .env("E2FSPROGS_FAKE_TIME", &epoch)
            .env("SOURCE_DATE_EPOCH", &epoch);
        if let Some(label) = s.fs_label() {
            cmd = cmd.args(["-L", label]);
        }
        cmd.args(["-O", "-metadata_csum", "-T", "default"])
            .arg("-U")
            .arg(uuid.to_string())
            .arg("-E")
            .arg(format!("hash_seed={hash_seed}"))
            .arg("-d")
            .arg_path(staging)
            .arg_path(part_img)
            .error_msg("mkfs.ext4 failed")
            .run()?;
        Ok(())
    }

    fn mkfs_vfat(
        &self,
        volume: &ResolvedVolume,
        s: &ResolvedStructure,
        staging: &Path,
        part_img: &Path,
    ) -> Result<()> {
        let volume_id = derive_u32(self.seed, &[&volume.name, &s.index.to_string(), "vfat"]);
        let epoch = FS_EPOCH.to_string();
        let mut cmd = Cmd::new(&self.tools.mkfs_vfat)
            .label(&s.label)
            .env("SOURCE_DATE_EPOCH", &epoch)
            .arg("--invariant")
            .args(["-s", "1", "-S", "512", "-F", "32"])
            .arg("-i")
            .arg(format!("{volume_id:08X}"));
        if let Some(label) = s.fs_label() {
            cmd = cmd.args(["-n", label]);
        }
        cmd.arg_path(part_img).error_msg("mkfs.vfat failed").run()?;

        let entries = top_level_entries(staging)?;
        if entries.is_empty() {
            return Ok(());
        }
        Cmd::new(&self.tools.mcopy)
            .label(&s.label)
            .env("MTOOLS_SKIP_CHECK", "1")
            .env("SOURCE_DATE_EPOCH", &epoch)
            .args(["-s", "-m"])
            .arg("-i")
            .arg_path(part_img)
            .args(&entries)
            .arg("::")
            .error_msg("mcopy failed")
            .run()?;
        Ok(())
    }
}

fn top_level_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(io_err("failed to read", dir))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(io_err("failed to read", dir))?;
    entries.sort();
    Ok(entries)
}

/// Copy a finished partition image into the volume image.
pub fn splice(part_img: &Path, image: &Path, s: &ResolvedStructure) -> Result<()> {
    let mut src = File::open(part_img).map_err(io_err("failed to open", part_img))?;
    let mut window = PartitionIo::open(image, s.offset, s.size)
        .map_err(|e| ToolError::io("copy", &s.label, e))?;
    sparse_copy(&mut src, &mut window).map_err(|e| ToolError::io("copy", &s.label, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::StructureType;
    use crate::gadget::Role;
    use crate::gadget::Schema;
    use crate::layout::{ResolvedContent, SizeSource};
    use tempfile::TempDir;

    fn fs_item(source: &str, target: &str) -> ResolvedContent {
        ResolvedContent {
            offset: 0,
            size: 0,
            kind: ResolvedContentKind::Filesystem {
                source: source.into(),
                target: target.into(),
            },
        }
    }

    fn structure(content: Vec<ResolvedContent>) -> ResolvedStructure {
        ResolvedStructure {
            index: 1,
            name: Some("boot".into()),
            label: "boot".into(),
            kind: StructureType::Role(Role::Esp),
            id: None,
            filesystem: Filesystem::Vfat,
            filesystem_label: None,
            offset: 0,
            size: 0,
            offset_write: None,
            content,
        }
    }

    fn volume(s: &ResolvedStructure) -> ResolvedVolume {
        ResolvedVolume {
            name: "pc".into(),
            index: 0,
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            structures: vec![s.clone()],
            minimum_size: 1 << 20,
            size: 1 << 20,
            size_source: SizeSource::Computed,
        }
    }

    /// Shell script standing in for an external tool.
    fn fake_tool(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.display().to_string()
    }

    /// Gadget tree with a `boot/` directory and a loose `shim.efi`.
    fn boot_gadget() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("boot/grub")).unwrap();
        std::fs::write(dir.path().join("boot/grub/grub.cfg"), "cfg").unwrap();
        std::fs::write(dir.path().join("shim.efi"), "shim").unwrap();
        dir
    }

    fn disk(dir: &Path) -> PathBuf {
        let image = dir.join("disk.img");
        File::create(&image).unwrap().set_len(1 << 20).unwrap();
        image
    }

    #[test]
    fn stages_files_and_directories_at_targets() {
        let gadget_dir = TempDir::new().unwrap();
        let g = gadget_dir.path();
        std::fs::create_dir_all(g.join("boot/grub")).unwrap();
        std::fs::write(g.join("boot/grub/grub.cfg"), "cfg").unwrap();
        std::fs::write(g.join("grubx64.efi"), "efi").unwrap();
        std::fs::write(g.join("shim.efi"), "shim").unwrap();

        let s = structure(vec![
            fs_item("boot/", "EFI/ubuntu/"),
            fs_item("grubx64.efi", "EFI/boot/grubx64.efi"),
            fs_item("shim.efi", "EFI/boot/"),
            fs_item("shim.efi", "/"),
        ]);
        let out = TempDir::new().unwrap();
        let staging = out.path().join("stage");
        stage_content(&GadgetTree::new(g), &s, &staging).unwrap();

        let read = |p: &str| std::fs::read_to_string(staging.join(p)).unwrap();
        assert_eq!(read("EFI/ubuntu/grub/grub.cfg"), "cfg");
        assert_eq!(read("EFI/boot/grubx64.efi"), "efi");
        assert_eq!(read("EFI/boot/shim.efi"), "shim");
        assert_eq!(read("shim.efi"), "shim");

        let pinned = SystemTime::UNIX_EPOCH + Duration::from_secs(FS_EPOCH);
        for p in ["EFI", "EFI/ubuntu/grub/grub.cfg", "shim.efi"] {
            let modified = std::fs::metadata(staging.join(p)).unwrap().modified().unwrap();
            assert_eq!(modified, pinned, "{p}");
        }
    }

    #[test]
    fn ext4_is_populated_from_staging_and_spliced() {
        let gadget_dir = boot_gadget();
        let work = TempDir::new().unwrap();
        let log = work.path().join("mkfs.log");
        let tools = Tools {
            mkfs_ext4: fake_tool(
                work.path(),
                "mkfs.ext4",
                &format!(
                    "echo \"$@\" > {log}\necho \"time=$E2FSPROGS_FAKE_TIME\" >> {log}\n\
                     for last; do :; done\nprintf EXT4 1<> \"$last\"",
                    log = log.display()
                ),
            ),
            ..Tools::default()
        };
        let gadget = GadgetTree::new(gadget_dir.path());
        let builder = FsBuilder {
            tools: &tools,
            gadget: &gadget,
            seed: "seed",
        };

        let mut s = structure(vec![fs_item("boot/", "/")]);
        s.filesystem = Filesystem::Ext4;
        s.filesystem_label = Some("writable".into());
        s.offset = 4096;
        s.size = 8192;
        let image = disk(work.path());
        let scratch = work.path().join("work");
        builder.build(&image, &volume(&s), &s, &scratch).unwrap();

        let staging = scratch.join("part1");
        let part_img = scratch.join("part1.img");
        let uuid = derive_uuid("seed", &["pc", "1", "ext4"]);
        let hash_seed = derive_uuid("seed", &["pc", "1", "hash"]);
        let recorded = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = recorded.lines().collect();
        assert_eq!(
            lines,
            vec![
                format!(
                    "-L writable -O -metadata_csum -T default -U {uuid} -E hash_seed={hash_seed} \
                     -d {} {}",
                    staging.display(),
                    part_img.display()
                ),
                format!("time={FS_EPOCH}"),
            ]
        );
        assert!(staging.join("grub/grub.cfg").is_file());

        let data = std::fs::read(&image).unwrap();
        assert_eq!(&data[4096..4100], b"EXT4");
        assert!(data[..4096].iter().all(|b| *b == 0));
        assert!(data[4100..].iter().all(|b| *b == 0));
    }

    #[test]
    fn vfat_is_formatted_then_filled_with_mcopy() {
        let gadget_dir = boot_gadget();
        let work = TempDir::new().unwrap();
        let log = work.path().join("tools.log");
        let tools = Tools {
            mkfs_vfat: fake_tool(
                work.path(),
                "mkfs.vfat",
                &format!(
                    "echo \"mkfs.vfat $@\" >> {log}\nfor last; do :; done\nprintf FAT32 1<> \"$last\"",
                    log = log.display()
                ),
            ),
            mcopy: fake_tool(
                work.path(),
                "mcopy",
                &format!(
                    "echo \"mcopy $@\" >> {log}\necho \"skip=$MTOOLS_SKIP_CHECK\" >> {log}",
                    log = log.display()
                ),
            ),
            ..Tools::default()
        };
        let gadget = GadgetTree::new(gadget_dir.path());
        let builder = FsBuilder {
            tools: &tools,
            gadget: &gadget,
            seed: "seed",
        };

        let mut s = structure(vec![
            fs_item("boot/", "EFI/ubuntu/"),
            fs_item("shim.efi", "/"),
        ]);
        s.filesystem_label = Some("ubuntu-seed".into());
        s.offset = 8192;
        s.size = 4096;
        let image = disk(work.path());
        let scratch = work.path().join("work");
        builder.build(&image, &volume(&s), &s, &scratch).unwrap();

        let staging = scratch.join("part1");
        let part_img = scratch.join("part1.img");
        let volume_id = derive_u32("seed", &["pc", "1", "vfat"]);
        let recorded = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = recorded.lines().collect();
        assert_eq!(
            lines,
            vec![
                format!(
                    "mkfs.vfat --invariant -s 1 -S 512 -F 32 -i {volume_id:08X} -n ubuntu-seed {}",
                    part_img.display()
                ),
                format!(
                    "mcopy -s -m -i {} {} {} ::",
                    part_img.display(),
                    staging.join("EFI").display(),
                    staging.join("shim.efi").display()
                ),
                "skip=1".to_string(),
            ]
        );

        let data = std::fs::read(&image).unwrap();
        assert_eq!(&data[8192..8197], b"FAT32");
        assert!(data[..8192].iter().all(|b| *b == 0));
        assert!(data[8197..].iter().all(|b| *b == 0));
    }

    #[test]
    fn splice_copies_partition_image_at_offset() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("disk.img");
        let part = dir.path().join("part.img");
        File::create(&image).unwrap().set_len(8192).unwrap();
        std::fs::write(&part, vec![0x5A; 1024]).unwrap();

        let mut s = structure(Vec::new());
        s.offset = 2048;
        s.size = 1024;
        splice(&part, &image, &s).unwrap();

        let data = std::fs::read(&image).unwrap();
        assert!(data[..2048].iter().all(|b| *b == 0));
        assert!(data[2048..3072].iter().all(|b| *b == 0x5A));
        assert!(data[3072..].iter().all(|b| *b == 0));
    }

    #[test]
    fn failing_mkfs_reports_structure_label() {
        let dir = TempDir::new().unwrap();
        let image = disk(dir.path());
        let tools = Tools {
            mkfs_vfat: "false".into(),
            ..Tools::default()
        };
        let gadget = GadgetTree::new(dir.path());
        let builder = FsBuilder {
            tools: &tools,
            gadget: &gadget,
            seed: "seed",
        };
        let mut s = structure(Vec::new());
        s.size = 4096;
        let err = builder
            .build(&image, &volume(&s), &s, &dir.path().join("work"))
            .unwrap_err();
        match err {
            Error::Tool(t) => {
                assert_eq!(t.tool, "false");
                assert_eq!(t.label, "boot");
                assert_eq!(t.status, Some(1));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
