use std::fs;
use std::path::{Path, PathBuf};

use gadget_image::error::{Error, ResumeError};
use gadget_image::pipeline::{
    BuildOptions, ImageSource, Pipeline, Step, StepContext, StopAt, checkpoint,
};
use gadget_image::size::MIB;
use tempfile::TempDir;

const MBR_GADGET: &str = r#"
volumes:
  pi:
    schema: mbr
    bootloader: u-boot
    structure:
      - name: mbr
        type: mbr
        content:
          - image: boot.img
      - name: firmware
        type: "83"
        offset: 1M
        size: 1M
        content:
          - image: blob.bin
            offset: 512
"#;

const GPT_GADGET: &str = r#"
volumes:
  pc:
    bootloader: grub
    structure:
      - name: mbr
        type: mbr
        content:
          - image: boot.img
      - name: bios-boot
        type: DA,21686148-6449-6E6F-744E-656564454649
        offset: 1M
        size: 1M
        offset-write: mbr+92
        content:
          - image: blob.bin
"#;

fn gadget_tree(root: &Path, yaml: &str) -> PathBuf {
    let tree = root.join("gadget-src");
    fs::create_dir_all(tree.join("meta")).expect("mkdir meta");
    fs::write(tree.join("meta/gadget.yaml"), yaml).expect("write gadget.yaml");
    fs::write(tree.join("boot.img"), vec![0xAB; 440]).expect("write boot.img");
    fs::write(tree.join("blob.bin"), b"firmware payload").expect("write blob");
    tree
}

fn pipeline() -> Pipeline {
    Pipeline::new(StepContext::default())
}

fn options(tree: PathBuf) -> BuildOptions {
    BuildOptions::new(ImageSource::GadgetTree(tree))
}

#[test]
fn builds_mbr_volume_from_tree() {
    let temp = TempDir::new().expect("temp dir");
    let tree = gadget_tree(temp.path(), MBR_GADGET);
    let workdir = temp.path().join("work");

    let outcome = pipeline()
        .start(options(tree), Some(&workdir), None)
        .expect("build");
    assert!(outcome.finished);
    assert_eq!(outcome.state.last_completed, Some(Step::Finish));

    let image = workdir.join("pi.img");
    let data = fs::read(&image).expect("read image");
    assert_eq!(data.len() as u64, 2 * MIB);

    assert!(data[..440].iter().all(|b| *b == 0xAB));
    assert_eq!(&data[510..512], &[0x55, 0xAA]);
    let entry = &data[446..462];
    assert_eq!(entry[4], 0x83);
    assert_eq!(u32::from_le_bytes(entry[8..12].try_into().unwrap()), 2048);
    assert_eq!(u32::from_le_bytes(entry[12..16].try_into().unwrap()), 2048);
    assert!(data[462..510].iter().all(|b| *b == 0));

    let at = (MIB + 512) as usize;
    assert_eq!(&data[at..at + 16], b"firmware payload");

    assert!(workdir.join("gadget.yaml").is_file());
    assert!(workdir.join(checkpoint::CHECKPOINT_FILE).is_file());
}

#[test]
fn builds_gpt_volume_from_tree() {
    let temp = TempDir::new().expect("temp dir");
    let tree = gadget_tree(temp.path(), GPT_GADGET);
    let workdir = temp.path().join("work");

    pipeline()
        .start(options(tree), Some(&workdir), None)
        .expect("build");

    let image = workdir.join("pc.img");
    let data = fs::read(&image).expect("read image");
    assert_eq!(data.len() as u64, 2 * MIB + 17 * 1024);

    // Boot code survives the protective MBR, the offset-write lands in it.
    assert!(data[..92].iter().all(|b| *b == 0xAB));
    assert_eq!(&data[92..96], &2048u32.to_le_bytes());
    assert!(data[96..440].iter().all(|b| *b == 0xAB));
    assert_eq!(data[446 + 4], 0xEE);
    assert_eq!(&data[512..520], b"EFI PART");

    let disk = gpt::GptConfig::new()
        .writable(false)
        .open(&image)
        .expect("open gpt");
    let parts = disk.partitions();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[&1].name, "bios-boot");
    assert_eq!(parts[&1].first_lba, 2048);
    assert_eq!(parts[&1].last_lba, 4095);

    let at = MIB as usize;
    assert_eq!(&data[at..at + 16], b"firmware payload");
}

#[test]
fn resumed_build_matches_single_run() {
    let temp = TempDir::new().expect("temp dir");
    let tree = gadget_tree(temp.path(), GPT_GADGET);
    let straight = temp.path().join("straight");
    let split = temp.path().join("split");

    pipeline()
        .start(options(tree.clone()), Some(&straight), None)
        .expect("straight build");

    let first = pipeline()
        .start(
            options(tree),
            Some(&split),
            Some(StopAt::Thru(Step::LoadGadgetYaml)),
        )
        .expect("partial build");
    assert!(!first.finished);
    assert_eq!(first.state.last_completed, Some(Step::LoadGadgetYaml));
    assert!(!split.join("pc.img").exists());

    let second = pipeline().resume(&split, None).expect("resume");
    assert!(second.finished);

    let a = fs::read(straight.join("pc.img")).expect("straight image");
    let b = fs::read(split.join("pc.img")).expect("split image");
    assert!(a == b, "resumed image differs from a single run");
}

#[test]
fn until_stops_before_the_step() {
    let temp = TempDir::new().expect("temp dir");
    let tree = gadget_tree(temp.path(), MBR_GADGET);
    let workdir = temp.path().join("work");

    let outcome = pipeline()
        .start(
            options(tree),
            Some(&workdir),
            Some(StopAt::Until(Step::AllocateVolumes)),
        )
        .expect("partial build");
    assert!(!outcome.finished);
    assert_eq!(outcome.state.last_completed, Some(Step::ResolveLayout));
    assert!(outcome.state.layout.is_some());
    assert!(!workdir.join("images").exists());

    let saved = checkpoint::load(&workdir).expect("checkpoint");
    assert_eq!(saved.last_completed, Some(Step::ResolveLayout));

    let outcome = pipeline()
        .resume(&workdir, Some(StopAt::Thru(Step::PartitionVolumes)))
        .expect("resume");
    assert_eq!(outcome.state.last_completed, Some(Step::PartitionVolumes));
    assert!(workdir.join("images/pi.img").is_file());
}

#[test]
fn resume_needs_a_checkpoint() {
    let temp = TempDir::new().expect("temp dir");
    let err = pipeline().resume(temp.path(), None).unwrap_err();
    assert!(matches!(err, Error::Resume(ResumeError::Missing(_))));
    assert_eq!(err.exit_code(), 6);

    fs::write(temp.path().join(checkpoint::CHECKPOINT_FILE), "{\"format\": 1}")
        .expect("write checkpoint");
    let err = pipeline().resume(temp.path(), None).unwrap_err();
    assert!(matches!(err, Error::Resume(ResumeError::Incompatible { .. })));
}

#[test]
fn image_file_list_and_output_dir() {
    let temp = TempDir::new().expect("temp dir");
    let tree = gadget_tree(temp.path(), MBR_GADGET);
    let out = temp.path().join("out");
    let list = temp.path().join("images.txt");

    let mut opts = options(tree);
    opts.output_dir = Some(out.clone());
    opts.image_file_list = Some(list.clone());
    let outcome = pipeline().start(opts, None, None).expect("build");
    assert!(outcome.finished);

    let image = fs::canonicalize(out.join("pi.img")).expect("image in output dir");
    let listed = fs::read_to_string(&list).expect("read list");
    assert_eq!(listed.trim_end(), image.to_str().expect("utf-8 path"));
}

#[test]
fn invalid_gadget_stops_with_validation_error() {
    let temp = TempDir::new().expect("temp dir");
    let tree = gadget_tree(
        temp.path(),
        r#"
volumes:
  pc:
    bootloader: grub
    structure:
      - {name: seed, type: esp, filesystem: ext4, size: 1M}
"#,
    );
    let workdir = temp.path().join("work");

    let err = pipeline()
        .start(options(tree), Some(&workdir), None)
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(err.exit_code(), 3);

    let saved = checkpoint::load(&workdir).expect("checkpoint");
    assert_eq!(saved.last_completed, Some(Step::PrepareImage));
}

#[test]
fn finish_can_be_resumed_after_a_failed_list_write() {
    let temp = TempDir::new().expect("temp dir");
    let tree = gadget_tree(temp.path(), MBR_GADGET);
    let workdir = temp.path().join("work");
    let lists = temp.path().join("lists");

    let mut opts = options(tree);
    opts.image_file_list = Some(lists.join("images.txt"));
    let err = pipeline()
        .start(opts, Some(&workdir), None)
        .unwrap_err();
    assert!(matches!(err, Error::Io { .. }));

    // The image was moved before the list write failed.
    let saved = checkpoint::load(&workdir).expect("checkpoint");
    assert_eq!(saved.last_completed, Some(Step::WriteRawContent));
    assert!(workdir.join("pi.img").is_file());
    assert!(!workdir.join("images/pi.img").exists());

    fs::create_dir_all(&lists).expect("mkdir lists");
    let outcome = pipeline().resume(&workdir, None).expect("resume");
    assert!(outcome.finished);

    let image = fs::canonicalize(workdir.join("pi.img")).expect("image");
    let listed = fs::read_to_string(lists.join("images.txt")).expect("read list");
    assert_eq!(listed.trim_end(), image.to_str().expect("utf-8 path"));
    assert_eq!(fs::read(&image).expect("read image").len() as u64, 2 * MIB);
}

/// `mkfs.ext4` recent enough (e2fsprogs 1.47.1) to take inode times copied
/// by `-d` from `SOURCE_DATE_EPOCH` instead of the host.
fn reproducible_mkfs_ext4() -> bool {
    let Ok(out) = std::process::Command::new("mkfs.ext4").arg("-V").output() else {
        return false;
    };
    let mut text = String::from_utf8_lossy(&out.stderr).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stdout));
    // mke2fs 1.47.1 (20-May-2024)
    let version: Vec<u32> = text
        .split_whitespace()
        .nth(1)
        .unwrap_or("")
        .split('.')
        .filter_map(|p| p.parse().ok())
        .collect();
    version >= vec![1, 47, 1]
}

#[test]
fn resumed_ext4_build_matches_single_run() {
    if !reproducible_mkfs_ext4() {
        eprintln!("skipping: mkfs.ext4 missing or too old for reproducible -d");
        return;
    }
    let temp = TempDir::new().expect("temp dir");
    let tree = gadget_tree(
        temp.path(),
        r#"
volumes:
  pc:
    bootloader: grub
    structure:
      - name: mbr
        type: mbr
        content:
          - image: boot.img
      - name: writable
        type: 83,0FC63DAF-8483-4772-8E79-3D69D8477DE4
        filesystem: ext4
        filesystem-label: writable
        offset: 1M
        size: 16M
        content:
          - source: blob.bin
            target: /firmware/
"#,
    );
    let straight = temp.path().join("straight");
    let split = temp.path().join("split");

    pipeline()
        .start(options(tree.clone()), Some(&straight), None)
        .expect("straight build");

    pipeline()
        .start(
            options(tree),
            Some(&split),
            Some(StopAt::Thru(Step::PartitionVolumes)),
        )
        .expect("partial build");
    // Keep the two runs in different seconds.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let resumed = pipeline().resume(&split, None).expect("resume");
    assert!(resumed.finished);

    let a = fs::read(straight.join("pc.img")).expect("straight image");
    let b = fs::read(split.join("pc.img")).expect("split image");
    assert_eq!(a.len(), b.len());
    assert!(a == b, "resumed ext4 image differs from a single run");
}
