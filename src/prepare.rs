//! Producing the unpacked gadget tree a build starts from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::tools::Cmd;

/// Relative location of the gadget directory inside an unpack root.
pub const GADGET_DIR: &str = "gadget";
/// Relative location of the description inside the gadget directory.
pub const GADGET_YAML: &str = "meta/gadget.yaml";

/// Fills `unpack` so that `<unpack>/gadget/meta/gadget.yaml` exists and
/// every content path it names resolves under `<unpack>/gadget`.
pub trait PrepareImage {
    fn prepare(&self, workdir: &Path, unpack: &Path) -> Result<()>;
}

/// How `snap prepare-image` treats validation-set assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validation {
    Enforce,
    Ignore,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Validation::Enforce => "enforce",
            Validation::Ignore => "ignore",
        })
    }
}

impl FromStr for Validation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "enforce" => Ok(Validation::Enforce),
            "ignore" => Ok(Validation::Ignore),
            other => Err(format!(
                "unknown validation mode `{other}` (expected enforce or ignore)"
            )),
        }
    }
}

/// `snap prepare-image` against a model assertion.
#[derive(Debug, Clone)]
pub struct SnapPrepare {
    pub snap_cmd: String,
    pub model: PathBuf,
    pub channel: Option<String>,
    pub snaps: Vec<String>,
    pub cloud_init: Option<PathBuf>,
    pub disable_console_conf: bool,
    pub factory_image: bool,
    pub validation: Option<Validation>,
}

/// Body of the `--customize` file.
#[derive(Serialize, Default)]
#[serde(rename_all = "kebab-case")]
struct Customization<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_init_user_data: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    console_conf: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    boot_flags: Vec<&'static str>,
}

impl Customization<'_> {
    fn is_empty(&self) -> bool {
        self.cloud_init_user_data.is_none()
            && self.console_conf.is_none()
            && self.boot_flags.is_empty()
    }
}

impl SnapPrepare {
    fn command(&self, workdir: &Path, unpack: &Path) -> Result<Cmd> {
        let mut cmd = Cmd::new(&self.snap_cmd)
            .arg("prepare-image")
            .label("prepare-image")
            .error_msg("snap prepare-image failed");
        if let Some(channel) = &self.channel {
            cmd = cmd.arg(format!("--channel={channel}"));
        }
        for snap in &self.snaps {
            cmd = cmd.arg(format!("--snap={snap}"));
        }
        if let Some(validation) = &self.validation {
            cmd = cmd.arg(format!("--validation={validation}"));
        }

        let mut custom = Customization {
            cloud_init_user_data: self.cloud_init.as_deref(),
            ..Default::default()
        };
        if self.disable_console_conf {
            custom.console_conf = Some("disabled");
        }
        if self.factory_image {
            custom.boot_flags.push("factory");
        }
        if !custom.is_empty() {
            let path = workdir.join("customization");
            let body = serde_json::to_vec(&custom)
                .map_err(|e| Error::io("failed to encode customization", e.into()))?;
            std::fs::write(&path, body)
                .map_err(|e| Error::io(format!("failed to write {}", path.display()), e))?;
            cmd = cmd.arg(format!("--customize={}", path.display()));
        }
        Ok(cmd.arg_path(&self.model).arg_path(unpack))
    }
}

impl PrepareImage for SnapPrepare {
    fn prepare(&self, workdir: &Path, unpack: &Path) -> Result<()> {
        log::info!("Preparing image from model {}", self.model.display());
        self.command(workdir, unpack)?.run()?;
        Ok(())
    }
}

/// A gadget directory that is already unpacked on disk.
#[derive(Debug, Clone)]
pub struct TreePrepare {
    pub gadget_tree: PathBuf,
}

impl PrepareImage for TreePrepare {
    fn prepare(&self, _workdir: &Path, unpack: &Path) -> Result<()> {
        let src = &self.gadget_tree;
        if !src.join(GADGET_YAML).is_file() {
            return Err(Error::io(
                format!("{} has no {GADGET_YAML}", src.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        let dest = unpack.join(GADGET_DIR);
        log::info!("Copying gadget tree {} to {}", src.display(), dest.display());
        copy_tree(src, &dest)
    }
}

/// Recursively copy `src` into `dest`, following symlinks.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| {
            let msg = format!("failed to walk {}", src.display());
            Error::io(msg, e.into())
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::io("bad path in gadget tree", std::io::Error::other(e)))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| Error::io(format!("failed to create {}", target.display()), e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| {
                Error::io(format!("failed to copy {}", entry.path().display()), e)
            })?;
        }
    }
    Ok(())
}
