use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::Step;
use crate::gadget::GadgetSpec;
use crate::layout::{GadgetTree, ResolvedLayout};
use crate::prepare::{GADGET_DIR, GADGET_YAML, Validation};
use crate::size::ImageSizeSpec;

/// Where the gadget tree comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSource {
    /// Run `snap prepare-image` against a model assertion.
    Model {
        model: PathBuf,
        channel: Option<String>,
        snaps: Vec<String>,
        cloud_init: Option<PathBuf>,
        #[serde(default)]
        disable_console_conf: bool,
        #[serde(default)]
        factory_image: bool,
        #[serde(default)]
        validation: Option<Validation>,
    },
    /// Copy an unpacked gadget directory.
    GadgetTree(PathBuf),
}

/// Everything the user asked for that steps consult.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    pub source: ImageSource,
    pub image_size: Option<ImageSizeSpec>,
    pub output_dir: Option<PathBuf>,
    pub image_file_list: Option<PathBuf>,
}

impl BuildOptions {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            image_size: None,
            output_dir: None,
            image_file_list: None,
        }
    }
}

/// Snapshot of build progress, replaced whole by every step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    pub options: BuildOptions,
    pub workdir: PathBuf,
    pub gadget: Option<GadgetSpec>,
    /// Hex SHA-256 of the gadget description, seeds derived identifiers.
    pub gadget_digest: Option<String>,
    pub layout: Option<ResolvedLayout>,
    /// Final image paths, in volume declaration order.
    pub outputs: Vec<PathBuf>,
    pub last_completed: Option<Step>,
}

impl BuildState {
    pub fn new(options: BuildOptions, workdir: PathBuf) -> Self {
        Self {
            options,
            workdir,
            gadget: None,
            gadget_digest: None,
            layout: None,
            outputs: Vec::new(),
            last_completed: None,
        }
    }

    pub fn unpack_dir(&self) -> PathBuf {
        self.workdir.join("unpack")
    }

    pub fn gadget_tree(&self) -> GadgetTree {
        GadgetTree::new(self.unpack_dir().join(GADGET_DIR))
    }

    pub fn gadget_yaml(&self) -> PathBuf {
        self.unpack_dir().join(GADGET_DIR).join(GADGET_YAML)
    }

    pub fn volume_work_dir(&self, volume: &str) -> PathBuf {
        self.workdir.join("volumes").join(volume)
    }

    /// Image under construction, moved to its output path by `finish`.
    pub fn image_path(&self, volume: &str) -> PathBuf {
        self.workdir.join("images").join(format!("{volume}.img"))
    }

    pub fn output_path(output_dir: &Path, volume: &str) -> PathBuf {
        output_dir.join(format!("{volume}.img"))
    }
}
