//! Concrete byte layout computed from a gadget description.

pub mod resolver;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::gadget::{Bootloader, Filesystem, Role, Schema, StructureType, VolumeId};

pub use resolver::resolve;

pub const SECTOR_SIZE: u64 = 512;

/// Measures the files referenced by `source`/`image` entries.
pub trait ContentSizer {
    /// Byte size of a file, or the summed size of every file under a
    /// directory. `None` when the path does not exist.
    fn size_of(&self, path: &str) -> Option<u64>;
}

/// The unpacked gadget directory that content paths are relative to.
#[derive(Debug, Clone)]
pub struct GadgetTree {
    root: PathBuf,
}

impl GadgetTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }
}

impl ContentSizer for GadgetTree {
    fn size_of(&self, path: &str) -> Option<u64> {
        let full = self.path_of(path);
        let meta = std::fs::metadata(&full).ok()?;
        if meta.is_file() {
            return Some(meta.len());
        }
        let total = WalkDir::new(&full)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();
        Some(total)
    }
}

/// Where the volume size came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeSource {
    Computed,
    Hint,
    HintIgnored(String),
}

/// A resolved `offset-write`: `value` goes to byte `location` as a
/// little-endian u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedWrite {
    pub location: u64,
    pub value: u32,
}

impl ResolvedWrite {
    pub fn bytes(&self) -> [u8; 4] {
        self.value.to_le_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedContentKind {
    Filesystem {
        source: String,
        target: String,
    },
    Raw {
        name: Option<String>,
        image: String,
        offset_write: Option<ResolvedWrite>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedContent {
    /// Relative to the start of the structure.
    pub offset: u64,
    pub size: u64,
    pub kind: ResolvedContentKind,
}

impl ResolvedContent {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedStructure {
    pub index: usize,
    pub name: Option<String>,
    /// Name or positional label, for messages.
    pub label: String,
    pub kind: StructureType,
    pub id: Option<Uuid>,
    pub filesystem: Filesystem,
    pub filesystem_label: Option<String>,
    pub offset: u64,
    pub size: u64,
    pub offset_write: Option<ResolvedWrite>,
    pub content: Vec<ResolvedContent>,
}

impl ResolvedStructure {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn role(&self) -> Option<Role> {
        self.kind.role()
    }

    pub fn is_partition(&self) -> bool {
        self.kind.is_partition()
    }

    pub fn fs_label(&self) -> Option<&str> {
        self.filesystem_label.as_deref().or(self.name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedVolume {
    pub name: String,
    pub index: usize,
    pub schema: Schema,
    pub bootloader: Option<Bootloader>,
    pub id: Option<VolumeId>,
    pub structures: Vec<ResolvedStructure>,
    pub minimum_size: u64,
    pub size: u64,
    pub size_source: SizeSource,
}

impl ResolvedVolume {
    /// Partition-table structures with their 1-based partition numbers.
    pub fn partitions(&self) -> impl Iterator<Item = (u32, &ResolvedStructure)> {
        self.structures
            .iter()
            .filter(|s| s.is_partition())
            .zip(1u32..)
            .map(|(s, n)| (n, s))
    }

    /// Every offset-write in the volume, labelled for messages.
    pub fn writes(&self) -> Vec<(String, ResolvedWrite)> {
        let mut out = Vec::new();
        for s in &self.structures {
            if let Some(w) = s.offset_write {
                out.push((s.label.clone(), w));
            }
            for (i, c) in s.content.iter().enumerate() {
                if let ResolvedContentKind::Raw {
                    name,
                    offset_write: Some(w),
                    ..
                } = &c.kind
                {
                    let label = name
                        .clone()
                        .unwrap_or_else(|| format!("{}.content[{i}]", s.label));
                    out.push((label, *w));
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLayout {
    pub volumes: Vec<ResolvedVolume>,
}

impl ResolvedLayout {
    pub fn volume(&self, name: &str) -> Option<&ResolvedVolume> {
        self.volumes.iter().find(|v| v.name == name)
    }
}
