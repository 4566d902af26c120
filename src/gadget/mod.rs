//! Typed model of a gadget description.
//!
//! A [`GadgetSpec`] is only ever produced by [`parser::parse`], which
//! enforces every cross-field rule before handing one out.

pub mod parser;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::{Uuid, uuid};

pub use parser::parse;

/// GPT type GUID implied by the `esp` role.
pub const ESP_GUID: Uuid = uuid!("C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
/// GPT type GUID implied by the `raw` role (BIOS boot).
pub const RAW_GUID: Uuid = uuid!("21686148-6449-6E6F-744E-656564454649");
/// Largest `mbr` role structure: the boot code area before the table.
pub const MBR_BOOT_CODE_SIZE: u64 = 446;
/// GPT partition names are 36 UTF-16 code units.
pub const MAX_NAME_LEN: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bootloader {
    #[serde(rename = "u-boot")]
    UBoot,
    #[serde(rename = "grub")]
    Grub,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    Mbr,
    #[default]
    Gpt,
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Schema::Mbr => "mbr",
            Schema::Gpt => "gpt",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    #[default]
    None,
    Ext4,
    Vfat,
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Filesystem::None => "none",
            Filesystem::Ext4 => "ext4",
            Filesystem::Vfat => "vfat",
        })
    }
}

/// Named structure roles usable in place of an explicit `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Esp,
    Raw,
    Mbr,
    Bare,
}

impl Role {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "esp" => Some(Role::Esp),
            "raw" => Some(Role::Raw),
            "mbr" => Some(Role::Mbr),
            "bare" => Some(Role::Bare),
            _ => None,
        }
    }

    pub fn implied_filesystem(self) -> Filesystem {
        match self {
            Role::Esp => Filesystem::Vfat,
            Role::Raw | Role::Mbr | Role::Bare => Filesystem::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureType {
    Guid(Uuid),
    MbrCode(u8),
    Hybrid(u8, Uuid),
    Role(Role),
}

impl StructureType {
    pub fn role(&self) -> Option<Role> {
        match self {
            StructureType::Role(r) => Some(*r),
            _ => None,
        }
    }

    /// Whether the structure gets a partition-table entry.
    pub fn is_partition(&self) -> bool {
        !matches!(self.role(), Some(Role::Mbr | Role::Bare))
    }

    pub fn gpt_guid(&self) -> Option<Uuid> {
        match self {
            StructureType::Guid(g) | StructureType::Hybrid(_, g) => Some(*g),
            StructureType::Role(Role::Esp) => Some(ESP_GUID),
            StructureType::Role(Role::Raw) => Some(RAW_GUID),
            _ => None,
        }
    }

    pub fn mbr_code(&self) -> Option<u8> {
        match self {
            StructureType::MbrCode(c) | StructureType::Hybrid(c, _) => Some(*c),
            StructureType::Role(Role::Esp) => Some(0xEF),
            StructureType::Role(Role::Raw) => Some(0xDA),
            _ => None,
        }
    }
}

impl fmt::Display for StructureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructureType::Guid(g) => write!(f, "{}", g.hyphenated().to_string().to_uppercase()),
            StructureType::MbrCode(c) => write!(f, "{c:02X}"),
            StructureType::Hybrid(c, g) => {
                write!(f, "{c:02X},{}", g.hyphenated().to_string().to_uppercase())
            }
            StructureType::Role(r) => write!(f, "{}", format!("{r:?}").to_lowercase()),
        }
    }
}

/// Where an `offset-write` puts its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetWrite {
    Absolute(u64),
    Relative { label: String, delta: u64 },
}

impl fmt::Display for OffsetWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetWrite::Absolute(at) => write!(f, "{at}"),
            OffsetWrite::Relative { label, delta } => write!(f, "{label}+{delta}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentItem {
    /// Copied into a created filesystem.
    Filesystem { source: String, target: String },
    /// Copied byte-for-byte into the structure.
    Raw {
        name: Option<String>,
        image: String,
        offset: Option<u64>,
        offset_write: Option<OffsetWrite>,
        size: Option<u64>,
    },
}

impl ContentItem {
    /// Trailing slash on the source means a recursive directory copy.
    pub fn is_directory_source(&self) -> bool {
        matches!(self, ContentItem::Filesystem { source, .. } if source.ends_with('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureSpec {
    pub name: Option<String>,
    pub offset: Option<u64>,
    pub offset_write: Option<OffsetWrite>,
    pub size: Option<u64>,
    pub kind: StructureType,
    pub id: Option<Uuid>,
    pub filesystem: Filesystem,
    pub filesystem_label: Option<String>,
    pub content: Vec<ContentItem>,
}

impl StructureSpec {
    pub fn role(&self) -> Option<Role> {
        self.kind.role()
    }

    /// Label used in messages: the name, or the structure's position.
    pub fn display_label(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("structure[{index}]"))
    }

    /// Label handed to mkfs: `filesystem-label`, falling back to the name.
    pub fn fs_label(&self) -> Option<&str> {
        self.filesystem_label.as_deref().or(self.name.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeId {
    Guid(Uuid),
    Signature(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub schema: Schema,
    pub bootloader: Option<Bootloader>,
    pub id: Option<VolumeId>,
    pub structures: Vec<StructureSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GadgetSpec {
    pub bootloader: Bootloader,
    pub device_tree: Option<String>,
    pub device_tree_origin: Option<String>,
    /// Declaration order; names are unique.
    pub volumes: Vec<VolumeSpec>,
}

impl GadgetSpec {
    pub fn volume(&self, name: &str) -> Option<&VolumeSpec> {
        self.volumes.iter().find(|v| v.name == name)
    }

    pub fn volume_names(&self) -> Vec<&str> {
        self.volumes.iter().map(|v| v.name.as_str()).collect()
    }
}
