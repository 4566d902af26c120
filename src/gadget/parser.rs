use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashSet;
use uuid::Uuid;

use super::{
    Bootloader, ContentItem, Filesystem, GadgetSpec, MAX_NAME_LEN, OffsetWrite, Role, Schema,
    StructureSpec, StructureType, VolumeId, VolumeSpec,
};
use crate::error::ValidationError;
use crate::size::parse_size;

type Result<T> = std::result::Result<T, ValidationError>;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawGadget {
    device_tree: Option<String>,
    device_tree_origin: Option<String>,
    volumes: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawVolume {
    schema: Option<String>,
    bootloader: Option<String>,
    id: Option<Value>,
    #[serde(default)]
    structure: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawStructure {
    name: Option<String>,
    offset: Option<Value>,
    offset_write: Option<Value>,
    size: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<Value>,
    id: Option<String>,
    filesystem: Option<String>,
    filesystem_label: Option<String>,
    #[serde(default)]
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawContent {
    source: Option<String>,
    target: Option<String>,
    image: Option<String>,
    name: Option<String>,
    offset: Option<Value>,
    offset_write: Option<Value>,
    size: Option<Value>,
}

impl RawContent {
    fn is_raw_flavor(&self) -> bool {
        self.image.is_some()
            || self.name.is_some()
            || self.offset.is_some()
            || self.offset_write.is_some()
            || self.size.is_some()
    }

    fn is_fs_flavor(&self) -> bool {
        self.source.is_some() || self.target.is_some()
    }
}

fn from_value<T: for<'de> Deserialize<'de>>(path: &str, value: Value) -> Result<T> {
    serde_yaml::from_value(value).map_err(|e| ValidationError::new(path, e.to_string()))
}

fn scalar_text(path: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(ValidationError::new(path, "expected a string or number")),
    }
}

fn size_value(path: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ValidationError::new(path, format!("invalid size {n}"))),
        Value::String(s) => parse_size(s).map_err(|e| ValidationError::new(path, e.to_string())),
        _ => Err(ValidationError::new(path, "expected a size")),
    }
}

fn offset_write_value(path: &str, value: &Value) -> Result<OffsetWrite> {
    if let Value::String(s) = value
        && let Some((label, delta)) = s.rsplit_once('+')
    {
        let label = label.trim();
        if label.is_empty() {
            return Err(ValidationError::new(path, format!("missing label in `{s}`")));
        }
        let delta = parse_size(delta).map_err(|e| ValidationError::new(path, e.to_string()))?;
        return Ok(OffsetWrite::Relative {
            label: label.to_string(),
            delta,
        });
    }
    size_value(path, value)
        .map(OffsetWrite::Absolute)
        .map_err(|_| ValidationError::new(path, "expected `label+N` or a byte offset"))
}

fn is_hex2(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn parse_guid(path: &str, s: &str) -> Result<Uuid> {
    Uuid::parse_str(s.trim()).map_err(|_| ValidationError::new(path, format!("invalid GUID `{s}`")))
}

fn parse_type(path: &str, s: &str) -> Result<StructureType> {
    let s = s.trim();
    if let Some(role) = Role::from_name(s) {
        return Ok(StructureType::Role(role));
    }
    if let Some((code, guid)) = s.split_once(',') {
        let code = code.trim();
        if !is_hex2(code) {
            return Err(ValidationError::new(
                path,
                format!("invalid MBR code `{code}` in `{s}`"),
            ));
        }
        let code = u8::from_str_radix(code, 16)
            .map_err(|_| ValidationError::new(path, format!("invalid MBR code `{code}`")))?;
        return Ok(StructureType::Hybrid(code, parse_guid(path, guid)?));
    }
    if is_hex2(s) {
        let code = u8::from_str_radix(s, 16)
            .map_err(|_| ValidationError::new(path, format!("invalid MBR code `{s}`")))?;
        return Ok(StructureType::MbrCode(code));
    }
    Uuid::parse_str(s).map(StructureType::Guid).map_err(|_| {
        ValidationError::new(
            path,
            format!("`{s}` is not a GUID, a two-digit MBR code, `XX,GUID` or a role (esp, raw, mbr, bare)"),
        )
    })
}

fn parse_filesystem(path: &str, s: &str) -> Result<Filesystem> {
    match s {
        "none" => Ok(Filesystem::None),
        "ext4" => Ok(Filesystem::Ext4),
        "vfat" => Ok(Filesystem::Vfat),
        other => Err(ValidationError::new(
            path,
            format!("unknown filesystem `{other}` (expected none, ext4 or vfat)"),
        )),
    }
}

fn check_label(path: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ValidationError::new(path, "name must not be empty"));
    }
    if !name.is_ascii() || name.chars().any(|c| c.is_ascii_control()) {
        return Err(ValidationError::new(path, format!("name `{name}` must be printable ASCII")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::new(
            path,
            format!("name `{name}` is longer than {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(())
}

fn parse_volume_id(path: &str, schema: Schema, value: &Value) -> Result<VolumeId> {
    let text = scalar_text(path, value)?;
    match schema {
        Schema::Gpt => parse_guid(path, &text).map(VolumeId::Guid),
        Schema::Mbr => {
            let hex = text
                .strip_prefix("0x")
                .or_else(|| text.strip_prefix("0X"))
                .unwrap_or(&text);
            if hex.len() != 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ValidationError::new(
                    path,
                    format!("mbr disk id `{text}` must be 8 hex digits"),
                ));
            }
            u32::from_str_radix(hex, 16)
                .map(VolumeId::Signature)
                .map_err(|_| ValidationError::new(path, format!("invalid disk id `{text}`")))
        }
    }
}

fn parse_content(
    path: &str,
    filesystem: Filesystem,
    raw: RawContent,
) -> Result<ContentItem> {
    if filesystem == Filesystem::None {
        if raw.is_fs_flavor() {
            return Err(ValidationError::new(
                path,
                "source/target content requires a filesystem; use `image` for raw structures",
            ));
        }
        let image = raw
            .image
            .ok_or_else(|| ValidationError::new(format!("{path}.image"), "field is required"))?;
        if let Some(name) = &raw.name {
            check_label(&format!("{path}.name"), name)?;
        }
        let offset = raw
            .offset
            .as_ref()
            .map(|v| size_value(&format!("{path}.offset"), v))
            .transpose()?;
        let offset_write = raw
            .offset_write
            .as_ref()
            .map(|v| offset_write_value(&format!("{path}.offset-write"), v))
            .transpose()?;
        let size = raw
            .size
            .as_ref()
            .map(|v| size_value(&format!("{path}.size"), v))
            .transpose()?;
        Ok(ContentItem::Raw {
            name: raw.name,
            image,
            offset,
            offset_write,
            size,
        })
    } else {
        if raw.is_raw_flavor() {
            return Err(ValidationError::new(
                path,
                format!("image content is only valid in raw structures, not {filesystem}"),
            ));
        }
        let source = raw
            .source
            .ok_or_else(|| ValidationError::new(format!("{path}.source"), "field is required"))?;
        let mut target = raw.target.unwrap_or_default();
        if target.is_empty() {
            target.push('/');
        }
        if source.ends_with('/') && !target.ends_with('/') {
            return Err(ValidationError::new(
                format!("{path}.target"),
                format!("directory source `{source}` needs a directory target ending in `/`"),
            ));
        }
        Ok(ContentItem::Filesystem { source, target })
    }
}

fn parse_structure(
    path: &str,
    schema: Schema,
    raw: RawStructure,
) -> Result<StructureSpec> {
    if let Some(name) = &raw.name {
        check_label(&format!("{path}.name"), name)?;
    }

    let type_path = format!("{path}.type");
    let kind_text = raw
        .kind
        .as_ref()
        .ok_or_else(|| ValidationError::new(&type_path, "field is required"))
        .and_then(|v| scalar_text(&type_path, v))?;
    let kind = parse_type(&type_path, &kind_text)?;
    match (kind, schema) {
        (StructureType::Guid(_), Schema::Mbr) => {
            return Err(ValidationError::new(
                type_path,
                "GUID partition type on an mbr volume",
            ));
        }
        (StructureType::MbrCode(_), Schema::Gpt) => {
            return Err(ValidationError::new(
                type_path,
                "two-digit MBR code on a gpt volume",
            ));
        }
        _ => {}
    }

    let fs_path = format!("{path}.filesystem");
    let explicit_fs = raw
        .filesystem
        .as_deref()
        .map(|s| parse_filesystem(&fs_path, s))
        .transpose()?;
    let filesystem = match (kind.role(), explicit_fs) {
        (Some(role), Some(fs)) if fs != role.implied_filesystem() => {
            return Err(ValidationError::new(
                fs_path,
                format!(
                    "role {} implies filesystem {}, got {fs}",
                    kind,
                    role.implied_filesystem()
                ),
            ));
        }
        (Some(role), _) => role.implied_filesystem(),
        (None, fs) => fs.unwrap_or_default(),
    };

    let offset = raw
        .offset
        .as_ref()
        .map(|v| size_value(&format!("{path}.offset"), v))
        .transpose()?;
    if kind.role() == Some(Role::Mbr) && offset.is_some_and(|o| o != 0) {
        return Err(ValidationError::new(
            format!("{path}.offset"),
            "mbr structure must sit at offset 0",
        ));
    }
    let offset_write = raw
        .offset_write
        .as_ref()
        .map(|v| offset_write_value(&format!("{path}.offset-write"), v))
        .transpose()?;
    let size = raw
        .size
        .as_ref()
        .map(|v| size_value(&format!("{path}.size"), v))
        .transpose()?;

    let id = match raw.id.as_deref() {
        None => None,
        Some(_) if schema != Schema::Gpt => {
            return Err(ValidationError::new(
                format!("{path}.id"),
                "partition id is only valid on gpt volumes",
            ));
        }
        Some(text) => Some(parse_guid(&format!("{path}.id"), text)?),
    };

    if let Some(label) = &raw.filesystem_label {
        if filesystem == Filesystem::None {
            return Err(ValidationError::new(
                format!("{path}.filesystem-label"),
                "filesystem-label needs a filesystem",
            ));
        }
        check_label(&format!("{path}.filesystem-label"), label)?;
    }

    let mut content = Vec::with_capacity(raw.content.len());
    for (i, value) in raw.content.into_iter().enumerate() {
        let item_path = format!("{path}.content[{i}]");
        let raw_item: RawContent = from_value(&item_path, value)?;
        content.push(parse_content(&item_path, filesystem, raw_item)?);
    }

    Ok(StructureSpec {
        name: raw.name,
        offset,
        offset_write,
        size,
        kind,
        id,
        filesystem,
        filesystem_label: raw.filesystem_label,
        content,
    })
}

fn parse_volume(name: &str, value: Value) -> Result<VolumeSpec> {
    let path = format!("volumes.{name}");
    check_label(&path, name)?;
    let raw: RawVolume = from_value(&path, value)?;

    let schema = match raw.schema.as_deref() {
        None => Schema::Gpt,
        Some("gpt") => Schema::Gpt,
        Some("mbr") => Schema::Mbr,
        Some(other) => {
            return Err(ValidationError::new(
                format!("{path}.schema"),
                format!("unknown schema `{other}` (expected mbr or gpt)"),
            ));
        }
    };

    let bootloader = match raw.bootloader.as_deref() {
        None => None,
        Some("u-boot") => Some(Bootloader::UBoot),
        Some("grub") => Some(Bootloader::Grub),
        Some(other) => {
            return Err(ValidationError::new(
                format!("{path}.bootloader"),
                format!("unknown bootloader `{other}` (expected u-boot or grub)"),
            ));
        }
    };

    let id = raw
        .id
        .as_ref()
        .map(|v| parse_volume_id(&format!("{path}.id"), schema, v))
        .transpose()?;

    let mut structures = Vec::with_capacity(raw.structure.len());
    let mut labels = HashSet::new();
    let mut mbr_seen = false;
    for (i, value) in raw.structure.into_iter().enumerate() {
        let spath = format!("{path}.structure[{i}]");
        let raw_structure: RawStructure = from_value(&spath, value)?;
        let structure = parse_structure(&spath, schema, raw_structure)?;

        if structure.role() == Some(Role::Mbr) {
            if mbr_seen {
                return Err(ValidationError::new(
                    format!("{spath}.type"),
                    "only one mbr structure is allowed per volume",
                ));
            }
            mbr_seen = true;
        }

        if let Some(n) = &structure.name
            && !labels.insert(n.clone())
        {
            return Err(ValidationError::new(
                format!("{spath}.name"),
                format!("duplicate label `{n}`"),
            ));
        }
        for (j, item) in structure.content.iter().enumerate() {
            if let ContentItem::Raw { name: Some(n), .. } = item
                && !labels.insert(n.clone())
            {
                return Err(ValidationError::new(
                    format!("{spath}.content[{j}].name"),
                    format!("duplicate label `{n}`"),
                ));
            }
        }
        structures.push(structure);
    }

    if schema == Schema::Mbr {
        let partitions = structures.iter().filter(|s| s.kind.is_partition()).count();
        if partitions > 4 {
            return Err(ValidationError::new(
                format!("{path}.structure"),
                format!("mbr volumes hold at most 4 partitions, found {partitions}"),
            ));
        }
    }

    Ok(VolumeSpec {
        name: name.to_string(),
        schema,
        bootloader,
        id,
        structures,
    })
}

/// Parse and validate gadget description text.
pub fn parse(text: &str) -> Result<GadgetSpec> {
    let doc: Value =
        serde_yaml::from_str(text).map_err(|e| ValidationError::new("gadget.yaml", e.to_string()))?;
    if doc.is_null() {
        return Err(ValidationError::new("gadget.yaml", "document is empty"));
    }
    let raw: RawGadget = from_value("gadget.yaml", doc)?;

    if let Some(origin) = raw.device_tree_origin.as_deref()
        && !matches!(origin, "gadget" | "kernel")
    {
        return Err(ValidationError::new(
            "device-tree-origin",
            format!("unknown origin `{origin}` (expected gadget or kernel)"),
        ));
    }

    if raw.volumes.is_empty() {
        return Err(ValidationError::new("volumes", "at least one volume is required"));
    }

    let mut volumes = Vec::with_capacity(raw.volumes.len());
    for (key, value) in raw.volumes {
        let Value::String(name) = key else {
            return Err(ValidationError::new(
                "volumes",
                "volume names must be strings",
            ));
        };
        volumes.push(parse_volume(&name, value)?);
    }

    let with_bootloader: Vec<&VolumeSpec> =
        volumes.iter().filter(|v| v.bootloader.is_some()).collect();
    let bootloader = match with_bootloader.as_slice() {
        [only] => only.bootloader,
        [] => None,
        many => {
            let names: Vec<&str> = many.iter().map(|v| v.name.as_str()).collect();
            return Err(ValidationError::new(
                "volumes",
                format!("exactly one volume may set bootloader, found {}", names.join(", ")),
            ));
        }
    };
    let Some(bootloader) = bootloader else {
        return Err(ValidationError::new(
            "volumes",
            "no volume sets a bootloader (u-boot or grub)",
        ));
    };

    Ok(GadgetSpec {
        bootloader,
        device_tree: raw.device_tree,
        device_tree_origin: raw.device_tree_origin,
        volumes,
    })
}
