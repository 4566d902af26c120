use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{BuildState, ImageSource, checkpoint};
use crate::disk::{VolumeBuilder, ids};
use crate::error::{Error, ResumeError, Result};
use crate::gadget::{self, GadgetSpec};
use crate::layout::{self, ResolvedLayout};
use crate::prepare::{PrepareImage, SnapPrepare, TreePrepare};
use crate::tools::Tools;

/// Per-run inputs that are not part of the persisted state.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub tools: Tools,
}

fn io_err(what: &str, path: &Path) -> impl FnOnce(std::io::Error) -> Error {
    let context = format!("{what} {}", path.display());
    move |e| Error::io(context, e)
}

fn missing(state: &BuildState, what: &str) -> Error {
    ResumeError::Incompatible {
        path: checkpoint::path_in(&state.workdir),
        reason: format!("build state has no {what}"),
    }
    .into()
}

fn parts(state: &BuildState) -> Result<(&GadgetSpec, &ResolvedLayout, &str)> {
    let gadget = state.gadget.as_ref().ok_or_else(|| missing(state, "gadget description"))?;
    let layout = state.layout.as_ref().ok_or_else(|| missing(state, "resolved layout"))?;
    let digest = state
        .gadget_digest
        .as_deref()
        .ok_or_else(|| missing(state, "gadget digest"))?;
    Ok((gadget, layout, digest))
}

pub fn prepare_image(state: BuildState, ctx: &StepContext) -> Result<BuildState> {
    fs::create_dir_all(&state.workdir).map_err(io_err("failed to create", &state.workdir))?;
    let unpack = state.unpack_dir();
    if unpack.exists() {
        fs::remove_dir_all(&unpack).map_err(io_err("failed to clear", &unpack))?;
    }
    fs::create_dir_all(&unpack).map_err(io_err("failed to create", &unpack))?;

    match &state.options.source {
        ImageSource::Model {
            model,
            channel,
            snaps,
            cloud_init,
            disable_console_conf,
            factory_image,
            validation,
        } => SnapPrepare {
            snap_cmd: ctx.tools.snap.clone(),
            model: model.clone(),
            channel: channel.clone(),
            snaps: snaps.clone(),
            cloud_init: cloud_init.clone(),
            disable_console_conf: *disable_console_conf,
            factory_image: *factory_image,
            validation: *validation,
        }
        .prepare(&state.workdir, &unpack)?,
        ImageSource::GadgetTree(tree) => TreePrepare {
            gadget_tree: tree.clone(),
        }
        .prepare(&state.workdir, &unpack)?,
    }
    Ok(state)
}

pub fn load_gadget_yaml(mut state: BuildState, _ctx: &StepContext) -> Result<BuildState> {
    let path = state.gadget_yaml();
    let text = fs::read_to_string(&path).map_err(io_err("failed to read", &path))?;
    let kept = state.workdir.join("gadget.yaml");
    fs::write(&kept, &text).map_err(io_err("failed to write", &kept))?;

    let spec = gadget::parse(&text)?;
    log::info!(
        "Loaded gadget description with {} volume(s): {}",
        spec.volumes.len(),
        spec.volume_names().join(", ")
    );
    state.gadget_digest = Some(ids::digest_text(&text));
    state.gadget = Some(spec);
    Ok(state)
}

pub fn resolve_layout(mut state: BuildState, _ctx: &StepContext) -> Result<BuildState> {
    let gadget = state
        .gadget
        .as_ref()
        .ok_or_else(|| missing(&state, "gadget description"))?;
    let layout = layout::resolve(gadget, &state.gadget_tree(), state.options.image_size.as_ref())?;

    let output_dir = state
        .options
        .output_dir
        .clone()
        .unwrap_or_else(|| state.workdir.clone());
    state.outputs = layout
        .volumes
        .iter()
        .map(|v| BuildState::output_path(&output_dir, &v.name))
        .collect();
    for v in &layout.volumes {
        log::info!("Volume {}: {} bytes, {} structures", v.name, v.size, v.structures.len());
    }
    state.layout = Some(layout);
    Ok(state)
}

pub fn allocate_volumes(state: BuildState, _ctx: &StepContext) -> Result<BuildState> {
    let (_, layout, digest) = parts(&state)?;
    for volume in &layout.volumes {
        let image = state.image_path(&volume.name);
        VolumeBuilder {
            volume,
            image: &image,
            seed: digest,
        }
        .allocate()?;
    }
    Ok(state)
}

pub fn partition_volumes(state: BuildState, _ctx: &StepContext) -> Result<BuildState> {
    let (_, layout, digest) = parts(&state)?;
    for volume in &layout.volumes {
        let image = state.image_path(&volume.name);
        VolumeBuilder {
            volume,
            image: &image,
            seed: digest,
        }
        .partition()?;
    }
    Ok(state)
}

pub fn populate_filesystems(state: BuildState, ctx: &StepContext) -> Result<BuildState> {
    let (_, layout, digest) = parts(&state)?;
    let gadget = state.gadget_tree();
    for volume in &layout.volumes {
        let image = state.image_path(&volume.name);
        VolumeBuilder {
            volume,
            image: &image,
            seed: digest,
        }
        .populate_filesystems(&ctx.tools, &gadget, &state.volume_work_dir(&volume.name))?;
    }
    Ok(state)
}

pub fn write_raw_content(state: BuildState, _ctx: &StepContext) -> Result<BuildState> {
    let (_, layout, digest) = parts(&state)?;
    let gadget = state.gadget_tree();
    for volume in &layout.volumes {
        let image = state.image_path(&volume.name);
        VolumeBuilder {
            volume,
            image: &image,
            seed: digest,
        }
        .write_raw(&gadget)?;
    }
    Ok(state)
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(io_err("failed to copy", from))?;
    fs::remove_file(from).map_err(io_err("failed to remove", from))?;
    Ok(())
}

pub fn finish(state: BuildState, _ctx: &StepContext) -> Result<BuildState> {
    let (_, layout, _) = parts(&state)?;
    let mut written: Vec<PathBuf> = Vec::with_capacity(state.outputs.len());
    for (volume, output) in layout.volumes.iter().zip(&state.outputs) {
        let image = state.image_path(&volume.name);
        if let Some(parent) = output.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
        }
        // A resumed finish may find the image already moved by the failed run.
        if image != *output {
            if image.exists() {
                move_file(&image, output)?;
            } else if output.is_file() {
                log::debug!("{} already in place", output.display());
            } else {
                return Err(Error::io(
                    format!("no image for volume {} at {}", volume.name, image.display()),
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ));
            }
        }
        let absolute = fs::canonicalize(output).map_err(io_err("failed to resolve", output))?;
        log::info!("Wrote {}", absolute.display());
        written.push(absolute);
    }

    if let Some(list) = &state.options.image_file_list {
        let mut file = fs::File::create(list).map_err(io_err("failed to create", list))?;
        for path in &written {
            writeln!(file, "{}", path.display()).map_err(io_err("failed to write", list))?;
        }
    }
    Ok(state)
}
