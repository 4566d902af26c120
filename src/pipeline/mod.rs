//! Resumable build pipeline: a fixed table of steps over [`BuildState`].

pub mod checkpoint;
mod state;
pub mod steps;

use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::TempDir;

use crate::error::{Error, Result};

pub use state::{BuildOptions, BuildState, ImageSource};
pub use steps::StepContext;

type StepFn = fn(BuildState, &StepContext) -> Result<BuildState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    PrepareImage,
    LoadGadgetYaml,
    ResolveLayout,
    AllocateVolumes,
    PartitionVolumes,
    PopulateFilesystems,
    WriteRawContent,
    Finish,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::PrepareImage,
        Step::LoadGadgetYaml,
        Step::ResolveLayout,
        Step::AllocateVolumes,
        Step::PartitionVolumes,
        Step::PopulateFilesystems,
        Step::WriteRawContent,
        Step::Finish,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::PrepareImage => "prepare_image",
            Step::LoadGadgetYaml => "load_gadget_yaml",
            Step::ResolveLayout => "resolve_layout",
            Step::AllocateVolumes => "allocate_volumes",
            Step::PartitionVolumes => "partition_volumes",
            Step::PopulateFilesystems => "populate_filesystems",
            Step::WriteRawContent => "write_raw_content",
            Step::Finish => "finish",
        }
    }

    /// 0-based position in [`Step::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// 1-based position, as accepted on the command line.
    pub fn ordinal(self) -> usize {
        self.index() + 1
    }

    pub fn description(self) -> &'static str {
        match self {
            Step::PrepareImage => "unpack the gadget tree into the working directory",
            Step::LoadGadgetYaml => "read and validate the gadget description",
            Step::ResolveLayout => "compute offsets and sizes, apply --image-size",
            Step::AllocateVolumes => "create sparse image files",
            Step::PartitionVolumes => "write GPT or MBR partition tables",
            Step::PopulateFilesystems => "create and fill filesystems",
            Step::WriteRawContent => "copy raw content and apply offset writes",
            Step::Finish => "move images into place, write the image list",
        }
    }

    fn func(self) -> StepFn {
        match self {
            Step::PrepareImage => steps::prepare_image,
            Step::LoadGadgetYaml => steps::load_gadget_yaml,
            Step::ResolveLayout => steps::resolve_layout,
            Step::AllocateVolumes => steps::allocate_volumes,
            Step::PartitionVolumes => steps::partition_volumes,
            Step::PopulateFilesystems => steps::populate_filesystems,
            Step::WriteRawContent => steps::write_raw_content,
            Step::Finish => steps::finish,
        }
    }

    fn next_after(last: Option<Step>) -> usize {
        last.map_or(0, |s| s.index() + 1)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<usize>() {
            return n
                .checked_sub(1)
                .and_then(|i| Step::ALL.get(i).copied())
                .ok_or_else(|| format!("step ordinal must be 1..={}", Step::ALL.len()));
        }
        Step::ALL
            .iter()
            .copied()
            .find(|step| step.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Step::ALL.iter().map(|s| s.name()).collect();
                format!("unknown step `{s}` (expected one of {})", names.join(", "))
            })
    }
}

/// Where a run should stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAt {
    /// Run the steps strictly before this one.
    Until(Step),
    /// Run up to and including this one.
    Thru(Step),
}

/// What a run ended with.
#[derive(Debug)]
pub struct Outcome {
    pub state: BuildState,
    /// Whether every step has now completed.
    pub finished: bool,
}

/// Drives [`BuildState`] through [`Step::ALL`].
pub struct Pipeline {
    ctx: StepContext,
    progress: ProgressBar,
}

impl Pipeline {
    pub fn new(ctx: StepContext) -> Self {
        Self {
            ctx,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Start a fresh build. Without a `workdir` a temporary one is used and
    /// removed afterwards, and no checkpoint is written.
    pub fn start(
        &self,
        mut options: BuildOptions,
        workdir: Option<&Path>,
        stop: Option<StopAt>,
    ) -> Result<Outcome> {
        match workdir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| Error::io(format!("failed to create {}", dir.display()), e))?;
                let dir = absolute(dir)?;
                if options.output_dir.is_none() {
                    options.output_dir = Some(dir.clone());
                }
                let state = BuildState::new(options, dir);
                checkpoint::save(&state)?;
                self.run(state, stop, true)
            }
            None => {
                if options.output_dir.is_none() {
                    let cwd = std::env::current_dir()
                        .map_err(|e| Error::io("failed to get current directory", e))?;
                    options.output_dir = Some(cwd);
                }
                let temp = TempDir::new()
                    .map_err(|e| Error::io("failed to create temporary working directory", e))?;
                log::debug!("using temporary working directory {}", temp.path().display());
                let state = BuildState::new(options, temp.path().to_path_buf());
                let outcome = self.run(state, stop, false);
                drop(temp);
                outcome
            }
        }
    }

    /// Continue from the checkpoint in `workdir`.
    pub fn resume(&self, workdir: &Path, stop: Option<StopAt>) -> Result<Outcome> {
        let mut state = checkpoint::load(workdir)?;
        state.workdir = absolute(workdir)?;
        match state.last_completed {
            Some(step) => log::info!("Resuming after step {} ({step})", step.ordinal()),
            None => log::info!("Resuming from the first step"),
        }
        self.run(state, stop, true)
    }

    fn run(&self, mut state: BuildState, stop: Option<StopAt>, persist: bool) -> Result<Outcome> {
        let first = Step::next_after(state.last_completed);
        self.progress.set_length(Step::ALL.len() as u64);
        self.progress.set_position(first as u64);

        for step in Step::ALL[first..].iter().copied() {
            if stop == Some(StopAt::Until(step)) {
                log::info!("Stopping before step {} ({step})", step.ordinal());
                break;
            }
            log::debug!("-> [{}] {}", step.ordinal(), step.name());
            self.progress.set_message(step.name());

            state = (step.func())(state, &self.ctx)?;
            state.last_completed = Some(step);
            if persist {
                checkpoint::save(&state)?;
            }
            self.progress.inc(1);

            if stop == Some(StopAt::Thru(step)) {
                log::info!("Stopping after step {} ({step})", step.ordinal());
                break;
            }
        }
        self.progress.finish_and_clear();

        let finished = state.last_completed == Some(Step::Finish);
        Ok(Outcome { state, finished })
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path)
        .map_err(|e| Error::io(format!("failed to resolve {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_parse_by_name_and_ordinal() {
        assert_eq!("load_gadget_yaml".parse::<Step>().unwrap(), Step::LoadGadgetYaml);
        assert_eq!("2".parse::<Step>().unwrap(), Step::LoadGadgetYaml);
        assert_eq!("8".parse::<Step>().unwrap(), Step::Finish);
        assert!("0".parse::<Step>().is_err());
        assert!("9".parse::<Step>().is_err());
        assert!("bogus".parse::<Step>().is_err());
    }

    #[test]
    fn step_table_is_ordered() {
        for (i, step) in Step::ALL.iter().enumerate() {
            assert_eq!(step.index(), i);
            assert_eq!(step.name().parse::<Step>().unwrap(), *step);
        }
        assert_eq!(Step::next_after(None), 0);
        assert_eq!(Step::next_after(Some(Step::ResolveLayout)), 3);
    }

    #[test]
    fn steps_serialize_by_name() {
        assert_eq!(
            serde_json::to_string(&Step::WriteRawContent).unwrap(),
            "\"write_raw_content\""
        );
    }
}
