//! External command runner and the configurable set of tools it drives.

use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Command;

use crate::error::ToolError;

/// Environment variable overriding the `snap` command.
pub const SNAP_CMD_ENV: &str = "GADGET_IMAGE_SNAP_CMD";

/// Command names for every external tool the builder shells out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tools {
    pub snap: String,
    pub mkfs_ext4: String,
    pub mkfs_vfat: String,
    pub mcopy: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            snap: "snap".to_string(),
            mkfs_ext4: "mkfs.ext4".to_string(),
            mkfs_vfat: "mkfs.vfat".to_string(),
            mcopy: "mcopy".to_string(),
        }
    }
}

impl Tools {
    /// Apply `GADGET_IMAGE_SNAP_CMD` on top of whatever is configured.
    pub fn with_env(mut self) -> Self {
        if let Ok(snap) = std::env::var(SNAP_CMD_ENV)
            && !snap.trim().is_empty()
        {
            log::debug!("{SNAP_CMD_ENV} overrides snap command with {snap}");
            self.snap = snap;
        }
        self
    }
}

#[derive(Debug)]
pub struct CmdOutput {
    pub status: Option<i32>,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Builder for one synchronous external command.
///
/// The program string may carry leading arguments (`"sudo snap"`), which
/// are split on whitespace.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    label: String,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            label: String::new(),
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Structure or content label reported on failure.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    fn tool_name(&self) -> &str {
        self.program.split_whitespace().next().unwrap_or(&self.program)
    }

    pub fn run(self) -> Result<CmdOutput, ToolError> {
        let mut words = self.program.split_whitespace();
        let Some(program) = words.next() else {
            return Err(ToolError::new("<empty>", &self.label, "no command configured"));
        };

        let mut command = Command::new(program);
        command.args(words).args(&self.args);
        for (k, v) in &self.envs {
            command.env(k, v);
        }
        log::debug!(
            "run: {} {}",
            self.program,
            self.args
                .iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let output = command
            .output()
            .map_err(|e| ToolError::io(self.tool_name(), &self.label, e))?;
        let result = CmdOutput {
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if result.success() {
            return Ok(result);
        }

        let stderr = result.stderr.trim();
        let detail = match (&self.error_msg, stderr.is_empty()) {
            (Some(msg), true) => msg.clone(),
            (Some(msg), false) => format!("{msg}: {stderr}"),
            (None, true) => "command failed".to_string(),
            (None, false) => stderr.to_string(),
        };
        let mut err = ToolError::new(self.tool_name(), &self.label, detail);
        err.status = result.status;
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn reports_exit_status_and_label() {
        let err = Cmd::new("sh")
            .args(["-c", "echo nope >&2; exit 3"])
            .label("writable")
            .error_msg("mkfs failed")
            .run()
            .unwrap_err();
        assert_eq!(err.tool, "sh");
        assert_eq!(err.label, "writable");
        assert_eq!(err.status, Some(3));
        assert_eq!(err.detail, "mkfs failed: nope");
    }

    #[test]
    fn program_may_carry_leading_args() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("out");
        let result = Cmd::new("sh -c")
            .arg("printf \"$X\" > \"$1\"")
            .arg("sh")
            .arg_path(&out)
            .env("X", "value")
            .run()
            .unwrap();
        assert!(result.success());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "value");
    }

    #[test]
    fn missing_program_is_a_tool_error() {
        let err = Cmd::new("definitely-not-a-real-tool-xyz")
            .label("boot")
            .run()
            .unwrap_err();
        assert_eq!(err.tool, "definitely-not-a-real-tool-xyz");
        assert_eq!(err.status, None);
    }

    #[test]
    #[serial]
    fn snap_command_env_override() {
        unsafe { std::env::set_var(SNAP_CMD_ENV, "/opt/snap") };
        let tools = Tools::default().with_env();
        unsafe { std::env::remove_var(SNAP_CMD_ENV) };
        assert_eq!(tools.snap, "/opt/snap");
        assert_eq!(tools.mcopy, "mcopy");
    }
}
