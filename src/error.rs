//! Error kinds surfaced by the image builder and their process exit codes.

use std::path::PathBuf;

use thiserror::Error;

/// Exit code for failures that fit no other category.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for command-line usage errors, including malformed sizes.
pub const EXIT_USAGE: i32 = 2;
/// Exit code for gadget description validation failures.
pub const EXIT_VALIDATION: i32 = 3;
/// Exit code for layout resolution failures.
pub const EXIT_LAYOUT: i32 = 4;
/// Exit code for external tool failures.
pub const EXIT_TOOL: i32 = 5;
/// Exit code for `--resume` without a usable checkpoint.
pub const EXIT_RESUME: i32 = 6;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed size `{input}`: {reason}")]
pub struct MalformedSizeError {
    pub input: String,
    pub reason: String,
}

impl MalformedSizeError {
    pub fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// A gadget description rule violation, tagged with the dotted path of the
/// offending field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("volume {volume}: {first} overlaps {second}")]
    Overlap {
        volume: String,
        first: String,
        second: String,
    },

    #[error("volume {volume}: offset-write reference `{reference}` names no structure or content label")]
    UnresolvedLabel { volume: String, reference: String },

    #[error("volume {volume}: {structure} has no size and no content to infer it from")]
    MissingSize { volume: String, structure: String },

    #[error("volume {volume}: {label} declares size {declared} but {path} is {actual} bytes")]
    ContentTooLarge {
        volume: String,
        label: String,
        path: String,
        declared: u64,
        actual: u64,
    },

    #[error("volume {volume}: content {label} does not fit in {structure} ({overage} bytes over)")]
    DoesNotFit {
        volume: String,
        structure: String,
        label: String,
        overage: u64,
    },

    #[error("volume {volume}: mbr structure is {size} bytes, limit is 446")]
    MbrTooLarge { volume: String, size: u64 },

    #[error("volume {volume}: content {path} not found in gadget tree")]
    MissingContent { volume: String, path: String },

    #[error("volume {volume}: {label} extends past the end of the 64-bit byte range")]
    OutOfRange { volume: String, label: String },

    #[error("volume {volume}: offset-write of {label} at {location} does not fit: {reason}")]
    WriteOutOfRange {
        volume: String,
        label: String,
        location: u64,
        reason: String,
    },
}

/// A delegated operation (external command or in-process table/copy write)
/// that failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{tool} failed for {label}{}: {detail}", .status.map(|s| format!(" (exit status {s})")).unwrap_or_default())]
pub struct ToolError {
    pub tool: String,
    pub label: String,
    pub status: Option<i32>,
    pub detail: String,
}

impl ToolError {
    pub fn new(tool: &str, label: &str, detail: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            label: label.to_string(),
            status: None,
            detail: detail.into(),
        }
    }

    pub fn io(tool: &str, label: &str, err: std::io::Error) -> Self {
        Self::new(tool, label, err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("no checkpoint found in {0}")]
    Missing(PathBuf),

    #[error("checkpoint {path} is incompatible: {reason}")]
    Incompatible { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    MalformedSize(#[from] MalformedSizeError),

    #[error("gadget.yaml validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("layout resolution failed: {0}")]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Resume(#[from] ResumeError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint serialization failed: {0}")]
    Checkpoint(#[from] serde_json::Error),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::MalformedSize(_) => EXIT_USAGE,
            Error::Validation(_) => EXIT_VALIDATION,
            Error::Layout(_) => EXIT_LAYOUT,
            Error::Tool(_) => EXIT_TOOL,
            Error::Resume(_) => EXIT_RESUME,
            Error::Io { .. } | Error::Checkpoint(_) => EXIT_FAILURE,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            Error::from(ValidationError::new("volumes", "x")).exit_code(),
            Error::from(LayoutError::MbrTooLarge {
                volume: "pc".into(),
                size: 512,
            })
            .exit_code(),
            Error::from(ToolError::new("mkfs.ext4", "writable", "boom")).exit_code(),
            Error::from(ResumeError::Missing(PathBuf::from("/w"))).exit_code(),
        ];
        assert_eq!(codes, [EXIT_VALIDATION, EXIT_LAYOUT, EXIT_TOOL, EXIT_RESUME]);
    }

    #[test]
    fn tool_error_mentions_status() {
        let mut err = ToolError::new("mkfs.vfat", "system-boot", "bad size");
        err.status = Some(1);
        assert_eq!(
            err.to_string(),
            "mkfs.vfat failed for system-boot (exit status 1): bad size"
        );
    }
}
