//! Failure taxonomy for build runs.
//!
//! Library functions return `anyhow::Result` and attach context as they go.
//! The variants here are the failures an operator has to act on; they travel
//! inside `anyhow::Error` and the binary downcasts them to pick an exit code.

use std::path::PathBuf;

use thiserror::Error;

use crate::state::BuildState;

#[derive(Error, Debug)]
pub enum BuildError {
    /// A required file or directory is absent. Nothing has been modified.
    #[error("missing {what} '{}'\n{remedy}", path.display())]
    MissingPrecondition {
        what: String,
        path: PathBuf,
        remedy: String,
    },

    /// Host tools that the selected steps shell out to are not on PATH.
    #[error("missing required host tools:\n{0}")]
    MissingTools(String),

    /// Another invocation holds the workspace lock.
    #[error("workspace '{}' is locked by another build", path.display())]
    WorkspaceLocked { path: PathBuf },

    /// An external tool exited unsuccessfully.
    #[error("{program} failed with {}", describe_exit(*code))]
    CommandFailed { program: String, code: Option<i32> },

    /// A patch was rejected. The source tree may be partially patched.
    #[error(
        "patch '{}' failed to apply with {}\nthe source tree is now partially patched; discard it and fetch again",
        patch.display(),
        describe_exit(*code)
    )]
    PatchRejected { patch: PathBuf, code: Option<i32> },

    #[error("invalid kernel variable file '{}': {reason}", path.display())]
    KernelVars { path: PathBuf, reason: String },

    #[error("could not derive package version in '{}': {reason}", source_dir.display())]
    Version { source_dir: PathBuf, reason: String },

    #[error("invalid package manifest '{}': {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("unknown placeholder '{{{key}}}' in template '{template}'")]
    Template { template: String, key: String },

    #[error("illegal build state transition {from} -> {to}")]
    InvalidTransition { from: BuildState, to: BuildState },
}

impl BuildError {
    /// Process exit code for this failure: the tool's own code when one was
    /// reported, otherwise 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::CommandFailed { code: Some(code), .. }
            | BuildError::PatchRejected { code: Some(code), .. }
                if *code != 0 =>
            {
                *code
            }
            _ => 1,
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "termination by signal".to_string(),
    }
}

/// Exit code for an arbitrary error chain.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BuildError>())
        .map(BuildError::exit_code)
        .unwrap_or(1)
}
