//! Preflight checks for build validation.
//!
//! A build never starts with a missing input: the source tree, the kernel
//! variable file, a prior stage's output and the host tools are all checked
//! before anything is modified. A failed check is fatal and names both the
//! missing path and the step that produces it.
//!
//! # Example
//!
//! ```rust
//! use package_build::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("dpkg-buildpackage") {
//!     println!("dpkg-dev not installed");
//! }
//!
//! let tools = &[("git", "git"), ("fpm", "ruby-fpm")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use std::path::Path;

use anyhow::Result;

use crate::error::BuildError;
use crate::state::{CheckKind, PreconditionRecord, StateTracker};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools used by the Debian backend. Each tuple is (command_name, package_name).
pub const DEBIAN_TOOLS: &[(&str, &str)] = &[
    ("dpkg-buildpackage", "dpkg-dev"),
    ("mk-build-deps", "devscripts"),
];

pub const FPM_TOOLS: &[(&str, &str)] = &[("fpm", "ruby-fpm")];

pub const GIT_TOOLS: &[(&str, &str)] = &[("git", "git")];

pub const PATCH_TOOLS: &[(&str, &str)] = &[("patch", "patch")];

/// Tools needed by the image targets.
pub const IMAGE_TOOLS: &[(&str, &str)] = &[("lb", "live-build")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect::<Vec<_>>();

    if !missing.is_empty() {
        return Err(BuildError::MissingTools(missing.join("\n")).into());
    }
    Ok(())
}

/// Require a directory, e.g. a checked-out source tree.
pub fn require_dir(path: &Path, what: &str, remedy: &str) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    Err(missing(path, what, remedy))
}

/// Require a regular file, e.g. a kernel variable file or a prior-stage ISO.
pub fn require_file(path: &Path, what: &str, remedy: &str) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }
    Err(missing(path, what, remedy))
}

fn missing(path: &Path, what: &str, remedy: &str) -> anyhow::Error {
    BuildError::MissingPrecondition {
        what: what.to_string(),
        path: path.to_path_buf(),
        remedy: remedy.to_string(),
    }
    .into()
}

/// A single precondition to evaluate against the filesystem or PATH.
#[derive(Debug, Clone)]
pub struct Precondition<'a> {
    pub kind: CheckKind,
    pub subject: &'a str,
    pub path: Option<&'a Path>,
    pub what: &'a str,
    pub remedy: &'a str,
}

impl<'a> Precondition<'a> {
    pub fn dir(path: &'a Path, what: &'a str, remedy: &'a str) -> Self {
        Self {
            kind: CheckKind::Directory,
            subject: what,
            path: Some(path),
            what,
            remedy,
        }
    }

    pub fn file(path: &'a Path, what: &'a str, remedy: &'a str) -> Self {
        Self {
            kind: CheckKind::File,
            subject: what,
            path: Some(path),
            what,
            remedy,
        }
    }

    pub fn tool(command: &'a str, package: &'a str) -> Self {
        Self {
            kind: CheckKind::Tool,
            subject: command,
            path: None,
            what: command,
            remedy: package,
        }
    }

    fn record(&self, satisfied: bool) -> PreconditionRecord {
        match self.path {
            Some(path) => PreconditionRecord::path(self.kind, path, satisfied),
            None => PreconditionRecord {
                kind: self.kind,
                subject: self.subject.to_string(),
                satisfied,
            },
        }
    }

    fn check(&self) -> Result<()> {
        match (self.kind, self.path) {
            (CheckKind::Directory, Some(path)) => require_dir(path, self.what, self.remedy),
            (CheckKind::File, Some(path)) => require_file(path, self.what, self.remedy),
            _ => check_required_tools(&[(self.subject, self.remedy)]),
        }
    }
}

/// Evaluate every check, record each result, and fail on the first miss.
///
/// All checks are recorded even after a failure so the run record shows the
/// complete picture; the returned error is the first failure.
pub fn evaluate(checks: &[Precondition<'_>], tracker: &mut StateTracker) -> Result<()> {
    let mut first_failure = None;
    for check in checks {
        let result = check.check();
        tracker.record_precondition(check.record(result.is_ok()));
        if let Err(err) = result {
            first_failure.get_or_insert(err);
        }
    }
    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
