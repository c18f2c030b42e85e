//! Patch discovery and application.
//!
//! Patches live in `<patch_dir>/<package>/` and are applied in lexicographic
//! file-name order, so names like `0001-...` encode the intended sequence.
//! The first rejected patch aborts the build; there is no rollback.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::BuildError;
use crate::process::Cmd;

/// How a patch is put into the source tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchMethod {
    /// Copy into `debian/patches/` and list in `debian/patches/series`.
    Series,
    /// `git am`
    GitAm,
    /// `patch -p1`
    Patch,
}

impl FromStr for PatchMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "series" | "debian" => Ok(PatchMethod::Series),
            "git-am" | "git_am" | "am" => Ok(PatchMethod::GitAm),
            "patch" => Ok(PatchMethod::Patch),
            other => Err(format!(
                "unsupported patch_method '{other}' (expected 'series', 'git-am' or 'patch')"
            )),
        }
    }
}

impl fmt::Display for PatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchMethod::Series => write!(f, "series"),
            PatchMethod::GitAm => write!(f, "git-am"),
            PatchMethod::Patch => write!(f, "patch"),
        }
    }
}

/// A patch that went in cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub name: String,
    pub sha256: String,
}

/// List patch files in application order.
///
/// A missing directory means the package has no patches.
pub fn discover_patches(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut patches = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("reading patch directory '{}'", dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("iterating patch directory '{}'", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        patches.push(path);
    }
    patches.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(patches)
}

/// Apply `patches` in order against `source_dir`.
pub fn apply_patches(
    source_dir: &Path,
    patches: &[PathBuf],
    method: PatchMethod,
) -> Result<Vec<AppliedPatch>> {
    let mut applied = Vec::with_capacity(patches.len());
    for patch in patches {
        let name = patch
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("patch path without file name '{}'", patch.display()))?
            .to_string();
        let sha256 = file_sha256(patch)?;

        match method {
            PatchMethod::Series => add_to_series(source_dir, patch, &name)?,
            PatchMethod::GitAm => run_patch_tool(
                Cmd::new("git")
                    .args(["am", "--keep-cr"])
                    .arg(absolute(patch)?)
                    .current_dir(source_dir),
                patch,
            )?,
            PatchMethod::Patch => run_patch_tool(
                Cmd::new("patch")
                    .args(["-p1", "--forward", "--batch", "-i"])
                    .arg(absolute(patch)?)
                    .current_dir(source_dir),
                patch,
            )?,
        }

        tracing::info!("  applied patch {name}");
        applied.push(AppliedPatch { name, sha256 });
    }
    Ok(applied)
}

/// Digest over names and contents of an ordered patch set.
pub fn patch_set_digest(applied: &[AppliedPatch]) -> String {
    let mut hasher = Sha256::new();
    for patch in applied {
        hasher.update(patch.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(patch.sha256.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

fn run_patch_tool(cmd: Cmd, patch: &Path) -> Result<()> {
    match cmd.run() {
        Ok(_) => Ok(()),
        Err(err) => match err.downcast_ref::<BuildError>() {
            Some(BuildError::CommandFailed { code, .. }) => Err(BuildError::PatchRejected {
                patch: patch.to_path_buf(),
                code: *code,
            }
            .into()),
            _ => Err(err),
        },
    }
}

fn add_to_series(source_dir: &Path, patch: &Path, name: &str) -> Result<()> {
    let patches_dir = source_dir.join("debian").join("patches");
    fs::create_dir_all(&patches_dir)
        .with_context(|| format!("creating '{}'", patches_dir.display()))?;
    let dest = patches_dir.join(name);
    fs::copy(patch, &dest).with_context(|| {
        format!("copying patch '{}' -> '{}'", patch.display(), dest.display())
    })?;

    let series = patches_dir.join("series");
    let listed = match fs::read_to_string(&series) {
        Ok(text) => text.lines().any(|line| line.trim() == name),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            return Err(err).with_context(|| format!("reading '{}'", series.display()));
        }
    };
    if listed {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&series)
        .with_context(|| format!("opening '{}'", series.display()))?;
    writeln!(file, "{name}").with_context(|| format!("appending to '{}'", series.display()))?;
    Ok(())
}

fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("reading patch '{}'", path.display()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("resolving patch path '{}'", path.display()))
}
