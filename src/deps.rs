//! Host build-dependency installation.
//!
//! Global dependencies come from the manifest's `[dependencies]` table;
//! per-package dependencies come from the source tree's `debian/control`
//! through `mk-build-deps`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::preflight::command_exists;
use crate::process::Cmd;

/// Prefix with `sudo` when it is available.
fn privileged(program: &str) -> Cmd {
    if command_exists("sudo") {
        Cmd::new("sudo").arg(program)
    } else {
        Cmd::new(program)
    }
}

/// `apt-get install` the manifest's global dependencies.
pub fn ensure_host_dependencies(packages: &[String]) -> Result<()> {
    if packages.is_empty() {
        tracing::info!("[deps] no additional dependencies to install");
        return Ok(());
    }
    tracing::info!("[deps] ensuring Debian build dependencies: {}", packages.join(" "));
    privileged("apt-get")
        .arg("update")
        .error_msg("apt-get update")
        .run_interactive()?;
    privileged("apt-get")
        .args(["install", "-y"])
        .args(packages)
        .error_msg("apt-get install")
        .run_interactive()
}

/// Install the build dependencies declared in `debian/control`, if any.
///
/// Returns `false` when the tree has no `debian/control`.
pub fn install_build_deps(source_dir: &Path) -> Result<bool> {
    if !source_dir.join("debian").join("control").is_file() {
        return Ok(false);
    }
    privileged("mk-build-deps")
        .args([
            "--install",
            "--tool",
            "apt-get --yes --no-install-recommends",
        ])
        .current_dir(source_dir)
        .error_msg("mk-build-deps")
        .run_interactive()?;

    let debs = build_deps_packages(source_dir)?;
    if !debs.is_empty() {
        privileged("dpkg")
            .arg("-i")
            .args(&debs)
            .current_dir(source_dir)
            .error_msg("dpkg -i build-deps")
            .run_interactive()?;
    }
    Ok(true)
}

/// `*build-deps*.deb` files left in `dir` by `mk-build-deps`.
pub fn build_deps_packages(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut debs = Vec::new();
    if !dir.is_dir() {
        return Ok(debs);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))? {
        let path = entry
            .with_context(|| format!("iterating '{}'", dir.display()))?
            .path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.contains("build-deps") && name.ends_with(".deb") && path.is_file() {
            debs.push(path);
        }
    }
    debs.sort();
    Ok(debs)
}

/// Remove `*build-deps*.deb` leftovers.
pub fn cleanup_build_deps(dir: &Path) -> Result<usize> {
    let debs = build_deps_packages(dir)?;
    for deb in &debs {
        fs::remove_file(deb).with_context(|| format!("removing '{}'", deb.display()))?;
    }
    Ok(debs.len())
}
