//! Artifact placement.
//!
//! After the external build, outputs are staged into the layout the
//! packaging backend expects: copy rules, removal of files that would collide
//! with a base package (`modules.*` indices shipped with the kernel image),
//! and an optional post-install hook. Built `.deb` files are then gathered
//! into the output directory.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::config::PlacementSpec;
use crate::template::Vars;

/// What placement did, for the run record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementReport {
    pub copied: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub post_install: Option<PathBuf>,
}

/// Apply copy rules and collision removals into `staging_dir`, and write the
/// post-install hook to `hook_path`.
pub fn place(
    spec: &PlacementSpec,
    source_dir: &Path,
    staging_dir: &Path,
    hook_path: &Path,
    vars: &Vars,
) -> Result<PlacementReport> {
    let mut report = PlacementReport::default();

    for rule in &spec.copy {
        let from = source_dir.join(vars.render(&rule.from)?);
        let to = staging_dir.join(vars.render(&rule.to)?);
        if from.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else if from.is_file() {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating '{}'", parent.display()))?;
            }
            fs::copy(&from, &to).with_context(|| {
                format!("copying '{}' -> '{}'", from.display(), to.display())
            })?;
        } else {
            bail!("build output not found: {}", from.display());
        }
        report.copied.push(to);
    }

    if !spec.remove.is_empty() {
        report.removed = remove_matching(staging_dir, &spec.remove)?;
    }

    if let Some(body) = spec.post_install.as_deref() {
        write_hook(hook_path, &vars.render(body)?)?;
        report.post_install = Some(hook_path.to_path_buf());
    }

    Ok(report)
}

/// Delete every file under `root` whose file name matches one of `patterns`.
pub fn remove_matching(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !root.exists() {
        return Ok(removed);
    }
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if patterns.iter().any(|p| wildcard_match(p, name)) {
            removed.push(entry.path().to_path_buf());
        }
    }
    for path in &removed {
        fs::remove_file(path).with_context(|| format!("removing '{}'", path.display()))?;
    }
    Ok(removed)
}

/// Shell-style match supporting `*` and `?`.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

fn write_hook(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let script = format!("#!/bin/sh\nset -e\n\n{}\n", body.trim_end());
    fs::write(path, script)
        .with_context(|| format!("writing post-install hook '{}'", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod post-install hook '{}'", path.display()))?;
    Ok(())
}

/// Recursively copy a directory tree, preserving symlinks.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating '{}'", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("reading link '{}'", entry.path().display()))?;
            if target.is_symlink() || target.exists() {
                fs::remove_file(&target)
                    .with_context(|| format!("replacing '{}'", target.display()))?;
            }
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("linking '{}'", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "copying '{}' -> '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

/// The `.deb` files present in a set of directories, with their
/// modification times, taken before the external build runs.
#[derive(Debug, Clone, Default)]
pub struct DebSnapshot {
    seen: BTreeMap<PathBuf, Option<SystemTime>>,
}

impl DebSnapshot {
    pub fn take(dirs: &[&Path]) -> Result<Self> {
        let mut seen = BTreeMap::new();
        for dir in dirs {
            for deb in list_debs(dir)? {
                let modified = modified(&deb);
                seen.insert(deb, modified);
            }
        }
        Ok(Self { seen })
    }

    /// Whether `path` appeared or changed since the snapshot.
    pub fn is_new(&self, path: &Path) -> bool {
        match self.seen.get(path) {
            None => true,
            Some(before) => modified(path) != *before,
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Built `.deb` files directly inside `dir`, without `mk-build-deps` leftovers.
fn list_debs(dir: &Path) -> Result<Vec<PathBuf>> {
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
        if name.ends_with(".deb") && !name.contains("build-deps") && path.is_file() {
            debs.push(path);
        }
    }
    debs.sort();
    Ok(debs)
}

/// Copy every `.deb` the build produced in `search_dirs` into `output_dir`.
///
/// Files already listed in `before` with an unchanged modification time
/// belong to earlier builds and are skipped. Files already in `output_dir`
/// are reported but not copied onto themselves.
pub fn collect_debs(
    search_dirs: &[&Path],
    output_dir: &Path,
    before: &DebSnapshot,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory '{}'", output_dir.display()))?;
    let output_canon = fs::canonicalize(output_dir)
        .with_context(|| format!("resolving '{}'", output_dir.display()))?;

    let mut collected = Vec::new();
    for dir in search_dirs {
        let same_dir = fs::canonicalize(dir).map(|d| d == output_canon).unwrap_or(false);
        for deb in list_debs(dir)? {
            if !before.is_new(&deb) {
                tracing::debug!("  skipping {} from an earlier build", deb.display());
                continue;
            }
            let dest = output_dir.join(deb.file_name().unwrap_or_default());
            if !same_dir {
                fs::copy(&deb, &dest).with_context(|| {
                    format!("copying '{}' -> '{}'", deb.display(), dest.display())
                })?;
                tracing::info!("  copied {}", dest.display());
            }
            if !collected.contains(&dest) {
                collected.push(dest);
            }
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyRule;

    #[test]
    fn wildcard_matches_module_indices() {
        assert!(wildcard_match("modules.*", "modules.dep"));
        assert!(wildcard_match("modules.*", "modules.alias.bin"));
        assert!(!wildcard_match("modules.*", "ixgbe.ko"));
        assert!(wildcard_match("*.ko", "ixgbe.ko"));
        assert!(wildcard_match("ixgb?.ko", "ixgbe.ko"));
        assert!(!wildcard_match("ixgb?.ko", "ixgb.ko"));
        assert!(wildcard_match("*", ""));
    }

    #[test]
    fn placement_stages_removes_collisions_and_writes_hook() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("ixgbe");
        fs::create_dir_all(src.join("src")).unwrap();
        fs::write(src.join("src/ixgbe.ko"), "module").unwrap();

        let staging = temp.path().join("staging");
        let modules = staging.join("lib/modules/6.6.48-vyos");
        fs::create_dir_all(modules.join("updates")).unwrap();
        fs::write(modules.join("modules.dep"), "").unwrap();
        fs::write(modules.join("modules.alias"), "").unwrap();

        let mut vars = Vars::new();
        vars.set("KERNEL_VERSION", "6.6.48").set("KERNEL_SUFFIX", "-vyos");
        let spec = PlacementSpec {
            copy: vec![CopyRule {
                from: "src/ixgbe.ko".into(),
                to: "lib/modules/{KERNEL_VERSION}{KERNEL_SUFFIX}/updates/ixgbe.ko".into(),
            }],
            remove: vec!["modules.*".into()],
            post_install: Some("depmod -a {KERNEL_VERSION}{KERNEL_SUFFIX}".into()),
        };
        let hook = temp.path().join("ixgbe.postinst");

        let report = place(&spec, &src, &staging, &hook, &vars).unwrap();
        assert!(modules.join("updates/ixgbe.ko").is_file());
        assert_eq!(report.removed.len(), 2);
        assert!(!modules.join("modules.dep").exists());

        let script = fs::read_to_string(&hook).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("depmod -a 6.6.48-vyos"));
        let mode = fs::metadata(&hook).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn missing_build_output_fails() {
        let temp = tempfile::tempdir().unwrap();
        let spec = PlacementSpec {
            copy: vec![CopyRule {
                from: "src/missing.ko".into(),
                to: "lib/missing.ko".into(),
            }],
            ..Default::default()
        };
        let err = place(
            &spec,
            temp.path(),
            &temp.path().join("staging"),
            &temp.path().join("hook"),
            &Vars::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing.ko"));
    }

    #[test]
    fn copy_tree_preserves_symlinks() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/tool"), "x").unwrap();
        std::os::unix::fs::symlink("tool", src.join("bin/alias")).unwrap();

        let dst = temp.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();
        assert!(dst.join("bin/tool").is_file());
        assert_eq!(
            fs::read_link(dst.join("bin/alias")).unwrap(),
            PathBuf::from("tool")
        );
    }

    #[test]
    fn collect_skips_build_deps_and_self_copies() {
        let temp = tempfile::tempdir().unwrap();
        let build = temp.path().join("build");
        let out = temp.path().join("out");
        fs::create_dir_all(&build).unwrap();
        fs::write(build.join("hsflowd_2.0.55_amd64.deb"), "deb").unwrap();
        fs::write(build.join("hsflowd-build-deps_2.0.55_all.deb"), "deb").unwrap();
        fs::write(build.join("hsflowd_2.0.55_amd64.changes"), "").unwrap();

        let collected =
            collect_debs(&[build.as_path(), out.as_path()], &out, &DebSnapshot::default()).unwrap();
        assert_eq!(collected, vec![out.join("hsflowd_2.0.55_amd64.deb")]);
        assert!(out.join("hsflowd_2.0.55_amd64.deb").is_file());
        assert!(!out.join("hsflowd-build-deps_2.0.55_all.deb").exists());
    }

    #[test]
    fn collect_ignores_debs_from_earlier_builds() {
        let temp = tempfile::tempdir().unwrap();
        let work = temp.path();
        let earlier = work.join("hsflowd_2.0_amd64.deb");
        let rebuilt = work.join("ixgbe_0.9_amd64.deb");
        fs::write(&earlier, "old").unwrap();
        fs::write(&rebuilt, "old").unwrap();
        let past = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        for path in [&earlier, &rebuilt] {
            fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(past)
                .unwrap();
        }

        let before = DebSnapshot::take(&[work]).unwrap();
        fs::write(work.join("ixgbe_1.0_amd64.deb"), "new").unwrap();
        fs::write(&rebuilt, "new").unwrap();

        let collected = collect_debs(&[work], work, &before).unwrap();
        assert_eq!(
            collected,
            vec![work.join("ixgbe_0.9_amd64.deb"), work.join("ixgbe_1.0_amd64.deb")]
        );
    }
}
