//! Source acquisition and source tarballs.
//!
//! Fetching is its own command: `build` never clones, it only checks that
//! the tree is there.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::PackageSpec;
use crate::process::Cmd;

/// Result of [`fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Cloned,
    AlreadyPresent,
}

/// Clone the package source if missing and check out its pinned commit.
pub fn fetch(package: &PackageSpec) -> Result<FetchOutcome> {
    let tag = format!("[fetch:{}]", package.name);
    let outcome = if package.source_dir.is_dir() {
        tracing::info!("{tag} source present at {}", package.source_dir.display());
        FetchOutcome::AlreadyPresent
    } else {
        let url = package.scm_url.as_deref().ok_or_else(|| {
            crate::error::BuildError::MissingPrecondition {
                what: "source directory".to_string(),
                path: package.source_dir.clone(),
                remedy: format!(
                    "package '{}' has no scm_url; check the source out by hand",
                    package.name
                ),
            }
        })?;
        tracing::info!("{tag} cloning {url}");
        Cmd::new("git")
            .arg("clone")
            .arg(url)
            .arg(&package.source_dir)
            .error_msg("git clone")
            .run_interactive()?;
        FetchOutcome::Cloned
    };

    if let Some(commit) = package.commit_id.as_deref() {
        tracing::info!("{tag} checking out {commit}");
        Cmd::new("git")
            .args(["checkout", "--quiet", commit])
            .current_dir(&package.source_dir)
            .error_msg("git checkout")
            .run()?;
    }
    Ok(outcome)
}

/// `<name>_<commit>.tar.gz`, with `/` in the commit replaced by `_`.
pub fn tarball_name(name: &str, commit_or_version: &str) -> String {
    format!("{}_{}.tar.gz", name, commit_or_version.replace('/', "_"))
}

/// Pack `source_dir` as `<top_dir>/...` into a gzip tarball at `output`.
pub fn create_tarball(source_dir: &Path, top_dir: &str, output: &Path) -> Result<PathBuf> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating tarball directory '{}'", parent.display()))?;
    }
    let file = File::create(output)
        .with_context(|| format!("creating tarball '{}'", output.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(top_dir, source_dir)
        .with_context(|| format!("archiving '{}'", source_dir.display()))?;
    let encoder = builder
        .into_inner()
        .with_context(|| format!("finishing tarball '{}'", output.display()))?;
    encoder
        .finish()
        .with_context(|| format!("flushing tarball '{}'", output.display()))?;
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn tarball_name_sanitizes_refs() {
        assert_eq!(
            tarball_name("hsflowd", "release/v2.0.55"),
            "hsflowd_release_v2.0.55.tar.gz"
        );
    }

    #[test]
    fn tarball_contains_top_dir() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("ixgbe");
        fs::create_dir_all(src.join("src")).unwrap();
        fs::write(src.join("src/main.c"), "int main(void){}\n").unwrap();

        let out = temp.path().join("out/ixgbe_v5.19.6.tar.gz");
        create_tarball(&src, "ixgbe", &out).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&out).unwrap()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "ixgbe/src/main.c"));
    }

    #[test]
    fn fetch_without_url_or_tree_fails() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = crate::config::Manifest::parse(
            "[[packages]]\nname = \"igb\"\n",
            Path::new("package.toml"),
            temp.path(),
        )
        .unwrap();
        let err = fetch(&manifest.packages[0]).unwrap_err();
        assert!(err.to_string().contains("no scm_url"));
    }
}
