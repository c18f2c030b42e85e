//! Package version derivation from repository tag state.
//!
//! The version is whatever `git describe --tags --always` reports for the
//! checked-out source, minus a leading prefix character (`v5.19.6` becomes
//! `5.19.6`). An untagged or shallow clone yields a bare commit hash or an
//! error; that is the tag state's problem, not something patched over here.

use std::path::Path;

use anyhow::Result;

use crate::error::BuildError;
use crate::process::Cmd;

pub fn describe(source_dir: &Path) -> Result<String> {
    let described = Cmd::new("git")
        .args(["describe", "--tags", "--always"])
        .current_dir(source_dir)
        .error_msg("git describe")
        .stdout()
        .map_err(|err| BuildError::Version {
            source_dir: source_dir.to_path_buf(),
            reason: format!("{err:#}"),
        })?;
    if described.is_empty() {
        return Err(BuildError::Version {
            source_dir: source_dir.to_path_buf(),
            reason: "git describe printed nothing".to_string(),
        }
        .into());
    }
    Ok(described)
}

/// Strip one leading `prefix` character, if present.
pub fn strip_version_prefix(described: &str, prefix: Option<char>) -> &str {
    match prefix {
        Some(prefix) => described.strip_prefix(prefix).unwrap_or(described),
        None => described,
    }
}

/// Derive the package version for `source_dir`.
pub fn derive_version(source_dir: &Path, prefix: Option<char>) -> Result<String> {
    let described = describe(source_dir)?;
    let version = strip_version_prefix(&described, prefix);
    if version.is_empty() {
        return Err(BuildError::Version {
            source_dir: source_dir.to_path_buf(),
            reason: format!("'{described}' is empty after stripping the version prefix"),
        }
        .into());
    }
    Ok(version.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::preflight::command_exists;
    use std::fs;

    /// Initialise a git repo at `dir` with one commit tagged `tag`.
    pub(crate) fn tagged_repo(dir: &Path, tag: &str) {
        let git = |args: &[&str]| {
            Cmd::new("git")
                .args(["-c", "user.name=builder", "-c", "user.email=builder@localhost"])
                .args(["-c", "commit.gpgsign=false", "-c", "tag.gpgsign=false"])
                .args(args)
                .current_dir(dir)
                .run()
                .unwrap();
        };
        fs::create_dir_all(dir).unwrap();
        git(&["init", "-q"]);
        if !dir.join("README").exists() {
            fs::write(dir.join("README"), "driver\n").unwrap();
        }
        git(&["add", "-A"]);
        git(&["commit", "-q", "-m", "import"]);
        git(&["tag", tag]);
    }

    #[test]
    fn strips_only_one_leading_prefix() {
        assert_eq!(strip_version_prefix("v5.19.6", Some('v')), "5.19.6");
        assert_eq!(strip_version_prefix("vv1", Some('v')), "v1");
        assert_eq!(strip_version_prefix("1.0-dev", Some('v')), "1.0-dev");
        assert_eq!(strip_version_prefix("v2.0", None), "v2.0");
    }

    #[test]
    fn derives_version_from_tag() {
        if !command_exists("git") {
            eprintln!("skipping: git not installed");
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let repo = temp.path().join("ixgbe");
        tagged_repo(&repo, "v5.19.6");

        let first = derive_version(&repo, Some('v')).unwrap();
        let second = derive_version(&repo, Some('v')).unwrap();
        assert_eq!(first, "5.19.6");
        assert_eq!(first, second);
    }

    #[test]
    fn non_repository_is_a_version_error() {
        if !command_exists("git") {
            eprintln!("skipping: git not installed");
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let err = derive_version(temp.path(), Some('v')).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Version { .. })
        ));
    }
}
